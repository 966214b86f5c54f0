use memtable::{compare_keys, Entry, StorageIterator};
use std::cmp::Ordering;
use std::error::Error;
use std::sync::Arc;

use crate::{SstError, Table, TableIterator};

/// Chains the iterators of a level's sorted, non-overlapping tables.
///
/// Tables must be sorted by key range. Per-table iterators are created
/// lazily; every table is referenced for the iterator's whole lifetime.
pub struct ConcatIterator {
    tables: Vec<Arc<Table>>,
    is_asc: bool,
    cur: Option<usize>,
    iter: Option<TableIterator>,
    err: Option<SstError>,
}

impl ConcatIterator {
    pub fn new(tables: Vec<Arc<Table>>, is_asc: bool) -> Self {
        for t in &tables {
            t.incr_ref();
        }
        Self {
            tables,
            is_asc,
            cur: None,
            iter: None,
            err: None,
        }
    }

    pub fn take_error(&mut self) -> Option<SstError> {
        self.err.take()
    }

    fn set_table(&mut self, idx: Option<usize>) {
        self.cur = idx;
        self.iter = idx
            .and_then(|i| self.tables.get(i))
            .map(|t| t.iter(self.is_asc));
    }

    /// Moves past exhausted tables in the iteration direction.
    fn settle(&mut self) {
        loop {
            let Some(it) = self.iter.as_mut() else {
                return;
            };
            if let Some(e) = it.take_error() {
                self.err = Some(e);
                self.set_table(None);
                return;
            }
            if it.valid() {
                return;
            }
            let next = match (self.cur, self.is_asc) {
                (Some(i), true) if i + 1 < self.tables.len() => Some(i + 1),
                (Some(i), false) if i > 0 => Some(i - 1),
                _ => None,
            };
            self.set_table(next);
            if let Some(it) = self.iter.as_mut() {
                it.rewind();
            }
        }
    }
}

impl StorageIterator for ConcatIterator {
    fn rewind(&mut self) {
        self.err = None;
        let start = match self.tables.len() {
            0 => None,
            _ if self.is_asc => Some(0),
            n => Some(n - 1),
        };
        self.set_table(start);
        if let Some(it) = self.iter.as_mut() {
            it.rewind();
        }
        self.settle();
    }

    fn seek(&mut self, key: &[u8]) {
        self.err = None;
        let idx = if self.is_asc {
            // first table whose max key is >= key
            let i = self
                .tables
                .partition_point(|t| compare_keys(t.max_key(), key) == Ordering::Less);
            (i < self.tables.len()).then_some(i)
        } else {
            // last table whose min key is <= key
            self.tables
                .partition_point(|t| compare_keys(t.min_key(), key) != Ordering::Greater)
                .checked_sub(1)
        };
        self.set_table(idx);
        if let Some(it) = self.iter.as_mut() {
            it.seek(key);
        }
        self.settle();
    }

    fn next(&mut self) {
        if let Some(it) = self.iter.as_mut() {
            it.next();
            self.settle();
        }
    }

    fn valid(&self) -> bool {
        self.iter.as_ref().map_or(false, TableIterator::valid)
    }

    fn item(&self) -> Option<&Entry> {
        self.iter.as_ref().and_then(StorageIterator::item)
    }

    fn error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.err.as_ref().map(|e| e as &(dyn Error + Send + Sync + 'static))
    }
}

impl Drop for ConcatIterator {
    fn drop(&mut self) {
        // Release the current table iterator first so its reference goes
        // before ours.
        self.iter = None;
        for t in &self.tables {
            if let Err(e) = t.decr_ref() {
                tracing::error!(fid = t.fid(), error = %e, "failed to release table");
            }
        }
    }
}
