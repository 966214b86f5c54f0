use std::cmp::Ordering;

use crate::entry::{compare_keys, Entry};

/// Cursor-style iterator shared by the skip list, blocks, tables and the
/// merged engine view.
///
/// A fresh iterator is unpositioned: call [`rewind`](Self::rewind) or
/// [`seek`](Self::seek) before reading.
pub trait StorageIterator {
    /// Positions on the first entry in iteration order.
    fn rewind(&mut self);

    /// Positions on the first entry at or after `key` in iteration order.
    fn seek(&mut self, key: &[u8]);

    /// Advances one entry.
    fn next(&mut self);

    fn valid(&self) -> bool;

    /// The current entry, or `None` once exhausted.
    fn item(&self) -> Option<&Entry>;

    /// The error that ended iteration early, if any. Running off the end
    /// is not an error.
    fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        None
    }
}

impl<I: StorageIterator + ?Sized> StorageIterator for Box<I> {
    fn rewind(&mut self) {
        (**self).rewind();
    }

    fn seek(&mut self, key: &[u8]) {
        (**self).seek(key);
    }

    fn next(&mut self) {
        (**self).next();
    }

    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn item(&self) -> Option<&Entry> {
        (**self).item()
    }

    fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        (**self).error()
    }
}

/// Iterator over an owned, sorted snapshot of entries, in either direction.
///
/// Used to read a memtable without holding its lock: the entries are copied
/// out once and the snapshot is walked afterwards.
pub struct VecIterator {
    entries: Vec<Entry>,
    is_asc: bool,
    pos: Option<usize>,
}

impl VecIterator {
    /// `entries` must be sorted by [`compare_keys`](crate::compare_keys).
    pub fn new(entries: Vec<Entry>, is_asc: bool) -> Self {
        Self {
            entries,
            is_asc,
            pos: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StorageIterator for VecIterator {
    fn rewind(&mut self) {
        self.pos = match (self.entries.len(), self.is_asc) {
            (0, _) => None,
            (_, true) => Some(0),
            (n, false) => Some(n - 1),
        };
    }

    fn seek(&mut self, key: &[u8]) {
        self.pos = if self.is_asc {
            let ge = self
                .entries
                .partition_point(|e| compare_keys(&e.key, key) == Ordering::Less);
            (ge < self.entries.len()).then_some(ge)
        } else {
            self.entries
                .partition_point(|e| compare_keys(&e.key, key) != Ordering::Greater)
                .checked_sub(1)
        };
    }

    fn next(&mut self) {
        self.pos = match self.pos {
            Some(i) if self.is_asc && i + 1 < self.entries.len() => Some(i + 1),
            Some(i) if !self.is_asc && i > 0 => Some(i - 1),
            _ => None,
        };
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn item(&self) -> Option<&Entry> {
        self.pos.and_then(|i| self.entries.get(i))
    }
}
