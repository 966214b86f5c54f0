//! Heap-based merge over any number of [`StorageIterator`] sources.
//!
//! Yields one entry per user key, in ascending or descending order. When
//! the same user key appears in several sources (or several versions in one
//! source), only the **highest version** is emitted. On equal versions the
//! source with the lower index wins, so callers pass sources newest first:
//! memtable, immutables, L0 tables, deeper levels.

use memtable::{compare_keys, parse_key, parse_ts, Entry, StorageIterator};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::error::Error;

/// Current key of one source, ordered for the merge direction.
struct HeapEntry {
    key: Vec<u8>,
    /// Index into `sources`.
    source: usize,
    is_asc: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: ascending merges reverse the key order.
        // On tie the lower source index comes out first.
        let by_key = compare_keys(&self.key, &other.key);
        let by_key = if self.is_asc { by_key.reverse() } else { by_key };
        by_key.then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sources into a single stream with the newest version per user key.
///
/// Unpositioned on creation, like every [`StorageIterator`].
pub struct MergeIterator<'a> {
    sources: Vec<Box<dyn StorageIterator + 'a>>,
    heap: BinaryHeap<HeapEntry>,
    is_asc: bool,
    item: Option<Entry>,
}

impl<'a> MergeIterator<'a> {
    /// `sources` must all iterate in the direction given by `is_asc`.
    pub fn new(sources: Vec<Box<dyn StorageIterator + 'a>>, is_asc: bool) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            is_asc,
            item: None,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn push(&mut self, source: usize) {
        if let Some(e) = self.sources[source].item() {
            self.heap.push(HeapEntry {
                key: e.key.clone(),
                source,
                is_asc: self.is_asc,
            });
        }
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for i in 0..self.sources.len() {
            self.push(i);
        }
        self.advance();
    }

    /// Pops the next user key, draining every other version of it and
    /// keeping the highest.
    fn advance(&mut self) {
        let Some(top) = self.heap.pop() else {
            self.item = None;
            return;
        };
        let mut best = self.take_and_step(top.source);

        while let Some(peek) = self.heap.peek() {
            let Some(current) = &best else {
                break;
            };
            if parse_key(&peek.key) != parse_key(&current.key) {
                break;
            }
            let Some(dup) = self.heap.pop() else {
                break;
            };
            if let Some(dup_entry) = self.take_and_step(dup.source) {
                if parse_ts(&dup_entry.key) > parse_ts(&current.key) {
                    best = Some(dup_entry);
                }
            }
        }
        self.item = best;
    }

    /// Clones the current entry of `source`, then advances the source and
    /// re-queues it.
    fn take_and_step(&mut self, source: usize) -> Option<Entry> {
        let entry = self.sources[source].item().cloned();
        self.sources[source].next();
        self.push(source);
        entry
    }
}

impl StorageIterator for MergeIterator<'_> {
    fn rewind(&mut self) {
        for s in &mut self.sources {
            s.rewind();
        }
        self.rebuild();
    }

    fn seek(&mut self, key: &[u8]) {
        for s in &mut self.sources {
            s.seek(key);
        }
        self.rebuild();
    }

    fn next(&mut self) {
        if self.item.is_some() {
            self.advance();
        }
    }

    fn valid(&self) -> bool {
        self.item.is_some()
    }

    fn item(&self) -> Option<&Entry> {
        self.item.as_ref()
    }

    /// The first source error. A failed source drops out of the merge, so
    /// the output is incomplete once this is set.
    fn error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.sources.iter().find_map(|s| s.error())
    }
}
