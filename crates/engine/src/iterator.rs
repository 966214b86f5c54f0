//! Merged iteration over the whole engine.
//!
//! [`Engine::iter`] pins a snapshot of every source: copies of the memtable
//! and immutable memtables plus refcounted iterators over the tables. A
//! [`MergeIterator`] picks the newest version per user key; this layer then
//! hides tombstones, expired entries and keys outside the prefix.

use memtable::{key_with_ts, now_secs, parse_key, Entry, StorageIterator};
use sstable::MergeIterator;

use crate::Engine;

/// Options for [`Engine::iter`].
#[derive(Debug, Clone)]
pub struct IteratorOptions {
    /// Only keys starting with these bytes are yielded. Empty matches all.
    pub prefix: Vec<u8>,
    /// Ascending key order when `true`, descending otherwise.
    pub is_asc: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            prefix: Vec::new(),
            is_asc: true,
        }
    }
}

impl IteratorOptions {
    pub fn with_prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reversed(mut self) -> Self {
        self.is_asc = !self.is_asc;
        self
    }
}

/// Iterator returned by [`Engine::iter`].
///
/// Yields entries keyed by user key with their version set. Unpositioned on
/// creation: call [`rewind`](StorageIterator::rewind) or
/// [`seek`](StorageIterator::seek) first. `seek` takes a user key.
pub struct EngineIterator {
    inner: MergeIterator<'static>,
    prefix: Vec<u8>,
    is_asc: bool,
    /// Clock reading taken at creation, so TTLs are judged consistently.
    now: u64,
    item: Option<Entry>,
}

impl EngineIterator {
    fn new(sources: Vec<Box<dyn StorageIterator>>, opts: IteratorOptions) -> Self {
        Self {
            inner: MergeIterator::new(sources, opts.is_asc),
            prefix: opts.prefix,
            is_asc: opts.is_asc,
            now: now_secs(),
            item: None,
        }
    }

    /// Collects the remaining entries from the current position.
    ///
    /// # Errors
    ///
    /// Fails if a source hit corruption or an I/O error on the way.
    pub fn collect_remaining(&mut self) -> anyhow::Result<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(e) = self.item() {
            out.push(e.clone());
            self.next();
        }
        self.status()?;
        Ok(out)
    }

    /// `Err` once any source failed; the iterator is then exhausted.
    pub fn status(&self) -> anyhow::Result<()> {
        match self.inner.error() {
            Some(e) => Err(anyhow::anyhow!("iteration stopped: {e}")),
            None => Ok(()),
        }
    }

    /// Moves past dead entries and stops at the end of the prefix range.
    fn settle(&mut self) {
        self.item = None;
        loop {
            if self.inner.error().is_some() {
                return;
            }
            let Some(e) = self.inner.item() else {
                return;
            };
            let user_key = parse_key(&e.key);
            if !user_key.starts_with(&self.prefix) {
                let past_range = if self.is_asc {
                    user_key > self.prefix.as_slice()
                } else {
                    user_key < self.prefix.as_slice()
                };
                if past_range {
                    return;
                }
                self.inner.next();
                continue;
            }
            if e.is_dead(self.now) {
                self.inner.next();
                continue;
            }
            let mut visible = e.clone();
            visible.key = user_key.to_vec();
            self.item = Some(visible);
            return;
        }
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or `None` when no such string exists (empty or all `0xff`).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(last) = succ.pop() {
        if last < u8::MAX {
            succ.push(last + 1);
            return Some(succ);
        }
    }
    None
}

impl StorageIterator for EngineIterator {
    fn rewind(&mut self) {
        if self.prefix.is_empty() {
            self.inner.rewind();
        } else if self.is_asc {
            self.inner.seek(&key_with_ts(&self.prefix, u64::MAX));
        } else {
            match prefix_successor(&self.prefix) {
                Some(succ) => self.inner.seek(&key_with_ts(&succ, u64::MAX)),
                None => self.inner.rewind(),
            }
        }
        self.settle();
    }

    fn seek(&mut self, key: &[u8]) {
        // Ascending starts before the newest version of `key`, descending
        // after its oldest, so every version is visible to the merge.
        let version = if self.is_asc { u64::MAX } else { 0 };
        self.inner.seek(&key_with_ts(key, version));
        self.settle();
    }

    fn next(&mut self) {
        if self.item.is_some() {
            self.inner.next();
            self.settle();
        }
    }

    fn valid(&self) -> bool {
        self.item.is_some()
    }

    fn item(&self) -> Option<&Entry> {
        self.item.as_ref()
    }

    fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.inner.error()
    }
}

impl Engine {
    /// Creates an iterator over a snapshot of the engine.
    ///
    /// Writes made after this call are not visible through it. Tables stay
    /// on disk until the iterator is dropped.
    pub fn iter(&self, opts: IteratorOptions) -> anyhow::Result<EngineIterator> {
        self.ensure_open()?;
        let is_asc = opts.is_asc;

        let mut sources: Vec<Box<dyn StorageIterator>> = Vec::new();
        let mem = self.mem.read().clone();
        sources.push(Box::new(mem.snapshot_iter(is_asc)));
        let immutables = self.immutables.read().clone();
        for imm in immutables.iter().rev() {
            sources.push(Box::new(imm.snapshot_iter(is_asc)));
        }
        sources.extend(self.levels.iterators(is_asc));

        Ok(EngineIterator::new(sources, opts))
    }

    /// Live entries whose key starts with `prefix`, in the given order.
    pub fn scan(&self, prefix: &[u8], is_asc: bool) -> anyhow::Result<Vec<Entry>> {
        let mut it = self.iter(IteratorOptions {
            prefix: prefix.to_vec(),
            is_asc,
        })?;
        it.rewind();
        it.collect_remaining()
    }
}
