use bloom::BloomFilter;
use memmap2::Mmap;
use memtable::{compare_keys, parse_key, parse_ts, Entry, StorageIterator};
use std::cmp::Ordering;
use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::format::{read_trailer, TableIndex};
use crate::{Block, BlockCache, BlockIterator, SstError};

/// An immutable, memory-mapped table.
///
/// Opening a table parses only the trailer and index; blocks are decoded on
/// demand through the shared [`BlockCache`].
///
/// # Reference counting
///
/// A table starts with one reference, owned by the level that holds it.
/// Iterators and snapshots call [`incr_ref`](Table::incr_ref) /
/// [`decr_ref`](Table::decr_ref) around their use. The backing file is
/// removed when the count drops to zero, so a table dropped from a level
/// stays readable until its last reader lets go.
pub struct Table {
    fid: u64,
    path: PathBuf,
    mmap: Mmap,
    index: TableIndex,
    bloom: Option<BloomFilter>,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    checksum: u64,
    refs: AtomicI32,
    cache: Arc<BlockCache>,
}

impl Table {
    /// Maps `path` and parses its trailer and index.
    ///
    /// # Errors
    ///
    /// Corruption (bad checksum length, checksum mismatch, malformed index)
    /// or I/O failure. A table without blocks is rejected as corrupt.
    pub fn open(path: &Path, fid: u64, cache: Arc<BlockCache>) -> Result<Self, SstError> {
        let file = File::open(path)?;
        // SAFETY: table files are write-once. They are fully written and
        // renamed into place before being opened, and never modified after.
        let mmap = unsafe { Mmap::map(&file)? };

        let (index_bytes, checksum) = read_trailer(&mmap)?;
        let index = TableIndex::decode(index_bytes)?;
        if index.offsets.is_empty() {
            return Err(SstError::corrupt("table without blocks"));
        }

        let bloom = if index.bloom_filter.is_empty() {
            None
        } else {
            Some(
                BloomFilter::from_bytes(&index.bloom_filter)
                    .ok_or_else(|| SstError::corrupt("malformed bloom filter"))?,
            )
        };

        let mut table = Self {
            fid,
            path: path.to_path_buf(),
            mmap,
            min_key: index.offsets[0].key.clone(),
            index,
            bloom,
            max_key: Vec::new(),
            checksum,
            refs: AtomicI32::new(1),
            cache,
        };

        let last = table.block(table.block_count() - 1)?;
        table.max_key = last.key_at(last.len() - 1)?;

        tracing::debug!(
            fid,
            blocks = table.block_count(),
            keys = table.index.key_count,
            "opened table"
        );
        Ok(table)
    }

    /// Returns block `idx`, decoding and caching it on a miss.
    pub fn block(&self, idx: usize) -> Result<Arc<Block>, SstError> {
        let Some(bo) = self.index.offsets.get(idx) else {
            return Err(SstError::BlockOutOfRange {
                idx,
                count: self.block_count(),
            });
        };
        if let Some(block) = self.cache.get(self.fid, idx) {
            return Ok(block);
        }

        let start = bo.offset as usize;
        let end = start
            .checked_add(bo.len as usize)
            .filter(|&end| end <= self.mmap.len())
            .ok_or_else(|| SstError::corrupt(format!("block {idx} exceeds table size")))?;
        let block = Arc::new(Block::decode(&self.mmap[start..end])?);
        self.cache.insert(self.fid, idx, Arc::clone(&block));
        Ok(block)
    }

    /// Whether the bloom filter admits `user_key`. Always true without one.
    #[must_use]
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        self.bloom
            .as_ref()
            .map_or(true, |bf| bf.may_contain_hash(bloom::hash(user_key)))
    }

    /// Finds the newest version of `key`'s user key at or below `key`'s version.
    ///
    /// The hit is returned only when its version is greater than
    /// `*max_version`, which is then raised to it. Callers searching several
    /// tables thread one `max_version` through all of them.
    pub fn search(&self, key: &[u8], max_version: &mut u64) -> Result<Option<Entry>, SstError> {
        if !self.may_contain(parse_key(key)) {
            return Ok(None);
        }

        // Last block whose base key is <= key; if the key sorts before every
        // base key the answer, if any, is the first entry of block 0.
        let mut idx = self.find_block(key).unwrap_or(0);
        let found = loop {
            let block = self.block(idx)?;
            let i = block.search(key)?;
            if i < block.len() {
                break block.entry_at(i)?;
            }
            idx += 1;
            if idx == self.block_count() {
                return Ok(None);
            }
        };

        if parse_key(&found.key) != parse_key(key) {
            return Ok(None);
        }
        let version = parse_ts(&found.key);
        if version > *max_version {
            *max_version = version;
            return Ok(Some(found));
        }
        Ok(None)
    }

    /// Index of the last block whose base key is `<= key`.
    fn find_block(&self, key: &[u8]) -> Option<usize> {
        self.index
            .offsets
            .partition_point(|bo| compare_keys(&bo.key, key) != Ordering::Greater)
            .checked_sub(1)
    }

    /// Creates an iterator holding its own reference to the table.
    pub fn iter(self: &Arc<Self>, is_asc: bool) -> TableIterator {
        TableIterator::new(Arc::clone(self), is_asc)
    }

    pub fn incr_ref(&self) {
        self.refs.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Releases one reference, deleting the file when it was the last one.
    pub fn decr_ref(&self) -> Result<(), SstError> {
        let prev = self.refs.fetch_sub(1, AtomicOrdering::AcqRel);
        if prev > 1 {
            return Ok(());
        }
        if prev < 1 {
            return Err(SstError::corrupt(format!(
                "table {} released more often than acquired",
                self.fid
            )));
        }
        self.cache.evict_table(self.fid, self.block_count());
        std::fs::remove_file(&self.path)?;
        tracing::debug!(fid = self.fid, "deleted table file");
        Ok(())
    }

    #[must_use]
    pub fn ref_count(&self) -> i32 {
        self.refs.load(AtomicOrdering::Acquire)
    }

    #[must_use]
    pub fn fid(&self) -> u64 {
        self.fid
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    #[must_use]
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    #[must_use]
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    #[must_use]
    pub fn key_count(&self) -> u32 {
        self.index.key_count
    }

    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.index.max_version
    }

    #[must_use]
    pub fn stale_data_size(&self) -> u32 {
        self.index.stale_data_size
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.index.offsets.len()
    }

    #[must_use]
    pub fn has_bloom_filter(&self) -> bool {
        self.bloom.is_some()
    }

    /// Checksum of the table index.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// Index checksum as recorded in the manifest.
    #[must_use]
    pub fn checksum_bytes(&self) -> Vec<u8> {
        self.checksum.to_be_bytes().to_vec()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("fid", &self.fid)
            .field("size", &self.size())
            .field("blocks", &self.block_count())
            .field("keys", &self.index.key_count)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Iterator over every entry of one table, in either direction.
///
/// Walks block by block, loading the next block lazily when the current one
/// is exhausted. Holds a table reference for its whole lifetime.
pub struct TableIterator {
    table: Arc<Table>,
    is_asc: bool,
    block_pos: usize,
    bi: Option<BlockIterator>,
    err: Option<SstError>,
}

impl TableIterator {
    pub fn new(table: Arc<Table>, is_asc: bool) -> Self {
        table.incr_ref();
        Self {
            table,
            is_asc,
            block_pos: 0,
            bi: None,
            err: None,
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn take_error(&mut self) -> Option<SstError> {
        self.err.take()
    }

    pub fn seek_to_first(&mut self) {
        if self.load_block(0) {
            self.with_block(BlockIterator::seek_to_first);
        }
    }

    pub fn seek_to_last(&mut self) {
        if self.load_block(self.table.block_count() - 1) {
            self.with_block(BlockIterator::seek_to_last);
        }
    }

    /// Positions on the first entry `>= key`.
    pub fn seek_ge(&mut self, key: &[u8]) {
        let idx = self.table.find_block(key).unwrap_or(0);
        if self.load_block(idx) {
            self.with_block(|bi| bi.seek_ge(key));
            if !self.block_valid() && self.err.is_none() {
                self.next_block();
            }
        }
    }

    /// Positions on the last entry `<= key`.
    pub fn seek_le(&mut self, key: &[u8]) {
        match self.table.find_block(key) {
            Some(idx) => {
                if self.load_block(idx) {
                    self.with_block(|bi| bi.seek_le(key));
                }
            }
            None => self.bi = None,
        }
    }

    fn block_valid(&self) -> bool {
        self.bi.as_ref().map_or(false, BlockIterator::valid)
    }

    fn with_block(&mut self, f: impl FnOnce(&mut BlockIterator)) {
        if let Some(bi) = self.bi.as_mut() {
            f(bi);
            if let Some(e) = bi.take_error() {
                self.err = Some(e);
                self.bi = None;
            }
        }
    }

    fn load_block(&mut self, idx: usize) -> bool {
        self.err = None;
        match self.table.block(idx) {
            Ok(block) => {
                self.block_pos = idx;
                self.bi = Some(BlockIterator::new(block));
                true
            }
            Err(e) => {
                self.err = Some(e);
                self.bi = None;
                false
            }
        }
    }

    fn next_block(&mut self) {
        let next = self.block_pos + 1;
        if next >= self.table.block_count() {
            self.bi = None;
            return;
        }
        if self.load_block(next) {
            self.with_block(BlockIterator::seek_to_first);
        }
    }

    fn prev_block(&mut self) {
        if self.block_pos == 0 {
            self.bi = None;
            return;
        }
        if self.load_block(self.block_pos - 1) {
            self.with_block(BlockIterator::seek_to_last);
        }
    }
}

impl StorageIterator for TableIterator {
    fn rewind(&mut self) {
        if self.is_asc {
            self.seek_to_first();
        } else {
            self.seek_to_last();
        }
    }

    fn seek(&mut self, key: &[u8]) {
        if self.is_asc {
            self.seek_ge(key);
        } else {
            self.seek_le(key);
        }
    }

    fn next(&mut self) {
        if !self.block_valid() {
            return;
        }
        if self.is_asc {
            self.with_block(StorageIterator::next);
            if !self.block_valid() && self.err.is_none() {
                self.next_block();
            }
        } else {
            self.with_block(BlockIterator::prev);
            if !self.block_valid() && self.err.is_none() {
                self.prev_block();
            }
        }
    }

    fn valid(&self) -> bool {
        self.block_valid()
    }

    fn item(&self) -> Option<&Entry> {
        self.bi.as_ref().and_then(StorageIterator::item)
    }

    fn error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.err.as_ref().map(|e| e as &(dyn Error + Send + Sync + 'static))
    }
}

impl Drop for TableIterator {
    fn drop(&mut self) {
        if let Err(e) = self.table.decr_ref() {
            tracing::error!(fid = self.table.fid(), error = %e, "failed to release table");
        }
    }
}
