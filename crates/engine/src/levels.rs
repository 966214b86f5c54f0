//! Level manager: the on-disk half of the LSM tree.
//!
//! Level 0 holds tables flushed from memtables, ordered by file id and
//! possibly overlapping. Deeper levels hold non-overlapping tables ordered by
//! their smallest key. Every table belongs to exactly one level and the
//! manifest records which.

use anyhow::{bail, Context, Result};
use config::Options;
use memtable::{parse_key, Entry, StorageIterator};
use parking_lot::RwLock;
use sstable::{
    parse_file_id, table_file_path, BlockCache, ConcatIterator, Table, TableBuilder, TableOptions,
    SST_EXT,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::manifest::{ManifestChange, ManifestFile};
use crate::mem::MemTable;

/// Inclusive range of user keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
}

impl KeyRange {
    /// Smallest range covering every table; `None` for no tables.
    pub fn of_tables(tables: &[Arc<Table>]) -> Option<Self> {
        let left = tables.iter().map(|t| parse_key(t.min_key())).min()?;
        let right = tables.iter().map(|t| parse_key(t.max_key())).max()?;
        Some(Self {
            left: left.to_vec(),
            right: right.to_vec(),
        })
    }

    pub fn overlaps_with(&self, other: &KeyRange) -> bool {
        self.left <= other.right && other.left <= self.right
    }
}

/// Size bookkeeping of one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStats {
    pub level: usize,
    pub tables: usize,
    pub total_size: u64,
    pub stale_size: u64,
}

/// L0 tables that are due for compaction and the L1 tables they overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionCandidate {
    pub range: KeyRange,
    pub top: Vec<u64>,
    pub bottom: Vec<u64>,
}

#[derive(Default)]
struct LevelInner {
    tables: Vec<Arc<Table>>,
    total_size: u64,
    total_stale_size: u64,
}

impl LevelInner {
    fn add_size(&mut self, t: &Table) {
        self.total_size += t.size();
        self.total_stale_size += u64::from(t.stale_data_size());
    }

    fn subtract_size(&mut self, t: &Table) {
        self.total_size = self.total_size.saturating_sub(t.size());
        self.total_stale_size = self
            .total_stale_size
            .saturating_sub(u64::from(t.stale_data_size()));
    }
}

/// Tables of one level behind a read/write lock.
///
/// Readers take the read lock; `add`, `sort`, `replace_tables` and
/// `delete_tables` take the write lock.
pub(crate) struct LevelHandler {
    level: usize,
    inner: RwLock<LevelInner>,
}

impl LevelHandler {
    pub(crate) fn new(level: usize) -> Self {
        Self {
            level,
            inner: RwLock::new(LevelInner::default()),
        }
    }

    /// Takes over the table's initial reference.
    pub(crate) fn add(&self, t: Arc<Table>) {
        let mut inner = self.inner.write();
        inner.add_size(&t);
        inner.tables.push(t);
    }

    /// L0 by file id, deeper levels by smallest key.
    pub(crate) fn sort(&self) {
        let mut inner = self.inner.write();
        sort_tables(self.level, &mut inner.tables);
    }

    pub(crate) fn tables(&self) -> Vec<Arc<Table>> {
        self.inner.read().tables.clone()
    }

    pub(crate) fn num_tables(&self) -> usize {
        self.inner.read().tables.len()
    }

    pub(crate) fn stats(&self) -> LevelStats {
        let inner = self.inner.read();
        LevelStats {
            level: self.level,
            tables: inner.tables.len(),
            total_size: inner.total_size,
            stale_size: inner.total_stale_size,
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if self.level == 0 {
            self.search_l0(key)
        } else {
            self.search_ln(key)
        }
    }

    /// Checks every table, newest first; the first hit wins.
    fn search_l0(&self, key: &[u8]) -> Result<Option<Entry>> {
        let inner = self.inner.read();
        for t in inner.tables.iter().rev() {
            let mut version = 0;
            if let Some(e) = t.search(key, &mut version)? {
                return Ok(Some(e));
            }
        }
        Ok(None)
    }

    /// Searches the single table whose range covers the key.
    fn search_ln(&self, key: &[u8]) -> Result<Option<Entry>> {
        let inner = self.inner.read();
        let Some(t) = table_for_key(&inner.tables, parse_key(key)) else {
            return Ok(None);
        };
        let mut version = 0;
        Ok(t.search(key, &mut version)?)
    }

    /// Index range `[left, right)` of the tables overlapping `kr`.
    /// Only meaningful for levels sorted by key.
    pub(crate) fn overlapping_tables(&self, kr: &KeyRange) -> (usize, usize) {
        overlapping(&self.inner.read().tables, kr)
    }

    /// Swaps `to_del` for `to_add` in one step. Removed tables lose the
    /// level's reference; added ones hand theirs over.
    pub(crate) fn replace_tables(&self, to_del: &[Arc<Table>], to_add: Vec<Arc<Table>>) -> Result<()> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = remove_tables(&mut inner, to_del);
            for t in to_add {
                inner.add_size(&t);
                inner.tables.push(t);
            }
            sort_tables(self.level, &mut inner.tables);
            removed
        };
        release(removed)
    }

    pub(crate) fn delete_tables(&self, to_del: &[Arc<Table>]) -> Result<()> {
        let removed = remove_tables(&mut self.inner.write(), to_del);
        release(removed)
    }
}

fn sort_tables(level: usize, tables: &mut [Arc<Table>]) {
    if level == 0 {
        tables.sort_by_key(|t| t.fid());
    } else {
        tables.sort_by(|a, b| memtable::compare_keys(a.min_key(), b.min_key()));
    }
}

fn overlapping(tables: &[Arc<Table>], kr: &KeyRange) -> (usize, usize) {
    let left = tables.partition_point(|t| parse_key(t.max_key()) < kr.left.as_slice());
    let right = tables.partition_point(|t| parse_key(t.min_key()) <= kr.right.as_slice());
    (left, right.max(left))
}

fn table_for_key<'a>(tables: &'a [Arc<Table>], user_key: &[u8]) -> Option<&'a Arc<Table>> {
    let idx = tables.partition_point(|t| parse_key(t.max_key()) < user_key);
    tables
        .get(idx)
        .filter(|t| parse_key(t.min_key()) <= user_key)
}

fn remove_tables(inner: &mut LevelInner, to_del: &[Arc<Table>]) -> Vec<Arc<Table>> {
    let fids: HashSet<u64> = to_del.iter().map(|t| t.fid()).collect();
    let (removed, kept): (Vec<_>, Vec<_>) = inner
        .tables
        .drain(..)
        .partition(|t| fids.contains(&t.fid()));
    inner.tables = kept;
    for t in &removed {
        inner.subtract_size(t);
    }
    removed
}

/// Drops the level's reference outside the lock.
fn release(tables: Vec<Arc<Table>>) -> Result<()> {
    for t in tables {
        t.decr_ref()
            .with_context(|| format!("failed to release table {}", t.fid()))?;
    }
    Ok(())
}

/// Ids of every table file in `dir`.
pub(crate) fn load_id_map(dir: &Path) -> Result<HashSet<u64>> {
    let mut ids = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        if let Some(fid) = parse_file_id(&entry?.path(), SST_EXT) {
            ids.insert(fid);
        }
    }
    Ok(ids)
}

/// Every level's table set, the manifest that records it, the shared block
/// cache and the file id allocator.
pub struct LevelManager {
    opts: Options,
    max_fid: AtomicU64,
    cache: Arc<BlockCache>,
    manifest: ManifestFile,
    levels: Vec<LevelHandler>,
}

impl LevelManager {
    /// Opens the manifest, reconciles it with the directory and opens every
    /// table it lists.
    pub(crate) fn open(opts: &Options) -> Result<Self> {
        let manifest = ManifestFile::open(
            &opts.work_dir,
            opts.manifest_deletions_threshold,
            opts.manifest_deletions_ratio,
        )
        .context("failed to open manifest")?;
        manifest.revert_to_manifest(&load_id_map(&opts.work_dir)?)?;

        let lm = Self {
            opts: opts.clone(),
            max_fid: AtomicU64::new(0),
            cache: Arc::new(BlockCache::new(opts.block_cache_capacity)),
            manifest,
            levels: (0..opts.max_level_num).map(LevelHandler::new).collect(),
        };
        lm.build()?;
        Ok(lm)
    }

    fn build(&self) -> Result<()> {
        let mut max_fid = 0;
        for (&fid, tm) in &self.manifest.manifest().tables {
            let level = tm.level as usize;
            if level >= self.levels.len() {
                bail!(
                    "table {fid} is at level {level}, beyond max_level_num {}",
                    self.levels.len()
                );
            }
            let path = table_file_path(&self.opts.work_dir, fid);
            let table = Table::open(&path, fid, Arc::clone(&self.cache))
                .with_context(|| format!("failed to open table {}", path.display()))?;
            if table.checksum_bytes() != tm.checksum {
                bail!("table {fid} checksum differs from manifest");
            }
            self.levels[level].add(Arc::new(table));
            max_fid = max_fid.max(fid);
        }
        for level in &self.levels {
            level.sort();
        }
        self.observe_fid(max_fid);
        Ok(())
    }

    /// Allocates the next file id, shared by WAL and table files.
    pub(crate) fn next_fid(&self) -> u64 {
        self.max_fid.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raises the allocator past an id seen on disk.
    pub(crate) fn observe_fid(&self, fid: u64) {
        self.max_fid.fetch_max(fid, Ordering::AcqRel);
    }

    pub(crate) fn max_fid(&self) -> u64 {
        self.max_fid.load(Ordering::Acquire)
    }

    fn table_options(&self) -> TableOptions {
        TableOptions {
            block_size: self.opts.block_size,
            bloom_false_positive: self.opts.bloom_false_positive,
            table_size: self.opts.sstable_max_size,
        }
    }

    /// Writes an immutable memtable out as a new L0 table and records it in
    /// the manifest. Returns the new table's id, or `None` for an empty
    /// memtable.
    pub(crate) fn flush(&self, mem: &MemTable) -> Result<Option<u64>> {
        let mut builder = TableBuilder::new(self.table_options());
        let mut prev: Option<Vec<u8>> = None;
        for e in mem.entries() {
            // Older versions follow the newest one of the same user key.
            let is_stale = prev.as_deref().map_or(false, |p| memtable::same_key(p, &e.key));
            builder.add(&e, is_stale)?;
            prev = Some(e.key);
        }
        if builder.is_empty() {
            return Ok(None);
        }

        let fid = self.next_fid();
        let path = table_file_path(&self.opts.work_dir, fid);
        let table = builder
            .flush(&path, fid, Arc::clone(&self.cache))
            .with_context(|| format!("failed to write table {}", path.display()))?;
        self.manifest
            .add_table_meta(0, fid, table.checksum_bytes())
            .context("failed to record table in manifest")?;

        tracing::info!(
            fid,
            wal = mem.fid(),
            keys = table.key_count(),
            size = table.size(),
            "flushed memtable to level 0"
        );
        self.levels[0].add(Arc::new(table));
        Ok(Some(fid))
    }

    /// Level 0 first, then each deeper level.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        for level in &self.levels {
            if let Some(e) = level.get(key)? {
                return Ok(Some(e));
            }
        }
        Ok(None)
    }

    /// Highest version stored in any table.
    pub(crate) fn max_version(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(LevelHandler::tables)
            .map(|t| t.max_version())
            .max()
            .unwrap_or(0)
    }

    /// Iterators over every table, newest data first: L0 tables by
    /// descending file id, then one concatenated iterator per deeper level.
    pub(crate) fn iterators(&self, is_asc: bool) -> Vec<Box<dyn StorageIterator>> {
        let mut iters: Vec<Box<dyn StorageIterator>> = Vec::new();
        if let Some((l0, deeper)) = self.levels.split_first() {
            for t in l0.tables().iter().rev() {
                iters.push(Box::new(t.iter(is_asc)));
            }
            for level in deeper {
                let tables = level.tables();
                if !tables.is_empty() {
                    iters.push(Box::new(ConcatIterator::new(tables, is_asc)));
                }
            }
        }
        iters
    }

    pub(crate) fn stats(&self) -> Vec<LevelStats> {
        self.levels.iter().map(LevelHandler::stats).collect()
    }

    /// Tables of `level` in level order; empty past the last level.
    pub fn tables(&self, level: usize) -> Vec<Arc<Table>> {
        self.levels.get(level).map(LevelHandler::tables).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn level(&self, level: usize) -> Option<&LevelHandler> {
        self.levels.get(level)
    }

    /// Swaps tables of `level` and records the change in the manifest first.
    ///
    /// This is the commit step of a merge: `to_add` must already be open
    /// and referenced, and `to_del` lose the level's reference.
    pub fn replace_tables(
        &self,
        level: usize,
        to_del: &[Arc<Table>],
        to_add: Vec<Arc<Table>>,
    ) -> Result<()> {
        let Some(handler) = self.levels.get(level) else {
            bail!("no level {level}");
        };
        let mut changes: Vec<_> = to_del.iter().map(|t| ManifestChange::delete(t.fid())).collect();
        changes.extend(
            to_add
                .iter()
                .map(|t| ManifestChange::create(t.fid(), level as u32, t.checksum_bytes())),
        );
        self.manifest.add_changes(&changes)?;
        handler.replace_tables(to_del, to_add)
    }

    /// Removes tables of `level`, recording the deletions in the manifest.
    pub fn delete_tables(&self, level: usize, to_del: &[Arc<Table>]) -> Result<()> {
        let Some(handler) = self.levels.get(level) else {
            bail!("no level {level}");
        };
        let changes: Vec<_> = to_del.iter().map(|t| ManifestChange::delete(t.fid())).collect();
        self.manifest.add_changes(&changes)?;
        handler.delete_tables(to_del)
    }

    /// L0 tables plus the overlapping L1 tables, once L0 is full enough.
    pub(crate) fn compaction_candidate(&self) -> Option<CompactionCandidate> {
        let l0 = self.levels.first()?;
        if l0.num_tables() < self.opts.num_level_zero_tables {
            return None;
        }
        let top = l0.tables();
        let range = KeyRange::of_tables(&top)?;
        let bottom = match self.levels.get(1) {
            Some(l1) => {
                let tables = l1.tables();
                let (left, right) = overlapping(&tables, &range);
                tables[left..right].iter().map(|t| t.fid()).collect()
            }
            None => Vec::new(),
        };
        Some(CompactionCandidate {
            range,
            top: top.iter().map(|t| t.fid()).collect(),
            bottom,
        })
    }

    #[cfg(test)]
    pub(crate) fn manifest(&self) -> &ManifestFile {
        &self.manifest
    }
}

impl std::fmt::Debug for LevelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelManager")
            .field("dir", &self.opts.work_dir)
            .field("max_fid", &self.max_fid.load(Ordering::Acquire))
            .field("tables", &self.levels.iter().map(LevelHandler::num_tables).collect::<Vec<_>>())
            .field("manifest", &self.manifest)
            .finish()
    }
}
