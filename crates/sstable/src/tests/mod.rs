mod concat_tests;

use std::path::Path;
use std::sync::Arc;

use memtable::{key_with_ts, Entry, StorageIterator};

use crate::{table_file_path, BlockCache, SstError, Table, TableBuilder, TableOptions};

/// Versioned key helper.
pub(crate) fn vkey(key: &str, version: u64) -> Vec<u8> {
    key_with_ts(key.as_bytes(), version)
}

pub(crate) fn small_blocks() -> TableOptions {
    TableOptions {
        block_size: 128,
        ..TableOptions::default()
    }
}

/// Builds table `fid` in `dir` from already sorted entries.
pub(crate) fn build_table(
    dir: &Path,
    fid: u64,
    entries: &[Entry],
    opts: TableOptions,
) -> Result<Arc<Table>, SstError> {
    build_table_with_cache(dir, fid, entries, opts, Arc::new(BlockCache::new(64)))
}

pub(crate) fn build_table_with_cache(
    dir: &Path,
    fid: u64,
    entries: &[Entry],
    opts: TableOptions,
    cache: Arc<BlockCache>,
) -> Result<Arc<Table>, SstError> {
    let mut builder = TableBuilder::new(opts);
    for e in entries {
        builder.add(e, false)?;
    }
    Ok(Arc::new(builder.flush(&table_file_path(dir, fid), fid, cache)?))
}

/// `count` keys `key00000..` at version 1 with values `value{i}`.
pub(crate) fn numbered(count: usize) -> Vec<Entry> {
    (0..count)
        .map(|i| Entry::new(vkey(&format!("key{i:05}"), 1), format!("value{i}")))
        .collect()
}

pub(crate) fn collect<I: StorageIterator + ?Sized>(it: &mut I) -> Vec<Entry> {
    let mut out = Vec::new();
    while let Some(e) = it.item() {
        out.push(e.clone());
        it.next();
    }
    out
}
