//! # Config - HardKV engine options
//!
//! A single [`Options`] struct shared by the engine and the CLI. Defaults
//! suit a general-purpose embedded store; [`Options::from_env`] layers
//! `HARDKV_*` environment overrides on top of them.
//!
//! ```text
//! HARDKV_DIR          work directory                  (default: "./data")
//! HARDKV_MEMTABLE_KB  memtable size in KiB            (default: 65536 = 64 MiB)
//! HARDKV_BLOCK_SIZE   table block size in bytes       (default: 4096)
//! HARDKV_BLOOM_FPR    bloom false positive rate       (default: 0.01, 0 = off)
//! HARDKV_SYNC         msync the WAL after each write  (default: "false")
//! HARDKV_CACHE_BLOCKS block cache capacity in blocks  (default: 1024)
//! HARDKV_L0_TABLES    L0 tables before compaction is due (default: 15)
//! ```

use anyhow::{ensure, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding table files, WAL files and the manifest.
    pub work_dir: PathBuf,
    /// WAL size at which the memtable is rotated.
    pub memtable_size: usize,
    /// Upper bound for one table file.
    pub sstable_max_size: usize,
    /// Target size of one table block.
    pub block_size: usize,
    /// Bloom filter false positive budget. `0.0` disables filters.
    pub bloom_false_positive: f64,
    /// Number of levels.
    pub max_level_num: usize,
    /// L0 table count at which a compaction is due.
    pub num_level_zero_tables: usize,
    /// Decoded blocks kept in the shared LRU cache.
    pub block_cache_capacity: usize,
    /// Flush the WAL mapping to disk after every write.
    pub sync_writes: bool,
    /// Tick of the background merge worker.
    pub merge_interval: Duration,
    /// Deletions the manifest accumulates before it may be rewritten.
    pub manifest_deletions_threshold: usize,
    /// Deletions must also exceed this multiple of the live table count.
    pub manifest_deletions_ratio: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./data"),
            memtable_size: 64 << 20,
            sstable_max_size: 64 << 20,
            block_size: 4 * 1024,
            bloom_false_positive: 0.01,
            max_level_num: 7,
            num_level_zero_tables: 15,
            block_cache_capacity: 1024,
            sync_writes: false,
            merge_interval: Duration::from_secs(1),
            manifest_deletions_threshold: 10_000,
            manifest_deletions_ratio: 10,
        }
    }
}

impl Options {
    /// Options rooted at `dir`, everything else default.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Defaults plus `HARDKV_*` overrides. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(dir) = get("HARDKV_DIR").filter(|d| !d.is_empty()) {
            opts.work_dir = PathBuf::from(dir);
        }
        if let Some(kb) = get("HARDKV_MEMTABLE_KB").and_then(|v| v.parse::<usize>().ok()) {
            opts.memtable_size = kb.saturating_mul(1024);
        }
        if let Some(size) = get("HARDKV_BLOCK_SIZE").and_then(|v| v.parse().ok()) {
            opts.block_size = size;
        }
        if let Some(fpr) = get("HARDKV_BLOOM_FPR").and_then(|v| v.parse().ok()) {
            opts.bloom_false_positive = fpr;
        }
        if let Some(sync) = get("HARDKV_SYNC").and_then(|v| parse_bool(&v)) {
            opts.sync_writes = sync;
        }
        if let Some(cap) = get("HARDKV_CACHE_BLOCKS").and_then(|v| v.parse().ok()) {
            opts.block_cache_capacity = cap;
        }
        if let Some(n) = get("HARDKV_L0_TABLES").and_then(|v| v.parse().ok()) {
            opts.num_level_zero_tables = n;
        }
        opts
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.work_dir.as_os_str().is_empty(),
            "work_dir must not be empty"
        );
        ensure!(self.memtable_size > 0, "memtable_size must be positive");
        ensure!(self.sstable_max_size > 0, "sstable_max_size must be positive");
        ensure!(self.block_size > 0, "block_size must be positive");
        ensure!(
            self.block_size <= u32::MAX as usize,
            "block_size {} exceeds u32::MAX",
            self.block_size
        );
        ensure!(
            (0.0..1.0).contains(&self.bloom_false_positive),
            "bloom_false_positive {} outside [0, 1)",
            self.bloom_false_positive
        );
        ensure!(self.max_level_num > 0, "max_level_num must be positive");
        ensure!(
            self.num_level_zero_tables > 0,
            "num_level_zero_tables must be positive"
        );
        ensure!(
            self.block_cache_capacity > 0,
            "block_cache_capacity must be positive"
        );
        ensure!(
            !self.merge_interval.is_zero(),
            "merge_interval must be positive"
        );
        Ok(())
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
