//! # Engine - HardKV Storage Engine
//!
//! Ties the [`memtable`], [`wal`] and [`sstable`] crates together into an
//! embedded LSM-tree key-value store.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌───────────────────────────────────────────────────────┐
//! │                        ENGINE                         │
//! │                                                       │
//! │ write.rs → stamp version → WAL append → skip list     │
//! │              |                                        │
//! │              |  (WAL would exceed memtable_size?)     │
//! │              v                                        │
//! │           rotate → immutable → L0 table + manifest    │
//! │                                                       │
//! │ read.rs → memtable → immutables → L0 → L1 .. Ln       │
//! │            (newest version wins, tombstones shadow)   │
//! │                                                       │
//! │ compaction.rs → merge worker reports due compactions  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                              |
//! |----------------|------------------------------------------------------|
//! | `lib.rs`       | `Engine` struct, accessors, stats, `close`, `Drop`   |
//! | `recovery`     | `open`: manifest, tables, WAL replay, fid seeding    |
//! | `write`        | `set()`, `del()`, memtable rotation and flush        |
//! | `read`         | `get()`                                              |
//! | `iterator`     | `iter()`: merged, filtered view over every source    |
//! | `compaction`   | background merge worker                              |
//! | [`levels`]     | level handlers, table search, L0 flush               |
//! | [`manifest`]   | binary table-set log with rewrite                    |
//! | `mem`          | skip list + WAL pair                                 |
//!
//! ## Versions
//!
//! Every write gets the next version from a single counter and is stored
//! under `key_with_ts(user_key, version)`. Reads look up
//! `key_with_ts(user_key, u64::MAX)`, which sorts before every stored
//! version of the key, so the first match is the newest one.
//!
//! ## Crash Safety
//!
//! Every write reaches the WAL before the skip list. A WAL file is deleted
//! only after its table is on disk and recorded in the manifest. WAL files
//! left behind by a crash are replayed and flushed on the next open.

mod closer;
mod compaction;
mod iterator;
pub mod levels;
pub mod manifest;
mod mem;
mod read;
mod recovery;
mod write;

use anyhow::Result;
use config::Options;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use closer::Closer;
use mem::MemTable;

pub use iterator::{EngineIterator, IteratorOptions};
pub use levels::{CompactionCandidate, KeyRange, LevelManager, LevelStats};
pub use memtable::{Entry, StorageIterator};

/// Largest user key; the version suffix takes the rest of the block key limit.
pub const MAX_USER_KEY_SIZE: usize = memtable::MAX_KEY_SIZE - memtable::TS_SIZE;

/// The LSM storage engine.
///
/// All methods take `&self`; the engine is `Send + Sync` and can be shared
/// across threads behind an `Arc`. Writes are serialized by an internal
/// lock, reads run concurrently.
pub struct Engine {
    pub(crate) opts: Options,
    /// Memtable accepting writes.
    pub(crate) mem: RwLock<Arc<MemTable>>,
    /// Rotated memtables waiting for their flush, oldest first.
    pub(crate) immutables: RwLock<Vec<Arc<MemTable>>>,
    pub(crate) levels: Arc<LevelManager>,
    /// Serializes versioning, WAL appends and rotation.
    pub(crate) write_lock: Mutex<()>,
    pub(crate) next_version: AtomicU64,
    pub(crate) closer: Arc<Closer>,
    pub(crate) merge_worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) closed: AtomicBool,
}

/// Point-in-time sizes of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub levels: Vec<LevelStats>,
    pub memtable_entries: usize,
    pub memtable_wal_size: usize,
    pub immutables: usize,
    pub next_version: u64,
    pub max_fid: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "memtable: {} entries, {} wal bytes; immutables: {}",
            self.memtable_entries, self.memtable_wal_size, self.immutables
        )?;
        writeln!(f, "next version: {}, max fid: {}", self.next_version, self.max_fid)?;
        for l in &self.levels {
            writeln!(
                f,
                "L{}: {} tables, {} bytes, {} stale bytes",
                l.level, l.tables, l.total_size, l.stale_size
            )?;
        }
        Ok(())
    }
}

impl Engine {
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// The level structure. Merge policies read tables from it and commit
    /// their output with [`LevelManager::replace_tables`].
    #[must_use]
    pub fn levels(&self) -> &LevelManager {
        &self.levels
    }

    /// Version the next write will get.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.next_version.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let mem = self.mem.read().clone();
        EngineStats {
            levels: self.levels.stats(),
            memtable_entries: mem.len(),
            memtable_wal_size: mem.wal_size(),
            immutables: self.immutables.read().len(),
            next_version: self.next_version(),
            max_fid: self.levels.max_fid(),
        }
    }

    /// Number of tables per level, L0 first.
    #[must_use]
    pub fn table_counts(&self) -> Vec<usize> {
        self.levels.stats().iter().map(|l| l.tables).collect()
    }

    /// Stops the merge worker and closes the memtable WALs.
    ///
    /// WALs are kept on disk and replayed by the next [`open`](Engine::open).
    /// Calling `close` more than once is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closer.signal_and_wait();
        if let Some(handle) = self.merge_worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("merge worker panicked");
            }
        }

        let _guard = self.write_lock.lock();
        self.mem.read().close()?;
        for imm in self.immutables.read().iter() {
            imm.close()?;
        }
        tracing::info!(dir = %self.opts.work_dir.display(), "engine closed");
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        anyhow::ensure!(!self.closed.load(Ordering::Acquire), "engine is closed");
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("work_dir", &self.opts.work_dir)
            .field("next_version", &self.next_version())
            .field("memtable", &*self.mem.read())
            .field("immutables", &self.immutables.read().len())
            .field("tables", &self.table_counts())
            .finish()
    }
}

/// Best-effort close on drop. Errors are logged; the WALs still hold every
/// write and are replayed on the next open.
impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close engine cleanly");
        }
    }
}

#[cfg(test)]
mod tests;
