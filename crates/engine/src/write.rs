//! Write path: `set()`, `del()`, memtable rotation and flush.
//!
//! All mutations flow through this module under the engine's write lock.
//! Each write gets the next version, is appended to the active memtable's
//! WAL and then inserted into its skip list. When the WAL would grow past
//! `memtable_size`, the memtable is rotated out and flushed to a new L0
//! table before the write lands in a fresh memtable.

use anyhow::{Context, Result};
use memtable::{key_with_ts, Entry};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use wal::estimate_entry_size;

use crate::mem::MemTable;
use crate::{Engine, MAX_USER_KEY_SIZE};

impl Engine {
    /// Stores `entry` under its user key (the `SET` command).
    ///
    /// The key is stamped with a fresh version; `entry.version` on input is
    /// ignored. TTLs come from `entry.expires_at`, see [`Entry::with_ttl`].
    ///
    /// # Errors
    ///
    /// Rejects empty or oversized keys and a closed engine. I/O failures of
    /// the WAL or of a triggered flush are propagated.
    pub fn set(&self, mut entry: Entry) -> Result<()> {
        self.ensure_open()?;
        anyhow::ensure!(!entry.key.is_empty(), "key must not be empty");
        anyhow::ensure!(
            entry.key.len() <= MAX_USER_KEY_SIZE,
            "key too large: {} bytes (max {})",
            entry.key.len(),
            MAX_USER_KEY_SIZE
        );

        let _guard = self.write_lock.lock();
        let version = self.next_version.load(Ordering::Acquire);
        anyhow::ensure!(version < u64::MAX, "version counter exhausted");

        entry.key = key_with_ts(&entry.key, version);
        entry.version = version;

        if self.needs_rotation(&entry) {
            self.rotate()?;
        }
        self.mem.read().set(&entry)?;
        self.next_version.store(version + 1, Ordering::Release);
        Ok(())
    }

    /// Deletes `key` by writing a tombstone (the `DEL` command).
    ///
    /// The tombstone shadows every older version in the memtables and tables.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.set(Entry::tombstone(key))
    }

    /// Rotates the memtable and flushes it even if it is below the size
    /// budget. A no-op for an empty memtable.
    pub fn force_flush(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        if self.mem.read().is_empty() {
            return Ok(());
        }
        self.rotate()
    }

    fn needs_rotation(&self, entry: &Entry) -> bool {
        let mem = self.mem.read();
        !mem.is_empty() && mem.wal_size() + estimate_entry_size(entry) > self.opts.memtable_size
    }

    /// Swaps in a fresh memtable and flushes every immutable one.
    ///
    /// Callers hold the write lock.
    fn rotate(&self) -> Result<()> {
        let fid = self.levels.next_fid();
        let fresh = MemTable::create(
            &self.opts.work_dir,
            fid,
            self.opts.memtable_size,
            self.opts.sync_writes,
        )?;

        // Publish the immutable before the swap so readers always see it.
        let old = self.mem.read().clone();
        self.immutables.write().push(Arc::clone(&old));
        *self.mem.write() = Arc::new(fresh);
        tracing::info!(
            old = old.fid(),
            new = fid,
            entries = old.len(),
            wal_size = old.wal_size(),
            "rotated memtable"
        );
        self.flush_immutables()
    }

    /// Flushes immutables oldest first. An immutable leaves the list only
    /// after its table is recorded in the manifest and its WAL is gone, so
    /// readers never lose sight of its entries.
    pub(crate) fn flush_immutables(&self) -> Result<()> {
        loop {
            let Some(imm) = self.immutables.read().first().cloned() else {
                return Ok(());
            };
            self.levels
                .flush(&imm)
                .with_context(|| format!("failed to flush memtable {}", imm.fid()))?;
            imm.delete_wal()?;
            self.immutables.write().retain(|m| !Arc::ptr_eq(m, &imm));
        }
    }
}
