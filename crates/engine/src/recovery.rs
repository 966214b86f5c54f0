//! Cold start: `Engine::open`.
//!
//! Opens the manifest and every table it lists, replays WAL files left by
//! the previous run into memtables, flushes them to level 0 and seeds the
//! version counter and the file id allocator from what was found on disk.

use anyhow::{Context, Result};
use config::Options;
use parking_lot::{Mutex, RwLock};
use sstable::parse_file_id;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use wal::WAL_EXT;

use crate::closer::Closer;
use crate::compaction::spawn_merge_worker;
use crate::levels::LevelManager;
use crate::mem::MemTable;
use crate::Engine;

impl Engine {
    /// Opens (or creates) the engine in `opts.work_dir`.
    ///
    /// # Errors
    ///
    /// Invalid options, manifest corruption, a table listed in the manifest
    /// but missing on disk, or any I/O failure while replaying WALs.
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        fs::create_dir_all(&opts.work_dir).with_context(|| {
            format!("failed to create work dir {}", opts.work_dir.display())
        })?;
        cleanup_tmp_files(&opts.work_dir);

        let levels = Arc::new(LevelManager::open(&opts)?);

        let wal_fids = list_wal_fids(&opts.work_dir)?;
        for &fid in &wal_fids {
            levels.observe_fid(fid);
        }

        let mut max_version = levels.max_version();
        for fid in wal_fids {
            let (mem, replayed_max) =
                MemTable::recover(&opts.work_dir, fid, opts.memtable_size, opts.sync_writes)?;
            max_version = max_version.max(replayed_max);
            if !mem.is_empty() {
                levels
                    .flush(&mem)
                    .with_context(|| format!("failed to flush recovered wal {fid}"))?;
            }
            mem.delete_wal()?;
        }

        let fid = levels.next_fid();
        let mem = MemTable::create(&opts.work_dir, fid, opts.memtable_size, opts.sync_writes)?;

        let closer = Arc::new(Closer::new());
        let worker = spawn_merge_worker(
            Arc::clone(&levels),
            Arc::clone(&closer),
            opts.merge_interval,
        )?;

        tracing::info!(
            dir = %opts.work_dir.display(),
            next_version = max_version + 1,
            wal = fid,
            tables = levels.stats().iter().map(|l| l.tables).sum::<usize>(),
            "engine opened"
        );

        Ok(Self {
            opts,
            mem: RwLock::new(Arc::new(mem)),
            immutables: RwLock::new(Vec::new()),
            levels,
            write_lock: Mutex::new(()),
            next_version: AtomicU64::new(max_version + 1),
            closer,
            merge_worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }
}

/// Ids of the `*.wal` files in `dir`, ascending.
fn list_wal_fids(dir: &Path) -> Result<Vec<u64>> {
    let mut fids = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Some(fid) = parse_file_id(&entry?.path(), WAL_EXT) {
            fids.push(fid);
        }
    }
    fids.sort_unstable();
    Ok(fids)
}

/// Removes leftover `.sst.tmp` files from interrupted flushes.
pub(crate) fn cleanup_tmp_files(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".sst.tmp") {
                    tracing::debug!(path = %p.display(), "removing leftover temp table");
                    let _ = fs::remove_file(&p);
                }
            }
        }
    }
}
