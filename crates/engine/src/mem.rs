use anyhow::{Context, Result};
use memtable::{Entry, SkipList, StorageIterator, VecIterator};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use wal::{wal_file_path, WalFile};

/// Largest arena a memtable starts with; it grows on demand.
const MAX_INITIAL_ARENA: usize = 1 << 20;

/// A skip list plus the WAL that makes it durable.
///
/// `set` appends to the WAL before touching the skip list, so every visible
/// entry is already logged. The skip list sits behind a `RwLock` because
/// arena growth needs exclusive access.
pub(crate) struct MemTable {
    fid: u64,
    sl: RwLock<SkipList>,
    /// `None` once the WAL was closed or deleted.
    wal: Mutex<Option<WalFile>>,
}

impl MemTable {
    /// Creates an empty memtable with a fresh WAL `fid`.
    pub(crate) fn create(dir: &Path, fid: u64, memtable_size: usize, sync: bool) -> Result<Self> {
        let path = wal_file_path(dir, fid);
        let wal = WalFile::open(&path, fid, memtable_size, sync)
            .with_context(|| format!("failed to create wal {}", path.display()))?;
        Ok(Self {
            fid,
            sl: RwLock::new(SkipList::new(memtable_size.min(MAX_INITIAL_ARENA))?),
            wal: Mutex::new(Some(wal)),
        })
    }

    /// Reopens WAL `fid`, replays it into a new skip list and cuts off any
    /// torn tail. Returns the memtable and the highest version replayed.
    pub(crate) fn recover(
        dir: &Path,
        fid: u64,
        memtable_size: usize,
        sync: bool,
    ) -> Result<(Self, u64)> {
        let path = wal_file_path(dir, fid);
        let mut wal = WalFile::open(&path, fid, memtable_size, sync)
            .with_context(|| format!("failed to open wal {}", path.display()))?;
        let mut sl = SkipList::new(memtable_size.min(MAX_INITIAL_ARENA))?;

        let mut max_version = 0;
        let mut entries = 0usize;
        let end = wal
            .iterate(0, |entry| {
                max_version = max_version.max(entry.version);
                entries += 1;
                sl.add(&entry)?;
                Ok(())
            })
            .with_context(|| format!("while replaying wal {}", path.display()))?;
        wal.truncate(end)?;

        tracing::info!(fid, entries, offset = end, "recovered memtable from wal");
        Ok((
            Self {
                fid,
                sl: RwLock::new(sl),
                wal: Mutex::new(Some(wal)),
            },
            max_version,
        ))
    }

    pub(crate) fn fid(&self) -> u64 {
        self.fid
    }

    /// Logs `entry` and makes it visible.
    pub(crate) fn set(&self, entry: &Entry) -> Result<()> {
        {
            let mut wal = self.wal.lock();
            let wal = wal
                .as_mut()
                .with_context(|| format!("wal {} is closed", self.fid))?;
            wal.write(entry)?;
        }
        self.sl.write().add(entry)?;
        Ok(())
    }

    /// Newest version of `key`'s user key at or below `key`'s version.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let sl = self.sl.read();
        let node = sl.seek_ge(key);
        if node == 0 {
            return Ok(None);
        }
        let entry = sl.decode_node(node)?;
        if memtable::same_key(&entry.key, key) {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Bytes written to the WAL so far.
    pub(crate) fn wal_size(&self) -> usize {
        self.wal.lock().as_ref().map_or(0, WalFile::size)
    }

    pub(crate) fn len(&self) -> usize {
        self.sl.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sl.read().is_empty()
    }

    /// Copies every entry out in key order.
    pub(crate) fn entries(&self) -> Vec<Entry> {
        let sl = self.sl.read();
        let mut it = sl.iter();
        it.rewind();
        let mut out = Vec::with_capacity(sl.len());
        while let Some(e) = it.item() {
            out.push(e.clone());
            it.next();
        }
        out
    }

    /// An iterator over a point-in-time copy of the entries.
    pub(crate) fn snapshot_iter(&self, is_asc: bool) -> VecIterator {
        VecIterator::new(self.entries(), is_asc)
    }

    /// Removes the WAL once the contents are safely in a table.
    pub(crate) fn delete_wal(&self) -> Result<()> {
        if let Some(wal) = self.wal.lock().take() {
            let path = wal.path().to_path_buf();
            wal.delete()
                .with_context(|| format!("failed to delete wal {}", path.display()))?;
        }
        Ok(())
    }

    /// Syncs and trims the WAL, keeping it for the next open.
    pub(crate) fn close(&self) -> Result<()> {
        if let Some(wal) = self.wal.lock().take() {
            wal.close()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("fid", &self.fid)
            .field("entries", &self.len())
            .field("wal_size", &self.wal_size())
            .finish()
    }
}
