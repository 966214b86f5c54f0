//! # Manifest - table set log
//!
//! Records which tables exist and at which level so the level structure can
//! be rebuilt after a restart.
//!
//! ## File Format
//!
//! ```text
//! "HARD" | version (u32 BE)
//! record*: len (u32 BE) | crc32c(payload) (u32 BE) | payload
//!
//! payload (change set):
//!   count (u32)
//!   per change: op (u8, 0 = create, 1 = delete) | id (u64) | level (u32)
//!               | checksum_len (u16) | checksum
//! ```
//!
//! ## Crash Safety
//!
//! Records are appended and fsynced one change set at a time. A record cut
//! short by a crash ends replay and is truncated away. A record that is
//! complete but fails its checksum is corruption and aborts the open.
//!
//! Once deletions dominate the log it is rewritten as a single snapshot of
//! `Create` records: written to `MANIFEST.rewrite`, fsynced, then renamed
//! over `MANIFEST`.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the manifest file within the work directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

/// Temporary file used while rewriting.
const MANIFEST_REWRITE_FILENAME: &str = "MANIFEST.rewrite";

const MAGIC_TEXT: &[u8; 4] = b"HARD";
const MAGIC_VERSION: u32 = 1;
const HEADER_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest has a bad magic header")]
    BadMagic,

    #[error("manifest has unsupported version {0} (supported: {MAGIC_VERSION})")]
    UnsupportedVersion(u32),

    #[error("manifest record checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    #[error("corrupt manifest record: {0}")]
    Corrupt(&'static str),

    #[error("manifest invalid: table {0} already exists")]
    TableExists(u64),

    #[error("manifest removes non-existing table {0}")]
    UnknownTable(u64),

    #[error("file does not exist for table {0}")]
    MissingTable(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Delete,
}

/// One table-set mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestChange {
    pub op: ChangeOp,
    pub id: u64,
    pub level: u32,
    pub checksum: Vec<u8>,
}

impl ManifestChange {
    pub fn create(id: u64, level: u32, checksum: Vec<u8>) -> Self {
        Self {
            op: ChangeOp::Create,
            id,
            level,
            checksum,
        }
    }

    pub fn delete(id: u64) -> Self {
        Self {
            op: ChangeOp::Delete,
            id,
            level: 0,
            checksum: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableManifest {
    pub level: u32,
    pub checksum: Vec<u8>,
}

/// The table set reconstructed from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Table ids per level.
    pub levels: Vec<HashSet<u64>>,
    pub tables: HashMap<u64, TableManifest>,
    pub creations: usize,
    pub deletions: usize,
}

impl Manifest {
    fn apply(&mut self, change: &ManifestChange) -> Result<(), ManifestError> {
        match change.op {
            ChangeOp::Create => {
                if self.tables.contains_key(&change.id) {
                    return Err(ManifestError::TableExists(change.id));
                }
                self.tables.insert(
                    change.id,
                    TableManifest {
                        level: change.level,
                        checksum: change.checksum.clone(),
                    },
                );
                let level = change.level as usize;
                if self.levels.len() <= level {
                    self.levels.resize_with(level + 1, HashSet::new);
                }
                self.levels[level].insert(change.id);
                self.creations += 1;
            }
            ChangeOp::Delete => {
                let tm = self
                    .tables
                    .remove(&change.id)
                    .ok_or(ManifestError::UnknownTable(change.id))?;
                if let Some(level) = self.levels.get_mut(tm.level as usize) {
                    level.remove(&change.id);
                }
                self.deletions += 1;
            }
        }
        Ok(())
    }

    fn apply_all(&mut self, changes: &[ManifestChange]) -> Result<(), ManifestError> {
        changes.iter().try_for_each(|c| self.apply(c))
    }

    /// Current state as `Create` changes, ordered by id.
    fn as_changes(&self) -> Vec<ManifestChange> {
        let mut changes: Vec<_> = self
            .tables
            .iter()
            .map(|(&id, tm)| ManifestChange::create(id, tm.level, tm.checksum.clone()))
            .collect();
        changes.sort_by_key(|c| c.id);
        changes
    }
}

/// The manifest log on disk plus its in-memory state.
///
/// Internally synchronized: every mutation, including a rewrite, happens
/// under one lock.
pub struct ManifestFile {
    dir: PathBuf,
    deletions_threshold: usize,
    deletions_ratio: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    manifest: Manifest,
}

impl ManifestFile {
    /// Opens `dir/MANIFEST`, replaying it, or creates an empty one.
    ///
    /// A partial record at the tail is truncated away.
    pub fn open(
        dir: &Path,
        deletions_threshold: usize,
        deletions_ratio: usize,
    ) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILENAME);
        let (file, manifest) = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(mut file) => {
                let (manifest, trunc_offset) = replay(&mut file)?;
                let len = file.metadata()?.len();
                if trunc_offset < len {
                    tracing::warn!(
                        offset = trunc_offset,
                        dropped = len - trunc_offset,
                        "truncating partial manifest record"
                    );
                    file.set_len(trunc_offset)?;
                }
                file.seek(SeekFrom::End(0))?;
                (file, manifest)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut manifest = Manifest::default();
                let file = help_rewrite(dir, &mut manifest)?;
                (file, manifest)
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            tables = manifest.tables.len(),
            creations = manifest.creations,
            deletions = manifest.deletions,
            "opened manifest"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            deletions_threshold,
            deletions_ratio,
            inner: Mutex::new(Inner { file, manifest }),
        })
    }

    /// Snapshot of the current table set.
    pub fn manifest(&self) -> Manifest {
        self.inner.lock().manifest.clone()
    }

    /// Applies `changes` and persists them as one record.
    ///
    /// The in-memory state only changes if every change applies cleanly and
    /// the record (or rewrite) is durable.
    pub fn add_changes(&self, changes: &[ManifestChange]) -> Result<(), ManifestError> {
        let payload = encode_change_set(changes)?;
        let mut inner = self.inner.lock();

        let mut next = inner.manifest.clone();
        next.apply_all(changes)?;

        let live = next.creations.saturating_sub(next.deletions);
        if next.deletions > self.deletions_threshold
            && next.deletions > self.deletions_ratio.saturating_mul(live)
        {
            inner.file = help_rewrite(&self.dir, &mut next)?;
            tracing::info!(tables = next.tables.len(), "rewrote manifest");
        } else {
            let mut record = Vec::with_capacity(8 + payload.len());
            record.write_u32::<BigEndian>(payload.len() as u32)?;
            record.write_u32::<BigEndian>(crc32c::crc32c(&payload))?;
            record.extend_from_slice(&payload);
            inner.file.write_all(&record)?;
            inner.file.sync_all()?;
        }
        inner.manifest = next;
        Ok(())
    }

    /// Records a new table at `level`.
    pub fn add_table_meta(&self, level: u32, id: u64, checksum: Vec<u8>) -> Result<(), ManifestError> {
        self.add_changes(&[ManifestChange::create(id, level, checksum)])
    }

    /// Reconciles the manifest with the table files found on disk.
    ///
    /// A table the manifest knows but the directory lacks is an error; a file
    /// the manifest does not know is an orphan and is deleted.
    pub fn revert_to_manifest(&self, on_disk: &HashSet<u64>) -> Result<(), ManifestError> {
        let inner = self.inner.lock();
        if let Some(&id) = inner
            .manifest
            .tables
            .keys()
            .find(|id| !on_disk.contains(id))
        {
            return Err(ManifestError::MissingTable(id));
        }
        for &id in on_disk {
            if !inner.manifest.tables.contains_key(&id) {
                tracing::warn!(fid = id, "table file not referenced in manifest, deleting");
                fs::remove_file(sstable::table_file_path(&self.dir, id))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ManifestFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ManifestFile")
            .field("dir", &self.dir)
            .field("tables", &inner.manifest.tables.len())
            .field("creations", &inner.manifest.creations)
            .field("deletions", &inner.manifest.deletions)
            .finish()
    }
}

/// Replays the whole log and returns the state plus the offset just past
/// the last complete record.
fn replay(file: &mut File) -> Result<(Manifest, u64), ManifestError> {
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut data)?;

    if data.len() < HEADER_SIZE || &data[..4] != MAGIC_TEXT {
        return Err(ManifestError::BadMagic);
    }
    let version = BigEndian::read_u32(&data[4..8]);
    if version != MAGIC_VERSION {
        return Err(ManifestError::UnsupportedVersion(version));
    }

    let mut manifest = Manifest::default();
    let mut offset = HEADER_SIZE;
    loop {
        let rest = &data[offset..];
        if rest.len() < 8 {
            break;
        }
        let len = BigEndian::read_u32(&rest[..4]) as usize;
        let crc = BigEndian::read_u32(&rest[4..8]);
        let Some(payload) = rest.get(8..8 + len) else {
            break;
        };
        if crc32c::crc32c(payload) != crc {
            return Err(ManifestError::ChecksumMismatch(offset as u64));
        }
        manifest.apply_all(&decode_change_set(payload)?)?;
        offset += 8 + len;
    }
    Ok((manifest, offset as u64))
}

/// Writes a fresh log holding only the current tables and swaps it in.
/// Resets the counters of `manifest` to match.
fn help_rewrite(dir: &Path, manifest: &mut Manifest) -> Result<File, ManifestError> {
    let rewrite_path = dir.join(MANIFEST_REWRITE_FILENAME);
    let manifest_path = dir.join(MANIFEST_FILENAME);

    let changes = manifest.as_changes();
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(MAGIC_TEXT);
    buf.write_u32::<BigEndian>(MAGIC_VERSION)?;
    // A fresh or emptied manifest is just the header.
    if !changes.is_empty() {
        let payload = encode_change_set(&changes)?;
        buf.write_u32::<BigEndian>(payload.len() as u32)?;
        buf.write_u32::<BigEndian>(crc32c::crc32c(&payload))?;
        buf.extend_from_slice(&payload);
    }
    {
        let mut fp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&rewrite_path)?;
        fp.write_all(&buf)?;
        fp.sync_all()?;
    }
    fs::rename(&rewrite_path, &manifest_path)?;
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }

    let mut file = OpenOptions::new().read(true).write(true).open(&manifest_path)?;
    file.seek(SeekFrom::End(0))?;

    manifest.creations = manifest.tables.len();
    manifest.deletions = 0;
    Ok(file)
}

fn encode_change_set(changes: &[ManifestChange]) -> Result<Vec<u8>, ManifestError> {
    let mut out = Vec::with_capacity(4 + changes.len() * 24);
    out.write_u32::<BigEndian>(changes.len() as u32)?;
    for c in changes {
        out.write_u8(match c.op {
            ChangeOp::Create => 0,
            ChangeOp::Delete => 1,
        })?;
        out.write_u64::<BigEndian>(c.id)?;
        out.write_u32::<BigEndian>(c.level)?;
        let len = u16::try_from(c.checksum.len())
            .map_err(|_| ManifestError::Corrupt("checksum too long"))?;
        out.write_u16::<BigEndian>(len)?;
        out.extend_from_slice(&c.checksum);
    }
    Ok(out)
}

fn decode_change_set(mut data: &[u8]) -> Result<Vec<ManifestChange>, ManifestError> {
    let bad = |_| ManifestError::Corrupt("truncated change set");
    let count = data.read_u32::<BigEndian>().map_err(bad)? as usize;
    // Each change takes at least 15 bytes.
    if count > data.len() / 15 {
        return Err(ManifestError::Corrupt("change count exceeds record size"));
    }
    let mut changes = Vec::with_capacity(count);
    for _ in 0..count {
        let op = match data.read_u8().map_err(bad)? {
            0 => ChangeOp::Create,
            1 => ChangeOp::Delete,
            _ => return Err(ManifestError::Corrupt("invalid change op")),
        };
        let id = data.read_u64::<BigEndian>().map_err(bad)?;
        let level = data.read_u32::<BigEndian>().map_err(bad)?;
        let len = data.read_u16::<BigEndian>().map_err(bad)? as usize;
        if data.len() < len {
            return Err(ManifestError::Corrupt("truncated checksum"));
        }
        let (checksum, rest) = data.split_at(len);
        data = rest;
        changes.push(ManifestChange {
            op,
            id,
            level,
            checksum: checksum.to_vec(),
        });
    }
    if !data.is_empty() {
        return Err(ManifestError::Corrupt("trailing bytes in change set"));
    }
    Ok(changes)
}
