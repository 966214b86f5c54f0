//! # WAL - Write-Ahead Log
//!
//! Provides crash-safe durability for one HardKV memtable.
//!
//! Every write is serialized into a checksummed record and copied into a
//! memory-mapped, growable file **before** the corresponding skip list
//! insert. On restart the log is replayed to rebuild the memtable.
//!
//! ## Binary Record Format
//!
//! ```text
//! [key_len: uvarint][value_len: uvarint][meta: uvarint][expires_at: uvarint]
//! [key bytes][value bytes][crc32c(header + key + value): u32 BE]
//! ```
//!
//! The mapped region is usually larger than the data written so far. The
//! unused tail is zero, and a zero key length marks the end of the log.
//!
//! ## Recovery
//!
//! [`WalFile::iterate`] stops at the first record that is incomplete, fails
//! its CRC, or declares an impossible key length. Everything before it is
//! delivered; the caller then [`truncate`](WalFile::truncate)s the file to
//! the returned offset. A torn tail from a crash mid-write is therefore not
//! an error.
//!
//! ## Example
//!
//! ```rust,no_run
//! use memtable::Entry;
//! use wal::WalFile;
//!
//! let mut wal = WalFile::open("00001.wal", 1, 1 << 20, false).unwrap();
//! wal.write(&Entry::new("hello", "world")).unwrap();
//! let end = wal.iterate(0, |e| { println!("{:?}", e.key); Ok(()) }).unwrap();
//! assert_eq!(end, wal.size());
//! ```

use byteorder::{BigEndian, ByteOrder};
use memmap2::MmapMut;
use memtable::entry::{put_uvarint, uvarint, MAX_VARINT_LEN};
use memtable::{Entry, MAX_KEY_SIZE};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// File extension of log files.
pub const WAL_EXT: &str = "wal";

/// Size of the trailing checksum.
const CRC_SIZE: usize = 4;

/// Largest single growth step of the mapping.
const MAX_GROW_STEP: usize = 1 << 30;

/// Worst-case header: key_len, value_len, meta, expires_at.
const MAX_HEADER_SIZE: usize = 5 + 5 + 2 + MAX_VARINT_LEN;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// `truncate` was asked to extend the log.
    #[error("cannot truncate wal of {len} bytes to {end}")]
    InvalidTruncate { end: usize, len: usize },

    /// A record exceeds what the format can hold.
    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),

    /// The replay callback failed to apply a record.
    #[error("failed to apply record: {0}")]
    Apply(#[from] memtable::MemtableError),
}

/// Builds the path of log file `fid` inside `dir`.
#[must_use]
pub fn wal_file_path(dir: &Path, fid: u64) -> PathBuf {
    dir.join(format!("{fid:05}.{WAL_EXT}"))
}

/// Upper bound of the bytes `entry` occupies in the log.
#[must_use]
pub fn estimate_entry_size(entry: &Entry) -> usize {
    MAX_HEADER_SIZE + entry.key.len() + entry.value.len() + CRC_SIZE
}

/// A memory-mapped, append-only log file.
pub struct WalFile {
    fid: u64,
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    /// Offset where the next record goes.
    write_at: usize,
    sync: bool,
    /// Reusable scratch buffer to avoid allocation on every write.
    buf: Vec<u8>,
}

impl WalFile {
    /// Opens (or creates) the log at `path`.
    ///
    /// A new or empty file is extended to `capacity` bytes before mapping.
    /// The write cursor starts at zero: callers reopening an existing log
    /// must [`iterate`](Self::iterate) and [`truncate`](Self::truncate)
    /// before writing.
    ///
    /// # Arguments
    ///
    /// * `path` - file system path for the log.
    /// * `fid` - file id encoded in the name.
    /// * `capacity` - initial mapping size for a fresh file.
    /// * `sync` - if true, every `write` msyncs the record's pages.
    pub fn open<P: AsRef<Path>>(
        path: P,
        fid: u64,
        capacity: usize,
        sync: bool,
    ) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            file.set_len(capacity.max(1) as u64)?;
        }
        // SAFETY: the file is owned by this handle for its whole lifetime and
        // only ever resized through `&mut self`, which also replaces the map.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            fid,
            path,
            file,
            mmap,
            write_at: 0,
            sync,
            buf: Vec::with_capacity(256),
        })
    }

    #[must_use]
    pub fn fid(&self) -> u64 {
        self.fid
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of valid records written so far.
    #[must_use]
    pub fn size(&self) -> usize {
        self.write_at
    }

    /// Serializes `entry` and appends it at the write cursor.
    pub fn write(&mut self, entry: &Entry) -> Result<(), WalError> {
        if entry.key.len() > MAX_KEY_SIZE {
            return Err(WalError::RecordTooLarge(entry.key.len()));
        }
        if entry.value.len() > u32::MAX as usize {
            return Err(WalError::RecordTooLarge(entry.value.len()));
        }

        // Reuse the internal buffer - clear but keep the allocation
        self.buf.clear();
        put_uvarint(&mut self.buf, entry.key.len() as u64);
        put_uvarint(&mut self.buf, entry.value.len() as u64);
        put_uvarint(&mut self.buf, u64::from(entry.meta));
        put_uvarint(&mut self.buf, entry.expires_at);
        self.buf.extend_from_slice(&entry.key);
        self.buf.extend_from_slice(&entry.value);
        let crc = crc32c::crc32c(&self.buf);
        self.buf.extend_from_slice(&crc.to_be_bytes());

        self.reserve(self.buf.len())?;
        let start = self.write_at;
        let end = start + self.buf.len();
        self.mmap[start..end].copy_from_slice(&self.buf);
        self.write_at = end;

        if self.sync {
            self.mmap.flush_range(start, end - start)?;
        }
        Ok(())
    }

    /// Replays records starting at `from`, calling `apply` for each one, and
    /// returns the offset just past the last valid record.
    ///
    /// # Termination
    ///
    /// - **Zero key length** (unused tail) -> clean end.
    /// - **Incomplete record, CRC mismatch, oversized key** -> stops there;
    ///   logged as a truncated tail.
    /// - **Error from `apply`** -> propagated.
    pub fn iterate<F>(&self, from: usize, mut apply: F) -> Result<usize, WalError>
    where
        F: FnMut(Entry) -> Result<(), WalError>,
    {
        let data = &self.mmap[..];
        let mut offset = from.min(data.len());
        loop {
            match decode_record(&data[offset..]) {
                Record::Entry(entry, len) => {
                    apply(entry)?;
                    offset += len;
                }
                Record::End => break,
                Record::Torn(reason) => {
                    tracing::warn!(
                        fid = self.fid,
                        offset,
                        reason,
                        "wal replay stopped at torn record"
                    );
                    break;
                }
            }
        }
        Ok(offset)
    }

    /// Cuts the file back to `end` bytes and moves the write cursor there.
    pub fn truncate(&mut self, end: usize) -> Result<(), WalError> {
        let len = self.mmap.len();
        if end > len {
            return Err(WalError::InvalidTruncate { end, len });
        }
        self.mmap.flush()?;
        // An empty log keeps a small mapping so the map is never zero-sized.
        let new_len = if end == 0 { len.min(4096).max(1) } else { end };
        if end == 0 {
            self.mmap[..new_len].fill(0);
        }
        self.remap(new_len)?;
        self.write_at = end;
        Ok(())
    }

    /// Flushes dirty pages of the mapping to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Syncs and trims the unused tail, leaving exactly the valid records.
    pub fn close(self) -> Result<(), WalError> {
        self.mmap.flush()?;
        let Self {
            file,
            mmap,
            write_at,
            ..
        } = self;
        drop(mmap);
        file.set_len(write_at as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// Unmaps and removes the file. Used once its memtable is on disk.
    pub fn delete(self) -> Result<(), WalError> {
        let Self {
            path, file, mmap, ..
        } = self;
        drop(mmap);
        drop(file);
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Grows the mapping so `need` more bytes fit after the write cursor.
    fn reserve(&mut self, need: usize) -> Result<(), WalError> {
        let end = self.write_at + need;
        let len = self.mmap.len();
        if end <= len {
            return Ok(());
        }
        let grow = len.clamp(need, MAX_GROW_STEP.max(need));
        self.mmap.flush()?;
        self.remap((len + grow).max(end))
    }

    fn remap(&mut self, new_len: usize) -> Result<(), WalError> {
        self.file.set_len(new_len as u64)?;
        // SAFETY: see `open`; we hold `&mut self`, so no slice of the old
        // mapping is alive.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }
}

impl std::fmt::Debug for WalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalFile")
            .field("fid", &self.fid)
            .field("path", &self.path)
            .field("size", &self.write_at)
            .field("mapped", &self.mmap.len())
            .finish()
    }
}

enum Record {
    Entry(Entry, usize),
    End,
    Torn(&'static str),
}

fn decode_record(buf: &[u8]) -> Record {
    let mut pos = 0;
    let mut header = [0u64; 4];
    for field in header.iter_mut() {
        match uvarint(&buf[pos..]) {
            Some((v, n)) => {
                *field = v;
                pos += n;
            }
            None if buf[pos..].iter().all(|&b| b == 0) => return Record::End,
            None => return Record::Torn("truncated header"),
        }
    }
    let [key_len, value_len, meta, expires_at] = header;

    if key_len == 0 {
        return Record::End;
    }
    if key_len > MAX_KEY_SIZE as u64 || meta > u64::from(u8::MAX) {
        return Record::Torn("implausible header");
    }
    let record_end = (pos as u64)
        .checked_add(key_len)
        .and_then(|n| n.checked_add(value_len))
        .and_then(|n| n.checked_add(CRC_SIZE as u64));
    let body_end = match record_end {
        Some(end) if end <= buf.len() as u64 => end as usize - CRC_SIZE,
        _ => return Record::Torn("truncated body"),
    };

    let stored = BigEndian::read_u32(&buf[body_end..body_end + CRC_SIZE]);
    if crc32c::crc32c(&buf[..body_end]) != stored {
        return Record::Torn("checksum mismatch");
    }

    let key_end = pos + key_len as usize;
    let entry = Entry {
        key: buf[pos..key_end].to_vec(),
        value: buf[key_end..body_end].to_vec(),
        expires_at,
        meta: meta as u8,
        version: memtable::parse_ts(&buf[pos..key_end]),
    };
    Record::Entry(entry, body_end + CRC_SIZE)
}

#[cfg(test)]
mod tests;
