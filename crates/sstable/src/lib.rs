//! # SSTable - Sorted String Table
//!
//! Immutable, block-structured on-disk tables for the HardKV storage engine.
//!
//! When a memtable is rotated out, the engine streams its skip list through a
//! [`TableBuilder`] and persists the result as a table. Tables are
//! *write-once, read-many*: opened through a read-only memory map and never
//! modified, only deleted once no reader references them.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ BLOCK 0 .. BLOCK n-1                                           │
//! │                                                               │
//! │   entry*: overlap (u16) | diff (u16) | diff key | value       │
//! │   offsets (u32 * entries) | entries (u32)                     │
//! │   checksum (u64) | checksum_len (u32)                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX                                                          │
//! │                                                               │
//! │   per block: base key, offset, length                         │
//! │   bloom filter bytes, max version, key count, stale bytes     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ index_len (u32) | checksum (u64) | checksum_len (u32)          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. `value` is a [`memtable::ValueStruct`]
//! (`meta | uvarint expires_at | bytes`). Keys inside a block are stored
//! relative to the block's first key: `overlap` bytes come from that base
//! key and `diff` bytes follow literally. The file is parsed from the end:
//! checksum length, checksum, index length, index.
//!
//! ## Iterators
//!
//! | Iterator           | Walks                                         |
//! |--------------------|-----------------------------------------------|
//! | [`BlockIterator`]  | entries of one decoded block                  |
//! | [`TableIterator`]  | all blocks of one table, either direction     |
//! | [`ConcatIterator`] | a level's sorted, non-overlapping tables      |
//! | [`MergeIterator`]  | any sources, newest version per user key      |

mod block;
mod builder;
mod cache;
mod concat;
mod format;
mod merge;
mod table;

pub use block::{Block, BlockIterator};
pub use builder::{TableBuilder, TableOptions};
pub use cache::BlockCache;
pub use concat::ConcatIterator;
pub use format::{checksum, BlockOffset, TableIndex, CHECKSUM_LEN};
pub use merge::MergeIterator;
pub use table::{Table, TableIterator};

use memtable::MemtableError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extension of table files.
pub const SST_EXT: &str = "sst";

/// Errors that can occur while building or reading tables.
#[derive(Debug, Error)]
pub enum SstError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Stored and computed checksums differ.
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    /// The checksum length field holds an unsupported value.
    #[error("invalid checksum length {0}")]
    BadChecksumLen(u32),

    /// Structurally invalid bytes.
    #[error("corrupt table: {0}")]
    Corrupt(String),

    /// Requested a block the index does not describe.
    #[error("block {idx} out of range ({count} blocks)")]
    BlockOutOfRange { idx: usize, count: usize },

    /// Size accounting would overflow a 32-bit offset.
    #[error("integer overflow in table size accounting")]
    IntegerOverflow,

    /// Keys are limited to `u16::MAX` bytes by the block entry header.
    #[error("key of {0} bytes exceeds the maximum key size")]
    KeyTooLarge(usize),

    /// Keys must arrive in strictly increasing order.
    #[error("key out of order")]
    OutOfOrder,

    /// Refusing to persist a table without entries.
    #[error("refusing to write an empty table")]
    Empty,

    #[error(transparent)]
    Memtable(#[from] MemtableError),
}

impl SstError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        SstError::Corrupt(msg.into())
    }
}

/// Builds the path of table `fid` inside `dir`.
#[must_use]
pub fn table_file_path(dir: &Path, fid: u64) -> PathBuf {
    dir.join(format!("{fid:05}.{SST_EXT}"))
}

/// Parses the file id out of a `NNNNN.<ext>` file name.
#[must_use]
pub fn parse_file_id(path: &Path, ext: &str) -> Option<u64> {
    if path.extension()?.to_str()? != ext {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests;
