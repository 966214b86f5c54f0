//! # Memtable - Arena-backed Skip List
//!
//! The in-memory write buffer of the HardKV storage engine, plus the entry
//! model and key encodings every other crate builds on.
//!
//! ```text
//! ┌──────────────────────── Arena (Vec<u8>) ────────────────────────┐
//! │ 0 │ head node │ node │ key │ value │ node │ key │ value │ ...    │
//! └───────────────────────────────────────────────────────────────────┘
//!       ▲   next[i] offsets thread nodes into levels
//!       │
//!  SkipList { head, height, len }
//! ```
//!
//! Nodes refer to one another by `u32` arena offsets, never by pointer, so the
//! arena may reallocate freely. Mutation needs `&mut SkipList`; the engine
//! wraps each list in a lock so growth never races with readers.
//!
//! | Module       | Purpose                                              |
//! |--------------|------------------------------------------------------|
//! | [`arena`]    | Offset allocator and node field accessors            |
//! | [`skiplist`] | Ordered index with deterministic rebuild             |
//! | [`entry`]    | `Entry`, `ValueStruct`, versioned keys, varints      |
//! | [`iterator`] | `StorageIterator` cursor trait                       |

pub mod arena;
pub mod entry;
pub mod iterator;
pub mod skiplist;

pub use arena::Arena;
pub use entry::{
    compare_keys, key_with_ts, now_secs, parse_key, parse_ts, same_key, Entry, ValueStruct,
    BIT_DELETE, MAX_KEY_SIZE, TS_SIZE,
};
pub use iterator::{StorageIterator, VecIterator};
pub use skiplist::{SkipList, SkipListIterator};

use thiserror::Error;

/// Errors raised by the arena and skip list.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Keys must be non-empty.
    #[error("key cannot be empty")]
    EmptyKey,

    /// The arena hit its hard size limit.
    #[error("arena full: requested {requested} bytes with {used} of {max} in use")]
    ArenaFull {
        requested: usize,
        used: usize,
        max: usize,
    },

    /// Size arithmetic overflowed.
    #[error("integer overflow")]
    IntegerOverflow,

    /// A stored value could not be decoded.
    #[error("corrupt value encoding")]
    CorruptValue,
}
