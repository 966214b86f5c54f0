//! Append-only byte arena handing out `u32` offsets.
//!
//! Offset `0` is reserved so it can stand for "no node". Growth copies the
//! existing buffer into a larger one, so offsets stay valid but borrowed
//! slices do not survive an allocation. Every allocating method takes
//! `&mut self`; readers only ever hold `&self`.
//!
//! ## Node layout (little-endian)
//!
//! ```text
//! 0        8            12         16       18   20
//! ┌────────┬────────────┬──────────┬────────┬────┬──────────────────────┐
//! │ value  │ key_offset │ key_len  │ height │pad │ next[0..height] u32  │
//! │ u64    │ u32        │ u32      │ u16    │    │                      │
//! └────────┴────────────┴──────────┴────────┴────┴──────────────────────┘
//! value = (value_offset << 32) | value_len
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::entry::ValueStruct;
use crate::MemtableError;

/// Hard ceiling on arena size; offsets must fit in a `u32`.
pub const MAX_ARENA_SIZE: usize = 1 << 30;
/// Smallest buffer an arena starts with.
pub const MIN_ARENA_SIZE: usize = 1000;
/// Tallest tower a node may have.
pub const MAX_HEIGHT: usize = 20;

const NODE_ALIGN: usize = 8;
const VALUE_POS: usize = 0;
const KEY_OFFSET_POS: usize = 8;
const KEY_LEN_POS: usize = 12;
const HEIGHT_POS: usize = 16;
const TOWER_POS: usize = 20;

/// Number of arena bytes a node of `height` levels occupies.
#[must_use]
pub fn node_size(height: usize) -> usize {
    TOWER_POS + height * 4
}

pub struct Arena {
    buf: Vec<u8>,
    pointer: usize,
    full: bool,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_ARENA_SIZE, MAX_ARENA_SIZE);
        Self {
            buf: vec![0u8; capacity],
            // Offset 0 means "none".
            pointer: 1,
            full: false,
        }
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pointer
    }

    /// Current buffer length.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// `true` once the buffer reached [`MAX_ARENA_SIZE`] and can no longer grow.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Reserves `size` bytes and returns the start offset.
    ///
    /// # Errors
    ///
    /// Returns [`MemtableError::ArenaFull`] if the request does not fit even
    /// after growing to [`MAX_ARENA_SIZE`].
    pub fn allocate(&mut self, size: usize) -> Result<u32, MemtableError> {
        let offset = self.pointer;
        let end = offset
            .checked_add(size)
            .ok_or(MemtableError::IntegerOverflow)?;

        if end > self.buf.len() {
            let mut grow = self.buf.len().max(size);
            if self.buf.len() + grow > MAX_ARENA_SIZE {
                grow = MAX_ARENA_SIZE - self.buf.len();
                self.full = true;
            }
            if self.buf.len() + grow < end {
                return Err(MemtableError::ArenaFull {
                    requested: size,
                    used: self.pointer,
                    max: MAX_ARENA_SIZE,
                });
            }
            self.buf.resize(self.buf.len() + grow, 0);
        }

        self.pointer = end;
        Ok(offset as u32)
    }

    pub fn put_key(&mut self, key: &[u8]) -> Result<u32, MemtableError> {
        let offset = self.allocate(key.len())?;
        let start = offset as usize;
        self.buf[start..start + key.len()].copy_from_slice(key);
        Ok(offset)
    }

    pub fn put_value(&mut self, vs: &ValueStruct) -> Result<u32, MemtableError> {
        let size = vs.encoded_size();
        let offset = self.allocate(size)?;
        let start = offset as usize;
        vs.encode_into(&mut self.buf[start..start + size]);
        Ok(offset)
    }

    /// Allocates a zeroed, aligned node with room for `height` tower slots.
    pub fn put_node(&mut self, height: usize) -> Result<u32, MemtableError> {
        let size = node_size(height) + NODE_ALIGN - 1;
        let raw = self.allocate(size)? as usize;
        let aligned = (raw + NODE_ALIGN - 1) & !(NODE_ALIGN - 1);
        LittleEndian::write_u16(&mut self.buf[aligned + HEIGHT_POS..], height as u16);
        Ok(aligned as u32)
    }

    #[must_use]
    pub fn get_key(&self, offset: u32, len: u32) -> &[u8] {
        let start = offset as usize;
        &self.buf[start..start + len as usize]
    }

    /// Decodes the value stored at `offset`.
    pub fn get_value(&self, offset: u32, len: u32) -> Result<ValueStruct, MemtableError> {
        ValueStruct::decode(self.get_key(offset, len))
    }

    // -------------------- Node fields --------------------

    #[must_use]
    pub fn node_value(&self, node: u32) -> (u32, u32) {
        let packed = LittleEndian::read_u64(&self.buf[node as usize + VALUE_POS..]);
        ((packed >> 32) as u32, packed as u32)
    }

    pub fn set_node_value(&mut self, node: u32, offset: u32, len: u32) {
        let packed = (u64::from(offset) << 32) | u64::from(len);
        LittleEndian::write_u64(&mut self.buf[node as usize + VALUE_POS..], packed);
    }

    #[must_use]
    pub fn node_key(&self, node: u32) -> &[u8] {
        let base = node as usize;
        let offset = LittleEndian::read_u32(&self.buf[base + KEY_OFFSET_POS..]);
        let len = LittleEndian::read_u32(&self.buf[base + KEY_LEN_POS..]);
        self.get_key(offset, len)
    }

    pub fn set_node_key(&mut self, node: u32, offset: u32, len: u32) {
        let base = node as usize;
        LittleEndian::write_u32(&mut self.buf[base + KEY_OFFSET_POS..], offset);
        LittleEndian::write_u32(&mut self.buf[base + KEY_LEN_POS..], len);
    }

    #[must_use]
    pub fn node_height(&self, node: u32) -> usize {
        usize::from(LittleEndian::read_u16(&self.buf[node as usize + HEIGHT_POS..]))
    }

    /// Next node at `level`, or `0` for the end of that level.
    #[must_use]
    pub fn next(&self, node: u32, level: usize) -> u32 {
        debug_assert!(level < self.node_height(node));
        LittleEndian::read_u32(&self.buf[node as usize + TOWER_POS + level * 4..])
    }

    pub fn set_next(&mut self, node: u32, level: usize, to: u32) {
        debug_assert!(level < self.node_height(node));
        LittleEndian::write_u32(&mut self.buf[node as usize + TOWER_POS + level * 4..], to);
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("size", &self.pointer)
            .field("capacity", &self.buf.len())
            .field("full", &self.full)
            .finish()
    }
}
