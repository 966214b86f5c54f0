//! Decoded blocks and the cursor over their entries.

use std::cmp::Ordering;
use std::error::Error;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use memtable::{compare_keys, Entry, StorageIterator, ValueStruct};

use crate::format::{checksum, CHECKSUM_LEN};
use crate::SstError;

/// Size of the per-entry `overlap | diff` header.
pub(crate) const HEADER_SIZE: usize = 4;

/// One block, verified and split into its entry region and offset table.
#[derive(Debug)]
pub struct Block {
    /// Entry bytes only; the offset table and tail are stripped.
    data: Vec<u8>,
    offsets: Vec<u32>,
    base_key: Vec<u8>,
}

impl Block {
    /// Verifies and decodes the raw bytes of one block.
    pub fn decode(raw: &[u8]) -> Result<Self, SstError> {
        let tail = 4 + CHECKSUM_LEN as usize;
        if raw.len() < tail + 4 {
            return Err(SstError::corrupt("block too small"));
        }

        let mut end = raw.len();
        let checksum_len = BigEndian::read_u32(&raw[end - 4..end]);
        if checksum_len != CHECKSUM_LEN {
            return Err(SstError::BadChecksumLen(checksum_len));
        }
        end -= 4;
        let expected = BigEndian::read_u64(&raw[end - 8..end]);
        end -= 8;

        let payload = &raw[..end];
        if checksum(payload) != expected {
            return Err(SstError::ChecksumMismatch("block"));
        }

        let count = BigEndian::read_u32(&payload[end - 4..end]) as usize;
        let offsets_start = count
            .checked_mul(4)
            .and_then(|n| (end - 4).checked_sub(n))
            .ok_or_else(|| SstError::corrupt("block entry count exceeds block size"))?;
        let offsets: Vec<u32> = payload[offsets_start..end - 4]
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .collect();

        let mut block = Self {
            data: payload[..offsets_start].to_vec(),
            offsets,
            base_key: Vec::new(),
        };
        if block.offsets.is_empty() {
            return Err(SstError::corrupt("block without entries"));
        }
        let (start, _) = block.entry_bounds(0)?;
        if BigEndian::read_u16(&block.data[start..start + 2]) != 0 {
            return Err(SstError::corrupt("first block entry shares a prefix"));
        }
        let (_, diff) = block.entry_key_parts(0)?;
        block.base_key = diff.to_vec();
        Ok(block)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub fn base_key(&self) -> &[u8] {
        &self.base_key
    }

    /// Reconstructs the full key of entry `i`.
    pub fn key_at(&self, i: usize) -> Result<Vec<u8>, SstError> {
        let (prefix, diff) = self.entry_key_parts(i)?;
        let mut key = Vec::with_capacity(prefix.len() + diff.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(diff);
        Ok(key)
    }

    /// Decodes entry `i` with its value.
    pub fn entry_at(&self, i: usize) -> Result<Entry, SstError> {
        let key = self.key_at(i)?;
        let (start, end) = self.entry_bounds(i)?;
        let diff = BigEndian::read_u16(&self.data[start + 2..start + 4]) as usize;
        let value_start = start + HEADER_SIZE + diff;
        let vs = ValueStruct::decode(&self.data[value_start..end])?;
        Ok(Entry::from_parts(key, vs))
    }

    /// Index of the first entry whose key is `>= key`; `len()` if none.
    pub fn search(&self, key: &[u8]) -> Result<usize, SstError> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if compare_keys(&self.key_at(mid)?, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn entry_bounds(&self, i: usize) -> Result<(usize, usize), SstError> {
        let start = *self
            .offsets
            .get(i)
            .ok_or_else(|| SstError::corrupt(format!("entry {i} out of range")))?
            as usize;
        let end = match self.offsets.get(i + 1) {
            Some(&next) => next as usize,
            None => self.data.len(),
        };
        if start + HEADER_SIZE > end || end > self.data.len() {
            return Err(SstError::corrupt("entry offsets out of order"));
        }
        Ok((start, end))
    }

    /// Returns the shared prefix (from the base key) and literal suffix of
    /// entry `i`'s key.
    fn entry_key_parts(&self, i: usize) -> Result<(&[u8], &[u8]), SstError> {
        let (start, end) = self.entry_bounds(i)?;
        let overlap = BigEndian::read_u16(&self.data[start..start + 2]) as usize;
        let diff = BigEndian::read_u16(&self.data[start + 2..start + 4]) as usize;
        let diff_start = start + HEADER_SIZE;
        if diff_start + diff > end || (i > 0 && overlap > self.base_key.len()) {
            return Err(SstError::corrupt("entry key exceeds block"));
        }
        Ok((
            &self.base_key[..overlap.min(self.base_key.len())],
            &self.data[diff_start..diff_start + diff],
        ))
    }
}

/// Cursor over one [`Block`].
pub struct BlockIterator {
    block: Arc<Block>,
    idx: usize,
    item: Option<Entry>,
    err: Option<SstError>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            idx: 0,
            item: None,
            err: None,
        }
    }

    pub fn seek_to_first(&mut self) {
        self.set_idx(0);
    }

    pub fn seek_to_last(&mut self) {
        match self.block.len() {
            0 => self.item = None,
            n => self.set_idx(n - 1),
        }
    }

    /// Positions on the first entry `>= key`.
    pub fn seek_ge(&mut self, key: &[u8]) {
        match self.block.search(key) {
            Ok(i) => self.set_idx(i),
            Err(e) => self.fail(e),
        }
    }

    /// Positions on the last entry `<= key`.
    pub fn seek_le(&mut self, key: &[u8]) {
        self.seek_ge(key);
        match &self.item {
            Some(e) if compare_keys(&e.key, key) == Ordering::Equal => {}
            Some(_) => self.prev(),
            None if self.err.is_none() => self.seek_to_last(),
            None => {}
        }
    }

    pub fn prev(&mut self) {
        if self.item.is_none() || self.idx == 0 {
            self.item = None;
            return;
        }
        self.set_idx(self.idx - 1);
    }

    /// Takes the error that stopped the iterator, if any.
    pub fn take_error(&mut self) -> Option<SstError> {
        self.err.take()
    }

    fn set_idx(&mut self, i: usize) {
        self.idx = i;
        if i >= self.block.len() {
            self.item = None;
            return;
        }
        match self.block.entry_at(i) {
            Ok(e) => self.item = Some(e),
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: SstError) {
        self.item = None;
        self.err = Some(e);
    }
}

impl StorageIterator for BlockIterator {
    fn rewind(&mut self) {
        self.seek_to_first();
    }

    fn seek(&mut self, key: &[u8]) {
        self.seek_ge(key);
    }

    fn next(&mut self) {
        if self.item.is_some() {
            self.set_idx(self.idx + 1);
        }
    }

    fn valid(&self) -> bool {
        self.item.is_some()
    }

    fn item(&self) -> Option<&Entry> {
        self.item.as_ref()
    }

    fn error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.err.as_ref().map(|e| e as &(dyn Error + Send + Sync + 'static))
    }
}
