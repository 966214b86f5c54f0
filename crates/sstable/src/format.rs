//! Table index and trailer encoding.
//!
//! ```text
//! INDEX
//!   blocks (u32)
//!   per block: key_len (u16) | key | offset (u32) | len (u32)
//!   bloom_len (u32) | bloom bytes
//!   max_version (u64) | key_count (u32) | stale_data_size (u32)
//!
//! TRAILER
//!   index_len (u32) | checksum(index) (u64) | checksum_len (u32) = 8
//! ```

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::SstError;

/// Width of every stored checksum.
pub const CHECKSUM_LEN: u32 = 8;

/// Bytes after the index: index length, checksum, checksum length.
pub(crate) const TRAILER_SIZE: usize = 4 + CHECKSUM_LEN as usize + 4;

/// Checksum used for blocks and the index: CRC32 (IEEE) widened to 64 bits.
#[must_use]
pub fn checksum(data: &[u8]) -> u64 {
    u64::from(crc32fast::hash(data))
}

/// Location and first key of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOffset {
    pub key: Vec<u8>,
    pub offset: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableIndex {
    pub offsets: Vec<BlockOffset>,
    pub bloom_filter: Vec<u8>,
    pub max_version: u64,
    pub key_count: u32,
    pub stale_data_size: u32,
}

impl TableIndex {
    pub fn encode(&self) -> Result<Vec<u8>, SstError> {
        let mut out = Vec::with_capacity(64 + self.bloom_filter.len());
        out.write_u32::<BigEndian>(self.offsets.len() as u32)?;
        for bo in &self.offsets {
            let key_len = u16::try_from(bo.key.len()).map_err(|_| SstError::IntegerOverflow)?;
            out.write_u16::<BigEndian>(key_len)?;
            out.extend_from_slice(&bo.key);
            out.write_u32::<BigEndian>(bo.offset)?;
            out.write_u32::<BigEndian>(bo.len)?;
        }
        let bloom_len =
            u32::try_from(self.bloom_filter.len()).map_err(|_| SstError::IntegerOverflow)?;
        out.write_u32::<BigEndian>(bloom_len)?;
        out.extend_from_slice(&self.bloom_filter);
        out.write_u64::<BigEndian>(self.max_version)?;
        out.write_u32::<BigEndian>(self.key_count)?;
        out.write_u32::<BigEndian>(self.stale_data_size)?;
        Ok(out)
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, SstError> {
        let bad = |_| SstError::corrupt("truncated index");
        let blocks = data.read_u32::<BigEndian>().map_err(bad)? as usize;
        // Every block entry needs at least 10 bytes.
        if blocks > data.len() / 10 {
            return Err(SstError::corrupt("index block count exceeds index size"));
        }
        let mut offsets = Vec::with_capacity(blocks);
        for _ in 0..blocks {
            let key_len = data.read_u16::<BigEndian>().map_err(bad)? as usize;
            let key = take(&mut data, key_len)?;
            let offset = data.read_u32::<BigEndian>().map_err(bad)?;
            let len = data.read_u32::<BigEndian>().map_err(bad)?;
            offsets.push(BlockOffset { key, offset, len });
        }
        let bloom_len = data.read_u32::<BigEndian>().map_err(bad)? as usize;
        let bloom_filter = take(&mut data, bloom_len)?;
        let max_version = data.read_u64::<BigEndian>().map_err(bad)?;
        let key_count = data.read_u32::<BigEndian>().map_err(bad)?;
        let stale_data_size = data.read_u32::<BigEndian>().map_err(bad)?;
        if !data.is_empty() {
            return Err(SstError::corrupt("trailing bytes after index"));
        }
        Ok(Self {
            offsets,
            bloom_filter,
            max_version,
            key_count,
            stale_data_size,
        })
    }
}

fn take(data: &mut &[u8], n: usize) -> Result<Vec<u8>, SstError> {
    if data.len() < n {
        return Err(SstError::corrupt("truncated index"));
    }
    let (head, rest) = data.split_at(n);
    *data = rest;
    Ok(head.to_vec())
}

/// Appends `index_len | checksum | checksum_len` after the encoded index.
pub(crate) fn write_trailer(out: &mut Vec<u8>, index: &[u8]) -> Result<(), SstError> {
    let index_len = u32::try_from(index.len()).map_err(|_| SstError::IntegerOverflow)?;
    out.write_u32::<BigEndian>(index_len)?;
    out.write_u64::<BigEndian>(checksum(index))?;
    out.write_u32::<BigEndian>(CHECKSUM_LEN)?;
    Ok(())
}

/// Parses the trailer of a whole table image and returns the verified index
/// bytes together with the stored checksum.
pub(crate) fn read_trailer(data: &[u8]) -> Result<(&[u8], u64), SstError> {
    if data.len() < TRAILER_SIZE {
        return Err(SstError::corrupt(format!(
            "table too small: {} bytes",
            data.len()
        )));
    }
    let mut end = data.len();

    let checksum_len = BigEndian::read_u32(&data[end - 4..end]);
    if checksum_len != CHECKSUM_LEN {
        return Err(SstError::BadChecksumLen(checksum_len));
    }
    end -= 4;

    let expected = BigEndian::read_u64(&data[end - 8..end]);
    end -= 8;

    let index_len = BigEndian::read_u32(&data[end - 4..end]) as usize;
    end -= 4;

    let start = end
        .checked_sub(index_len)
        .ok_or_else(|| SstError::corrupt("index length exceeds table size"))?;
    let index = &data[start..end];
    if checksum(index) != expected {
        return Err(SstError::ChecksumMismatch("table index"));
    }
    Ok((index, expected))
}
