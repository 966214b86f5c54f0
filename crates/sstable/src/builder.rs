use bloom::BloomFilter;
use byteorder::{BigEndian, WriteBytesExt};
use memtable::{compare_keys, parse_key, parse_ts, Entry, ValueStruct, MAX_KEY_SIZE};
use std::cmp::Ordering;
use std::fs::{rename, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::block::HEADER_SIZE;
use crate::format::{checksum, write_trailer, BlockOffset, TableIndex, CHECKSUM_LEN};
use crate::{BlockCache, SstError, Table};

/// Largest buffer pre-allocated for a table image.
const MAX_PREALLOC: usize = 4 << 20;

/// Tuning knobs for building tables.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Target block size in bytes; a block is sealed before it would exceed it.
    pub block_size: usize,
    /// Bloom filter budget; `0.0` disables the filter.
    pub bloom_false_positive: f64,
    /// Expected table size, used as an allocation hint.
    pub table_size: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            bloom_false_positive: 0.01,
            table_size: 64 << 20,
        }
    }
}

/// The block currently being filled.
#[derive(Default)]
struct BlockBuf {
    data: Vec<u8>,
    offsets: Vec<u32>,
    base_key: Vec<u8>,
}

/// Encodes sorted entries into a table image.
///
/// Entries are appended with [`add`](TableBuilder::add) in strictly
/// increasing key order. Blocks are sealed automatically; the index and
/// trailer are written by [`finish`](TableBuilder::finish), and
/// [`flush`](TableBuilder::flush) persists the image and opens it.
pub struct TableBuilder {
    opts: TableOptions,
    /// Sealed blocks, back to back.
    buf: Vec<u8>,
    block: Option<BlockBuf>,
    block_offsets: Vec<BlockOffset>,
    key_hashes: Vec<u32>,
    last_key: Vec<u8>,
    max_version: u64,
    key_count: u32,
    stale_data_size: u32,
}

impl TableBuilder {
    pub fn new(opts: TableOptions) -> Self {
        let capacity = opts.table_size.min(MAX_PREALLOC);
        Self {
            opts,
            buf: Vec::with_capacity(capacity),
            block: None,
            block_offsets: Vec::new(),
            key_hashes: Vec::new(),
            last_key: Vec::new(),
            max_version: 0,
            key_count: 0,
            stale_data_size: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    #[must_use]
    pub fn key_count(&self) -> u32 {
        self.key_count
    }

    /// Sealed bytes plus the open block.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.block.as_ref().map_or(0, |b| b.data.len())
    }

    /// Appends one entry. `is_stale` marks data already shadowed by a newer
    /// version; its size is tracked in the index.
    ///
    /// # Errors
    ///
    /// - [`SstError::OutOfOrder`] if `entry.key` does not sort after the
    ///   previous key.
    /// - [`SstError::IntegerOverflow`] if block accounting would overflow.
    pub fn add(&mut self, entry: &Entry, is_stale: bool) -> Result<(), SstError> {
        let key = entry.key.as_slice();
        if key.is_empty() {
            return Err(memtable::MemtableError::EmptyKey.into());
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(SstError::KeyTooLarge(key.len()));
        }
        if self.key_count > 0 && compare_keys(key, &self.last_key) != Ordering::Greater {
            return Err(SstError::OutOfOrder);
        }

        let vs = entry.value_struct();
        if self.block_is_full(key, &vs)? {
            self.finish_block()?;
        }

        self.key_hashes.push(bloom::hash(parse_key(key)));
        self.max_version = self.max_version.max(parse_ts(key));

        let block = self.block.get_or_insert_with(|| BlockBuf {
            base_key: key.to_vec(),
            ..Default::default()
        });
        let entry_start = block.data.len();
        block
            .offsets
            .push(u32::try_from(entry_start).map_err(|_| SstError::IntegerOverflow)?);

        // The first entry carries the whole key; it becomes the base key.
        let overlap = if entry_start == 0 {
            0
        } else {
            common_prefix(&block.base_key, key)
        };
        let diff = &key[overlap..];
        block.data.write_u16::<BigEndian>(overlap as u16)?;
        block.data.write_u16::<BigEndian>(diff.len() as u16)?;
        block.data.extend_from_slice(diff);
        vs.encode_to(&mut block.data);

        if is_stale {
            let size = (block.data.len() - entry_start) as u32;
            self.stale_data_size = self.stale_data_size.saturating_add(size);
        }
        self.key_count += 1;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        Ok(())
    }

    /// Whether adding `key`/`vs` would push the open block past the target
    /// size, counting the worst-case tail the block still needs.
    fn block_is_full(&self, key: &[u8], vs: &ValueStruct) -> Result<bool, SstError> {
        let Some(block) = &self.block else {
            return Ok(false);
        };
        if block.offsets.is_empty() {
            return Ok(false);
        }

        // offsets of every entry including the new one, count, checksum, checksum length
        let tail = (block.offsets.len() + 1)
            .checked_mul(4)
            .and_then(|n| n.checked_add(4 + CHECKSUM_LEN as usize + 4))
            .filter(|&n| n <= u32::MAX as usize)
            .ok_or(SstError::IntegerOverflow)?;
        let estimated = block
            .data
            .len()
            .checked_add(HEADER_SIZE)
            .and_then(|n| n.checked_add(key.len()))
            .and_then(|n| n.checked_add(vs.encoded_size()))
            .and_then(|n| n.checked_add(tail))
            .filter(|&n| n <= u32::MAX as usize)
            .ok_or(SstError::IntegerOverflow)?;

        Ok(estimated > self.opts.block_size)
    }

    /// Seals the open block: offsets, count, checksum, checksum length.
    fn finish_block(&mut self) -> Result<(), SstError> {
        let Some(mut block) = self.block.take() else {
            return Ok(());
        };
        for &off in &block.offsets {
            block.data.write_u32::<BigEndian>(off)?;
        }
        block
            .data
            .write_u32::<BigEndian>(block.offsets.len() as u32)?;
        let sum = checksum(&block.data);
        block.data.write_u64::<BigEndian>(sum)?;
        block.data.write_u32::<BigEndian>(CHECKSUM_LEN)?;

        let offset = u32::try_from(self.buf.len()).map_err(|_| SstError::IntegerOverflow)?;
        let len = u32::try_from(block.data.len()).map_err(|_| SstError::IntegerOverflow)?;
        offset.checked_add(len).ok_or(SstError::IntegerOverflow)?;

        self.buf.extend_from_slice(&block.data);
        self.block_offsets.push(BlockOffset {
            key: block.base_key,
            offset,
            len,
        });
        Ok(())
    }

    fn build_index(&mut self) -> TableIndex {
        let bloom_filter = if self.opts.bloom_false_positive > 0.0
            && self.opts.bloom_false_positive < 1.0
            && !self.key_hashes.is_empty()
        {
            BloomFilter::from_hashes(&self.key_hashes, self.opts.bloom_false_positive).to_bytes()
        } else {
            Vec::new()
        };
        TableIndex {
            offsets: std::mem::take(&mut self.block_offsets),
            bloom_filter,
            max_version: self.max_version,
            key_count: self.key_count,
            stale_data_size: self.stale_data_size,
        }
    }

    /// Seals the last block and returns the complete table image.
    pub fn finish(mut self) -> Result<Vec<u8>, SstError> {
        self.finish_block()?;
        let index = self.build_index().encode()?;
        let mut out = std::mem::take(&mut self.buf);
        out.extend_from_slice(&index);
        write_trailer(&mut out, &index)?;
        Ok(out)
    }

    /// Persists the table as `path` and opens it.
    ///
    /// # Crash Safety
    ///
    /// Writes to `path.sst.tmp`, calls `sync_all()`, then atomically renames
    /// and syncs the parent directory. A crash mid-write leaves only the temp
    /// file behind.
    ///
    /// # Errors
    ///
    /// [`SstError::Empty`] when no entry was added, or any I/O failure.
    pub fn flush(self, path: &Path, fid: u64, cache: Arc<BlockCache>) -> Result<Table, SstError> {
        if self.is_empty() {
            return Err(SstError::Empty);
        }
        let image = self.finish()?;

        let tmp_path = path.with_extension("sst.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&image)?;
            file.sync_all()?;
        }
        rename(&tmp_path, path)?;

        // Fsync the parent directory so the rename itself is durable.
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Table::open(path, fid, cache)
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
