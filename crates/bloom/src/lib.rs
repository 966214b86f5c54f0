//! # Bloom Filter
//!
//! A space-efficient probabilistic data structure for set membership testing.
//!
//! A bloom filter can tell you with certainty that a key is **not** in the set
//! (no false negatives), but may occasionally report that a key **is** in the
//! set when it isn't (false positives). The false positive rate depends on the
//! number of bits per key and the number of probes.
//!
//! ## Usage in HardKV
//!
//! The table builder records a 32-bit [`hash`] of every user key it sees and
//! builds one filter per table from those hashes. The filter bytes are stored
//! inside the table index. During point lookups the table checks the filter
//! first: if it says "not present", the table is skipped without touching a
//! single block.
//!
//! ## Serialized form
//!
//! ```text
//! [bit array ...][num_hashes: u8]
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::new(1000, 0.01);
//! bf.insert(b"hello");
//! assert!(bf.may_contain(b"hello"));
//! ```

/// A bloom filter backed by a bit vector with `k` probes per key.
///
/// Probes use double hashing on one 32-bit hash: the hash is rotated by 15
/// bits to form the step, so `h(i) = h + i * delta`.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// The bit vector storing the filter state.
    bits: Vec<u8>,
    /// Number of bits in the filter.
    num_bits: u64,
    /// Number of probes (k).
    num_hashes: u8,
}

impl BloomFilter {
    /// Creates a new bloom filter sized for `expected_items` with the given
    /// target `false_positive_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `expected_items` is 0 or `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );
        let bits_per_key = bits_per_key(expected_items, false_positive_rate);
        Self::with_bits_per_key(expected_items, bits_per_key)
    }

    /// Creates a filter with an explicit bits-per-key budget.
    pub fn with_bits_per_key(expected_items: usize, bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to a sane range
        let k = ((bits_per_key as f64) * std::f64::consts::LN_2) as u32;
        let k = k.clamp(1, 30) as u8;

        // Tiny filters have a very high false positive rate, so keep a floor.
        let m = (expected_items.max(1) * bits_per_key).max(64) as u64;
        let byte_len = ((m + 7) / 8) as usize;

        Self {
            bits: vec![0u8; byte_len],
            num_bits: byte_len as u64 * 8,
            num_hashes: k,
        }
    }

    /// Builds a filter from precomputed key hashes.
    pub fn from_hashes(hashes: &[u32], false_positive_rate: f64) -> Self {
        let mut bf = Self::new(hashes.len().max(1), false_positive_rate);
        for &h in hashes {
            bf.insert_hash(h);
        }
        bf
    }

    /// Inserts a key into the bloom filter.
    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(hash(key));
    }

    /// Inserts an already hashed key.
    pub fn insert_hash(&mut self, mut h: u32) {
        let delta = h.rotate_left(15);
        for _ in 0..self.num_hashes {
            let bit_idx = u64::from(h) % self.num_bits;
            self.set_bit(bit_idx);
            h = h.wrapping_add(delta);
        }
    }

    /// Returns `true` if the key **might** be in the set, `false` if it is
    /// **definitely not** in the set.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.may_contain_hash(hash(key))
    }

    /// Hash-based variant of [`may_contain`](Self::may_contain).
    #[must_use]
    pub fn may_contain_hash(&self, mut h: u32) -> bool {
        let delta = h.rotate_left(15);
        for _ in 0..self.num_hashes {
            let bit_idx = u64::from(h) % self.num_bits;
            if !self.get_bit(bit_idx) {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    /// Returns the number of bits in the filter.
    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Returns the number of probes.
    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        u32::from(self.num_hashes)
    }

    /// Returns the size of the serialized bloom filter in bytes.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.bits.len() + 1
    }

    /// Serializes the filter as the bit array followed by the probe count.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        out.extend_from_slice(&self.bits);
        out.push(self.num_hashes);
        out
    }

    /// Deserializes a filter produced by [`to_bytes`](Self::to_bytes).
    ///
    /// Returns `None` if the buffer is too short or the probe count is out
    /// of range.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (&k, bits) = data.split_last()?;
        if bits.is_empty() || k == 0 || k > 30 {
            return None;
        }
        Some(Self {
            bits: bits.to_vec(),
            num_bits: bits.len() as u64 * 8,
            num_hashes: k,
        })
    }

    // ---- Internal helpers ----

    fn set_bit(&mut self, idx: u64) {
        let byte_idx = (idx / 8) as usize;
        let bit_offset = (idx % 8) as u8;
        self.bits[byte_idx] |= 1 << bit_offset;
    }

    fn get_bit(&self, idx: u64) -> bool {
        let byte_idx = (idx / 8) as usize;
        let bit_offset = (idx % 8) as u8;
        (self.bits[byte_idx] >> bit_offset) & 1 == 1
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("bytes", &self.bits.len())
            .finish()
    }
}

/// Bits per key needed to reach `false_positive_rate`:
/// `m/n = -ln(p) / ln(2)^2`.
#[must_use]
pub fn bits_per_key(expected_items: usize, false_positive_rate: f64) -> usize {
    let n = expected_items.max(1) as f64;
    let m = -n * false_positive_rate.ln() / std::f64::consts::LN_2.powi(2);
    ((m / n).ceil() as usize).max(1)
}

/// Murmur-style 32-bit hash used for filter probes.
#[must_use]
pub fn hash(data: &[u8]) -> u32 {
    const SEED: u32 = 0xbc9f_1d34;
    const M: u32 = 0xc6a4_a793;

    let mut h = SEED ^ (data.len() as u32).wrapping_mul(M);
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if rest.len() == 3 {
        h = h.wrapping_add(u32::from(rest[2]) << 16);
    }
    if rest.len() >= 2 {
        h = h.wrapping_add(u32::from(rest[1]) << 8);
    }
    if !rest.is_empty() {
        h = h.wrapping_add(u32::from(rest[0]));
        h = h.wrapping_mul(M);
        h ^= h >> 24;
    }
    h
}
