//! Entry model and the byte encodings shared by every storage layer.
//!
//! ## Versioned keys
//!
//! ```text
//! [user key bytes ...][u64 BE: u64::MAX - version]
//! ```
//!
//! The inverted version suffix makes newer versions of the same user key sort
//! first. [`compare_keys`] orders by the user key and only then by the suffix,
//! so all versions of one key are contiguous.
//!
//! ## ValueStruct
//!
//! ```text
//! [meta: u8][expires_at: uvarint][value bytes ...]
//! ```

use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::MemtableError;

/// Width of the version suffix appended to every stored key.
pub const TS_SIZE: usize = 8;

/// Largest stored key, version suffix included. Block headers hold key
/// lengths as `u16`.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Meta bit marking a tombstone.
pub const BIT_DELETE: u8 = 1 << 0;

/// Upper bound of a LEB128-encoded u64.
pub const MAX_VARINT_LEN: usize = 10;

/// A single key/value write as seen by callers and by the WAL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Unix seconds after which the entry is dead; `0` means no expiry.
    pub expires_at: u64,
    pub meta: u8,
    /// Version parsed from the key suffix on reads. Not persisted on its own.
    pub version: u64,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Creates a tombstone for `key`.
    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            meta: BIT_DELETE,
            ..Default::default()
        }
    }

    /// Sets `expires_at` to now + `ttl`, rounded down to whole seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = now_secs().saturating_add(ttl.as_secs());
        self
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    /// An entry is expired once the clock has moved strictly past `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now > self.expires_at
    }

    /// Returns `true` if the entry is a tombstone or has expired.
    #[must_use]
    pub fn is_dead(&self, now: u64) -> bool {
        self.is_deleted() || self.is_expired(now)
    }

    #[must_use]
    pub fn value_struct(&self) -> ValueStruct {
        ValueStruct {
            meta: self.meta,
            expires_at: self.expires_at,
            value: self.value.clone(),
        }
    }

    /// Builds an entry from a stored key and its decoded value.
    pub fn from_parts(key: Vec<u8>, vs: ValueStruct) -> Self {
        let version = parse_ts(&key);
        Self {
            key,
            value: vs.value,
            expires_at: vs.expires_at,
            meta: vs.meta,
            version,
        }
    }
}

/// On-disk and in-arena value encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStruct {
    pub meta: u8,
    pub expires_at: u64,
    pub value: Vec<u8>,
}

impl ValueStruct {
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        1 + uvarint_len(self.expires_at) + self.value.len()
    }

    /// Writes the encoding into `dst`, which must hold at least
    /// [`encoded_size`](Self::encoded_size) bytes. Returns the bytes written.
    pub fn encode_into(&self, dst: &mut [u8]) -> usize {
        dst[0] = self.meta;
        let mut n = 1;
        n += write_uvarint(&mut dst[n..], self.expires_at);
        dst[n..n + self.value.len()].copy_from_slice(&self.value);
        n + self.value.len()
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(self.meta);
        put_uvarint(out, self.expires_at);
        out.extend_from_slice(&self.value);
    }

    /// Decodes a value occupying all of `src`.
    pub fn decode(src: &[u8]) -> Result<Self, MemtableError> {
        let (&meta, rest) = src.split_first().ok_or(MemtableError::CorruptValue)?;
        let (expires_at, n) = uvarint(rest).ok_or(MemtableError::CorruptValue)?;
        Ok(Self {
            meta,
            expires_at,
            value: rest[n..].to_vec(),
        })
    }
}

/// Current unix time in seconds.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// -------------------- Versioned keys --------------------

/// Appends the inverted big-endian version suffix to `key`.
#[must_use]
pub fn key_with_ts(key: &[u8], version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + TS_SIZE);
    out.extend_from_slice(key);
    out.extend_from_slice(&(u64::MAX - version).to_be_bytes());
    out
}

/// Strips the version suffix. Keys shorter than the suffix are returned whole.
#[must_use]
pub fn parse_key(key: &[u8]) -> &[u8] {
    if key.len() < TS_SIZE {
        return key;
    }
    &key[..key.len() - TS_SIZE]
}

/// Extracts the version from the suffix, or `0` for unversioned keys.
#[must_use]
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() < TS_SIZE {
        return 0;
    }
    let mut ts = [0u8; TS_SIZE];
    ts.copy_from_slice(&key[key.len() - TS_SIZE..]);
    u64::MAX - u64::from_be_bytes(ts)
}

/// Returns `true` when both keys share the same user key.
#[must_use]
pub fn same_key(a: &[u8], b: &[u8]) -> bool {
    parse_key(a) == parse_key(b)
}

/// Total order over stored keys: user key first, then the version suffix.
#[must_use]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    let (ua, sa) = split_ts(a);
    let (ub, sb) = split_ts(b);
    ua.cmp(ub).then_with(|| sa.cmp(sb))
}

fn split_ts(key: &[u8]) -> (&[u8], &[u8]) {
    if key.len() < TS_SIZE {
        (key, &[])
    } else {
        key.split_at(key.len() - TS_SIZE)
    }
}

// -------------------- Varints --------------------

/// Number of bytes `v` takes as an unsigned LEB128 varint.
#[must_use]
pub fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

pub fn put_uvarint(out: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let n = write_uvarint(&mut buf, v);
    out.extend_from_slice(&buf[..n]);
}

/// Writes `v` into the front of `dst` and returns the number of bytes used.
pub fn write_uvarint(dst: &mut [u8], mut v: u64) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        dst[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    dst[i] = v as u8;
    i + 1
}

/// Decodes a varint from the front of `src`, returning the value and its
/// length. `None` on truncated input or overflow.
#[must_use]
pub fn uvarint(src: &[u8]) -> Option<(u64, usize)> {
    let mut x = 0u64;
    let mut shift = 0u32;
    for (i, &b) in src.iter().enumerate().take(MAX_VARINT_LEN) {
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return None;
            }
            return Some((x | (u64::from(b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    None
}
