//! Read path: `get()`.
//!
//! Point lookups check the active memtable first, then the immutables
//! (newest first), then level 0 (newest table first) and the deeper levels.
//! The first layer holding any version of the key wins; a tombstone or an
//! expired entry there means not-found.

use anyhow::Result;
use memtable::{key_with_ts, now_secs, parse_key, Entry};

use crate::Engine;

impl Engine {
    /// Looks up the newest visible version of `key`.
    ///
    /// The returned entry carries the user key (no version suffix) and the
    /// version it was written with.
    ///
    /// # Errors
    ///
    /// Propagates table corruption and I/O errors.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.ensure_open()?;
        if key.is_empty() {
            return Ok(None);
        }
        let seek = key_with_ts(key, u64::MAX);

        let found = match self.get_from_memtables(&seek)? {
            Some(e) => Some(e),
            None => self.levels.get(&seek)?,
        };

        Ok(found.and_then(|mut e| {
            if e.is_dead(now_secs()) {
                return None;
            }
            e.key = parse_key(&e.key).to_vec();
            Some(e)
        }))
    }

    fn get_from_memtables(&self, seek: &[u8]) -> Result<Option<Entry>> {
        let mem = self.mem.read().clone();
        if let Some(e) = mem.get(seek)? {
            return Ok(Some(e));
        }
        let immutables = self.immutables.read().clone();
        for imm in immutables.iter().rev() {
            if let Some(e) = imm.get(seek)? {
                return Ok(Some(e));
            }
        }
        Ok(None)
    }
}
