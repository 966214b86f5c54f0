use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::Block;

/// Shared LRU of decoded blocks keyed by `(file id, block index)`.
///
/// Internally synchronized; tables call it through `&self`.
pub struct BlockCache {
    inner: Mutex<LruCache<(u64, usize), Arc<Block>>>,
}

impl BlockCache {
    /// Creates a cache holding at most `capacity` blocks (minimum one).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, fid: u64, block_idx: usize) -> Option<Arc<Block>> {
        self.inner.lock().get(&(fid, block_idx)).cloned()
    }

    pub fn insert(&self, fid: u64, block_idx: usize, block: Arc<Block>) {
        self.inner.lock().put((fid, block_idx), block);
    }

    /// Drops every cached block of table `fid`.
    pub fn evict_table(&self, fid: u64, block_count: usize) {
        let mut cache = self.inner.lock();
        for idx in 0..block_count {
            cache.pop(&(fid, idx));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.inner.lock();
        f.debug_struct("BlockCache")
            .field("len", &cache.len())
            .field("cap", &cache.cap())
            .finish()
    }
}
