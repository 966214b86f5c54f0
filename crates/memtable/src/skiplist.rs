//! Arena-backed skip list ordered by [`compare_keys`].
//!
//! While the list is small every node is threaded only through level 0.
//! Once it holds [`BUILD_THRESHOLD`] nodes the upper levels are rebuilt in one
//! pass into a perfectly interleaved tower (node `i` joins level `j` when
//! `i % 2^j == 0`). From then on new nodes draw a random height up to the
//! current list height, and the height grows with `log2(len)`.

use std::cmp::Ordering;

use rand::Rng;

use crate::arena::{Arena, MAX_HEIGHT};
use crate::entry::{compare_keys, Entry, ValueStruct};
use crate::iterator::StorageIterator;
use crate::MemtableError;

/// Node count at which the upper levels are built deterministically.
pub const BUILD_THRESHOLD: usize = 256;

/// `log2(BUILD_THRESHOLD)`: tower height reserved for nodes inserted before
/// the rebuild, and the list height right after it.
const INITIAL_HEIGHT: usize = BUILD_THRESHOLD.trailing_zeros() as usize;

pub struct SkipList {
    arena: Arena,
    head: u32,
    height: usize,
    len: usize,
}

impl SkipList {
    /// Creates an empty list whose arena starts at `arena_size` bytes.
    pub fn new(arena_size: usize) -> Result<Self, MemtableError> {
        let mut arena = Arena::new(arena_size);
        let head = arena.put_node(MAX_HEIGHT)?;
        Ok(Self {
            arena,
            head,
            height: 1,
            len: 0,
        })
    }

    /// Number of distinct keys stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of levels in use.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Arena bytes consumed, a proxy for memory use.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        self.arena.size()
    }

    /// Inserts `entry`, or replaces the value in place when the exact key
    /// (including any version suffix) is already present.
    ///
    /// # Errors
    ///
    /// [`MemtableError::EmptyKey`] for an empty key and
    /// [`MemtableError::ArenaFull`] when the arena cannot grow further.
    pub fn add(&mut self, entry: &Entry) -> Result<(), MemtableError> {
        if entry.key.is_empty() {
            return Err(MemtableError::EmptyKey);
        }
        let vs = entry.value_struct();

        let (prev, found) = self.find_splice(&entry.key);
        if let Some(node) = found {
            let value_offset = self.arena.put_value(&vs)?;
            self.arena
                .set_node_value(node, value_offset, vs.encoded_size() as u32);
            return Ok(());
        }

        let height = if self.height == 1 {
            // Reserve a full initial tower so the rebuild can link this node.
            INITIAL_HEIGHT
        } else {
            random_height(self.height)
        };
        let node = self.put_node(&entry.key, &vs, height)?;

        let linked = if self.height == 1 { 1 } else { height };
        for (level, &p) in prev.iter().enumerate().take(linked) {
            let next = self.arena.next(p, level);
            self.arena.set_next(node, level, next);
            self.arena.set_next(p, level, node);
        }
        self.len += 1;

        if self.height == 1 && self.len == BUILD_THRESHOLD {
            self.construct();
        } else if self.height >= INITIAL_HEIGHT
            && self.height < MAX_HEIGHT
            && self.height < self.len.ilog2() as usize
        {
            self.height += 1;
        }
        Ok(())
    }

    /// Returns the node holding exactly `key`.
    #[must_use]
    pub fn search(&self, key: &[u8]) -> Option<u32> {
        self.find_splice(key).1
    }

    /// Looks up `key` exactly and materializes the stored entry.
    pub fn get_entry(&self, key: &[u8]) -> Result<Option<Entry>, MemtableError> {
        match self.search(key) {
            Some(node) => self.decode_node(node).map(Some),
            None => Ok(None),
        }
    }

    /// First node whose key is `>= key`, or `0` if none.
    #[must_use]
    pub fn seek_ge(&self, key: &[u8]) -> u32 {
        let (prev, found) = self.find_splice(key);
        match found {
            Some(node) => node,
            None => self.arena.next(prev[0], 0),
        }
    }

    pub fn decode_node(&self, node: u32) -> Result<Entry, MemtableError> {
        let key = self.arena.node_key(node).to_vec();
        let (offset, len) = self.arena.node_value(node);
        let vs = self.arena.get_value(offset, len)?;
        Ok(Entry::from_parts(key, vs))
    }

    #[must_use]
    pub fn iter(&self) -> SkipListIterator<'_> {
        SkipListIterator {
            list: self,
            node: 0,
            item: None,
        }
    }

    /// Walks down from the top level and returns, per level, the last node
    /// with a key strictly below `key`. Stops early on an exact match.
    fn find_splice(&self, key: &[u8]) -> ([u32; MAX_HEIGHT], Option<u32>) {
        let mut prev = [self.head; MAX_HEIGHT];
        let mut x = self.head;
        for level in (0..self.height).rev() {
            loop {
                let next = self.arena.next(x, level);
                if next == 0 {
                    break;
                }
                match compare_keys(self.arena.node_key(next), key) {
                    Ordering::Less => x = next,
                    Ordering::Equal => return (prev, Some(next)),
                    Ordering::Greater => break,
                }
            }
            prev[level] = x;
        }
        (prev, None)
    }

    fn put_node(&mut self, key: &[u8], vs: &ValueStruct, height: usize) -> Result<u32, MemtableError> {
        let node = self.arena.put_node(height)?;
        let key_offset = self.arena.put_key(key)?;
        let value_offset = self.arena.put_value(vs)?;
        self.arena.set_node_key(node, key_offset, key.len() as u32);
        self.arena
            .set_node_value(node, value_offset, vs.encoded_size() as u32);
        Ok(node)
    }

    /// Rebuilds levels `1..INITIAL_HEIGHT` from level 0 in a single pass.
    fn construct(&mut self) {
        let first = self.arena.next(self.head, 0);
        let mut tails = [self.head; INITIAL_HEIGHT];

        let mut node = first;
        let mut i = 0usize;
        while node != 0 {
            for (level, tail) in tails.iter_mut().enumerate().skip(1) {
                if i % (1 << level) != 0 || self.arena.node_height(node) <= level {
                    break;
                }
                self.arena.set_next(*tail, level, node);
                *tail = node;
            }
            node = self.arena.next(node, 0);
            i += 1;
        }
        for (level, &tail) in tails.iter().enumerate().skip(1) {
            self.arena.set_next(tail, level, 0);
        }
        self.height = INITIAL_HEIGHT;
    }
}

impl std::fmt::Debug for SkipList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList")
            .field("len", &self.len)
            .field("height", &self.height)
            .field("arena", &self.arena)
            .finish()
    }
}

/// Coin-flip height in `1..=max`.
fn random_height(max: usize) -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < max && rng.gen::<bool>() {
        height += 1;
    }
    height
}

/// Forward cursor over a [`SkipList`].
///
/// The current entry is materialized on every move, so [`item`] hands out a
/// plain reference that does not borrow the arena.
///
/// [`item`]: StorageIterator::item
pub struct SkipListIterator<'a> {
    list: &'a SkipList,
    node: u32,
    item: Option<Entry>,
}

impl SkipListIterator<'_> {
    fn load(&mut self) {
        // Values were encoded by this list, so a decode failure means the
        // arena itself is damaged; treat the cursor as exhausted.
        self.item = if self.node == 0 {
            None
        } else {
            self.list.decode_node(self.node).ok()
        };
    }
}

impl StorageIterator for SkipListIterator<'_> {
    fn rewind(&mut self) {
        self.node = self.list.arena.next(self.list.head, 0);
        self.load();
    }

    fn seek(&mut self, key: &[u8]) {
        self.node = self.list.seek_ge(key);
        self.load();
    }

    fn next(&mut self) {
        if self.node != 0 {
            self.node = self.list.arena.next(self.node, 0);
        }
        self.load();
    }

    fn valid(&self) -> bool {
        self.item.is_some()
    }

    fn item(&self) -> Option<&Entry> {
        self.item.as_ref()
    }
}
