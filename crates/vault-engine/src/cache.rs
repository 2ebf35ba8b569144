//! Bounded in-memory chunk cache (spec §5, §9: "a plain mutex-guarded
//! map plus a FIFO eviction list — no LRU bookkeeping needed, since the
//! workload is dominated by one-shot reads of already-downloaded
//! chunks, not repeated re-reads of a hot set").

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use vault_common::{Identifier, PlainHash};

struct Inner {
    entries: HashMap<Identifier, (PlainHash, Vec<u8>)>,
    order: VecDeque<Identifier>,
    capacity: usize,
}

/// A bounded cache of `IndexID -> (PlainHash, plaintext)`, keyed the
/// same way `DownloadChunk` is keyed. Eviction is strict FIFO: the
/// oldest insert goes first, regardless of how recently it was read.
pub struct ChunkCache {
    inner: Mutex<Inner>,
}

impl ChunkCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    #[must_use]
    pub fn get(&self, id: Identifier) -> Option<(PlainHash, Vec<u8>)> {
        self.inner.lock().entries.get(&id).cloned()
    }

    pub fn insert(&self, id: Identifier, hash: PlainHash, plaintext: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return;
        }
        inner.entries.insert(id, (hash, plaintext));
        inner.order.push_back(id);
        while inner.order.len() > inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> Identifier {
        Identifier([b; 32])
    }

    fn hash(b: u8) -> PlainHash {
        PlainHash([b; 32])
    }

    #[test]
    fn inserts_and_reads_back() {
        let cache = ChunkCache::new(4);
        cache.insert(id(1), hash(1), vec![1, 2, 3]);
        let (h, v) = cache.get(id(1)).unwrap();
        assert_eq!(h, hash(1));
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[test]
    fn evicts_oldest_entry_first() {
        let cache = ChunkCache::new(2);
        cache.insert(id(1), hash(1), vec![1]);
        cache.insert(id(2), hash(2), vec![2]);
        cache.insert(id(3), hash(3), vec![3]);
        assert!(cache.get(id(1)).is_none());
        assert!(cache.get(id(2)).is_some());
        assert!(cache.get(id(3)).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn re_inserting_an_existing_key_does_not_disturb_eviction_order() {
        let cache = ChunkCache::new(2);
        cache.insert(id(1), hash(1), vec![1]);
        cache.insert(id(2), hash(2), vec![2]);
        cache.insert(id(1), hash(1), vec![99]); // already present, ignored
        cache.insert(id(3), hash(3), vec![3]);
        // insertion order is still [1, 2] before the third insert, so 1
        // (not 2) is the oldest and gets evicted.
        assert!(cache.get(id(1)).is_none());
        assert!(cache.get(id(2)).is_some());
        assert!(cache.get(id(3)).is_some());
    }
}
