//! Inbound dedup cache (§4.13): a bounded LRU of content hashes already
//! seen, so the same block or transaction is never relayed twice within
//! the window. Implemented directly over a `HashSet` + `VecDeque` rather
//! than pulling in a dedicated LRU crate, since the only operations
//! needed are "seen before" and "evict oldest".

use shared::Hash256;
use std::collections::{HashSet, VecDeque};

pub struct DedupCache {
    capacity: usize,
    order: VecDeque<Hash256>,
    seen: HashSet<Hash256>,
}

impl DedupCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::with_capacity(capacity), seen: HashSet::with_capacity(capacity) }
    }

    /// Returns `true` if `hash` had not been recorded before, inserting
    /// it (and evicting the oldest entry if the cache is at capacity).
    /// Returns `false` for a hash already present, so the caller can
    /// short-circuit relaying it again.
    pub fn insert(&mut self, hash: Hash256) -> bool {
        if self.seen.contains(&hash) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(hash);
        self.seen.insert(hash);
        true
    }

    #[must_use]
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.seen.contains(hash)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(seed: u8) -> Hash256 {
        Hash256::keccak256(&[seed])
    }

    #[test]
    fn first_insert_of_a_hash_reports_new_then_reports_seen() {
        let mut cache = DedupCache::new(10);
        assert!(cache.insert(h(1)));
        assert!(!cache.insert(h(1)));
    }

    #[test]
    fn capacity_overflow_evicts_the_oldest_entry() {
        let mut cache = DedupCache::new(2);
        cache.insert(h(1));
        cache.insert(h(2));
        cache.insert(h(3));
        assert!(!cache.contains(&h(1)));
        assert!(cache.contains(&h(2)));
        assert!(cache.contains(&h(3)));
        assert_eq!(cache.len(), 2);
    }
}
