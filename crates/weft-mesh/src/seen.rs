//! Bounded first-in-first-out duplicate filter.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Remembers the last `capacity` inserted keys. Insertion order eviction,
/// no per-entry timestamps.
pub struct SeenCache<T: Eq + Hash + Clone> {
    set: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> SeenCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true when the key is new (and records it).
    pub fn insert(&mut self, key: T) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &T) -> bool {
        self.set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_rejected() {
        let mut cache = SeenCache::new(8);
        assert!(cache.insert("a"));
        assert!(!cache.insert("a"));
        assert!(cache.insert("b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let mut cache = SeenCache::new(2);
        cache.insert(1);
        cache.insert(2);
        cache.insert(3);
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
        // Evicted keys are accepted again.
        assert!(cache.insert(1));
    }
}
