//! Bounded LRU cache with TTL freshness, keyed by tool name.
//!
//! Hand-rolled on HashMap plus a monotonic use-counter: eviction scans for
//! the smallest counter. Capacity stays in the hundreds, so the O(n) evict
//! scan is noise next to the Postgres round-trip it saves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct LruTtlCache<V> {
    entries: HashMap<String, Entry<V>>,
    capacity: usize,
    ttl: Duration,
    tick: u64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: u64,
}

impl<V: Clone> LruTtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            ttl,
            tick: 0,
        }
    }

    /// Fresh hit or None. Stale entries are removed on access.
    pub fn get(&mut self, key: &str) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;

        match self.entries.get_mut(key) {
            Some(e) if e.inserted_at.elapsed() <= self.ttl => {
                e.last_used = tick;
                Some(e.value.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, key: String, value: V) {
        self.tick += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_lru();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                last_used: self.tick,
            },
        );
    }

    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&mut self) {
        if let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_prefers_least_recently_used() {
        let mut c = LruTtlCache::new(2, Duration::from_secs(60));
        c.put("a".into(), 1);
        c.put("b".into(), 2);
        assert_eq!(c.get("a"), Some(1)); // touch a; b is now LRU
        c.put("c".into(), 3);
        assert_eq!(c.get("b"), None);
        assert_eq!(c.get("a"), Some(1));
        assert_eq!(c.get("c"), Some(3));
    }

    #[test]
    fn ttl_expiry_misses_and_removes() {
        let mut c = LruTtlCache::new(4, Duration::ZERO);
        c.put("a".into(), 1);
        assert_eq!(c.get("a"), None);
        assert!(c.is_empty());
    }

    #[test]
    fn capacity_is_the_only_growth_bound() {
        let mut c = LruTtlCache::new(3, Duration::from_secs(60));
        for i in 0..50 {
            c.put(format!("k{i}"), i);
        }
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn overwrite_does_not_evict_a_neighbor() {
        let mut c = LruTtlCache::new(2, Duration::from_secs(60));
        c.put("a".into(), 1);
        c.put("b".into(), 2);
        c.put("a".into(), 10);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("a"), Some(10));
        assert_eq!(c.get("b"), Some(2));
    }
}
