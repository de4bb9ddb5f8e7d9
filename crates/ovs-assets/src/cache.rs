//! Bounded LRU + TTL cache for asset lookups.
//!
//! Keys carry tenant, projection, and the serialized query, so two tenants
//! (or two projections) never share an entry. Values are full record sets;
//! projection is applied on the way out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ovs_schemas::AssetRecord;

pub struct AssetCache {
    entries: HashMap<String, Entry>,
    capacity: usize,
    ttl: Duration,
    tick: u64,
}

struct Entry {
    records: Vec<AssetRecord>,
    inserted_at: Instant,
    last_used: u64,
}

impl AssetCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
            tick: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<AssetRecord>> {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(key) {
            Some(e) if e.inserted_at.elapsed() <= self.ttl => {
                e.last_used = tick;
                Some(e.records.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, key: String, records: Vec<AssetRecord>) {
        self.tick += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(lru) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&lru);
            }
        }
        self.entries.insert(
            key,
            Entry {
                records,
                inserted_at: Instant::now(),
                last_used: self.tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(host: &str) -> AssetRecord {
        AssetRecord {
            asset_id: format!("a-{host}"),
            name: host.to_string(),
            hostname: host.to_string(),
            ip_address: "10.0.0.1".into(),
            os_type: "linux".into(),
            os_version: None,
            environment: "staging".into(),
            service_type: None,
            port: None,
            is_secure: true,
            credential_type: None,
            is_active: true,
            connection_status: Some("reachable".into()),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn bounded_by_capacity_with_lru_eviction() {
        let mut c = AssetCache::new(2, Duration::from_secs(60));
        c.put("k1".into(), vec![record("h1")]);
        c.put("k2".into(), vec![record("h2")]);
        assert!(c.get("k1").is_some()); // k2 becomes LRU
        c.put("k3".into(), vec![record("h3")]);
        assert!(c.get("k2").is_none());
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn ttl_expires_entries() {
        let mut c = AssetCache::new(4, Duration::ZERO);
        c.put("k".into(), vec![record("h")]);
        assert!(c.get("k").is_none());
    }
}
