//! Local key-value storage with TTL expiry.
//!
//! Records are replaced wholesale on every put (last writer wins by local
//! arrival time) and vanish once older than the configured TTL unless they
//! are republished. The store is bounded by an LRU cache so a flood of
//! STOREs cannot grow memory without limit.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

use crate::key::{Key, NodeId};

/// A stored value together with its provenance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueRecord {
    pub key: Key,
    pub value: Vec<u8>,
    /// Local arrival time; the TTL counts from here.
    pub stored_at: Instant,
    /// The node that originated the record.
    pub publisher: NodeId,
}

impl ValueRecord {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) >= ttl
    }
}

/// TTL-expiring key→value map.
pub struct ValueStore {
    /// LRU cache providing O(1) get, put, and capacity eviction.
    records: LruCache<Key, ValueRecord>,
    ttl: Duration,
}

impl ValueStore {
    /// Create a store holding at most `capacity` records for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(cap),
            ttl,
        }
    }

    /// Store `value` under `key`, replacing any previous record.
    pub fn put(&mut self, key: Key, value: Vec<u8>, publisher: NodeId) {
        self.put_at(key, value, publisher, Instant::now());
    }

    /// Store with an explicit arrival time.
    pub fn put_at(&mut self, key: Key, value: Vec<u8>, publisher: NodeId, now: Instant) {
        self.records.put(
            key,
            ValueRecord {
                key,
                value,
                stored_at: now,
                publisher,
            },
        );
    }

    /// Get the value for `key` if present and not yet expired.
    pub fn get(&mut self, key: &Key) -> Option<Vec<u8>> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &Key, now: Instant) -> Option<Vec<u8>> {
        let ttl = self.ttl;
        self.records
            .get(key)
            .filter(|record| !record.is_expired(now, ttl))
            .map(|record| record.value.clone())
    }

    /// Full record for `key`, without promoting it in the LRU order.
    pub fn record(&self, key: &Key) -> Option<&ValueRecord> {
        self.records.peek(key)
    }

    /// Remove every record older than the TTL. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let expired: Vec<Key> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_expired(now, ttl))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.records.pop(key);
        }
        expired.len()
    }

    /// Records that `publisher` originated; the republish set when it is the local node.
    pub fn published_by(&self, publisher: &NodeId) -> Vec<ValueRecord> {
        self.records
            .iter()
            .filter(|(_, record)| &record.publisher == publisher)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn put_then_get_returns_value() {
        let mut store = ValueStore::new(16, TTL);
        store.put([1u8; 32], b"v".to_vec(), [9u8; 32]);
        assert_eq!(store.get(&[1u8; 32]), Some(b"v".to_vec()));
        assert_eq!(store.get(&[2u8; 32]), None);
    }

    #[test]
    fn expire_removes_records_past_ttl() {
        let mut store = ValueStore::new(16, TTL);
        let start = Instant::now();
        store.put_at([1u8; 32], b"old".to_vec(), [9u8; 32], start);
        store.put_at([2u8; 32], b"new".to_vec(), [9u8; 32], start + Duration::from_secs(30));

        let later = start + TTL + Duration::from_secs(1);
        assert_eq!(store.expire(later), 1);
        assert_eq!(store.get_at(&[1u8; 32], later), None);
        assert_eq!(store.get_at(&[2u8; 32], later), Some(b"new".to_vec()));
    }

    #[test]
    fn expired_record_is_hidden_before_sweep() {
        let mut store = ValueStore::new(16, TTL);
        let start = Instant::now();
        store.put_at([1u8; 32], b"v".to_vec(), [9u8; 32], start);
        assert_eq!(store.get_at(&[1u8; 32], start + TTL), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_overwrites_unconditionally() {
        let mut store = ValueStore::new(16, TTL);
        store.put([1u8; 32], b"first".to_vec(), [8u8; 32]);
        store.put([1u8; 32], b"second".to_vec(), [9u8; 32]);
        assert_eq!(store.get(&[1u8; 32]), Some(b"second".to_vec()));
        assert_eq!(store.record(&[1u8; 32]).map(|r| r.publisher), Some([9u8; 32]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut store = ValueStore::new(2, TTL);
        store.put([1u8; 32], b"a".to_vec(), [9u8; 32]);
        store.put([2u8; 32], b"b".to_vec(), [9u8; 32]);
        let _ = store.get(&[1u8; 32]);
        store.put([3u8; 32], b"c".to_vec(), [9u8; 32]);
        assert!(store.record(&[2u8; 32]).is_none());
        assert!(store.record(&[1u8; 32]).is_some());
    }

    #[test]
    fn published_by_filters_on_publisher() {
        let mut store = ValueStore::new(16, TTL);
        store.put([1u8; 32], b"mine".to_vec(), [7u8; 32]);
        store.put([2u8; 32], b"theirs".to_vec(), [8u8; 32]);
        let mine = store.published_by(&[7u8; 32]);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].key, [1u8; 32]);
    }
}
