//! Provider records: who claims to serve content for a key.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::key::{short_hex, Key, NodeId};
use crate::routing::Contact;

/// One provider's claim for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRecord {
    pub key: Key,
    /// The provider's ID and an address snapshot taken when it announced.
    pub provider: Contact,
    pub stored_at: Instant,
}

impl ProviderRecord {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) >= ttl
    }
}

/// TTL-expiring key→set-of-providers map.
///
/// Each `(key, provider)` pair holds at most one record; re-adding refreshes
/// its timestamp and address snapshot. Both dimensions are bounded: the key
/// map is an LRU cache of `max_keys` entries, and each key keeps at most
/// `max_per_key` providers.
pub struct ProviderStore {
    records: LruCache<Key, HashMap<NodeId, ProviderRecord>>,
    ttl: Duration,
    max_per_key: usize,
}

impl ProviderStore {
    pub fn new(ttl: Duration, max_keys: usize, max_per_key: usize) -> Self {
        let cap = NonZeroUsize::new(max_keys.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(cap),
            ttl,
            max_per_key: max_per_key.max(1),
        }
    }

    /// Record `provider` as a source for `key`.
    pub fn add_provider(&mut self, key: Key, provider: Contact) {
        self.add_provider_at(key, provider, Instant::now());
    }

    /// Record with an explicit arrival time.
    ///
    /// When the key already has the maximum number of providers, the one
    /// with the oldest timestamp makes room. A new key arriving at capacity
    /// evicts the least recently used key with all of its providers.
    pub fn add_provider_at(&mut self, key: Key, provider: Contact, now: Instant) {
        let record = ProviderRecord {
            key,
            provider,
            stored_at: now,
        };
        let Some(providers) = self.records.get_mut(&key) else {
            let mut providers = HashMap::new();
            providers.insert(record.provider.id, record);
            if let Some((evicted, dropped)) = self.records.push(key, providers) {
                debug!(
                    key = %short_hex(&evicted),
                    providers = dropped.len(),
                    "provider store full, evicted least recently used key"
                );
            }
            return;
        };

        if !providers.contains_key(&record.provider.id) && providers.len() >= self.max_per_key {
            let oldest = providers
                .values()
                .min_by_key(|record| record.stored_at)
                .map(|record| record.provider.id);
            if let Some(oldest) = oldest {
                providers.remove(&oldest);
            }
        }
        providers.insert(record.provider.id, record);
    }

    /// Non-expired providers for `key`, most recently announced first.
    pub fn get_providers(&self, key: &Key) -> Vec<ProviderRecord> {
        self.get_providers_at(key, Instant::now())
    }

    pub fn get_providers_at(&self, key: &Key, now: Instant) -> Vec<ProviderRecord> {
        let Some(providers) = self.records.peek(key) else {
            return Vec::new();
        };
        let mut live: Vec<ProviderRecord> = providers
            .values()
            .filter(|record| !record.is_expired(now, self.ttl))
            .cloned()
            .collect();
        live.sort_by(|a, b| {
            b.stored_at
                .cmp(&a.stored_at)
                .then_with(|| a.provider.id.cmp(&b.provider.id))
        });
        live
    }

    /// Remove every record older than the TTL. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (key, providers) in self.records.iter_mut() {
            let before = providers.len();
            providers.retain(|_, record| !record.is_expired(now, ttl));
            removed += before - providers.len();
            if providers.is_empty() {
                emptied.push(*key);
            }
        }
        for key in emptied {
            self.records.pop(&key);
        }
        removed
    }

    /// Keys for which `provider` has a record; the republish set when it is the local node.
    pub fn keys_provided_by(&self, provider: &NodeId) -> Vec<Key> {
        self.records
            .iter()
            .filter(|(_, providers)| providers.contains_key(provider))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Total number of provider records across all keys.
    pub fn len(&self) -> usize {
        self.records.iter().map(|(_, providers)| providers.len()).sum()
    }

    /// Number of keys with at least one provider record.
    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
