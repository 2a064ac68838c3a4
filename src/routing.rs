//! Kademlia routing table.
//!
//! Peers are grouped into k-buckets by the length of the prefix their ID
//! shares with the local ID. The table starts with a single bucket covering
//! the whole key space. Bucket `i` (for every bucket but the last) holds peers
//! whose common-prefix length is exactly `i`; the last bucket holds everything
//! closer, including the local node's own neighbourhood. Only that last bucket
//! splits when full. Every other full bucket applies ping-before-evict: the
//! least-recently-seen peer is probed and only replaced if it fails to answer,
//! so long-lived reachable peers are preferred over fresh discoveries.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::key::{bucket_index, short_hex, xor_distance, NodeId, ID_BITS};
use crate::node::{drain, lock_unpoisoned};
use crate::rpc::{with_timeout, DhtNetwork};

/// Another DHT node: its ID and the endpoint descriptors it can be dialed on.
///
/// Addresses are opaque to the DHT core and interpreted only by the
/// [`DhtNetwork`] implementation (for the TCP adapter they are `host:port`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// The node's unique identifier.
    pub id: NodeId,
    /// Ordered endpoint descriptors, most preferred first.
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(id: NodeId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    /// Contact reachable on a single address.
    pub fn with_addr(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addrs: vec![addr.into()],
        }
    }
}

/// A contact as held by a bucket, with the time it was last observed.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub contact: Contact,
    pub last_seen: Instant,
}

/// A single Kademlia routing bucket.
///
/// Maintains up to k entries in LRU order, preferring long-lived nodes
/// (older entries) over newly discovered ones.
#[derive(Debug, Clone)]
struct Bucket {
    /// Entries in LRU order (oldest first, newest last).
    entries: Vec<PeerEntry>,
    /// Last time any entry in this bucket was inserted or refreshed.
    last_active: Instant,
}

/// Outcome of attempting to add or refresh a contact in a bucket.
#[derive(Debug)]
enum BucketTouchOutcome {
    /// Contact was newly inserted (bucket had space).
    Inserted,
    /// Existing contact was refreshed (moved to end of LRU queue).
    Refreshed,
    /// Bucket is full; includes the oldest contact for potential eviction.
    Full { new_contact: Contact, oldest: Contact },
}

/// Pending bucket update when a bucket is full and its oldest contact needs a ping check.
#[derive(Clone, Debug)]
pub struct PendingBucketUpdate {
    /// Least-recently-seen contact of the full bucket.
    pub oldest: Contact,
    /// Contact waiting for a slot.
    pub new_contact: Contact,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            entries: Vec::new(),
            last_active: now,
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| &e.contact.id == id)
    }

    /// Attempt to add or refresh a contact in the bucket.
    ///
    /// - If the contact exists, moves it to the end (most recently seen)
    /// - If the bucket has space, appends the contact
    /// - If the bucket is full, returns the oldest contact for potential eviction
    fn touch(&mut self, contact: Contact, k: usize, now: Instant) -> BucketTouchOutcome {
        if let Some(pos) = self.position(&contact.id) {
            let mut existing = self.entries.remove(pos);
            if !contact.addrs.is_empty() {
                existing.contact.addrs = contact.addrs;
            }
            existing.last_seen = now;
            self.entries.push(existing);
            self.last_active = now;
            return BucketTouchOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(PeerEntry {
                contact,
                last_seen: now,
            });
            self.last_active = now;
            return BucketTouchOutcome::Inserted;
        }

        match self.entries.first() {
            Some(oldest) => BucketTouchOutcome::Full {
                new_contact: contact,
                oldest: oldest.contact.clone(),
            },
            // k == 0 leaves nothing to evict; treat as a refusal.
            None => BucketTouchOutcome::Refreshed,
        }
    }

    /// Move a contact to the end of the LRU queue.
    fn refresh(&mut self, id: &NodeId, now: Instant) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut existing = self.entries.remove(pos);
                existing.last_seen = now;
                self.entries.push(existing);
                self.last_active = now;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Kademlia routing table with up to 256 buckets for 256-bit node IDs.
#[derive(Debug)]
pub struct RoutingTable {
    /// This node's ID.
    self_id: NodeId,
    /// Maximum contacts per bucket.
    k: usize,
    /// Buckets ordered by common-prefix length; the last one covers the local ID.
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Create a new routing table for the given node ID.
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: vec![Bucket::new(Instant::now())],
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Index of the bucket whose range contains `id`.
    pub fn bucket_for(&self, id: &NodeId) -> usize {
        bucket_index(&self.self_id, id).min(self.buckets.len() - 1)
    }

    /// Add or update a contact in the routing table, ignoring the ping-evict path.
    pub fn update(&mut self, contact: Contact) {
        let _ = self.update_with_pending(contact);
    }

    /// Add or update a contact, returning pending update info if its bucket is full.
    ///
    /// The last bucket is split (repeatedly if needed) instead of reporting a
    /// pending update. For any other full bucket the caller should ping the
    /// returned oldest contact and report back via [`apply_ping_result`].
    ///
    /// [`apply_ping_result`]: Self::apply_ping_result
    pub fn update_with_pending(&mut self, contact: Contact) -> Option<PendingBucketUpdate> {
        if contact.id == self.self_id {
            return None;
        }
        let now = Instant::now();
        let mut contact = contact;
        loop {
            let idx = self.bucket_for(&contact.id);
            match self.buckets[idx].touch(contact, self.k, now) {
                BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => return None,
                BucketTouchOutcome::Full {
                    new_contact,
                    oldest,
                } => {
                    if idx == self.buckets.len() - 1 && self.buckets.len() < ID_BITS {
                        self.split_last_bucket(now);
                        contact = new_contact;
                        continue;
                    }
                    return Some(PendingBucketUpdate {
                        oldest,
                        new_contact,
                    });
                }
            }
        }
    }

    /// Split the last bucket at the next prefix bit.
    ///
    /// Entries that share more than `len - 1` prefix bits with the local ID
    /// move into a new last bucket; LRU order is preserved in both halves.
    fn split_last_bucket(&mut self, now: Instant) {
        let last = self.buckets.len() - 1;
        let entries = std::mem::take(&mut self.buckets[last].entries);
        let mut closer = Bucket::new(now);
        for entry in entries {
            if bucket_index(&self.self_id, &entry.contact.id) > last {
                closer.entries.push(entry);
            } else {
                self.buckets[last].entries.push(entry);
            }
        }
        self.buckets.push(closer);
        debug!(buckets = self.buckets.len(), "split routing bucket");
    }

    /// Apply the result of pinging the oldest contact in a full bucket.
    ///
    /// If the oldest contact is still alive it is refreshed and the new
    /// contact dropped. If it is dead it is evicted and the new contact
    /// inserted in its place.
    pub fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let now = Instant::now();
        let idx = self.bucket_for(&pending.oldest.id);
        if oldest_alive {
            self.buckets[idx].refresh(&pending.oldest.id, now);
            return;
        }
        self.buckets[idx].remove(&pending.oldest.id);
        // Another observe may have refilled the slot meanwhile; that case
        // yields a fresh pending update which is dropped here.
        let _ = self.update_with_pending(pending.new_contact);
    }

    /// Find the `count` closest contacts to a target ID.
    ///
    /// Results are sorted by ascending XOR distance, ties broken by raw ID.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all: Vec<(crate::key::Distance, &Contact)> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .map(|e| (xor_distance(&e.contact.id, target), &e.contact))
            .collect();

        all.sort_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.id.cmp(&b.id)));
        all.into_iter()
            .take(count)
            .map(|(_, contact)| contact.clone())
            .collect()
    }

    /// Remove a contact. Returns true if it was present.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let idx = self.bucket_for(id);
        self.buckets[idx].remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerEntry> {
        let idx = self.bucket_for(id);
        self.buckets[idx].entries.iter().find(|e| &e.contact.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Every known contact, bucket by bucket.
    ///
    /// Also serves as a snapshot an application may persist and feed back
    /// into a later bootstrap.
    pub fn all_peers(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.contact.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of entries in bucket `idx`, or zero if it does not exist.
    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets.get(idx).map(|b| b.entries.len()).unwrap_or(0)
    }

    /// Buckets with no insert or refresh within `threshold`.
    pub fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| now.duration_since(bucket.last_active) >= threshold)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_active = Instant::now();
        }
    }
}

/// Shared, async face of the routing table.
///
/// Owns the table behind its own lock and the network used for liveness
/// probes. `observe` never waits on the network: a full bucket hands its
/// least-recently-seen peer to a background probe, and the ping result is
/// applied to the table when it arrives. At most one probe per peer is in
/// flight; a newcomer arriving while its bucket's oldest peer is already
/// being probed is dropped.
pub struct RoutingHandle<N: DhtNetwork> {
    table: Arc<Mutex<RoutingTable>>,
    network: Arc<N>,
    probe_timeout: Duration,
    /// Peers with a liveness probe in flight.
    probing: Arc<StdMutex<HashSet<NodeId>>>,
    probes: StdMutex<JoinSet<()>>,
}

impl<N: DhtNetwork> RoutingHandle<N> {
    pub fn new(self_id: NodeId, k: usize, network: Arc<N>, probe_timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(RoutingTable::new(self_id, k))),
            network,
            probe_timeout,
            probing: Arc::new(StdMutex::new(HashSet::new())),
            probes: StdMutex::new(JoinSet::new()),
        }
    }

    /// Record evidence that `contact` is alive.
    ///
    /// Refreshes a known peer, inserts a new one or splits the local bucket.
    /// For any other full bucket a ping-before-evict probe is started in the
    /// background and this returns without waiting for it.
    pub async fn observe(&self, contact: Contact) {
        let pending = {
            let mut table = self.table.lock().await;
            table.update_with_pending(contact)
        };
        if let Some(update) = pending {
            self.spawn_probe(update);
        }
    }

    fn spawn_probe(&self, update: PendingBucketUpdate) {
        let oldest = update.oldest.id;
        if !lock_unpoisoned(&self.probing).insert(oldest) {
            trace!(
                peer = %short_hex(&update.new_contact.id),
                "bucket probe already in flight, dropping newcomer"
            );
            return;
        }

        let network = self.network.clone();
        let table = self.table.clone();
        let probing = self.probing.clone();
        let probe_timeout = self.probe_timeout;
        let probe = async move {
            let alive = match with_timeout(probe_timeout, network.ping(&update.oldest)).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(
                        peer = %short_hex(&update.oldest.id),
                        "liveness probe failed, evicting: {err}"
                    );
                    false
                }
            };
            table.lock().await.apply_ping_result(update, alive);
            lock_unpoisoned(&probing).remove(&oldest);
        };

        let mut probes = lock_unpoisoned(&self.probes);
        while probes.try_join_next().is_some() {}
        probes.spawn(probe);
    }

    /// Wait until every liveness probe started so far has been applied.
    pub async fn wait_for_probes(&self) {
        loop {
            let probes = std::mem::take(&mut *lock_unpoisoned(&self.probes));
            if probes.is_empty() {
                return;
            }
            drain(probes, "liveness probe").await;
        }
    }

    /// Cancel outstanding probes, leaving their buckets as they are.
    pub async fn abort_probes(&self) {
        let mut probes = std::mem::take(&mut *lock_unpoisoned(&self.probes));
        probes.abort_all();
        drain(probes, "liveness probe").await;
        lock_unpoisoned(&self.probing).clear();
    }

    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.table.lock().await.closest(target, count)
    }

    pub async fn remove(&self, id: &NodeId) -> bool {
        self.table.lock().await.remove(id)
    }

    pub async fn get(&self, id: &NodeId) -> Option<Contact> {
        self.table.lock().await.get(id).map(|e| e.contact.clone())
    }

    pub async fn all_peers(&self) -> Vec<Contact> {
        self.table.lock().await.all_peers()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn bucket_count(&self) -> usize {
        self.table.lock().await.bucket_count()
    }

    pub async fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.table.lock().await.stale_bucket_indices(threshold)
    }

    pub async fn mark_bucket_refreshed(&self, bucket_idx: usize) {
        self.table.lock().await.mark_bucket_refreshed(bucket_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_prefix(first: u8, last: u8) -> NodeId {
        let mut id = [0u8; 32];
        id[0] = first;
        id[31] = last;
        id
    }

    fn contact(first: u8, last: u8) -> Contact {
        Contact::with_addr(id_with_prefix(first, last), format!("node-{first}-{last}"))
    }

    #[test]
    fn local_id_is_never_inserted() {
        let self_id = [0u8; 32];
        let mut table = RoutingTable::new(self_id, 4);
        table.update(Contact::with_addr(self_id, "me"));
        assert!(table.is_empty());
    }

    #[test]
    fn last_bucket_splits_instead_of_evicting() {
        let mut table = RoutingTable::new([0u8; 32], 2);
        // Two far peers fill the single initial bucket.
        table.update(contact(0x80, 1));
        table.update(contact(0x80, 2));
        // A near peer forces a split rather than a pending eviction.
        let pending = table.update_with_pending(contact(0x01, 0));
        assert!(pending.is_none());
        assert!(table.bucket_count() >= 2);
        assert_eq!(table.len(), 3);
        assert_eq!(table.bucket_len(0), 2);
    }

    #[test]
    fn full_far_bucket_reports_oldest_for_probe() {
        let mut table = RoutingTable::new([0u8; 32], 2);
        table.update(contact(0x01, 0));
        table.update(contact(0x80, 1));
        table.update(contact(0x80, 2));
        // Bucket 0 is no longer the last bucket once the table has split.
        assert!(table.bucket_count() >= 2);

        let pending = table
            .update_with_pending(contact(0x80, 3))
            .expect("full far bucket asks for a probe");
        assert_eq!(pending.oldest.id, id_with_prefix(0x80, 1));
        assert_eq!(pending.new_contact.id, id_with_prefix(0x80, 3));
        assert_eq!(table.bucket_len(0), 2);
    }

    #[test]
    fn failed_probe_replaces_oldest_and_live_probe_keeps_it() {
        let mut table = RoutingTable::new([0u8; 32], 2);
        table.update(contact(0x01, 0));
        table.update(contact(0x80, 1));
        table.update(contact(0x80, 2));

        let pending = table.update_with_pending(contact(0x80, 3)).expect("pending");
        table.apply_ping_result(pending, true);
        assert!(table.contains(&id_with_prefix(0x80, 1)));
        assert!(!table.contains(&id_with_prefix(0x80, 3)));

        // 0x80/1 was refreshed, so 0x80/2 is now the oldest.
        let pending = table.update_with_pending(contact(0x80, 3)).expect("pending");
        assert_eq!(pending.oldest.id, id_with_prefix(0x80, 2));
        table.apply_ping_result(pending, false);
        assert!(!table.contains(&id_with_prefix(0x80, 2)));
        assert!(table.contains(&id_with_prefix(0x80, 3)));
        assert_eq!(table.bucket_len(0), 2);
    }

    #[test]
    fn observing_twice_is_idempotent() {
        let mut table = RoutingTable::new([0u8; 32], 4);
        table.update(contact(0x40, 1));
        table.update(contact(0x40, 1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.all_peers(), vec![contact(0x40, 1)]);
    }

    #[test]
    fn refresh_updates_addresses() {
        let mut table = RoutingTable::new([0u8; 32], 4);
        table.update(contact(0x40, 1));
        table.update(Contact::with_addr(id_with_prefix(0x40, 1), "moved"));
        let entry = table.get(&id_with_prefix(0x40, 1)).expect("present");
        assert_eq!(entry.contact.addrs, vec!["moved".to_string()]);
    }

    #[test]
    fn remove_drops_contact() {
        let mut table = RoutingTable::new([0u8; 32], 4);
        table.update(contact(0x40, 1));
        assert!(table.remove(&id_with_prefix(0x40, 1)));
        assert!(!table.remove(&id_with_prefix(0x40, 1)));
        assert!(table.is_empty());
    }

    #[test]
    fn fresh_buckets_are_not_stale() {
        let mut table = RoutingTable::new([0u8; 32], 4);
        table.update(contact(0x40, 1));
        assert!(table
            .stale_bucket_indices(Duration::from_secs(3600))
            .is_empty());
        assert_eq!(table.stale_bucket_indices(Duration::ZERO), vec![0]);
    }
}
