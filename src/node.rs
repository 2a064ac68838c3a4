//! The DHT node: public operations, inbound RPC dispatch, bootstrap and
//! background maintenance.
//!
//! A [`DhtNode`] owns a routing table, a value store, a provider store and
//! the [`DhtNetwork`] used to reach other peers. The type is generic over the
//! network layer so tests can use an in-memory mock while production uses
//! [`crate::net::StreamNetwork`]. Handles are cheap to clone and share one
//! node; several independent nodes can live in the same process.
//!
//! # Lifecycle
//!
//! `Stopped → Bootstrapping → Running → Stopping → Stopped`. Entering
//! `Running` starts three maintenance loops (bucket refresh, expiry sweep,
//! republish). [`shutdown`](DhtNode::shutdown) cancels in-flight lookups,
//! maintenance and outstanding replication before returning.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use futures::future;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::key::{random_id_for_bucket, short_hex, Key, NodeId};
use crate::lookup::{LookupEngine, LookupKind, LookupOutcome};
use crate::protocol::{Request, Response};
use crate::providers::ProviderStore;
use crate::routing::{Contact, RoutingHandle};
use crate::rpc::{with_timeout, DhtNetwork};
use crate::store::ValueStore;

/// Base delay between replication attempts; doubled after each failure.
const REPLICATION_BASE_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Bootstrapping,
    Running,
    Stopping,
}

/// What happened during [`DhtNode::bootstrap`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Bootstrap peers that were pinged.
    pub attempted: usize,
    /// Bootstrap peers that answered.
    pub reachable: usize,
    /// Routing-table size once bootstrap finished.
    pub known_peers: usize,
}

impl BootstrapReport {
    /// The node joined without reaching any bootstrap peer.
    pub fn is_isolated(&self) -> bool {
        self.reachable == 0
    }
}

/// Snapshot of current node state for telemetry and debugging.
#[derive(Clone, Debug)]
pub struct TelemetrySnapshot {
    pub state: NodeState,
    /// Peers in the routing table.
    pub routing_peers: usize,
    /// Buckets the routing table has split into.
    pub buckets: usize,
    /// Buckets untouched for longer than the staleness threshold.
    pub stale_buckets: usize,
    /// Value records held locally.
    pub stored_values: usize,
    /// Provider records held locally.
    pub provider_records: usize,
    /// Replication factor (k parameter).
    pub replication_factor: usize,
    /// Lookup concurrency (alpha parameter).
    pub concurrency: usize,
}

/// A record to push to the k closest peers.
#[derive(Clone, Debug)]
enum Replica {
    Value { key: Key, value: Vec<u8> },
    Provider { key: Key, provider: Contact },
}

impl Replica {
    fn key(&self) -> &Key {
        match self {
            Replica::Value { key, .. } | Replica::Provider { key, .. } => key,
        }
    }
}

struct NodeInner<N: DhtNetwork> {
    id: NodeId,
    self_contact: Contact,
    config: DhtConfig,
    network: Arc<N>,
    routing: Arc<RoutingHandle<N>>,
    lookup: LookupEngine<N>,
    values: Mutex<ValueStore>,
    providers: Mutex<ProviderStore>,
    state: watch::Sender<NodeState>,
    maintenance: StdMutex<JoinSet<()>>,
    replication: StdMutex<JoinSet<()>>,
}

/// High-level Kademlia DHT node.
///
/// # Key Methods
///
/// * [`bootstrap`](Self::bootstrap) - Join the network through known peers
/// * [`put_value`](Self::put_value) / [`get_value`](Self::get_value) - Replicated key-value records
/// * [`provide`](Self::provide) / [`find_providers`](Self::find_providers) - Provider records
/// * [`find_peer`](Self::find_peer) - Locate a peer's contact information
/// * [`handle_request`](Self::handle_request) - Dispatch an inbound RPC
pub struct DhtNode<N: DhtNetwork> {
    inner: Arc<NodeInner<N>>,
}

impl<N: DhtNetwork> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drain a task set, logging any task that panicked.
pub(crate) async fn drain(mut tasks: JoinSet<()>, what: &str) {
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            if err.is_panic() {
                let err = DhtError::LocalState(format!("{what} task panicked: {err}"));
                error!("{err}");
            }
        }
    }
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Create a stopped node. Call [`bootstrap`](Self::bootstrap) to start it.
    pub fn new(id: NodeId, self_contact: Contact, network: N, config: DhtConfig) -> Self {
        let network = Arc::new(network);
        let (state, state_rx) = watch::channel(NodeState::Stopped);
        let routing = Arc::new(RoutingHandle::new(
            id,
            config.k.max(1),
            network.clone(),
            config.rpc_timeout,
        ));
        let lookup = LookupEngine::new(id, routing.clone(), network.clone(), &config, state_rx);
        let values = ValueStore::new(config.max_records, config.record_ttl);
        let providers = ProviderStore::new(
            config.provider_ttl,
            config.max_provider_keys,
            config.max_providers_per_key,
        );
        Self {
            inner: Arc::new(NodeInner {
                id,
                self_contact,
                config,
                network,
                routing,
                lookup,
                values: Mutex::new(values),
                providers: Mutex::new(providers),
                state,
                maintenance: StdMutex::new(JoinSet::new()),
                replication: StdMutex::new(JoinSet::new()),
            }),
        }
    }

    /// Get this node's unique identifier.
    pub fn node_id(&self) -> NodeId {
        self.inner.id
    }

    /// Get this node's contact information.
    pub fn contact(&self) -> Contact {
        self.inner.self_contact.clone()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.inner.state.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            NodeState::Running => Ok(()),
            other => Err(DhtError::NotRunning(other)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────

    /// Observe a contact and update the routing table.
    ///
    /// When `contact` lands in a full bucket, the least-recently-seen peer is
    /// pinged in the background and `contact` only takes its slot if that
    /// ping fails. See [`wait_for_probes`](Self::wait_for_probes).
    pub async fn observe_contact(&self, contact: Contact) {
        if contact.id == self.inner.id {
            return;
        }
        self.inner.routing.observe(contact).await;
    }

    /// Wait until every pending ping-before-evict probe has been applied.
    pub async fn wait_for_probes(&self) {
        self.inner.routing.wait_for_probes().await;
    }

    /// Forget a peer.
    pub async fn remove_contact(&self, id: &NodeId) -> bool {
        self.inner.routing.remove(id).await
    }

    /// The `count` known peers closest to `target`.
    pub async fn closest_peers(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.inner.routing.closest(target, count).await
    }

    /// Every peer in the routing table; suitable for persisting as future bootstrap peers.
    pub async fn routing_snapshot(&self) -> Vec<Contact> {
        self.inner.routing.all_peers().await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Join the network through the given peers and start maintenance.
    ///
    /// Every bootstrap peer is pinged concurrently and the responders are
    /// observed; a self-lookup then pulls in the network's view of our
    /// neighbourhood. If nobody answers the node still enters `Running`,
    /// isolated, and waits for inbound contact.
    pub async fn bootstrap(&self, peers: &[Contact]) -> Result<BootstrapReport> {
        let previous = self.state();
        if previous == NodeState::Stopping {
            return Err(DhtError::NotRunning(previous));
        }
        self.inner.state.send_replace(NodeState::Bootstrapping);
        info!(node = %short_hex(&self.inner.id), peers = peers.len(), "bootstrapping");

        let candidates: Vec<&Contact> = peers.iter().filter(|p| p.id != self.inner.id).collect();
        let rpc_timeout = self.inner.config.rpc_timeout;
        let pings = candidates.iter().map(|peer| {
            let network = self.inner.network.clone();
            async move {
                let result = with_timeout(rpc_timeout, network.ping(peer)).await;
                (*peer, result)
            }
        });

        let mut reachable = 0;
        for (peer, result) in future::join_all(pings).await {
            match result {
                Ok(()) => {
                    reachable += 1;
                    self.observe_contact(peer.clone()).await;
                }
                Err(err) => {
                    warn!(peer = %short_hex(&peer.id), "bootstrap peer unreachable: {err}");
                }
            }
        }

        if reachable > 0 {
            if let Err(err) = self.inner.lookup.lookup_peer(self.inner.id).await {
                warn!("bootstrap self-lookup failed: {err}");
            }
        }

        let report = BootstrapReport {
            attempted: candidates.len(),
            reachable,
            known_peers: self.inner.routing.len().await,
        };

        // Shutdown may have started while we were waiting on the network.
        if self.state() == NodeState::Bootstrapping {
            self.inner.state.send_replace(NodeState::Running);
            self.spawn_maintenance();
        }

        if report.is_isolated() {
            warn!("no bootstrap peer reachable; running isolated");
        } else {
            info!(
                reachable = report.reachable,
                known_peers = report.known_peers,
                "bootstrap complete"
            );
        }
        Ok(report)
    }

    /// Cancel lookups, maintenance, replication and liveness probes, then stop.
    pub async fn shutdown(&self) {
        if self.state() == NodeState::Stopped {
            return;
        }
        self.inner.state.send_replace(NodeState::Stopping);

        let mut maintenance = std::mem::take(&mut *lock_unpoisoned(&self.inner.maintenance));
        let mut replication = std::mem::take(&mut *lock_unpoisoned(&self.inner.replication));
        maintenance.abort_all();
        replication.abort_all();
        drain(maintenance, "maintenance").await;
        drain(replication, "replication").await;
        self.inner.routing.abort_probes().await;

        self.inner.state.send_replace(NodeState::Stopped);
        info!(node = %short_hex(&self.inner.id), "node stopped");
    }

    /// Wait until every outstanding replication task has finished.
    pub async fn wait_for_replication(&self) {
        loop {
            let tasks = std::mem::take(&mut *lock_unpoisoned(&self.inner.replication));
            if tasks.is_empty() {
                return;
            }
            drain(tasks, "replication").await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public operations
    // ─────────────────────────────────────────────────────────────────────

    /// Store a value locally and replicate it to the k closest peers.
    ///
    /// Returns once the value is stored locally and the replica set is
    /// known; STORE RPCs continue in the background with bounded retries.
    /// Fails with [`DhtError::NoReachablePeers`] if no peer could be reached,
    /// in which case the value remains stored locally.
    pub async fn put_value(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        {
            let mut values = self.inner.values.lock().await;
            values.put(key, value.clone(), self.inner.id);
        }
        self.replicate(Replica::Value { key, value }).await
    }

    /// Retrieve a value, locally if possible, otherwise from the network.
    ///
    /// `Ok(None)` means no reachable peer holds the key.
    pub async fn get_value(&self, key: Key) -> Result<Option<Vec<u8>>> {
        self.ensure_running()?;
        if let Some(value) = self.get_local(&key).await {
            return Ok(Some(value));
        }
        let outcome = self.inner.lookup.lookup_value(key).await?;
        Ok(outcome.value.map(|found| found.value))
    }

    /// Announce the local node as a provider for `key`.
    pub async fn provide(&self, key: Key) -> Result<()> {
        self.ensure_running()?;
        let provider = self.contact();
        {
            let mut providers = self.inner.providers.lock().await;
            providers.add_provider(key, provider.clone());
        }
        self.replicate(Replica::Provider { key, provider }).await
    }

    /// Find peers that provide content for `key`.
    ///
    /// Local records are merged with those collected along the lookup path.
    pub async fn find_providers(&self, key: Key) -> Result<Vec<Contact>> {
        self.ensure_running()?;
        let mut found: Vec<Contact> = {
            let providers = self.inner.providers.lock().await;
            providers
                .get_providers(&key)
                .into_iter()
                .map(|record| record.provider)
                .collect()
        };

        match self.inner.lookup.lookup_providers(key).await {
            Ok(outcome) => {
                for provider in outcome.providers {
                    if !found.iter().any(|known| known.id == provider.id) {
                        found.push(provider);
                    }
                }
            }
            Err(DhtError::NoReachablePeers) if !found.is_empty() => {}
            Err(err) => return Err(err),
        }
        Ok(found)
    }

    /// Locate a peer by ID.
    pub async fn find_peer(&self, id: NodeId) -> Result<Option<Contact>> {
        self.ensure_running()?;
        if id == self.inner.id {
            return Ok(Some(self.contact()));
        }
        if let Some(contact) = self.inner.routing.get(&id).await {
            return Ok(Some(contact));
        }
        let closest = self.inner.lookup.lookup_peer(id).await?;
        Ok(closest.into_iter().find(|contact| contact.id == id))
    }

    /// Perform an iterative lookup to find the k closest nodes to a target.
    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<Contact>> {
        self.inner.lookup.lookup_peer(target).await
    }

    /// Run an iterative lookup and return the full outcome, including
    /// whether the lookup deadline cut it short.
    pub async fn lookup(&self, target: Key, kind: LookupKind) -> Result<LookupOutcome> {
        self.inner.lookup.lookup(target, kind).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replication
    // ─────────────────────────────────────────────────────────────────────

    /// Find the replica set for a record and push the record to it in the background.
    async fn replicate(&self, replica: Replica) -> Result<()> {
        let targets = self.inner.lookup.lookup_peer(*replica.key()).await?;
        debug!(
            key = %short_hex(replica.key()),
            targets = targets.len(),
            "replicating record"
        );
        self.spawn_replication(targets, replica);
        Ok(())
    }

    /// Send `replica` to every target, retrying each with exponential backoff.
    fn spawn_replication(&self, targets: Vec<Contact>, replica: Replica) {
        let network = self.inner.network.clone();
        let routing = self.inner.routing.clone();
        let attempts = self.inner.config.replication_attempts.max(1);
        let rpc_timeout = self.inner.config.rpc_timeout;

        let task = async move {
            let sends = targets.into_iter().map(|target| {
                let network = network.clone();
                let routing = routing.clone();
                let replica = replica.clone();
                async move {
                    for attempt in 0..attempts {
                        let result = with_timeout(rpc_timeout, async {
                            match &replica {
                                Replica::Value { key, value } => {
                                    network.store(&target, *key, value.clone()).await
                                }
                                Replica::Provider { key, provider } => {
                                    network.add_provider(&target, *key, provider.clone()).await
                                }
                            }
                        })
                        .await;
                        match result {
                            Ok(()) => {
                                routing.observe(target.clone()).await;
                                return;
                            }
                            Err(err) if !err.is_peer_failure() => {
                                debug!(peer = %short_hex(&target.id), "replication abandoned: {err}");
                                return;
                            }
                            Err(err) => {
                                debug!(
                                    peer = %short_hex(&target.id),
                                    attempt = attempt + 1,
                                    "replication failed: {err}"
                                );
                                if attempt + 1 < attempts {
                                    let backoff = REPLICATION_BASE_DELAY * (1u32 << attempt.min(16));
                                    tokio::time::sleep(backoff).await;
                                }
                            }
                        }
                    }
                }
            });
            future::join_all(sends).await;
        };

        let mut tasks = lock_unpoisoned(&self.inner.replication);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────

    fn spawn_maintenance(&self) {
        let mut tasks = lock_unpoisoned(&self.inner.maintenance);
        if !tasks.is_empty() {
            return;
        }
        let config = &self.inner.config;
        let weak = Arc::downgrade(&self.inner);
        spawn_periodic(&mut tasks, weak.clone(), config.refresh_interval, |node| async move {
            node.refresh_buckets().await;
        });
        spawn_periodic(&mut tasks, weak.clone(), config.expiry_interval, |node| async move {
            node.expire_records().await;
        });
        spawn_periodic(&mut tasks, weak, config.republish_interval, |node| async move {
            node.republish().await;
        });
    }

    /// Self-lookup plus one random lookup per stale bucket.
    pub async fn refresh_buckets(&self) {
        if let Err(err) = self.inner.lookup.lookup_peer(self.inner.id).await {
            debug!("self-lookup during refresh failed: {err}");
        }

        let stale = self
            .inner
            .routing
            .stale_bucket_indices(self.inner.config.bucket_stale_threshold)
            .await;
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");
        for bucket_idx in stale {
            let target = random_id_for_bucket(&self.inner.id, bucket_idx);
            if let Err(err) = self.inner.lookup.lookup_peer(target).await {
                debug!(bucket = bucket_idx, "bucket refresh lookup failed: {err}");
            }
            self.inner.routing.mark_bucket_refreshed(bucket_idx).await;
        }
    }

    /// Drop expired values and provider records. Returns (values, providers) removed.
    pub async fn expire_records(&self) -> (usize, usize) {
        self.expire_records_at(Instant::now()).await
    }

    /// Expiry sweep evaluated at `now`.
    pub async fn expire_records_at(&self, now: Instant) -> (usize, usize) {
        let values = self.inner.values.lock().await.expire(now);
        let providers = self.inner.providers.lock().await.expire(now);
        if values > 0 || providers > 0 {
            debug!(values, providers, "expired records");
        }
        (values, providers)
    }

    /// Push every locally-originated record to its current replica set.
    ///
    /// Local copies are refreshed first so they never expire while the node
    /// keeps republishing them.
    pub async fn republish(&self) {
        let id = self.inner.id;
        let values = {
            let mut store = self.inner.values.lock().await;
            let records = store.published_by(&id);
            for record in &records {
                store.put(record.key, record.value.clone(), id);
            }
            records
        };
        let provided = {
            let mut store = self.inner.providers.lock().await;
            let keys = store.keys_provided_by(&id);
            for key in &keys {
                store.add_provider(*key, self.contact());
            }
            keys
        };

        let replicas = values
            .into_iter()
            .map(|record| Replica::Value {
                key: record.key,
                value: record.value,
            })
            .chain(provided.into_iter().map(|key| Replica::Provider {
                key,
                provider: self.contact(),
            }));

        for replica in replicas {
            let key = *replica.key();
            if let Err(err) = self.replicate(replica).await {
                warn!(key = %short_hex(&key), "republish failed: {err}");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound RPC handlers
    // ─────────────────────────────────────────────────────────────────────

    async fn get_local(&self, key: &Key) -> Option<Vec<u8>> {
        self.inner.values.lock().await.get(key)
    }

    /// Dispatch an inbound request from `from`.
    pub async fn handle_request(&self, from: &Contact, request: Request) -> Response {
        match request {
            Request::Ping => {
                self.handle_ping(from).await;
                Response::Pong
            }
            Request::FindNode { target } => Response::Nodes {
                closer: self.handle_find_node_request(from, target).await,
            },
            Request::FindValue { key } => {
                let (value, closer) = self.handle_find_value_request(from, key).await;
                Response::Value { value, closer }
            }
            Request::Store { key, value } => {
                self.handle_store_request(from, key, value).await;
                Response::Stored
            }
            Request::AddProvider { key, provider } => {
                if self.handle_add_provider_request(from, key, provider).await {
                    Response::ProviderAdded
                } else {
                    Response::Rejected {
                        reason: "peers may only announce themselves as providers".into(),
                    }
                }
            }
            Request::GetProviders { key } => {
                let (providers, closer) = self.handle_get_providers_request(from, key).await;
                Response::Providers { providers, closer }
            }
        }
    }

    /// Handle an incoming PING.
    pub async fn handle_ping(&self, from: &Contact) {
        self.observe_contact(from.clone()).await;
    }

    /// Handle an incoming FIND_NODE RPC request.
    ///
    /// Returns the k closest contacts to the target ID from our routing table.
    pub async fn handle_find_node_request(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.observe_contact(from.clone()).await;
        self.inner
            .routing
            .closest(&target, self.inner.config.k)
            .await
    }

    /// Handle an incoming FIND_VALUE RPC request.
    ///
    /// If we have the value locally, returns it. Otherwise, returns the k closest
    /// contacts to the key for the requester to continue the lookup.
    pub async fn handle_find_value_request(
        &self,
        from: &Contact,
        key: Key,
    ) -> (Option<Vec<u8>>, Vec<Contact>) {
        self.observe_contact(from.clone()).await;
        if let Some(value) = self.get_local(&key).await {
            return (Some(value), Vec::new());
        }
        let closer = self.inner.routing.closest(&key, self.inner.config.k).await;
        (None, closer)
    }

    /// Handle an incoming STORE RPC request. The sender becomes the record's publisher.
    pub async fn handle_store_request(&self, from: &Contact, key: Key, value: Vec<u8>) {
        self.observe_contact(from.clone()).await;
        let mut values = self.inner.values.lock().await;
        values.put(key, value, from.id);
    }

    /// Handle an incoming ADD_PROVIDER RPC request.
    ///
    /// Returns false, storing nothing, when the sender announces someone else.
    pub async fn handle_add_provider_request(
        &self,
        from: &Contact,
        key: Key,
        provider: Contact,
    ) -> bool {
        self.observe_contact(from.clone()).await;
        if provider.id != from.id {
            debug!(
                from = %short_hex(&from.id),
                provider = %short_hex(&provider.id),
                "rejecting third-party provider announcement"
            );
            return false;
        }
        let mut providers = self.inner.providers.lock().await;
        providers.add_provider(key, provider);
        true
    }

    /// Handle an incoming GET_PROVIDERS RPC request.
    ///
    /// Returns (providers, closer_nodes); closer nodes are always included so
    /// the requester can keep collecting from other peers.
    pub async fn handle_get_providers_request(
        &self,
        from: &Contact,
        key: Key,
    ) -> (Vec<Contact>, Vec<Contact>) {
        self.observe_contact(from.clone()).await;
        let providers = {
            let store = self.inner.providers.lock().await;
            store
                .get_providers(&key)
                .into_iter()
                .map(|record| record.provider)
                .collect()
        };
        let closer = self.inner.routing.closest(&key, self.inner.config.k).await;
        (providers, closer)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Telemetry
    // ─────────────────────────────────────────────────────────────────────

    /// Get a snapshot of current node state for telemetry.
    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let stored_values = self.inner.values.lock().await.len();
        let provider_records = self.inner.providers.lock().await.len();
        let stale_buckets = self
            .inner
            .routing
            .stale_bucket_indices(self.inner.config.bucket_stale_threshold)
            .await
            .len();
        TelemetrySnapshot {
            state: self.state(),
            routing_peers: self.inner.routing.len().await,
            buckets: self.inner.routing.bucket_count().await,
            stale_buckets,
            stored_values,
            provider_records,
            replication_factor: self.inner.config.k,
            concurrency: self.inner.config.alpha,
        }
    }
}

/// Run `task` every `period` for as long as the node is alive.
///
/// Holds only a weak reference between ticks, so a dropped node ends its loops.
fn spawn_periodic<N, F, Fut>(
    tasks: &mut JoinSet<()>,
    inner: Weak<NodeInner<N>>,
    period: Duration,
    task: F,
) where
    N: DhtNetwork,
    F: Fn(DhtNode<N>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            task(DhtNode { inner }).await;
        }
    });
}
