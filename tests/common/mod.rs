#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use kadmesh::{Contact, DhtConfig, DhtError, DhtNetwork, DhtNode, Key, NodeId, Result};

/// In-memory network that delivers RPCs by calling the target node's handlers directly.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    stores: Arc<Mutex<Vec<(Contact, Key, usize)>>>,
    providers: Arc<Mutex<Vec<(Contact, Key)>>>,
    pings: Arc<Mutex<Vec<NodeId>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            stores: Arc::new(Mutex::new(Vec::new())),
            providers: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(node, latency);
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub async fn store_calls(&self) -> Vec<(Contact, Key, usize)> {
        let stores = self.stores.lock().await;
        stores.clone()
    }

    pub async fn provider_calls(&self) -> Vec<(Contact, Key)> {
        let providers = self.providers.lock().await;
        providers.clone()
    }

    pub async fn ping_calls(&self) -> Vec<NodeId> {
        let calls = self.pings.lock().await;
        calls.clone()
    }
}

/// Every node reachable through a [`TestNetwork`], keyed by ID.
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, DhtNode<TestNetwork>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &DhtNode<TestNetwork>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.node_id(), node.clone());
    }

    /// Take a node off the network; RPCs to it fail as unreachable.
    pub async fn unregister(&self, id: &NodeId) {
        let mut peers = self.peers.write().await;
        peers.remove(id);
    }

    pub async fn get(&self, id: &NodeId) -> Option<DhtNode<TestNetwork>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl DhtNetwork for TestNetwork {
    async fn ping(&self, to: &Contact) -> Result<()> {
        let peer = self.reach(to).await?;
        {
            let mut calls = self.pings.lock().await;
            calls.push(to.id);
        }
        peer.handle_ping(&self.self_contact).await;
        Ok(())
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let peer = self.reach(to).await?;
        Ok(peer
            .handle_find_node_request(&self.self_contact, target)
            .await)
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)> {
        let peer = self.reach(to).await?;
        Ok(peer
            .handle_find_value_request(&self.self_contact, key)
            .await)
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        let peer = self.reach(to).await?;
        {
            let mut stores = self.stores.lock().await;
            stores.push((to.clone(), key, value.len()));
        }
        peer.handle_store_request(&self.self_contact, key, value)
            .await;
        Ok(())
    }

    async fn add_provider(&self, to: &Contact, key: Key, provider: Contact) -> Result<()> {
        let peer = self.reach(to).await?;
        {
            let mut providers = self.providers.lock().await;
            providers.push((to.clone(), key));
        }
        if peer
            .handle_add_provider_request(&self.self_contact, key, provider)
            .await
        {
            Ok(())
        } else {
            Err(DhtError::Protocol("provider announcement rejected".into()))
        }
    }

    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)> {
        let peer = self.reach(to).await?;
        Ok(peer
            .handle_get_providers_request(&self.self_contact, key)
            .await)
    }
}

impl TestNetwork {
    /// Apply injected failure and latency, then look the target up.
    async fn reach(&self, to: &Contact) -> Result<DhtNode<TestNetwork>> {
        if self.should_fail(&to.id).await {
            return Err(DhtError::Unreachable("injected network failure".into()));
        }
        self.maybe_sleep(&to.id).await;
        self.registry
            .get(&to.id)
            .await
            .ok_or_else(|| DhtError::Unreachable("peer not registered".into()))
    }

    async fn should_fail(&self, node: &NodeId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = {
            let latencies = self.latencies.lock().await;
            latencies.get(node).copied()
        };
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }
}

pub struct TestNode {
    pub node: DhtNode<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize, alpha: usize) -> Self {
        Self::with_config(registry, index, test_config(k, alpha)).await
    }

    pub async fn with_config(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        Self::with_id(registry, make_node_id(index), config).await
    }

    pub async fn with_id(registry: Arc<NetworkRegistry>, id: NodeId, config: DhtConfig) -> Self {
        let contact = Contact::with_addr(id, format!("node-{}", hex::encode(&id[..4])));
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let node = DhtNode::new(id, contact, network.clone(), config);
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn contact(&self) -> Contact {
        self.node.contact()
    }

    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }
}

/// Small k and alpha with timeouts short enough for tests.
pub fn test_config(k: usize, alpha: usize) -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_millis(500),
        lookup_timeout: Duration::from_secs(5),
        ..DhtConfig::with_params(k, alpha)
    }
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_contact(index: u32) -> Contact {
    Contact::with_addr(make_node_id(index), format!("node-{index}"))
}

/// Build `count` nodes with IDs 1..=count; each bootstraps from its predecessor.
pub async fn build_chain(
    registry: &Arc<NetworkRegistry>,
    count: u32,
    k: usize,
    alpha: usize,
) -> Vec<TestNode> {
    let mut nodes: Vec<TestNode> = Vec::new();
    for index in 1..=count {
        let node = TestNode::new(registry.clone(), index, k, alpha).await;
        let seeds: Vec<Contact> = nodes.last().map(|prev| prev.contact()).into_iter().collect();
        node.node.bootstrap(&seeds).await.expect("bootstrap");
        nodes.push(node);
    }
    nodes
}
