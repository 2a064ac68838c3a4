//! The outbound RPC boundary.
//!
//! [`DhtNetwork`] abstracts the transport and codec, allowing the core DHT
//! logic to work with different network implementations (the stream adapter
//! in [`crate::net`], an in-memory mock for testing, ...).

use std::future::Future;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::{DhtError, Result};
use crate::key::{Key, NodeId};
use crate::routing::Contact;

/// Issues the six DHT RPCs to a remote peer.
///
/// Implementations report dial failures as [`DhtError::Unreachable`] and
/// malformed replies as [`DhtError::Protocol`]. Callers in this crate wrap
/// every call in [`with_timeout`], so implementations need not enforce their
/// own deadline.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Ping a contact to check if it's still responsive.
    ///
    /// Used for the Kademlia "ping-before-evict" rule and during bootstrap.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Send a FIND_NODE RPC to find contacts near a target ID.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Send a FIND_VALUE RPC to retrieve a value or get closer contacts.
    ///
    /// Returns (value, closer_nodes) where value is Some if the key was found.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)>;

    /// Send a STORE RPC to store a key-value pair on a node.
    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()>;

    /// Send an ADD_PROVIDER RPC announcing `provider` as a source for `key`.
    async fn add_provider(&self, to: &Contact, key: Key, provider: Contact) -> Result<()>;

    /// Send a GET_PROVIDERS RPC.
    ///
    /// Returns (providers, closer_nodes).
    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)>;
}

/// Run an RPC future under a deadline, mapping expiry to [`DhtError::Timeout`].
pub async fn with_timeout<T, F>(budget: Duration, rpc: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, rpc).await {
        Ok(result) => result,
        Err(_) => Err(DhtError::Timeout(budget)),
    }
}
