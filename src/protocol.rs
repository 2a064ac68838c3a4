//! DHT protocol message definitions.
//!
//! This module defines the RPC request and response types for DHT
//! communication. All messages are serializable for network transport; each
//! request travels in an [`RpcRequest`] envelope naming the sender so the
//! receiver can observe it in its routing table.

use serde::{Deserialize, Serialize};

use crate::key::{Key, NodeId};
use crate::routing::Contact;

/// The six DHT requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness check.
    Ping,
    /// Find nodes closest to a target ID.
    FindNode { target: NodeId },
    /// Find a value by key, or get closer nodes if not found.
    FindValue { key: Key },
    /// Store a key-value pair on the receiver.
    Store { key: Key, value: Vec<u8> },
    /// Announce that `provider` serves content for `key`.
    AddProvider { key: Key, provider: Contact },
    /// Ask for providers of `key`, plus closer nodes.
    GetProviders { key: Key },
}

impl Request {
    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::FindNode { .. } => "find_node",
            Request::FindValue { .. } => "find_value",
            Request::Store { .. } => "store",
            Request::AddProvider { .. } => "add_provider",
            Request::GetProviders { .. } => "get_providers",
        }
    }
}

/// Replies to [`Request`]s, one variant per request kind plus a refusal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Nodes {
        closer: Vec<Contact>,
    },
    Value {
        /// The value if found locally.
        value: Option<Vec<u8>>,
        /// Closer nodes to continue the lookup if the value was not found.
        closer: Vec<Contact>,
    },
    Stored,
    ProviderAdded,
    Providers {
        providers: Vec<Contact>,
        closer: Vec<Contact>,
    },
    /// The receiver understood the request but refused it.
    Rejected {
        reason: String,
    },
}

/// A request together with the sender's contact information.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub from: Contact,
    pub request: Request,
}

/// A response together with the responder's contact information.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub from: Contact,
    pub response: Response,
}
