//! # kadmesh
//!
//! This crate implements a Kademlia distributed hash table node: a 256-bit
//! XOR keyspace, k-bucket routing with ping-before-evict, iterative parallel
//! lookups, TTL-bound value records with republishing, and provider records
//! for content discovery.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`key`]: identifiers, BLAKE3 hashing, and the XOR [`Distance`] metric.
//! - [`routing`]: the bucketed [`RoutingTable`] and its async [`RoutingHandle`].
//! - [`lookup`]: the iterative lookup coordinator shared by peer, value and
//!   provider queries.
//! - [`store`] and [`providers`]: local record storage with TTL expiry.
//! - [`node`]: the [`DhtNode`] state machine tying the above together.
//! - [`rpc`]: the [`DhtNetwork`] trait the node uses to reach other peers.
//! - [`protocol`], [`framing`], [`net`] and [`server`]: a JSON-over-TCP
//!   transport implementing that trait and serving inbound requests.
//!
//! ## Getting started
//!
//! Bind a listener, build a [`DhtNode`] over a [`StreamNetwork`], serve
//! inbound requests and join the network through a known peer:
//!
//! ```no_run
//! use anyhow::Result;
//! use kadmesh::{derive_node_id, serve, Contact, DhtConfig, DhtNode, StreamNetwork};
//! use tokio::net::TcpListener;
//!
//! # async fn launch(bootstrap: Contact) -> Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?.to_string();
//! let id = derive_node_id(addr.as_bytes());
//! let contact = Contact::with_addr(id, addr);
//!
//! let node = DhtNode::new(id, contact.clone(), StreamNetwork::tcp(contact), DhtConfig::default());
//! tokio::spawn(serve(node.clone(), listener));
//! node.bootstrap(&[bootstrap]).await?;
//!
//! let key = kadmesh::hash_content(b"hello");
//! node.put_value(key, b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces together into a
//! command-line server/client pair.

pub mod config;
pub mod error;
pub mod framing;
pub mod key;
pub mod lookup;
pub mod net;
pub mod node;
pub mod protocol;
pub mod providers;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod store;

pub use config::DhtConfig;
pub use error::{DhtError, Result};
pub use key::{derive_node_id, hash_content, xor_distance, Distance, Key, NodeId};
pub use lookup::{LookupKind, LookupOutcome};
pub use net::{Dialer, StreamNetwork, TcpDialer};
pub use node::{BootstrapReport, DhtNode, NodeState, TelemetrySnapshot};
pub use routing::{Contact, RoutingHandle, RoutingTable};
pub use rpc::DhtNetwork;
pub use server::{handle_connection, serve, serve_incoming, Acceptor};
