//! Error taxonomy for DHT operations.
//!
//! Per-peer failures (`Unreachable`, `Protocol`, `Timeout`) are absorbed
//! inside lookups and maintenance; callers of the public node API normally
//! only see `NoReachablePeers`, `NotRunning` or `ShuttingDown`. Absent
//! values, providers and peers are reported as `None` / empty results.

use thiserror::Error;

use crate::node::NodeState;

pub type Result<T, E = DhtError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DhtError {
    /// Dialing or talking to a specific peer failed.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// A peer sent a malformed or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A per-RPC or per-lookup time budget elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The node could not reach a single peer, so it cannot participate.
    #[error("no reachable peers")]
    NoReachablePeers,

    /// A public operation was invoked outside the `Running` state.
    #[error("node is not running (state: {0:?})")]
    NotRunning(NodeState),

    /// The operation was cancelled by node shutdown.
    #[error("node is shutting down")]
    ShuttingDown,

    /// A routing-table or store invariant was violated.
    #[error("local state error: {0}")]
    LocalState(String),
}

impl DhtError {
    /// Whether the failure concerns a single remote peer and can be
    /// recovered by simply dropping that peer from the current operation.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            DhtError::Unreachable(_) | DhtError::Protocol(_) | DhtError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::Unreachable(err.to_string())
    }
}

impl From<serde_json::Error> for DhtError {
    fn from(err: serde_json::Error) -> Self {
        DhtError::Protocol(err.to_string())
    }
}
