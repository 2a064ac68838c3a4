//! Stream transport for DHT RPCs.
//!
//! This module provides [`StreamNetwork`], the production implementation of
//! the [`DhtNetwork`] trait. Every RPC dials the target through a [`Dialer`],
//! writes one JSON-encoded [`RpcRequest`] frame and reads one [`RpcResponse`]
//! frame back. [`TcpDialer`] supplies plain TCP connections; other byte
//! streams plug in by implementing [`Dialer`].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{DhtError, Result};
use crate::framing::{read_frame, write_frame};
use crate::key::{short_hex, Key, NodeId};
use crate::protocol::{Request, Response, RpcRequest, RpcResponse};
use crate::routing::Contact;
use crate::rpc::DhtNetwork;

/// Opens a bidirectional byte stream to a peer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `peer` using the first address that works.
    async fn dial(&self, peer: &NodeId, addrs: &[String]) -> Result<Self::Stream>;
}

/// Dials `host:port` addresses over TCP.
#[derive(Clone, Debug, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, peer: &NodeId, addrs: &[String]) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr.as_str()).await {
                Ok(stream) => {
                    // Request/response frames are small; don't let Nagle hold them back.
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(err) => {
                    trace!(peer = %short_hex(peer), %addr, "dial failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => DhtError::Unreachable(format!("{}: {err}", short_hex(peer))),
            None => DhtError::Unreachable(format!("{}: no addresses", short_hex(peer))),
        })
    }
}

/// Network implementation exchanging framed JSON messages over dialed streams.
pub struct StreamNetwork<D: Dialer> {
    dialer: D,
    /// Contact info for the local node (included in all RPC requests).
    self_contact: Contact,
}

impl StreamNetwork<TcpDialer> {
    pub fn tcp(self_contact: Contact) -> Self {
        Self::new(TcpDialer, self_contact)
    }
}

impl<D: Dialer> StreamNetwork<D> {
    pub fn new(dialer: D, self_contact: Contact) -> Self {
        Self {
            dialer,
            self_contact,
        }
    }

    pub fn self_contact(&self) -> &Contact {
        &self.self_contact
    }

    /// Send one request and wait for its response.
    async fn call(&self, to: &Contact, request: Request) -> Result<Response> {
        let kind = request.kind();
        let mut stream = self.dialer.dial(&to.id, &to.addrs).await?;

        let envelope = RpcRequest {
            from: self.self_contact.clone(),
            request,
        };
        write_frame(&mut stream, &serde_json::to_vec(&envelope)?).await?;

        let bytes = read_frame(&mut stream).await?.ok_or_else(|| {
            DhtError::Unreachable(format!("{} closed before replying", short_hex(&to.id)))
        })?;
        let reply: RpcResponse = serde_json::from_slice(&bytes)?;
        if reply.from.id != to.id {
            return Err(DhtError::Protocol(format!(
                "dialed {} but {} answered",
                short_hex(&to.id),
                short_hex(&reply.from.id)
            )));
        }
        trace!(peer = %short_hex(&to.id), rpc = kind, "rpc completed");

        match reply.response {
            Response::Rejected { reason } => {
                Err(DhtError::Protocol(format!("{kind} rejected: {reason}")))
            }
            response => Ok(response),
        }
    }
}

fn unexpected(rpc: &str, response: Response) -> DhtError {
    DhtError::Protocol(format!("unexpected reply to {rpc}: {response:?}"))
}

#[async_trait]
impl<D: Dialer> DhtNetwork for StreamNetwork<D> {
    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.call(to, Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        match self.call(to, Request::FindNode { target }).await? {
            Response::Nodes { closer } => Ok(closer),
            other => Err(unexpected("find_node", other)),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)> {
        match self.call(to, Request::FindValue { key }).await? {
            Response::Value { value, closer } => Ok((value, closer)),
            other => Err(unexpected("find_value", other)),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        match self.call(to, Request::Store { key, value }).await? {
            Response::Stored => Ok(()),
            other => Err(unexpected("store", other)),
        }
    }

    async fn add_provider(&self, to: &Contact, key: Key, provider: Contact) -> Result<()> {
        match self.call(to, Request::AddProvider { key, provider }).await? {
            Response::ProviderAdded => Ok(()),
            other => Err(unexpected("add_provider", other)),
        }
    }

    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)> {
        match self.call(to, Request::GetProviders { key }).await? {
            Response::Providers { providers, closer } => Ok((providers, closer)),
            other => Err(unexpected("get_providers", other)),
        }
    }
}
