//! Inbound side of the stream transport: accept connections and answer framed RPCs.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::framing::{read_frame, write_frame};
use crate::key::short_hex;
use crate::node::{DhtNode, NodeState};
use crate::protocol::{RpcRequest, RpcResponse};
use crate::rpc::DhtNetwork;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Source of inbound streams for [`serve_incoming`].
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection, returning it with a peer label for logs.
    async fn accept(&mut self) -> io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, String)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        let _ = stream.set_nodelay(true);
        Ok((stream, addr.to_string()))
    }
}

/// Serve DHT requests arriving on a single stream.
///
/// Reads request frames until the peer closes the stream, dispatching each
/// through [`DhtNode::handle_request`] and writing the reply frame back. A
/// malformed frame ends the connection; the peer sees the stream close.
pub async fn handle_connection<N, S>(node: DhtNode<N>, mut stream: S) -> Result<()>
where
    N: DhtNetwork,
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(bytes) = read_frame(&mut stream).await? {
        let RpcRequest { from, request } = serde_json::from_slice(&bytes)?;
        trace!(peer = %short_hex(&from.id), rpc = request.kind(), "inbound rpc");

        let response = node.handle_request(&from, request).await;
        let reply = RpcResponse {
            from: node.contact(),
            response,
        };
        write_frame(&mut stream, &serde_json::to_vec(&reply)?).await?;
    }
    Ok(())
}

/// Accept TCP connections until the node stops, one task per connection.
pub async fn serve<N: DhtNetwork>(node: DhtNode<N>, listener: TcpListener) -> Result<()> {
    serve_incoming(node, listener).await
}

/// Accept connections from any [`Acceptor`] until the node stops.
///
/// A failed accept is logged and retried after a short pause; the node keeps
/// serving for as long as it runs.
pub async fn serve_incoming<N, A>(node: DhtNode<N>, mut acceptor: A) -> Result<()>
where
    N: DhtNetwork,
    A: Acceptor,
{
    let stopped = wait_until_stopped(node.subscribe_state());
    tokio::pin!(stopped);

    loop {
        let accepted = tokio::select! {
            accepted = acceptor.accept() => accepted,
            _ = &mut stopped => {
                debug!("listener closing");
                return Ok(());
            }
        };
        let (stream, peer) = match accepted {
            Ok(connection) => connection,
            Err(err) => {
                warn!("accept failed: {err}");
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => {}
                    _ = &mut stopped => return Ok(()),
                }
                continue;
            }
        };

        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(node, stream).await {
                warn!(%peer, "connection ended with error: {err}");
            }
        });
    }
}

/// Resolves once the node leaves service.
///
/// A fresh node is `Stopped` until it bootstraps; only a later `Stopped` counts.
async fn wait_until_stopped(mut state: watch::Receiver<NodeState>) {
    let mut started = false;
    loop {
        let current = *state.borrow_and_update();
        match current {
            NodeState::Stopping => return,
            NodeState::Stopped if started => return,
            NodeState::Stopped => {}
            NodeState::Bootstrapping | NodeState::Running => started = true,
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
