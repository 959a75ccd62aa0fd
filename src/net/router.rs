//! Public entry point: sniff, then splice.
//!
//! # Responsibilities
//! - Accept raw connections on the single public port
//! - Read exactly one chunk and classify it
//! - Splice the connection into the plain or secure proxy, replaying the
//!   chunk first so the downstream sees the stream from byte zero
//! - Close unsupported connections without writing anything

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::net::connection::{ActivityTracker, ConnectionId};
use crate::net::listener::{Listener, ListenerError};
use crate::net::peer::PeerRegistry;
use crate::net::sniff::{self, Protocol};
use crate::observability::metrics;

/// Large enough for a TLS ClientHello or a request line in one read.
const SNIFF_BUFFER: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no data within {0:?}")]
    SniffTimeout(Duration),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("splice to {target} failed: {source}")]
    Splice {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Internal listeners the router splices into.
#[derive(Debug, Clone, Copy)]
pub struct SpliceTargets {
    pub plain: SocketAddr,
    pub secure: SocketAddr,
}

impl SpliceTargets {
    fn for_protocol(&self, protocol: Protocol) -> Option<SocketAddr> {
        match protocol {
            Protocol::Plain => Some(self.plain),
            Protocol::Secure => Some(self.secure),
            Protocol::Unsupported => None,
        }
    }
}

pub struct Router {
    listener: Listener,
    targets: SpliceTargets,
    peers: PeerRegistry,
    sniff_timeout: Duration,
    connections: ActivityTracker,
}

impl Router {
    pub async fn bind(
        address: &str,
        max_connections: usize,
        targets: SpliceTargets,
        peers: PeerRegistry,
        sniff_timeout: Duration,
    ) -> Result<Self, ListenerError> {
        let listener = Listener::bind("router", address, max_connections).await?;
        Ok(Self {
            listener,
            targets,
            peers,
            sniff_timeout,
            connections: ActivityTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Connections currently being sniffed or spliced.
    pub fn connections(&self) -> ActivityTracker {
        self.connections.clone()
    }

    /// Accept until shutdown is signalled.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, client, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Router accept failed");
                            continue;
                        }
                    };
                    let targets = self.targets;
                    let peers = self.peers.clone();
                    let sniff_timeout = self.sniff_timeout;
                    let activity = self.connections.track();
                    tokio::spawn(async move {
                        let id = activity.id();
                        match route(stream, client, targets, &peers, sniff_timeout, id).await {
                            Ok(protocol) => {
                                tracing::debug!(connection_id = %id, %client, %protocol, "Connection closed");
                            }
                            Err(e) => {
                                tracing::debug!(connection_id = %id, %client, error = %e, "Connection ended with error");
                            }
                        }
                        drop(permit);
                        drop(activity);
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Router received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Classify one connection and splice it. Returns the protocol it was routed as.
async fn route(
    mut client: TcpStream,
    client_addr: SocketAddr,
    targets: SpliceTargets,
    peers: &PeerRegistry,
    sniff_timeout: Duration,
    id: ConnectionId,
) -> Result<Protocol, RouteError> {
    let mut first_chunk = vec![0u8; SNIFF_BUFFER];
    let n = tokio::time::timeout(sniff_timeout, client.read(&mut first_chunk))
        .await
        .map_err(|_| RouteError::SniffTimeout(sniff_timeout))?
        .map_err(RouteError::Read)?;
    first_chunk.truncate(n);

    let protocol = sniff::classify(&first_chunk);
    metrics::record_connection(protocol);

    let Some(target) = targets.for_protocol(protocol) else {
        tracing::warn!(
            connection_id = %id,
            client = %client_addr,
            first_byte = ?first_chunk.first(),
            "Unsupported protocol, closing connection"
        );
        return Ok(protocol);
    };

    tracing::debug!(connection_id = %id, client = %client_addr, %protocol, %target, "Splicing connection");
    splice(client, client_addr, &first_chunk, target, peers)
        .await
        .map_err(|source| RouteError::Splice { target, source })?;
    Ok(protocol)
}

/// Replay `first_chunk` into `target`, then relay both ways until both halves close.
async fn splice(
    mut client: TcpStream,
    client_addr: SocketAddr,
    first_chunk: &[u8],
    target: SocketAddr,
    peers: &PeerRegistry,
) -> Result<(), std::io::Error> {
    let mut upstream = TcpStream::connect(target).await?;
    let _peer = peers.register(upstream.local_addr()?, client_addr);

    upstream.write_all(first_chunk).await?;
    let (to_proxy, to_client) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    tracing::trace!(
        bytes_to_proxy = to_proxy + first_chunk.len() as u64,
        bytes_to_client = to_client,
        "Splice finished"
    );
    Ok(())
}
