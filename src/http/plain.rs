//! Plain HTTP forward proxy.
//!
//! Clients send absolute-form requests (`GET http://host/path HTTP/1.1`);
//! anything else is answered with 400.

use http::Uri;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use crate::http::forward::{serve, ForwardContext, Target, TargetError};
use crate::net::listener::{Listener, ListenerError};
use crate::net::peer::PeerRegistry;

/// Map an absolute-form `http://` URI to its origin.
pub fn plain_target(uri: &Uri) -> Result<Target, TargetError> {
    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        _ => return Err(TargetError::UnsupportedScheme("http")),
    }
    let url = Url::parse(&uri.to_string()).map_err(|_| TargetError::Invalid(uri.to_string()))?;
    Target::from_url(url)
}

pub struct PlainProxy {
    listener: Listener,
    ctx: Arc<ForwardContext>,
    peers: PeerRegistry,
}

impl PlainProxy {
    pub async fn bind(
        address: &str,
        max_connections: usize,
        ctx: ForwardContext,
        peers: PeerRegistry,
    ) -> Result<Self, ListenerError> {
        let listener = Listener::bind("plain", address, max_connections).await?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            peers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept until shutdown is signalled. Open connections finish on their own.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Plain proxy accept failed");
                            continue;
                        }
                    };
                    let peers = self.peers.clone();
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        serve(stream, addr, peers, ctx, |request| plain_target(request.uri())).await;
                        drop(permit);
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Plain proxy received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
