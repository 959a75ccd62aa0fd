//! TLS-terminating proxy.
//!
//! # Responsibilities
//! - Answer an optional `CONNECT` pre-amble before the handshake
//! - Terminate TLS with the single static credential
//! - Rebuild `https://` targets from `Host` (or the CONNECT authority)
//!
//! # Design Decisions
//! - The same certificate is presented for every host; clients must trust it
//! - The pre-amble is read through the same buffer the handshake uses, so a
//!   ClientHello sent early is not lost

use http::header::HOST;
use http::{HeaderMap, Uri};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use url::Url;

use crate::http::forward::{serve, ForwardContext, Target, TargetError};
use crate::net::listener::{Listener, ListenerError};
use crate::net::peer::PeerRegistry;

/// Upper bound on a CONNECT request head.
const MAX_CONNECT_HEAD: usize = 8 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("I/O error before handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("CONNECT head exceeds {MAX_CONNECT_HEAD} bytes")]
    HeadTooLarge,

    #[error("malformed CONNECT request line {0:?}")]
    BadConnect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("handshake did not finish within {0:?}")]
    Timeout(Duration),
}

/// Map a request received over TLS to its origin.
///
/// `connect_authority` is the `host:port` from a CONNECT pre-amble, used
/// when the request carries no `Host`.
pub fn secure_target(
    uri: &Uri,
    headers: &HeaderMap,
    connect_authority: Option<&str>,
) -> Result<Target, TargetError> {
    if let Some(scheme) = uri.scheme_str() {
        if !scheme.eq_ignore_ascii_case("https") {
            return Err(TargetError::UnsupportedScheme("https"));
        }
        let url = Url::parse(&uri.to_string()).map_err(|_| TargetError::Invalid(uri.to_string()))?;
        return Target::from_url(url);
    }

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .or(connect_authority)
        .ok_or(TargetError::MissingHost)?;
    if host.contains(['@', '/', '?', '#', ' ']) {
        return Err(TargetError::Invalid(host.to_string()));
    }

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let raw = format!("https://{}{}", host, path);
    let url = Url::parse(&raw).map_err(|_| TargetError::Invalid(raw))?;
    Target::from_url(url)
}

/// Read a CONNECT head and return its authority.
async fn read_connect_head<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: AsyncBufRead + Unpin,
{
    let mut request_line = None;
    let mut consumed = 0usize;

    loop {
        let remaining = MAX_CONNECT_HEAD.saturating_sub(consumed) as u64;
        if remaining == 0 {
            return Err(HandshakeError::HeadTooLarge);
        }
        let mut line = Vec::new();
        let n = (&mut *stream).take(remaining).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(HandshakeError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        consumed += n;
        if !line.ends_with(b"\n") {
            return Err(HandshakeError::HeadTooLarge);
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            break;
        }
        if request_line.is_none() {
            request_line = Some(text.to_string());
        }
    }

    let line = request_line.unwrap_or_default();
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(method), Some(authority)) if method.eq_ignore_ascii_case("CONNECT") => Ok(authority.to_string()),
        _ => Err(HandshakeError::BadConnect(line)),
    }
}

/// Complete the optional pre-amble and the TLS handshake.
async fn accept_tls<S>(
    stream: S,
    acceptor: &TlsAcceptor,
) -> Result<(TlsStream<BufReader<S>>, Option<String>), HandshakeError>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let connect_authority = if stream.fill_buf().await?.first() == Some(&b'C') {
        let authority = read_connect_head(&mut stream).await?;
        stream.write_all(CONNECT_ESTABLISHED).await?;
        stream.flush().await?;
        tracing::debug!(%authority, "CONNECT tunnel established");
        Some(authority)
    } else {
        None
    };

    let tls = acceptor.accept(stream).await.map_err(HandshakeError::Tls)?;
    Ok((tls, connect_authority))
}

pub struct SecureProxy {
    listener: Listener,
    acceptor: TlsAcceptor,
    ctx: Arc<ForwardContext>,
    peers: PeerRegistry,
    handshake_timeout: Duration,
}

impl SecureProxy {
    pub async fn bind(
        address: &str,
        max_connections: usize,
        tls: Arc<ServerConfig>,
        ctx: ForwardContext,
        peers: PeerRegistry,
        handshake_timeout: Duration,
    ) -> Result<Self, ListenerError> {
        let listener = Listener::bind("secure", address, max_connections).await?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            ctx: Arc::new(ctx),
            peers,
            handshake_timeout,
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
                            tracing::warn!(error = %e, "Secure proxy accept failed");
                            continue;
                        }
                    };
                    let peers = self.peers.clone();
                    let ctx = Arc::clone(&self.ctx);
                    let acceptor = self.acceptor.clone();
                    let handshake_timeout = self.handshake_timeout;
                    tokio::spawn(async move {
                        handle_connection(stream, addr, peers, acceptor, handshake_timeout, ctx).await;
                        drop(permit);
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Secure proxy received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    peers: PeerRegistry,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    ctx: Arc<ForwardContext>,
) {
    let accepted = tokio::time::timeout(handshake_timeout, accept_tls(stream, &acceptor))
        .await
        .unwrap_or(Err(HandshakeError::Timeout(handshake_timeout)));

    let (tls, connect_authority) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::debug!(%remote, error = %e, "Secure connection dropped before HTTP");
            return;
        }
    };

    serve(tls, remote, peers, ctx, move |request| {
        secure_target(request.uri(), request.headers(), connect_authority.as_deref())
    })
    .await;
}
