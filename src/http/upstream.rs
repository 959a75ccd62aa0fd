//! Outbound connections to origin servers.
//!
//! # Responsibilities
//! - Resolve the origin host and connect, optionally over TLS
//! - Run one HTTP/1.1 client connection per proxied request
//! - Tie the connection's lifetime to an abort-on-drop guard
//!
//! # Design Decisions
//! - No pooling: each request gets a fresh connection
//! - Name resolution is separate from connecting so it can map to 404

use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} resolved to no addresses")]
    NoAddress(String),

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {host} timed out after {timeout:?}")]
    ConnectTimeout { host: String, timeout: Duration },

    #[error("invalid TLS server name {0}")]
    ServerName(String),

    #[error("TLS handshake with origin failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("HTTP handshake with origin failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("origin request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("cannot build origin request: {0}")]
    Build(#[from] http::Error),
}

impl UpstreamError {
    /// Status sent to the client when this happens before the response starts.
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Resolve { .. } | UpstreamError::NoAddress(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Aborts the connection driver task when dropped.
#[derive(Debug)]
pub struct UpstreamGuard(JoinHandle<()>);

impl Drop for UpstreamGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A ready-to-use origin connection.
pub struct UpstreamConnection {
    pub sender: SendRequest<Incoming>,
    pub guard: UpstreamGuard,
    pub peer: SocketAddr,
}

#[derive(Clone)]
pub struct UpstreamConnector {
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl UpstreamConnector {
    pub fn plain(connect_timeout: Duration) -> Self {
        Self {
            tls: None,
            connect_timeout,
        }
    }

    pub fn tls(config: Arc<rustls::ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: Some(TlsConnector::from(config)),
            connect_timeout,
        }
    }

    /// Resolve, connect and handshake with `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<UpstreamConnection, UpstreamError> {
        // IPv6 literals arrive bracketed from URLs.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| UpstreamError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(UpstreamError::NoAddress(host.to_string()));
        }

        tokio::time::timeout(self.connect_timeout, self.establish(host, &addrs))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout {
                host: host.to_string(),
                timeout: self.connect_timeout,
            })?
    }

    async fn establish(&self, host: &str, addrs: &[SocketAddr]) -> Result<UpstreamConnection, UpstreamError> {
        let (stream, peer) = connect_any(addrs).await?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(%host, %peer, tls = self.tls.is_some(), "Connected to origin");

        match &self.tls {
            None => handshake(stream, peer).await,
            Some(connector) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| UpstreamError::ServerName(host.to_string()))?;
                let tls = connector.connect(name, stream).await.map_err(UpstreamError::Tls)?;
                handshake(tls, peer).await
            }
        }
    }
}

/// Try each resolved address in order, keeping the last error.
async fn connect_any(addrs: &[SocketAddr]) -> Result<(TcpStream, SocketAddr), UpstreamError> {
    let mut last_error = None;
    for &addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(source) => {
                tracing::trace!(%addr, error = %source, "Origin address refused");
                last_error = Some(UpstreamError::Connect { addr, source });
            }
        }
    }
    Err(last_error.unwrap_or_else(|| UpstreamError::NoAddress(String::new())))
}

async fn handshake<S>(io: S, peer: SocketAddr) -> Result<UpstreamConnection, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(UpstreamError::Handshake)?;

    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(%peer, error = %e, "Origin connection ended with error");
        }
    });

    Ok(UpstreamConnection {
        sender,
        guard: UpstreamGuard(driver),
        peer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn resolve_failures_map_to_not_found() {
        let resolve = UpstreamError::Resolve {
            host: "nowhere.invalid".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "nx"),
        };
        assert_eq!(resolve.status(), StatusCode::NOT_FOUND);
        assert_eq!(UpstreamError::NoAddress("x".into()).status(), StatusCode::NOT_FOUND);

        let refused = UpstreamError::Connect {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(refused.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = UpstreamConnector::plain(Duration::from_secs(2));
        let err = connector.connect("127.0.0.1", port).await.err().unwrap();
        assert!(matches!(err, UpstreamError::Connect { .. }), "{err}");
    }

    #[tokio::test]
    async fn dropping_guard_closes_origin_socket() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = UpstreamConnector::plain(Duration::from_secs(2));
        let (connection, accepted) = tokio::join!(connector.connect("127.0.0.1", addr.port()), listener.accept());
        let connection = connection.unwrap();
        let (mut origin_side, _) = accepted.unwrap();
        assert_eq!(connection.peer, addr);

        drop(connection);
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), origin_side.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
