//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for media-tap.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Public entry point and the two internal proxy listeners.
    pub listener: ListenerConfig,

    /// Static credential for the secure proxy and upstream trust roots.
    pub tls: TlsConfig,

    /// Media detection and download settings.
    pub capture: CaptureConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// How this proxy names itself in `Via` headers.
    pub identity: IdentityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Router address, the only address clients should be pointed at.
    pub bind_address: String,

    /// Internal plain-HTTP proxy address. Only the router connects here.
    pub plain_proxy_address: String,

    /// Internal secure proxy address. Only the router connects here.
    pub secure_proxy_address: String,

    /// Maximum concurrent connections per listener (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8989".to_string(),
            plain_proxy_address: "127.0.0.1:8990".to_string(),
            secure_proxy_address: "127.0.0.1:8991".to_string(),
            max_connections: 1_024,
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain presented to clients (PEM).
    pub cert_path: String,

    /// Path to the matching private key (PEM).
    pub key_path: String,

    /// Extra CA bundle trusted for origin connections, on top of native roots.
    pub upstream_ca_path: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "certs/server.crt".to_string(),
            key_path: "certs/server.key".to_string(),
            upstream_ca_path: None,
        }
    }
}

/// Media capture configuration. Reloadable at runtime.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Start downloads for qualifying responses.
    pub enabled: bool,

    /// Directory downloads are written to. Created if missing.
    pub download_dir: String,

    /// Responses must be strictly larger than this to be captured.
    pub min_size_bytes: u64,

    /// Lower-case URL path suffixes treated as media.
    pub media_extensions: Vec<String>,

    /// Content-Type prefixes treated as media.
    pub media_type_prefixes: Vec<String>,

    /// Chunks buffered between the relay and the disk writer before the
    /// capture is abandoned.
    pub buffer_chunks: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            download_dir: "downloads".to_string(),
            min_size_bytes: 1_000_000,
            media_extensions: vec![".mp3".into(), ".m4a".into(), ".mp4".into()],
            media_type_prefixes: vec!["audio".into(), "video".into()],
            buffer_chunks: 256,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Origin connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time the router waits for the first chunk of a new connection.
    pub sniff_secs: u64,

    /// Time allowed for the client TLS handshake on the secure proxy.
    pub tls_handshake_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn sniff(&self) -> Duration {
        Duration::from_secs(self.sniff_secs)
    }

    pub fn tls_handshake(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            sniff_secs: 10,
            tls_handshake_secs: 10,
        }
    }
}

/// Identity used in the `Via` header.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub hostname: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self { hostname }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Expose a Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Address of the scrape endpoint.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "media_tap=info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}
