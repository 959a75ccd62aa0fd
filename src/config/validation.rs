//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges, parsable addresses
//! and listener collisions. Every problem is reported, not just the first.

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: '{value}' is not a socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("listener addresses must be distinct, {0} is used twice")]
    DuplicateAddress(SocketAddr),

    #[error("listener.max_connections must be greater than zero")]
    ZeroConnections,

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("capture.buffer_chunks must be greater than zero")]
    ZeroBuffer,

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("identity.hostname contains characters not allowed in a header")]
    InvalidHostname,
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listeners = [
        ("listener.bind_address", &config.listener.bind_address),
        ("listener.plain_proxy_address", &config.listener.plain_proxy_address),
        ("listener.secure_proxy_address", &config.listener.secure_proxy_address),
    ];
    let mut seen = HashSet::new();
    for (field, value) in listeners {
        match value.parse::<SocketAddr>() {
            // Port 0 asks the OS for a free port, so it can never collide.
            Ok(addr) if addr.port() != 0 => {
                if !seen.insert(addr) {
                    errors.push(ValidationError::DuplicateAddress(addr));
                }
            }
            Ok(_) => {}
            Err(_) => errors.push(ValidationError::InvalidAddress {
                field,
                value: value.clone(),
            }),
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroConnections);
    }

    let timeouts = [
        ("connect_secs", config.timeouts.connect_secs),
        ("sniff_secs", config.timeouts.sniff_secs),
        ("tls_handshake_secs", config.timeouts.tls_handshake_secs),
    ];
    for (name, secs) in timeouts {
        if secs == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if config.capture.buffer_chunks == 0 {
        errors.push(ValidationError::ZeroBuffer);
    }
    if config.capture.download_dir.trim().is_empty() {
        errors.push(ValidationError::Empty("capture.download_dir"));
    }
    if config.tls.cert_path.trim().is_empty() {
        errors.push(ValidationError::Empty("tls.cert_path"));
    }
    if config.tls.key_path.trim().is_empty() {
        errors.push(ValidationError::Empty("tls.key_path"));
    }

    let hostname = &config.identity.hostname;
    if hostname.is_empty() {
        errors.push(ValidationError::Empty("identity.hostname"));
    } else if !hostname.bytes().all(|b| b.is_ascii_graphic()) {
        errors.push(ValidationError::InvalidHostname);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
