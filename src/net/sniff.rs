//! First-byte protocol classification.
//!
//! The router reads one chunk from a new connection and decides where to
//! splice it. Only the first byte is inspected; nothing is consumed here.

/// Content type byte of a TLS handshake record.
pub const TLS_HANDSHAKE: u8 = 0x16;

/// Where a new connection should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TLS record or a `CONNECT` probe; handled by the secure proxy.
    Secure,
    /// Plain HTTP/1.x request line; handled by the plain proxy.
    Plain,
    /// Anything else. The connection is closed without a response.
    Unsupported,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Secure => "secure",
            Protocol::Plain => "plain",
            Protocol::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_tls_handshake(byte: u8) -> bool {
    byte == TLS_HANDSHAKE
}

pub fn is_connect_probe(byte: u8) -> bool {
    byte == b'C'
}

/// Leading letter of GET, POST/PUT/PATCH, HEAD, DELETE, OPTIONS or TRACE.
pub fn is_http_method_initial(byte: u8) -> bool {
    matches!(byte, b'G' | b'P' | b'H' | b'D' | b'O' | b'T')
}

/// Classify a connection from its first chunk.
pub fn classify(chunk: &[u8]) -> Protocol {
    match chunk.first() {
        Some(&b) if is_tls_handshake(b) || is_connect_probe(b) => Protocol::Secure,
        Some(&b) if is_http_method_initial(b) => Protocol::Plain,
        _ => Protocol::Unsupported,
    }
}
