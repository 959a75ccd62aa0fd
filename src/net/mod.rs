//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection (public port)
//!     → listener.rs (accept loop, connection limits)
//!     → router.rs (read one chunk)
//!     → sniff.rs (first byte → Secure | Plain | Unsupported)
//!     → peer.rs (remember the real client for the spliced socket)
//!     → splice into the plain or secure internal listener
//!
//! Secure internal listener:
//!     → tls.rs (static credential, TLS handshake)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Sniffed bytes are replayed, never dropped
//! - Unsupported connections are closed without a reply

pub mod connection;
pub mod listener;
pub mod peer;
pub mod router;
pub mod sniff;
pub mod tls;
