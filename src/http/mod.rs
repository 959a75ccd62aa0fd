//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Spliced connection from the router
//!     → plain.rs (absolute-form http:// requests)
//!     → secure.rs (CONNECT pre-amble, TLS termination, Host-based target)
//!     → forward.rs (request phases, error mapping)
//!         → headers.rs (hop-by-hop stripping, X-Forwarded-For / Via)
//!         → upstream.rs (one origin connection per request)
//!     → body.rs (relay to client, tee to capture)
//! ```

pub mod body;
pub mod forward;
pub mod headers;
pub mod plain;
pub mod secure;
pub mod upstream;

pub use forward::{ForwardContext, RequestPhase, Target, TargetError};
pub use headers::{HeaderList, HeaderTransform};
pub use plain::PlainProxy;
pub use secure::SecureProxy;
