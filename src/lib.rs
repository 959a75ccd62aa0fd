//! Transparent intercepting proxy with opportunistic media capture.
//!
//! One public port accepts both plain HTTP proxy traffic and TLS. The router
//! sniffs the first byte of each connection and splices it into the plain or
//! secure proxy; both forward to the real origin, relay the response back
//! unchanged apart from hop-by-hop headers, and hand response metadata to the
//! capture subsystem, which downloads large audio/video bodies to disk.

pub mod capture;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use capture::{CaptureOutcome, ObservedEvent, Subscription, TrafficObserver};
pub use config::schema::ProxyConfig;
pub use lifecycle::{MediaTap, RunningProxy, StartupError, StartupListener};
