//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → plain proxy → secure proxy → router
//!     (each stage reported to a StartupListener)
//!
//! Shutdown (shutdown.rs):
//!     Trigger → accept loops exit → open connections finish on their own
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: listeners the router depends on bind first
//! - A failed stage tears down the stages before it

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{LogStartup, MediaTap, RunningProxy, Stage, StartupError, StartupListener};
