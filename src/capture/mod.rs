//! Media capture subsystem.
//!
//! # Data Flow
//! ```text
//! Response headers arrive (http::forward)
//!     → observer.rs (ObservedEvent → subscribers, classification)
//!     → settings.rs (current thresholds and download directory)
//!     → downloader.rs (duplicate guards, background writer)
//!     → CaptureSink fed by the relay body
//! ```
//!
//! # Design Decisions
//! - Observation never blocks or alters the relay
//! - Subscribers are per proxy instance, not global

pub mod downloader;
pub mod observer;
pub mod settings;

pub use downloader::{CaptureSink, CaptureStart, DownloadState, DownloadTask, Downloader};
pub use observer::{
    classify, CaptureOutcome, Classification, MediaRules, ObservedEvent, ObserverRegistry,
    Subscription, TrafficMonitor, TrafficObserver,
};
pub use settings::{CaptureSettings, SharedSettings};
