//! media-tap: transparent intercepting proxy with media capture.
//!
//! ```text
//!                        ┌──────────────────────────────────────────────┐
//!                        │                  MEDIA TAP                   │
//!   Client ─────────────▶│ router ──┬──▶ plain proxy ──┐                │
//!   (HTTP proxy or TLS)  │ (sniff)  └──▶ secure proxy ─┴──▶ origin ─────┼──▶ Internet
//!                        │                     │                        │
//!                        │                     ▼                        │
//!                        │            traffic observer ──▶ downloader ──┼──▶ disk
//!                        └──────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use media_tap::capture::{CaptureOutcome, ObservedEvent, TrafficObserver};
use media_tap::config::{load_config, ProxyConfig};
use media_tap::config::watcher::ConfigWatcher;
use media_tap::lifecycle::signals::wait_for_shutdown_signal;
use media_tap::lifecycle::{LogStartup, MediaTap};
use media_tap::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "media-tap")]
#[command(about = "Transparent proxy that captures audio and video downloads", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override capture.download_dir
    #[arg(short, long)]
    download_dir: Option<PathBuf>,

    /// Reload capture settings when the config file changes
    #[arg(short, long, requires = "config")]
    watch: bool,
}

/// Writes every observed URL and capture decision to the log.
struct LogObserver;

impl TrafficObserver for LogObserver {
    fn on_connect_url(&self, event: &ObservedEvent) {
        tracing::info!(url = %event.url, status = %event.status, "Observed");
    }

    fn on_got_content(&self, event: &ObservedEvent) {
        tracing::info!(
            url = %event.url,
            content_type = %event.content_type,
            content_length = event.content_length,
            "Media response"
        );
    }

    fn on_capture(&self, outcome: &CaptureOutcome) {
        tracing::debug!(outcome = outcome.label(), url = %outcome.url(), "Capture outcome");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(dir) = &cli.download_dir {
        config.capture.download_dir = dir.display().to_string();
    }

    logging::init(&config.observability.log_filter);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "media-tap starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        download_dir = %config.capture.download_dir,
        min_size_bytes = config.capture.min_size_bytes,
        capture_enabled = config.capture.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let running = MediaTap::new(config.clone()).start(&LogStartup).await?;
    let _observer = running.subscribe(Arc::new(LogObserver));

    // Keep the watcher alive for the life of the process.
    let _watcher = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let watcher = ConfigWatcher::new(path, config, running.capture_settings().clone());
            Some(watcher.run()?)
        }
        _ => None,
    };

    tracing::info!(address = %running.router_addr(), "Point your client's HTTP and HTTPS proxy here");
    wait_for_shutdown_signal().await;

    running.shutdown().await;
    Ok(())
}
