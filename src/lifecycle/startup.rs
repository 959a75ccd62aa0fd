//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Build the shared capture state (observers, settings, downloader)
//! - Bind the plain proxy, then the secure proxy, then the router
//! - Report each stage to a [`StartupListener`]
//!
//! # Design Decisions
//! - Fail fast: a failing stage stops the pipeline and later stages are not tried
//! - Stages that already started are torn down when a later one fails
//! - The router starts last, so traffic only arrives once both proxies listen

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::capture::{
    CaptureSettings, ObserverRegistry, SharedSettings, Subscription, TrafficMonitor, TrafficObserver,
};
use crate::config::schema::{CaptureConfig, ProxyConfig};
use crate::config::validation::{validate_config, ValidationError};
use crate::http::forward::ForwardContext;
use crate::http::headers::via_token;
use crate::http::plain::PlainProxy;
use crate::http::secure::SecureProxy;
use crate::http::upstream::UpstreamConnector;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::ActivityTracker;
use crate::net::listener::ListenerError;
use crate::net::peer::PeerRegistry;
use crate::net::router::{Router, SpliceTargets};
use crate::net::tls::{self, TlsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Plain,
    Secure,
    Router,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Config => "config",
            Stage::Plain => "plain proxy",
            Stage::Secure => "secure proxy",
            Stage::Router => "router",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("cannot read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} failed to start: {source}")]
pub struct StartupError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl StartupError {
    fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    /// True when a listener address is owned by another process.
    pub fn is_address_in_use(&self) -> bool {
        matches!(&self.source, StageError::Listener(e) if e.is_address_in_use())
    }
}

/// Per-stage startup notifications. Each method is called at most once.
///
/// Plain and secure failures are reported only through their own
/// callbacks; `on_error` covers configuration and router failures.
pub trait StartupListener: Send + Sync {
    fn on_plain_ready(&self, _addr: SocketAddr) {}
    fn on_plain_error(&self, _error: &StartupError) {}
    fn on_secure_ready(&self, _addr: SocketAddr) {}
    fn on_secure_error(&self, _error: &StartupError) {}
    /// The router is accepting; the proxy is usable.
    fn on_ready(&self, _addr: SocketAddr) {}
    fn on_error(&self, _error: &StartupError) {}
}

/// Logs every stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStartup;

impl StartupListener for LogStartup {
    fn on_plain_ready(&self, addr: SocketAddr) {
        tracing::info!(address = %addr, "Plain proxy ready");
    }

    fn on_plain_error(&self, error: &StartupError) {
        tracing::error!(error = %error, address_in_use = error.is_address_in_use(), "Plain proxy failed");
    }

    fn on_secure_ready(&self, addr: SocketAddr) {
        tracing::info!(address = %addr, "Secure proxy ready");
    }

    fn on_secure_error(&self, error: &StartupError) {
        tracing::error!(error = %error, address_in_use = error.is_address_in_use(), "Secure proxy failed");
    }

    fn on_ready(&self, addr: SocketAddr) {
        tracing::info!(address = %addr, "Proxy entry point ready");
    }

    fn on_error(&self, error: &StartupError) {
        tracing::error!(error = %error, address_in_use = error.is_address_in_use(), "Proxy entry point failed");
    }
}

/// A configured, not yet started proxy.
pub struct MediaTap {
    config: ProxyConfig,
}

impl MediaTap {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Run the startup pipeline: plain proxy, secure proxy, router.
    pub async fn start(self, listener: &dyn StartupListener) -> Result<RunningProxy, StartupError> {
        let config = self.config;

        if let Err(errors) = validate_config(&config) {
            let error = StartupError::new(Stage::Config, StageError::Invalid(errors));
            listener.on_error(&error);
            return Err(error);
        }

        let observers = ObserverRegistry::new();
        let settings = SharedSettings::new(CaptureSettings::from(&config.capture));
        let monitor = TrafficMonitor::new(observers.clone(), settings.clone());
        let requests = ActivityTracker::new();
        let peers = PeerRegistry::new();
        let shutdown = Shutdown::new();
        let via = via_token(&config.identity.hostname);
        let max_connections = config.listener.max_connections;
        let connect_timeout = config.timeouts.connect();

        let mut tasks = StartedTasks::default();

        // Plain proxy
        let plain_ctx = ForwardContext {
            path: "plain",
            connector: UpstreamConnector::plain(connect_timeout),
            via: via.clone(),
            monitor: monitor.clone(),
            requests: requests.clone(),
        };
        let plain = PlainProxy::bind(
            &config.listener.plain_proxy_address,
            max_connections,
            plain_ctx,
            peers.clone(),
        )
        .await
        .map_err(|e| StartupError::new(Stage::Plain, e))
        .and_then(|proxy| {
            let addr = proxy.local_addr().map_err(|e| StartupError::new(Stage::Plain, StageError::LocalAddr(e)))?;
            Ok((proxy, addr))
        });
        let plain_addr = match plain {
            Ok((proxy, addr)) => {
                tasks.push(tokio::spawn(proxy.run(shutdown.subscribe())));
                listener.on_plain_ready(addr);
                addr
            }
            Err(error) => {
                listener.on_plain_error(&error);
                return Err(error);
            }
        };

        // Secure proxy
        let secure = async {
            let server_config = tls::load_server_config(
                Path::new(&config.tls.cert_path),
                Path::new(&config.tls.key_path),
            )
            .map_err(|e| StartupError::new(Stage::Secure, e))?;
            let client_config = tls::upstream_client_config(config.tls.upstream_ca_path.as_deref().map(Path::new))
                .map_err(|e| StartupError::new(Stage::Secure, e))?;

            let secure_ctx = ForwardContext {
                path: "secure",
                connector: UpstreamConnector::tls(client_config, connect_timeout),
                via: via.clone(),
                monitor: monitor.clone(),
                requests: requests.clone(),
            };
            let proxy = SecureProxy::bind(
                &config.listener.secure_proxy_address,
                max_connections,
                server_config,
                secure_ctx,
                peers.clone(),
                config.timeouts.tls_handshake(),
            )
            .await
            .map_err(|e| StartupError::new(Stage::Secure, e))?;
            let addr = proxy
                .local_addr()
                .map_err(|e| StartupError::new(Stage::Secure, StageError::LocalAddr(e)))?;
            Ok::<_, StartupError>((proxy, addr))
        }
        .await;
        let secure_addr = match secure {
            Ok((proxy, addr)) => {
                tasks.push(tokio::spawn(proxy.run(shutdown.subscribe())));
                listener.on_secure_ready(addr);
                addr
            }
            Err(error) => {
                listener.on_secure_error(&error);
                return Err(error);
            }
        };

        // Router
        let targets = SpliceTargets {
            plain: connectable(plain_addr),
            secure: connectable(secure_addr),
        };
        let router = async {
            let router = Router::bind(
                &config.listener.bind_address,
                max_connections,
                targets,
                peers.clone(),
                config.timeouts.sniff(),
            )
            .await
            .map_err(|e| StartupError::new(Stage::Router, e))?;
            let addr = router
                .local_addr()
                .map_err(|e| StartupError::new(Stage::Router, StageError::LocalAddr(e)))?;
            Ok::<_, StartupError>((router, addr))
        }
        .await;
        let (router_addr, connections) = match router {
            Ok((router, addr)) => {
                let connections = router.connections();
                tasks.push(tokio::spawn(router.run(shutdown.subscribe())));
                listener.on_ready(addr);
                (addr, connections)
            }
            Err(error) => {
                listener.on_error(&error);
                return Err(error);
            }
        };

        Ok(RunningProxy {
            router_addr,
            plain_addr,
            secure_addr,
            observers,
            settings,
            requests,
            connections,
            shutdown,
            tasks: tasks.release(),
        })
    }
}

/// Accept loops started so far; aborted unless released.
#[derive(Default)]
struct StartedTasks(Vec<JoinHandle<()>>);

impl StartedTasks {
    fn push(&mut self, task: JoinHandle<()>) {
        self.0.push(task);
    }

    fn release(mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for StartedTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Address the router can connect to for a listener bound to `addr`.
fn connectable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

/// Handle to a started proxy. Dropping it stops accepting new connections.
pub struct RunningProxy {
    router_addr: SocketAddr,
    plain_addr: SocketAddr,
    secure_addr: SocketAddr,
    observers: ObserverRegistry,
    settings: SharedSettings,
    requests: ActivityTracker,
    connections: ActivityTracker,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningProxy {
    /// The public entry point clients should use.
    pub fn router_addr(&self) -> SocketAddr {
        self.router_addr
    }

    pub fn plain_addr(&self) -> SocketAddr {
        self.plain_addr
    }

    pub fn secure_addr(&self) -> SocketAddr {
        self.secure_addr
    }

    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn subscribe(&self, observer: Arc<dyn TrafficObserver>) -> Subscription {
        self.observers.subscribe(observer)
    }

    pub fn capture_settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn set_download_dir(&self, dir: impl Into<PathBuf>) {
        self.settings.set_download_dir(dir.into());
    }

    pub fn apply_capture_config(&self, config: &CaptureConfig) {
        self.settings.apply(config);
    }

    /// Requests that have not finished relaying.
    pub fn in_flight(&self) -> u64 {
        self.requests.active_count()
    }

    /// Connections currently held by the router.
    pub fn open_connections(&self) -> u64 {
        self.connections.active_count()
    }

    /// Stop accepting on all listeners and wait for the accept loops to exit.
    /// Connections already being served run to completion.
    pub async fn shutdown(mut self) {
        tracing::info!(in_flight = self.in_flight(), "Shutting down");
        self.shutdown.trigger();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        tracing::info!("Shutdown complete");
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
