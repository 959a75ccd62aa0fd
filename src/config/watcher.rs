//! Configuration file watcher for hot reload.
//!
//! Only the `[capture]` section takes effect without a restart. Changes to
//! listeners or TLS files are detected and logged so the operator knows a
//! restart is needed.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::SharedSettings;
use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::ProxyConfig;

/// What a reload changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub capture_applied: bool,
    pub restart_required: bool,
}

/// Load `path` and push its capture section into `settings`.
///
/// Invalid files leave the running settings untouched.
pub fn reload(path: &Path, baseline: &ProxyConfig, settings: &SharedSettings) -> Result<ReloadSummary, ConfigError> {
    let config = load_config(path)?;

    let before = settings.load();
    settings.apply(&config.capture);
    let capture_applied = *settings.load() != *before;

    let restart_required = config.listener != baseline.listener || config.tls != baseline.tls;
    if restart_required {
        tracing::warn!(path = %path.display(), "Listener or TLS settings changed; restart to apply them");
    }

    Ok(ReloadSummary {
        capture_applied,
        restart_required,
    })
}

/// Watches the configuration file and reloads capture settings on change.
pub struct ConfigWatcher {
    path: PathBuf,
    baseline: ProxyConfig,
    settings: SharedSettings,
}

impl ConfigWatcher {
    pub fn new(path: &Path, baseline: ProxyConfig, settings: SharedSettings) -> Self {
        Self {
            path: path.to_path_buf(),
            baseline,
            settings,
        }
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let baseline = self.baseline;
        let settings = self.settings;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    tracing::info!(path = %path.display(), "Config file change detected, reloading");
                    match reload(&path, &baseline, &settings) {
                        Ok(summary) => tracing::debug!(?summary, "Config reloaded"),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config, keeping current settings");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}
