//! Runtime capture settings, swappable while traffic flows.

use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::capture::observer::MediaRules;
use crate::config::schema::CaptureConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub enabled: bool,
    pub download_dir: PathBuf,
    pub rules: MediaRules,
    pub buffer_chunks: usize,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            enabled: config.enabled,
            download_dir: PathBuf::from(&config.download_dir),
            rules: MediaRules::from(config),
            buffer_chunks: config.buffer_chunks.max(1),
        }
    }
}

/// Shared handle; each response reads one consistent snapshot.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<ArcSwap<CaptureSettings>>,
}

impl SharedSettings {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub fn load(&self) -> Arc<CaptureSettings> {
        self.inner.load_full()
    }

    /// Replace everything from a freshly loaded config section.
    pub fn apply(&self, config: &CaptureConfig) {
        let next = CaptureSettings::from(config);
        if *self.load() != next {
            tracing::info!(
                enabled = next.enabled,
                download_dir = %next.download_dir.display(),
                min_size_bytes = next.rules.min_size_bytes,
                "Capture settings updated"
            );
            self.inner.store(Arc::new(next));
        }
    }

    pub fn set_download_dir(&self, dir: PathBuf) {
        tracing::info!(download_dir = %dir.display(), "Download directory changed");
        self.inner.rcu(|current| {
            let mut next = CaptureSettings::clone(current);
            next.download_dir = dir.clone();
            next
        });
    }
}
