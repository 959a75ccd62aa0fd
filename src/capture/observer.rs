//! Traffic observation and media classification.
//!
//! Every response whose headers reached the proxy becomes an
//! [`ObservedEvent`]. Events are fanned out to registered
//! [`TrafficObserver`]s and classified against [`MediaRules`]. Nothing here
//! can touch the relay: observers get shared references and a panicking
//! observer is contained.

use arc_swap::ArcSwap;
use http::{Method, StatusCode};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use url::Url;

use crate::capture::downloader::{CaptureSink, CaptureStart, Downloader};
use crate::capture::settings::SharedSettings;
use crate::config::schema::CaptureConfig;
use crate::http::headers::HeaderList;
use crate::observability::metrics;

/// Immutable snapshot of one proxied exchange, taken when response headers arrive.
#[derive(Debug, Clone)]
pub struct ObservedEvent {
    pub url: Url,
    pub method: Method,
    pub status: StatusCode,
    /// `Content-Type` of the response, empty when absent.
    pub content_type: String,
    /// `Content-Length` of the response, 0 when absent or unparsable.
    pub content_length: u64,
    pub request_headers: HeaderList,
    pub response_headers: HeaderList,
}

impl ObservedEvent {
    pub fn new(
        url: Url,
        method: Method,
        status: StatusCode,
        request_headers: HeaderList,
        response_headers: HeaderList,
    ) -> Self {
        let content_type = response_headers
            .get_str("content-type")
            .unwrap_or_default()
            .to_string();
        let content_length = response_headers
            .get_str("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        Self {
            url,
            method,
            status,
            content_type,
            content_length,
            request_headers,
            response_headers,
        }
    }

    /// True when the body that follows is the whole resource. HEAD answers
    /// carry no body and anything but 200 (206 ranges, 304) is partial or empty.
    pub fn carries_full_body(&self) -> bool {
        self.method != Method::HEAD && self.status == StatusCode::OK
    }
}

/// Heuristic media filter: path suffix or MIME prefix, plus a size floor.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRules {
    pub extensions: Vec<String>,
    pub type_prefixes: Vec<String>,
    pub min_size_bytes: u64,
}

impl From<&CaptureConfig> for MediaRules {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            extensions: config.media_extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            type_prefixes: config
                .media_type_prefixes
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            min_size_bytes: config.min_size_bytes,
        }
    }
}

impl MediaRules {
    pub fn is_media(&self, event: &ObservedEvent) -> bool {
        let path = event.url.path().to_ascii_lowercase();
        let content_type = event.content_type.to_ascii_lowercase();
        self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
            || self
                .type_prefixes
                .iter()
                .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not media.
    Ignored,
    /// Media above the size floor.
    Capture,
    /// Media with a known length at or below the floor.
    TooSmall,
    /// Media without a usable length.
    Invalid,
}

pub fn classify(event: &ObservedEvent, rules: &MediaRules) -> Classification {
    if !rules.is_media(event) {
        return Classification::Ignored;
    }
    match event.content_length {
        0 => Classification::Invalid,
        len if len > rules.min_size_bytes => Classification::Capture,
        _ => Classification::TooSmall,
    }
}

/// What happened to a media response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Started { url: Url, path: PathBuf },
    Completed { url: Url, path: PathBuf, bytes: u64 },
    SkippedExists { url: Url, path: PathBuf },
    SkippedTooSmall { url: Url, length: u64 },
    SkippedInvalid { url: Url, reason: String },
    Failed { url: Url, path: PathBuf, reason: String },
}

impl CaptureOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CaptureOutcome::Started { .. } => "started",
            CaptureOutcome::Completed { .. } => "completed",
            CaptureOutcome::SkippedExists { .. } => "skipped_exists",
            CaptureOutcome::SkippedTooSmall { .. } => "skipped_too_small",
            CaptureOutcome::SkippedInvalid { .. } => "skipped_invalid",
            CaptureOutcome::Failed { .. } => "failed",
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            CaptureOutcome::Started { url, .. }
            | CaptureOutcome::Completed { url, .. }
            | CaptureOutcome::SkippedExists { url, .. }
            | CaptureOutcome::SkippedTooSmall { url, .. }
            | CaptureOutcome::SkippedInvalid { url, .. }
            | CaptureOutcome::Failed { url, .. } => url,
        }
    }
}

/// Subscriber hooks. All methods default to doing nothing.
pub trait TrafficObserver: Send + Sync {
    /// Every observed response.
    fn on_connect_url(&self, _event: &ObservedEvent) {}

    /// Responses classified as media, whatever their size.
    fn on_got_content(&self, _event: &ObservedEvent) {}

    /// Capture lifecycle notifications.
    fn on_capture(&self, _outcome: &CaptureOutcome) {}
}

type Observers = Vec<(u64, Arc<dyn TrafficObserver>)>;

/// Instance-scoped list of observers.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    next_id: Arc<AtomicU64>,
    observers: Arc<ArcSwap<Observers>>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` until the returned subscription is dropped.
    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn subscribe(&self, observer: Arc<dyn TrafficObserver>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.rcu(|current| {
            let mut next = Observers::clone(current);
            next.push((id, Arc::clone(&observer)));
            next
        });
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn len(&self) -> usize {
        self.observers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` on every observer, containing panics.
    pub fn notify(&self, f: impl Fn(&dyn TrafficObserver)) {
        let observers = self.observers.load();
        for (id, observer) in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::warn!(observer_id = id, "Observer panicked; ignoring");
            }
        }
    }

    /// Log, count and broadcast a capture outcome.
    pub fn publish(&self, outcome: CaptureOutcome) {
        match &outcome {
            CaptureOutcome::Completed { path, bytes, .. } => {
                tracing::info!(path = %path.display(), bytes, "Capture completed");
            }
            CaptureOutcome::Failed { url, reason, .. } => {
                tracing::warn!(%url, %reason, "Capture failed");
            }
            other => {
                tracing::info!(url = %other.url(), outcome = other.label(), "Capture decision");
            }
        }
        metrics::record_capture(outcome.label());
        self.notify(|o| o.on_capture(&outcome));
    }
}

/// Keeps an observer registered.
pub struct Subscription {
    id: u64,
    observers: Weak<ArcSwap<Observers>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            let id = self.id;
            observers.rcu(|current| {
                current
                    .iter()
                    .filter(|(other, _)| *other != id)
                    .cloned()
                    .collect::<Observers>()
            });
        }
    }
}

/// Entry point from the forwarding pipeline, called once per response.
#[derive(Debug, Clone)]
pub struct TrafficMonitor {
    observers: ObserverRegistry,
    settings: SharedSettings,
    downloader: Downloader,
}

impl TrafficMonitor {
    pub fn new(observers: ObserverRegistry, settings: SharedSettings) -> Self {
        let downloader = Downloader::new(observers.clone());
        Self {
            observers,
            settings,
            downloader,
        }
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Report `event` and return a sink when its body should be captured.
    pub async fn observe(&self, event: &ObservedEvent) -> Option<CaptureSink> {
        self.observers.notify(|o| o.on_connect_url(event));

        let settings = self.settings.load();
        let classification = classify(event, &settings.rules);
        if classification == Classification::Ignored {
            return None;
        }

        tracing::debug!(
            url = %event.url,
            content_type = %event.content_type,
            content_length = event.content_length,
            ?classification,
            "Media response observed"
        );
        self.observers.notify(|o| o.on_got_content(event));

        match classification {
            Classification::Capture if !event.carries_full_body() => {
                tracing::debug!(
                    url = %event.url,
                    method = %event.method,
                    status = %event.status,
                    "Response has no complete body; not downloading"
                );
                None
            }
            Classification::Capture if settings.enabled => {
                match self
                    .downloader
                    .capture(
                        &event.url,
                        event.content_length,
                        &settings.download_dir,
                        settings.buffer_chunks,
                    )
                    .await
                {
                    CaptureStart::Started(sink) => Some(sink),
                    CaptureStart::Skipped(_) => None,
                }
            }
            Classification::Capture => {
                tracing::debug!(url = %event.url, "Capture disabled; not downloading");
                None
            }
            Classification::TooSmall => {
                self.observers.publish(CaptureOutcome::SkippedTooSmall {
                    url: event.url.clone(),
                    length: event.content_length,
                });
                None
            }
            Classification::Invalid => {
                self.observers.publish(CaptureOutcome::SkippedInvalid {
                    url: event.url.clone(),
                    reason: "missing or zero content-length".to_string(),
                });
                None
            }
            Classification::Ignored => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::sync::Mutex;

    fn event(url: &str, content_type: Option<&str>, length: Option<&str>) -> ObservedEvent {
        exchange(Method::GET, StatusCode::OK, url, content_type, length)
    }

    fn exchange(
        method: Method,
        status: StatusCode,
        url: &str,
        content_type: Option<&str>,
        length: Option<&str>,
    ) -> ObservedEvent {
        let mut headers = HeaderList::new();
        if let Some(ct) = content_type {
            headers.push("Content-Type", HeaderValue::from_str(ct).unwrap());
        }
        if let Some(len) = length {
            headers.push("Content-Length", HeaderValue::from_str(len).unwrap());
        }
        ObservedEvent::new(Url::parse(url).unwrap(), method, status, HeaderList::new(), headers)
    }

    fn rules() -> MediaRules {
        MediaRules::from(&CaptureConfig::default())
    }

    #[test]
    fn audio_above_threshold_is_captured() {
        let e = event("http://a/stream", Some("audio/mpeg"), Some("2000000"));
        assert_eq!(classify(&e, &rules()), Classification::Capture);
    }

    #[test]
    fn audio_below_threshold_is_too_small() {
        let e = event("http://a/stream", Some("audio/mpeg"), Some("500000"));
        assert_eq!(classify(&e, &rules()), Classification::TooSmall);

        let exact = event("http://a/stream", Some("audio/mpeg"), Some("1000000"));
        assert_eq!(classify(&exact, &rules()), Classification::TooSmall);
    }

    #[test]
    fn media_without_length_is_invalid() {
        let zero = event("http://a/stream", Some("audio/mpeg"), Some("0"));
        assert_eq!(classify(&zero, &rules()), Classification::Invalid);

        let missing = event("http://a/song.MP3", None, None);
        assert_eq!(classify(&missing, &rules()), Classification::Invalid);
    }

    #[test]
    fn extension_matched_case_insensitively_without_content_type() {
        let e = event("http://a/Clip.MP4?token=1", Some("application/octet-stream"), Some("5000000"));
        assert_eq!(classify(&e, &rules()), Classification::Capture);
    }

    #[test]
    fn non_media_is_ignored() {
        let e = event("http://a/index.html", Some("text/html"), Some("9000000"));
        assert_eq!(classify(&e, &rules()), Classification::Ignored);
        // Query strings do not count as path suffixes.
        let q = event("http://a/page?file=x.mp3", Some("text/html"), Some("9000000"));
        assert_eq!(classify(&q, &rules()), Classification::Ignored);
    }

    #[test]
    fn event_extracts_defaults() {
        let e = event("http://a/", None, Some("not-a-number"));
        assert_eq!(e.content_type, "");
        assert_eq!(e.content_length, 0);
    }

    #[derive(Default)]
    struct Recorder {
        urls: Mutex<Vec<String>>,
    }

    impl TrafficObserver for Recorder {
        fn on_connect_url(&self, event: &ObservedEvent) {
            self.urls.lock().unwrap().push(event.url.to_string());
        }
    }

    struct Panicker;

    impl TrafficObserver for Panicker {
        fn on_connect_url(&self, _event: &ObservedEvent) {
            panic!("observer bug");
        }
    }

    #[test]
    fn subscriptions_register_and_unregister() {
        let registry = ObserverRegistry::new();
        let recorder = Arc::new(Recorder::default());

        let sub = registry.subscribe(recorder.clone());
        assert_eq!(registry.len(), 1);
        registry.notify(|o| o.on_connect_url(&event("http://a/1", None, None)));

        drop(sub);
        assert!(registry.is_empty());
        registry.notify(|o| o.on_connect_url(&event("http://a/2", None, None)));

        assert_eq!(*recorder.urls.lock().unwrap(), vec!["http://a/1"]);
    }

    #[test]
    fn panicking_observer_does_not_stop_others() {
        let registry = ObserverRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let _a = registry.subscribe(Arc::new(Panicker));
        let _b = registry.subscribe(recorder.clone());

        registry.notify(|o| o.on_connect_url(&event("http://a/x", None, None)));
        assert_eq!(recorder.urls.lock().unwrap().len(), 1);
    }

    #[derive(Default)]
    struct Decisions {
        media: Mutex<Vec<String>>,
        outcomes: Mutex<Vec<&'static str>>,
    }

    impl TrafficObserver for Decisions {
        fn on_got_content(&self, event: &ObservedEvent) {
            self.media.lock().unwrap().push(event.url.to_string());
        }

        fn on_capture(&self, outcome: &CaptureOutcome) {
            self.outcomes.lock().unwrap().push(outcome.label());
        }
    }

    fn monitor(dir: &std::path::Path, enabled: bool) -> TrafficMonitor {
        let config = CaptureConfig {
            enabled,
            download_dir: dir.display().to_string(),
            ..CaptureConfig::default()
        };
        let settings = SharedSettings::new(crate::capture::settings::CaptureSettings::from(&config));
        TrafficMonitor::new(ObserverRegistry::new(), settings)
    }

    #[tokio::test]
    async fn monitor_reports_small_media_without_sink() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path(), true);
        let decisions = Arc::new(Decisions::default());
        let _sub = monitor.observers().subscribe(decisions.clone());

        let small = event("http://a/a.mp3", Some("audio/mpeg"), Some("500000"));
        assert!(monitor.observe(&small).await.is_none());
        let page = event("http://a/index.html", Some("text/html"), Some("10"));
        assert!(monitor.observe(&page).await.is_none());

        assert_eq!(*decisions.media.lock().unwrap(), vec!["http://a/a.mp3"]);
        assert_eq!(*decisions.outcomes.lock().unwrap(), vec!["skipped_too_small"]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn monitor_starts_capture_for_large_media() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path(), true);
        let decisions = Arc::new(Decisions::default());
        let _sub = monitor.observers().subscribe(decisions.clone());

        let large = event("http://a/big.mp4", Some("video/mp4"), Some("2000000"));
        let sink = monitor.observe(&large).await.expect("capture should start");
        assert_eq!(sink.path(), dir.path().join("big.mp4"));
        assert_eq!(*decisions.outcomes.lock().unwrap(), vec!["started"]);
    }

    #[tokio::test]
    async fn disabled_capture_still_reports_media() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path(), false);
        let decisions = Arc::new(Decisions::default());
        let _sub = monitor.observers().subscribe(decisions.clone());

        let large = event("http://a/big.mp4", Some("video/mp4"), Some("2000000"));
        assert!(monitor.observe(&large).await.is_none());
        assert_eq!(decisions.media.lock().unwrap().len(), 1);
        assert!(decisions.outcomes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn head_and_partial_responses_never_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path(), true);
        let decisions = Arc::new(Decisions::default());
        let _sub = monitor.observers().subscribe(decisions.clone());

        let head = exchange(Method::HEAD, StatusCode::OK, "http://a/song.mp3", Some("audio/mpeg"), Some("2000000"));
        assert!(monitor.observe(&head).await.is_none());
        let range = exchange(
            Method::GET,
            StatusCode::PARTIAL_CONTENT,
            "http://a/song.mp3",
            Some("audio/mpeg"),
            Some("2000000"),
        );
        assert!(monitor.observe(&range).await.is_none());

        assert_eq!(decisions.media.lock().unwrap().len(), 2);
        assert!(decisions.outcomes.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let full = event("http://a/song.mp3", Some("audio/mpeg"), Some("2000000"));
        assert!(monitor.observe(&full).await.is_some());
    }
}
