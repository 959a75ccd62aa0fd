//! Streams captured response bodies to disk.
//!
//! # Responsibilities
//! - Derive a file name from the URL and refuse unusable ones
//! - Never overwrite: skip existing files and destinations being written
//! - Write chunks in the background, fed by a bounded channel
//! - Report the final outcome to observers
//!
//! # Design Decisions
//! - The relay side only ever calls `try_send`; a slow disk detaches the
//!   capture instead of slowing the client
//! - Files are opened with `create_new`, so two processes cannot clobber
//!   each other either
//! - Short bodies leave the partial file in place and report `Failed`

use bytes::Bytes;
use dashmap::DashSet;
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use url::Url;

use crate::capture::observer::{CaptureOutcome, ObserverRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Pending,
    Active,
    Completed,
    SkippedExists,
    SkippedTooSmall,
    SkippedInvalid,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadState::Pending | DownloadState::Active)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: Url,
    pub path: PathBuf,
    pub expected_len: u64,
    pub state: DownloadState,
}

impl DownloadTask {
    fn new(url: Url, path: PathBuf, expected_len: u64) -> Self {
        Self {
            url,
            path,
            expected_len,
            state: DownloadState::Pending,
        }
    }

    fn transition(&mut self, next: DownloadState) {
        tracing::debug!(
            path = %self.path.display(),
            from = ?self.state,
            to = ?next,
            "Download state change"
        );
        self.state = next;
    }

    /// Outcome for the writer's result. Moves the task to a terminal state.
    fn finish(&mut self, written: u64, result: std::io::Result<()>) -> CaptureOutcome {
        let failure = match result {
            Err(e) => Some(e.to_string()),
            Ok(()) if written < self.expected_len => Some(format!(
                "body ended after {} of {} bytes",
                written, self.expected_len
            )),
            Ok(()) => None,
        };

        match failure {
            None => {
                self.transition(DownloadState::Completed);
                CaptureOutcome::Completed {
                    url: self.url.clone(),
                    path: self.path.clone(),
                    bytes: written,
                }
            }
            Some(reason) => {
                self.transition(DownloadState::Failed);
                CaptureOutcome::Failed {
                    url: self.url.clone(),
                    path: self.path.clone(),
                    reason,
                }
            }
        }
    }
}

/// File name for a captured URL: the decoded last path segment.
pub fn file_name_for(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let name = percent_decode_str(segment).decode_utf8_lossy();
    let name = name.trim();

    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return None;
    }
    Some(name.to_string())
}

/// Relay-side end of a running download.
#[derive(Debug)]
pub struct CaptureSink {
    tx: mpsc::Sender<Bytes>,
    path: PathBuf,
}

impl CaptureSink {
    /// Hand a chunk to the writer without waiting. False means the capture
    /// should be detached for the rest of the body.
    pub fn offer(&self, chunk: &Bytes) -> bool {
        match self.tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(path = %self.path.display(), "Download writer lagging; detaching capture");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(path = %self.path.display(), "Download writer gone; detaching capture");
                false
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub enum CaptureStart {
    Started(CaptureSink),
    Skipped(CaptureOutcome),
}

/// Removes a destination from the active set when its writer ends.
struct ActiveClaim {
    active: Arc<DashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active.remove(&self.path);
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    active: Arc<DashSet<PathBuf>>,
    observers: ObserverRegistry,
}

impl Downloader {
    pub fn new(observers: ObserverRegistry) -> Self {
        Self {
            active: Arc::new(DashSet::new()),
            observers,
        }
    }

    /// Destinations currently being written.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Decide whether `url` can be written into `dest_dir` and, if so, start
    /// the writer. Every decision is published to observers.
    pub async fn capture(
        &self,
        url: &Url,
        expected_len: u64,
        dest_dir: &Path,
        buffer_chunks: usize,
    ) -> CaptureStart {
        let start = self.start(url, expected_len, dest_dir, buffer_chunks).await;
        match &start {
            CaptureStart::Started(sink) => self.observers.publish(CaptureOutcome::Started {
                url: url.clone(),
                path: sink.path.clone(),
            }),
            CaptureStart::Skipped(outcome) => self.observers.publish(outcome.clone()),
        }
        start
    }

    async fn start(
        &self,
        url: &Url,
        expected_len: u64,
        dest_dir: &Path,
        buffer_chunks: usize,
    ) -> CaptureStart {
        let Some(name) = file_name_for(url) else {
            return CaptureStart::Skipped(CaptureOutcome::SkippedInvalid {
                url: url.clone(),
                reason: "no usable file name in URL".to_string(),
            });
        };
        let path = dest_dir.join(name);
        let mut task = DownloadTask::new(url.clone(), path.clone(), expected_len);
        let failed = |reason: String| {
            CaptureStart::Skipped(CaptureOutcome::Failed {
                url: url.clone(),
                path: path.clone(),
                reason,
            })
        };
        let exists = || {
            CaptureStart::Skipped(CaptureOutcome::SkippedExists {
                url: url.clone(),
                path: path.clone(),
            })
        };

        if let Err(e) = tokio::fs::create_dir_all(dest_dir).await {
            return failed(format!("cannot create {}: {}", dest_dir.display(), e));
        }

        if !self.active.insert(path.clone()) {
            return exists();
        }
        let claim = ActiveClaim {
            active: Arc::clone(&self.active),
            path: path.clone(),
        };

        if tokio::fs::try_exists(&path).await.unwrap_or(true) {
            return exists();
        }

        let file = match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return exists(),
            Err(e) => return failed(e.to_string()),
        };

        let (tx, rx) = mpsc::channel(buffer_chunks.max(1));
        task.transition(DownloadState::Active);
        tracing::info!(%url, path = %path.display(), expected_len, "Capturing media");
        tokio::spawn(write_body(task, file, rx, claim, self.observers.clone()));

        CaptureStart::Started(CaptureSink { tx, path })
    }
}

async fn write_body(
    mut task: DownloadTask,
    file: File,
    mut rx: mpsc::Receiver<Bytes>,
    claim: ActiveClaim,
    observers: ObserverRegistry,
) {
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;

    let result = async {
        while let Some(chunk) = rx.recv().await {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await
    }
    .await;

    let outcome = task.finish(written, result);
    drop(claim);
    observers.publish(outcome);
}
