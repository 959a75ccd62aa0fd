//! Connection and request lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique IDs for log correlation
//! - Count live connections / in-flight requests with RAII guards

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live units of work (connections, requests).
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    active_count: Arc<AtomicU64>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active unit. Returns a guard that decrements on drop.
    pub fn track(&self) -> ActivityGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Decrements the owning tracker when dropped.
#[derive(Debug)]
pub struct ActivityGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ActivityGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(id = %self.id, "Activity finished");
    }
}
