//! # Cellaserv Metrics
//!
//! Lock-free counters updated on the routing paths. Every update is a single
//! relaxed atomic operation so the counters can be bumped while the broker
//! state lock is held without lengthening the critical section.
//!
//! ```rust,no_run
//! use cellaserv::metrics::BrokerMetrics;
//!
//! let metrics = BrokerMetrics::new();
//! metrics.connection_opened();
//! metrics.request_routed();
//!
//! let snapshot = metrics.snapshot();
//! println!("{}", snapshot.to_json().unwrap());
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Ensure hot counters live on their own cache line
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineAligned<T>(T);

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    active_connections: CacheLineAligned<AtomicUsize>,
    total_connections: AtomicU64,
    requests_routed: CacheLineAligned<AtomicU64>,
    request_errors: AtomicU64,
    replies_forwarded: AtomicU64,
    replies_dropped: AtomicU64,
    timeouts: AtomicU64,
    publishes: CacheLineAligned<AtomicU64>,
    deliveries: CacheLineAligned<AtomicU64>,
    frames_dropped: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn connection_opened(&self) {
        self.active_connections.0.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn connection_closed(&self) {
        self.active_connections.0.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn request_routed(&self) {
        self.requests_routed.0.fetch_add(1, Ordering::Relaxed);
    }

    /// A request answered with an error reply by the broker itself
    pub fn request_error(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_forwarded(&self) {
        self.replies_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_dropped(&self) {
        self.replies_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn published(&self, recipients: usize) {
        self.publishes.0.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .0
            .fetch_add(recipients as u64, Ordering::Relaxed);
    }

    /// A frame refused by a full outbound queue
    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.0.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            requests_routed: self.requests_routed.0.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            replies_forwarded: self.replies_forwarded.load(Ordering::Relaxed),
            replies_dropped: self.replies_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            publishes: self.publishes.0.load(Ordering::Relaxed),
            deliveries: self.deliveries.0.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BrokerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub requests_routed: u64,
    pub request_errors: u64,
    pub replies_forwarded: u64,
    pub replies_dropped: u64,
    pub timeouts: u64,
    pub publishes: u64,
    pub deliveries: u64,
    pub frames_dropped: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
