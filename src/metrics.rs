//! Metrics collection for RiverQ client

use std::sync::atomic::{AtomicU64, Ordering};

/// Client metrics collector. One instance is shared by the engine that owns it;
/// there is deliberately no process-wide registry.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub messages_published: AtomicU64,
    pub publish_attempts: AtomicU64,
    pub publish_errors: AtomicU64,

    // Consumer metrics
    pub messages_received: AtomicU64,
    pub messages_finished: AtomicU64,
    pub messages_requeued: AtomicU64,
    pub handler_failures: AtomicU64,
    pub rdy_adjustments: AtomicU64,

    // Connection metrics
    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
    pub connections_invalidated: AtomicU64,
}

impl ClientMetrics {
    pub fn record_publish(&self, message_count: u64) {
        self.messages_published
            .fetch_add(message_count, Ordering::Relaxed);
    }

    pub fn record_publish_attempt(&self) {
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self) {
        self.messages_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.messages_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rdy_adjustment(&self) {
        self.rdy_adjustments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_invalidated(&self) {
        self.connections_invalidated.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_finished: self.messages_finished.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            rdy_adjustments: self.rdy_adjustments.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_invalidated: self.connections_invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub publish_attempts: u64,
    pub publish_errors: u64,
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub handler_failures: u64,
    pub rdy_adjustments: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub connections_invalidated: u64,
}
