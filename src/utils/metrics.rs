//! Observability and Metrics
//!
//! Process-wide counters for connections, negotiation, calls and security
//! events.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for RPC operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections opened (client) or accepted (server)
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Bind and alter-context exchanges started
    pub binds_total: AtomicU64,
    /// Binds that were refused outright
    pub binds_rejected: AtomicU64,
    /// Calls issued (client) or dispatched (server)
    pub calls_total: AtomicU64,
    /// Calls that ended in a fault PDU
    pub faults_total: AtomicU64,
    /// Calls abandoned at their deadline
    pub timeouts_total: AtomicU64,
    /// Fragments written
    pub fragments_sent: AtomicU64,
    /// Fragments read
    pub fragments_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Failed token exchanges and verifier checks
    pub auth_failures: AtomicU64,
    /// Verifiers rejected for their sequence number
    pub sequence_violations: AtomicU64,
    /// Total replay cache hits
    pub replay_cache_hits: AtomicU64,
    /// Framing and decode errors
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            binds_total: AtomicU64::new(0),
            binds_rejected: AtomicU64::new(0),
            calls_total: AtomicU64::new(0),
            faults_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            fragments_sent: AtomicU64::new(0),
            fragments_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            sequence_violations: AtomicU64::new(0),
            replay_cache_hits: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn bind_attempt(&self) {
        self.binds_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bind_rejected(&self) {
        self.binds_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_started(&self) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fault(&self) {
        self.faults_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fragment sent
    pub fn fragment_sent(&self, byte_count: u64) {
        self.fragments_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a fragment received
    pub fn fragment_received(&self, byte_count: u64) {
        self.fragments_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sequence_violation(&self) {
        self.sequence_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a replay cache hit
    pub fn replay_cache_hit(&self) {
        self.replay_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            binds_total: self.binds_total.load(Ordering::Relaxed),
            binds_rejected: self.binds_rejected.load(Ordering::Relaxed),
            calls_total: self.calls_total.load(Ordering::Relaxed),
            faults_total: self.faults_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            fragments_received: self.fragments_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            sequence_violations: self.sequence_violations.load(Ordering::Relaxed),
            replay_cache_hits: self.replay_cache_hits.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            binds_total = snapshot.binds_total,
            binds_rejected = snapshot.binds_rejected,
            calls_total = snapshot.calls_total,
            faults_total = snapshot.faults_total,
            timeouts_total = snapshot.timeouts_total,
            fragments_sent = snapshot.fragments_sent,
            fragments_received = snapshot.fragments_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            auth_failures = snapshot.auth_failures,
            sequence_violations = snapshot.sequence_violations,
            replay_cache_hits = snapshot.replay_cache_hits,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "RPC metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub binds_total: u64,
    pub binds_rejected: u64,
    pub calls_total: u64,
    pub faults_total: u64,
    pub timeouts_total: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub auth_failures: u64,
    pub sequence_violations: u64,
    pub replay_cache_hits: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Initialize metrics collection (call once at startup)
pub fn init_metrics() {
    let _ = global_metrics();
    info!("Metrics collection initialized");
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let m = Metrics::new();
        m.connection_established();
        m.fragment_sent(100);
        m.fragment_received(40);
        m.fault();
        m.connection_closed();
        m.connection_closed();

        let s = m.snapshot();
        assert_eq!(s.connections_total, 1);
        assert_eq!(s.connections_active, 0);
        assert_eq!(s.bytes_sent, 100);
        assert_eq!(s.bytes_received, 40);
        assert_eq!(s.faults_total, 1);
    }
}
