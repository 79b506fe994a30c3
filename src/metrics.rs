use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for observability
///
/// Shared by every endpoint of one manager. Use `snapshot()` to get a
/// point-in-time view, or the individual getters for specific values.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Reconnections: {}", metrics.reconnections());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    connect_failures_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    malformed_frames_total: AtomicU64,
    subscriber_panics_total: AtomicU64,
    sends_rejected_total: AtomicU64,
    pings_sent_total: AtomicU64,
    pongs_received_total: AtomicU64,
    heartbeat_failures_total: AtomicU64,
    reconnects_exhausted_total: AtomicU64,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total successful opens (first connects and reconnects)
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnect attempts scheduled
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total failed opens
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures_total.load(Ordering::Relaxed)
    }

    /// Get total text frames received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Get total frames written
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total inbound frames dropped as malformed
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames_total.load(Ordering::Relaxed)
    }

    /// Get total subscriber/observer panics caught
    pub fn subscriber_panics(&self) -> u64 {
        self.subscriber_panics_total.load(Ordering::Relaxed)
    }

    /// Get total `send` calls that returned false
    pub fn sends_rejected(&self) -> u64 {
        self.sends_rejected_total.load(Ordering::Relaxed)
    }

    /// Get total pings sent
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent_total.load(Ordering::Relaxed)
    }

    /// Get total pongs received
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received_total.load(Ordering::Relaxed)
    }

    /// Get total missed-pong timeouts
    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures_total.load(Ordering::Relaxed)
    }

    /// Get total endpoints that ran out of reconnect attempts
    pub fn reconnects_exhausted(&self) -> u64 {
        self.reconnects_exhausted_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed_frame(&self) {
        self.malformed_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subscriber_panic(&self) {
        self.subscriber_panics_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_rejected(&self) {
        self.sends_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong(&self) {
        self.pongs_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_failure(&self) {
        self.heartbeat_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnects_exhausted(&self) {
        self.reconnects_exhausted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all counters for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            connect_failures_total: self.connect_failures_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            malformed_frames_total: self.malformed_frames_total.load(Ordering::Acquire),
            subscriber_panics_total: self.subscriber_panics_total.load(Ordering::Acquire),
            sends_rejected_total: self.sends_rejected_total.load(Ordering::Acquire),
            pings_sent_total: self.pings_sent_total.load(Ordering::Acquire),
            pongs_received_total: self.pongs_received_total.load(Ordering::Acquire),
            heartbeat_failures_total: self.heartbeat_failures_total.load(Ordering::Acquire),
            reconnects_exhausted_total: self.reconnects_exhausted_total.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub connect_failures_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub malformed_frames_total: u64,
    pub subscriber_panics_total: u64,
    pub sends_rejected_total: u64,
    pub pings_sent_total: u64,
    pub pongs_received_total: u64,
    pub heartbeat_failures_total: u64,
    pub reconnects_exhausted_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_reconnection();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_message_received();
        metrics.record_malformed_frame();
        metrics.record_send_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received_total, 1);
        assert_eq!(snapshot.malformed_frames_total, 1);
        assert_eq!(snapshot.sends_rejected_total, 1);
        assert_eq!(snapshot.messages_sent_total, 0);
    }

    #[test]
    fn test_individual_getters() {
        let metrics = Metrics::new();

        metrics.record_ping();
        metrics.record_pong();
        metrics.record_heartbeat_failure();
        metrics.record_reconnects_exhausted();

        assert_eq!(metrics.pings_sent(), 1);
        assert_eq!(metrics.pongs_received(), 1);
        assert_eq!(metrics.heartbeat_failures(), 1);
        assert_eq!(metrics.reconnects_exhausted(), 1);
        assert_eq!(metrics.connect_failures(), 0);
    }
}
