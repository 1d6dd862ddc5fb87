//! Metrics sink port.
//!
//! The core reports gauges, counters, and timings through this trait; the
//! deployment decides where they go. [`NoopMetrics`] discards everything
//! and is the default for tests and the CLI.

use std::time::Duration;

/// Receives metric updates from the core.
///
/// Implementations must not block; buffer or drop instead.
pub trait MetricsSink: Send + Sync {
    /// Set a gauge to an absolute value.
    fn gauge(&self, name: &'static str, value: f64);

    /// Add `delta` (possibly negative) to a gauge.
    fn gauge_add(&self, name: &'static str, delta: f64);

    /// Increment a counter.
    fn increment(&self, name: &'static str, by: u64);

    /// Record an elapsed duration.
    fn timing(&self, name: &'static str, elapsed: Duration);
}

/// Gauge and counter names used by the core.
pub mod names {
    pub const CONNECTIONS_ONLINE: &str = "connections_online";
    pub const SESSIONS_ONLINE: &str = "sessions_online";
    pub const REALMS_OPEN: &str = "realms_open";
    pub const PENDING_UPLOAD_BYTES: &str = "pending_upload_bytes";
    pub const INTEGRATION_TIME: &str = "integration_time";
    pub const DOWNLOAD_MESSAGES_SENT: &str = "download_messages_sent";
    pub const PING_RTT: &str = "ping_rtt";
}

/// Discards all metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn gauge(&self, _name: &'static str, _value: f64) {}
    fn gauge_add(&self, _name: &'static str, _delta: f64) {}
    fn increment(&self, _name: &'static str, _by: u64) {}
    fn timing(&self, _name: &'static str, _elapsed: Duration) {}
}
