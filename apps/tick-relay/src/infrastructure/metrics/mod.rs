//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ticks**: upstream ticks processed and published, processing latency
//! - **Leases**: acquisition outcomes, stream exits, health sweep results
//! - **Push**: deliveries and drops per outcome, connected sessions
//! - **Bulk reads**: cache hits, fallback fetches, fallback failures
//!
//! # Integration
//!
//! Metrics are rendered at `/metrics` on the HTTP server. Recording before
//! [`init_metrics`] is a no-op, so services and tests never need a recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe all metrics.
///
/// Calling it again returns the handle installed the first time.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Prometheus handle for rendering, if metrics were initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "tick_relay_ticks_received_total",
        "Ticks received from the upstream feed"
    );
    describe_counter!(
        "tick_relay_ticks_published_total",
        "Tick events published on the broadcast topic, by source"
    );
    describe_histogram!(
        "tick_relay_tick_processing_seconds",
        "Time from tick receipt to cache write and publish"
    );

    describe_counter!(
        "tick_relay_lease_acquisitions_total",
        "Lease acquisition attempts by outcome"
    );
    describe_counter!(
        "tick_relay_stream_exits_total",
        "Upstream workers that terminated, by reason"
    );
    describe_counter!(
        "tick_relay_reconnects_total",
        "Upstream connect attempts that failed and were retried"
    );
    describe_counter!(
        "tick_relay_sessions_dropped_total",
        "Live upstream sessions lost and handed to reconnect"
    );
    describe_gauge!(
        "tick_relay_local_streams",
        "Upstream workers owned by this process"
    );
    describe_gauge!(
        "tick_relay_leases",
        "Leases seen by the last health sweep, by status"
    );
    describe_counter!(
        "tick_relay_leases_reclaimed_total",
        "Expired leases force-released by the health sweep"
    );

    describe_counter!(
        "tick_relay_push_total",
        "Push deliveries to client sessions, by outcome"
    );
    describe_gauge!(
        "tick_relay_push_sessions",
        "Connected push sessions in this process"
    );

    describe_counter!(
        "tick_relay_bulk_keys_total",
        "Bulk read keys by resolution"
    );
    describe_counter!(
        "tick_relay_fallback_failures_total",
        "Failed calls to the REST quote fallback"
    );
}

// =============================================================================
// Labels
// =============================================================================

/// Result of delivering one tick to one push session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued on the session buffer.
    Delivered,
    /// Buffer full; the tick was dropped for this session.
    Dropped,
    /// Session had gone away and was pruned.
    Closed,
}

impl PushOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Dropped => "dropped",
            Self::Closed => "closed",
        }
    }
}

/// How a bulk-read key was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkResolution {
    /// Served from the tick cache.
    Cached,
    /// Fetched from the REST fallback.
    Fetched,
    /// Not available from either source.
    Missing,
}

impl BulkResolution {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Fetched => "fetched",
            Self::Missing => "missing",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one upstream tick and how long it took to process.
pub fn record_tick_processed(duration: Duration) {
    counter!("tick_relay_ticks_received_total").increment(1);
    histogram!("tick_relay_tick_processing_seconds").record(duration.as_secs_f64());
}

/// Record tick events published on the broadcast topic.
pub fn record_ticks_published(source: &'static str, count: u64) {
    counter!("tick_relay_ticks_published_total", "source" => source).increment(count);
}

/// Record a lease acquisition outcome (`granted`, `already_held`, `error`).
pub fn record_lease_acquisition(outcome: &'static str) {
    counter!("tick_relay_lease_acquisitions_total", "outcome" => outcome).increment(1);
}

/// Record a worker exit.
pub fn record_stream_exit(reason: &'static str) {
    counter!("tick_relay_stream_exits_total", "reason" => reason).increment(1);
}

/// Record a failed upstream connect that will be retried after a backoff.
pub fn record_reconnect() {
    counter!("tick_relay_reconnects_total").increment(1);
}

/// Record a live upstream session that was lost.
pub fn record_session_dropped() {
    counter!("tick_relay_sessions_dropped_total").increment(1);
}

/// Update the number of workers owned by this process.
pub fn set_local_streams(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("tick_relay_local_streams").set(count as f64);
}

/// Update lease gauges from a health sweep.
pub fn set_lease_counts(active: usize, stale: usize) {
    #[allow(clippy::cast_precision_loss)]
    {
        gauge!("tick_relay_leases", "status" => "active").set(active as f64);
        gauge!("tick_relay_leases", "status" => "stale").set(stale as f64);
    }
}

/// Record leases reclaimed by a health sweep.
pub fn record_leases_reclaimed(count: u64) {
    counter!("tick_relay_leases_reclaimed_total").increment(count);
}

/// Record push deliveries with one outcome.
pub fn record_push(outcome: PushOutcome, count: u64) {
    if count > 0 {
        counter!("tick_relay_push_total", "outcome" => outcome.as_str()).increment(count);
    }
}

/// Update the connected push session count.
pub fn set_push_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("tick_relay_push_sessions").set(count as f64);
}

/// Record bulk-read keys with one resolution.
pub fn record_bulk_keys(resolution: BulkResolution, count: u64) {
    if count > 0 {
        counter!("tick_relay_bulk_keys_total", "resolution" => resolution.as_str())
            .increment(count);
    }
}

/// Record a failed fallback call.
pub fn record_fallback_failure() {
    counter!("tick_relay_fallback_failures_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_names() {
        assert_eq!(PushOutcome::Delivered.as_str(), "delivered");
        assert_eq!(PushOutcome::Dropped.as_str(), "dropped");
        assert_eq!(PushOutcome::Closed.as_str(), "closed");
        assert_eq!(BulkResolution::Cached.as_str(), "cached");
        assert_eq!(BulkResolution::Fetched.as_str(), "fetched");
        assert_eq!(BulkResolution::Missing.as_str(), "missing");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_tick_processed(Duration::from_millis(1));
        record_push(PushOutcome::Dropped, 3);
        set_lease_counts(2, 1);
    }
}
