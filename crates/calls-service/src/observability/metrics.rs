//! Metrics definitions for the calls service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `calls_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `lock`: named cluster locks (`ensure_bot`, `cleanup_state`)
//! - `result`: a handful of outcome values per metric
//! - `direction`: inbound, outbound
//! - `reason`: bounded drop reasons
//! - `kind`: cluster event kinds (6 values)
//! - `scope`: cleanup scopes (3 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used by the
/// `/metrics` route.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Lock acquisition can legitimately wait up to the acquisition timeout
        .set_buckets_for_metric(
            Matcher::Prefix("calls_mutex_acquire".to_string()),
            &[
                0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.000, 5.000, 10.000, 20.000,
            ],
        )
        .map_err(|e| format!("Failed to set mutex buckets: {e}"))?
        // Client writes are bounded by the write timeout (seconds at most)
        .set_buckets_for_metric(
            Matcher::Prefix("calls_relay_write".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.500, 1.000, 2.000,
            ],
        )
        .map_err(|e| format!("Failed to set relay write buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Cluster Mutex
// ============================================================================

/// Record a cluster lock acquisition attempt.
///
/// Metric: `calls_mutex_acquisitions_total`, `calls_mutex_acquire_duration_seconds`
/// Labels: `lock`, `result` (acquired, timeout, unavailable)
pub fn record_mutex_acquisition(lock: &str, result: &str, duration: Duration) {
    counter!("calls_mutex_acquisitions_total",
        "lock" => lock.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
    histogram!("calls_mutex_acquire_duration_seconds", "lock" => lock.to_string())
        .record(duration.as_secs_f64());
}

/// Record a held lock whose lease could not be renewed.
///
/// Metric: `calls_mutex_lease_lost_total`
/// Labels: `lock`
///
/// Non-zero values mean a holder ran longer than its lease while the store was
/// unreachable, so mutual exclusion may have been violated.
pub fn record_mutex_lease_lost(lock: &str) {
    counter!("calls_mutex_lease_lost_total", "lock" => lock.to_string()).increment(1);
}

// ============================================================================
// Ownership & Cluster Events
// ============================================================================

/// Set the number of calls this node currently hosts.
///
/// Metric: `calls_owned_calls`
pub fn set_owned_calls(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("calls_owned_calls").set(count as f64);
}

/// Record a rejected ownership claim.
///
/// Metric: `calls_ownership_conflicts_total`
///
/// ALERT: any non-zero value indicates a coordination bug.
pub fn record_ownership_conflict() {
    counter!("calls_ownership_conflicts_total").increment(1);
}

/// Record a consumed cluster event.
///
/// Metric: `calls_cluster_events_total`
/// Labels: `kind`, `result` (applied, stale, ignored)
pub fn record_cluster_event(kind: &str, result: &str) {
    counter!("calls_cluster_events_total",
        "kind" => kind.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a cleanup run and how many records it removed.
///
/// Metric: `calls_cleanup_runs_total`, `calls_cleanup_removed_total`
/// Labels: `scope` (pre_incarnation, all_ownership, node)
pub fn record_cleanup(scope: &str, removed: usize) {
    counter!("calls_cleanup_runs_total", "scope" => scope.to_string()).increment(1);
    counter!("calls_cleanup_removed_total", "scope" => scope.to_string())
        .increment(u64::try_from(removed).unwrap_or(u64::MAX));
}

// ============================================================================
// Signaling Relay
// ============================================================================

/// Record a relayed signaling message.
///
/// Metric: `calls_relay_messages_total`
/// Labels: `direction` (inbound, outbound), `route` (local, peer, backend)
pub fn record_relay_message(direction: &str, route: &str) {
    counter!("calls_relay_messages_total",
        "direction" => direction.to_string(),
        "route" => route.to_string()
    )
    .increment(1);
}

/// Record a dropped signaling message.
///
/// Metric: `calls_relay_dropped_total`
/// Labels: `reason` (queue_full, write_failed, write_timeout, no_session, backend_error)
pub fn record_relay_drop(reason: &str) {
    counter!("calls_relay_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a client transport write latency.
///
/// Metric: `calls_relay_write_latency_seconds`
pub fn record_relay_write_latency(duration: Duration) {
    histogram!("calls_relay_write_latency_seconds").record(duration.as_secs_f64());
}

/// Set the number of sessions with an active outbound writer.
///
/// Metric: `calls_relay_sessions_active`
pub fn set_relay_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("calls_relay_sessions_active").set(count as f64);
}

// ============================================================================
// Media Backend
// ============================================================================

/// Record a media daemon connection attempt.
///
/// Metric: `calls_backend_connects_total`
/// Labels: `result` (connected, failed, exhausted)
pub fn record_backend_connect(result: &str) {
    counter!("calls_backend_connects_total", "result" => result.to_string()).increment(1);
}

/// Record a TURN credential rotation.
///
/// Metric: `calls_turn_rotations_total`
pub fn record_turn_rotation() {
    counter!("calls_turn_rotations_total").increment(1);
}
