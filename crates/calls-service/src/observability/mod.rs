//! Observability for the calls service.
//!
//! Instrumented functions use `#[instrument(skip_all)]` with an explicit
//! allow-list of fields. Credentials, session tokens and store URLs are never
//! recorded. Metric labels are bounded; see [`metrics`] for the catalog.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `calls_mutex_acquisitions_total` | Counter | `lock`, `result` |
//! | `calls_mutex_acquire_duration_seconds` | Histogram | `lock` |
//! | `calls_mutex_lease_lost_total` | Counter | `lock` |
//! | `calls_owned_calls` | Gauge | none |
//! | `calls_ownership_conflicts_total` | Counter | none |
//! | `calls_cluster_events_total` | Counter | `kind`, `result` |
//! | `calls_cleanup_runs_total` | Counter | `scope` |
//! | `calls_relay_messages_total` | Counter | `direction`, `route` |
//! | `calls_relay_dropped_total` | Counter | `reason` |
//! | `calls_relay_write_latency_seconds` | Histogram | none |
//! | `calls_relay_sessions_active` | Gauge | none |
//! | `calls_backend_connects_total` | Counter | `result` |
//! | `calls_turn_rotations_total` | Counter | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
