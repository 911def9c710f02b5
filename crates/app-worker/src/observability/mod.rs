//! Observability for the worker.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit safe
//! fields. Signed tokens, token payloads and secrets never reach a span or a
//! log line; socket ids, token ids and group names do.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `worker_sockets_active` | Gauge | none |
//! | `worker_requests_total` | Counter | `outcome` |
//! | `worker_request_duration_seconds` | Histogram | `outcome` |
//! | `worker_fetch_rejected_total` | Counter | none |
//! | `worker_bus_packages_total` | Counter | `direction`, `task_type` |
//! | `worker_bus_publish_failures_total` | Counter | `channel` |
//! | `worker_client_events_dropped_total` | Counter | none |
//! | `worker_token_mutations_total` | Counter | `path` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
