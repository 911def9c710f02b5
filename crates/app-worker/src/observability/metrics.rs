//! Metrics definitions for the worker.
//!
//! All metrics follow Prometheus naming conventions:
//! - `worker_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: ok, error (2 values)
//! - `direction`: published, received (2 values)
//! - `task_type`: map_task, special_task (2 values)
//! - `channel`: bus channel names (2 values)
//! - `path`: create, identity, ordinary, deauthenticate (4 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("worker_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set request duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of live sockets on this worker.
///
/// Metric: `worker_sockets_active`
pub fn set_sockets_active(count: usize) {
    // usize to f64 conversion is safe for realistic socket counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("worker_sockets_active").set(count as f64);
}

/// Record one handled request.
///
/// Metrics: `worker_requests_total`, `worker_request_duration_seconds`
/// Labels: `outcome`
pub fn record_request(outcome: &str, duration: Duration) {
    counter!("worker_requests_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("worker_request_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record a fetch shed by admission control.
///
/// Metric: `worker_fetch_rejected_total`
pub fn record_fetch_rejected() {
    counter!("worker_fetch_rejected_total").increment(1);
}

/// Record a package crossing the cluster bus.
///
/// Metric: `worker_bus_packages_total`
/// Labels: `direction`, `task_type`
pub fn record_bus_package(direction: &str, task_type: &str) {
    counter!(
        "worker_bus_packages_total",
        "direction" => direction.to_string(),
        "task_type" => task_type.to_string()
    )
    .increment(1);
}

/// Record a failed bus publish.
///
/// Metric: `worker_bus_publish_failures_total`
/// Labels: `channel`
pub fn record_bus_publish_failure(channel: &str) {
    counter!("worker_bus_publish_failures_total", "channel" => channel.to_string()).increment(1);
}

/// Record a client event dropped because the socket's outbound queue was full.
///
/// Metric: `worker_client_events_dropped_total`
pub fn record_client_event_dropped() {
    counter!("worker_client_events_dropped_total").increment(1);
}

/// Record a token mutation.
///
/// Metric: `worker_token_mutations_total`
/// Labels: `path`
pub fn record_token_mutation(path: &str) {
    counter!("worker_token_mutations_total", "path" => path.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // The metrics crate records to a no-op recorder when none is installed,
    // so these only exercise the recording paths.

    #[test]
    fn test_set_sockets_active() {
        set_sockets_active(0);
        set_sockets_active(1);
        set_sockets_active(10_000);
    }

    #[test]
    fn test_record_request() {
        record_request("ok", Duration::from_millis(3));
        record_request("error", Duration::from_millis(40));
    }

    #[test]
    fn test_record_bus_and_token_counters() {
        record_bus_package("published", "map_task");
        record_bus_package("received", "special_task");
        record_bus_publish_failure("__worker");
        record_fetch_rejected();
        record_client_event_dropped();
        record_token_mutation("identity");
        record_token_mutation("ordinary");
    }

    #[test]
    fn test_metrics_are_captured_by_recorder() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_sockets_active(3);
            record_request("ok", Duration::from_millis(5));
            record_fetch_rejected();
            record_bus_package("published", "map_task");
            record_bus_publish_failure("__worker");
            record_client_event_dropped();
            record_token_mutation("identity");
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "worker_sockets_active",
            "worker_requests_total",
            "worker_request_duration_seconds",
            "worker_fetch_rejected_total",
            "worker_bus_packages_total",
            "worker_bus_publish_failures_total",
            "worker_client_events_dropped_total",
            "worker_token_mutations_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }
    }
}
