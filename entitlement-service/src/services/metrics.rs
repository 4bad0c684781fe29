//! Metrics module for entitlement-service.
//! Prometheus metrics for webhook reconciliation and the quota/feature gates.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "entitlement_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Webhook events by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Events for which no user could be resolved (alerting)
pub static RESOLUTION_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Quota gate decisions
pub static QUOTA_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Feature gate decisions
pub static FEATURE_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Store calls that exceeded the configured timeout
pub static STORE_TIMEOUTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Rows removed by the retention task
pub static PRUNED_ROWS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// gRPC request counter
pub static GRPC_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// gRPC request duration histogram
pub static GRPC_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Recorder behind the `metrics` facade used by the HTTP middleware.
static HTTP_METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_webhook_events_total",
                "Billing webhook events by type and outcome"
            ),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    RESOLUTION_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_user_resolution_failures_total",
                "Billing events acknowledged without a resolvable user"
            ),
            &["event_type"]
        )
        .expect("Failed to register RESOLUTION_FAILURES_TOTAL")
    });

    QUOTA_DECISIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_quota_decisions_total",
                "Quota gate decisions by outcome and deny reason"
            ),
            &["outcome", "reason"]
        )
        .expect("Failed to register QUOTA_DECISIONS_TOTAL")
    });

    FEATURE_DECISIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_feature_decisions_total",
                "Feature gate decisions by feature, outcome and deny reason"
            ),
            &["feature", "outcome", "reason"]
        )
        .expect("Failed to register FEATURE_DECISIONS_TOTAL")
    });

    STORE_TIMEOUTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_store_timeouts_total",
                "Store calls abandoned after the configured timeout"
            ),
            &["operation"]
        )
        .expect("Failed to register STORE_TIMEOUTS_TOTAL")
    });

    PRUNED_ROWS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_pruned_rows_total",
                "Rows deleted by the retention task"
            ),
            &["table"]
        )
        .expect("Failed to register PRUNED_ROWS_TOTAL")
    });

    GRPC_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("entitlement_grpc_requests_total", "Total gRPC requests"),
            &["method", "status"]
        )
        .expect("Failed to register GRPC_REQUESTS_TOTAL")
    });

    // Gates sit on the request path of every analysis, so buckets start low.
    GRPC_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "entitlement_grpc_request_duration_seconds",
                "gRPC request duration",
                vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
            ),
            &["method"]
        )
        .expect("Failed to register GRPC_REQUEST_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "entitlement_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // A second recorder cannot be installed in the same process (tests spawn
    // several apps), so a failed install just leaves HTTP metrics unrendered.
    HTTP_METRICS_HANDLE.get_or_init(|| PrometheusBuilder::new().install_recorder().ok());

    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    let mut output = String::from_utf8_lossy(&buffer).into_owned();

    if let Some(Some(handle)) = HTTP_METRICS_HANDLE.get() {
        output.push_str(&handle.render());
    }
    output
}

/// Record a processed webhook event.
pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

/// Record an event whose user could not be resolved.
pub fn record_resolution_failure(event_type: &str) {
    if let Some(counter) = RESOLUTION_FAILURES_TOTAL.get() {
        counter.with_label_values(&[event_type]).inc();
    }
}

/// Record a quota gate decision. `reason` is empty for allowed calls.
pub fn record_quota_decision(allowed: bool, reason: &str) {
    if let Some(counter) = QUOTA_DECISIONS_TOTAL.get() {
        counter
            .with_label_values(&[outcome_label(allowed), reason])
            .inc();
    }
}

/// Record a feature gate decision.
pub fn record_feature_decision(feature: &str, allowed: bool, reason: &str) {
    if let Some(counter) = FEATURE_DECISIONS_TOTAL.get() {
        counter
            .with_label_values(&[feature, outcome_label(allowed), reason])
            .inc();
    }
}

/// Record a store timeout.
pub fn record_store_timeout(operation: &str) {
    if let Some(counter) = STORE_TIMEOUTS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record rows removed by the retention task.
pub fn record_pruned_rows(table: &str, rows: u64) {
    if let Some(counter) = PRUNED_ROWS_TOTAL.get() {
        counter.with_label_values(&[table]).inc_by(rows);
    }
}

/// Record a gRPC request.
pub fn record_grpc_request(method: &str, status: &str) {
    if let Some(counter) = GRPC_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[method, status]).inc();
    }
}

/// Record gRPC request duration.
pub fn record_grpc_request_duration(method: &str, duration_secs: f64) {
    if let Some(histogram) = GRPC_REQUEST_DURATION.get() {
        histogram
            .with_label_values(&[method])
            .observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}

fn outcome_label(allowed: bool) -> &'static str {
    if allowed {
        "allowed"
    } else {
        "denied"
    }
}
