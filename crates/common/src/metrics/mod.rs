//! Metrics and observability utilities
//!
//! Prometheus metrics for the question-answering pipeline with
//! standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Coursewise metrics
pub const METRICS_PREFIX: &str = "coursewise";

/// Histogram buckets for whole-turn latency (in seconds).
/// A turn makes several sequential model calls, so the range is wide.
pub const TURN_BUCKETS: &[f64] = &[
    0.250,
    0.500,
    1.000,
    2.000,
    5.000,
    10.00,
    20.00,
    30.00,
    60.00,
    120.0,
];

/// Buckets for single model-service calls
pub const MODEL_CALL_BUCKETS: &[f64] = &[
    0.050,
    0.100,
    0.250,
    0.500,
    1.000,
    2.000,
    5.000,
    10.00,
    30.00,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Turn metrics
    describe_counter!(
        format!("{}_turns_total", METRICS_PREFIX),
        Unit::Count,
        "Total conversation turns processed"
    );

    describe_counter!(
        format!("{}_turn_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Turns aborted, labelled by stage"
    );

    describe_histogram!(
        format!("{}_turn_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end turn latency in seconds"
    );

    describe_counter!(
        format!("{}_subqueries_total", METRICS_PREFIX),
        Unit::Count,
        "Sub-questions processed, labelled by route"
    );

    describe_counter!(
        format!("{}_unresolved_total", METRICS_PREFIX),
        Unit::Count,
        "Sub-questions left unresolved, labelled by reason"
    );

    describe_counter!(
        format!("{}_sql_rejections_total", METRICS_PREFIX),
        Unit::Count,
        "Generated SQL rejected before execution"
    );

    // Model service metrics
    describe_counter!(
        format!("{}_model_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total language-model and embedding requests"
    );

    describe_histogram!(
        format!("{}_model_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Model service latency in seconds"
    );

    describe_counter!(
        format!("{}_model_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Retried model-service calls, labelled by call site"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record a completed turn
pub fn record_turn(duration_secs: f64, subquery_count: usize) {
    counter!(format!("{}_turns_total", METRICS_PREFIX)).increment(1);

    histogram!(
        format!("{}_turn_duration_seconds", METRICS_PREFIX),
        "subqueries" => subquery_count.min(5).to_string()
    )
    .record(duration_secs);
}

/// Record a turn aborted in a whole-turn stage
pub fn record_turn_failure(stage: &str) {
    counter!(
        format!("{}_turn_failures_total", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Record the route a sub-question took
pub fn record_subquery(route: &str) {
    counter!(
        format!("{}_subqueries_total", METRICS_PREFIX),
        "route" => route.to_string()
    )
    .increment(1);
}

/// Record an unresolved sub-question
pub fn record_unresolved(reason: &str) {
    counter!(
        format!("{}_unresolved_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record generated SQL rejected by the contract checks or the executor
pub fn record_sql_rejection(checker: &str) {
    counter!(
        format!("{}_sql_rejections_total", METRICS_PREFIX),
        "checker" => checker.to_string()
    )
    .increment(1);
}

/// Record a model-service call
pub fn record_model_call(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_model_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_model_request_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// Record a retried model-service attempt
pub fn record_retry(call_site: &str) {
    counter!(
        format!("{}_model_retries_total", METRICS_PREFIX),
        "call_site" => call_site.to_string()
    )
    .increment(1);
}
