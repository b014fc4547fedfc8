//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for runs, steps and backend calls with
//! standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

/// Metrics prefix for all AnswerForge metrics
pub const METRICS_PREFIX: &str = "answerforge";

/// Buckets for whole-run latency (in seconds)
pub const RUN_BUCKETS: &[f64] = &[
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    20.00,  // 20s
    30.00,  // 30s
    60.00,  // 60s - default run ceiling
    120.0,  // 2m
];

/// Buckets for individual backend calls
pub const CALL_BUCKETS: &[f64] = &[
    0.010,  // 10ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    20.00,  // 20s - default step ceiling
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_runs_total", METRICS_PREFIX),
        Unit::Count,
        "Total query runs by outcome"
    );

    describe_histogram!(
        format!("{}_run_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end run latency in seconds"
    );

    describe_histogram!(
        format!("{}_run_steps", METRICS_PREFIX),
        Unit::Count,
        "Backend steps consumed per run"
    );

    describe_counter!(
        format!("{}_steps_total", METRICS_PREFIX),
        Unit::Count,
        "Authorized backend steps by kind and outcome"
    );

    describe_counter!(
        format!("{}_budget_denials_total", METRICS_PREFIX),
        Unit::Count,
        "Steps denied by the budget governor"
    );

    describe_counter!(
        format!("{}_llm_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total LLM requests"
    );

    describe_histogram!(
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "LLM call latency in seconds"
    );

    describe_counter!(
        format!("{}_retrieval_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total search service requests"
    );

    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Search latency in seconds"
    );

    describe_histogram!(
        format!("{}_retrieval_results", METRICS_PREFIX),
        Unit::Count,
        "Chunks returned per search"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record a finished run
pub fn record_run(outcome: &str, duration_secs: f64, steps: u32) {
    counter!(
        format!("{}_runs_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(format!("{}_run_duration_seconds", METRICS_PREFIX)).record(duration_secs);
    histogram!(format!("{}_run_steps", METRICS_PREFIX)).record(steps as f64);
}

/// Helper to record a settled step
pub fn record_step(kind: &str, outcome: &str) {
    counter!(
        format!("{}_steps_total", METRICS_PREFIX),
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Helper to record a governor denial
pub fn record_budget_denial(reason: &str) {
    counter!(
        format!("{}_budget_denials_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Helper to record LLM call metrics
pub fn record_llm_call(duration_secs: f64, model_class: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_llm_requests_total", METRICS_PREFIX),
        "model_class" => model_class.to_string(),
        "status" => status
    )
    .increment(1);

    histogram!(
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        "model_class" => model_class.to_string()
    )
    .record(duration_secs);
}

/// Helper to record search metrics
pub fn record_retrieval(duration_secs: f64, result_count: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_retrieval_requests_total", METRICS_PREFIX),
        "status" => status
    )
    .increment(1);

    histogram!(format!("{}_retrieval_duration_seconds", METRICS_PREFIX)).record(duration_secs);

    if success {
        histogram!(format!("{}_retrieval_results", METRICS_PREFIX)).record(result_count as f64);
    }
}
