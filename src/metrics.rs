//! Prometheus metrics for the task runtime.
//!
//! Exposed in text format on the HTTP front end's `/metrics` route.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_gauge, CounterVec, Encoder, Histogram,
    IntGauge, TextEncoder,
};

lazy_static! {
    /// Sessions currently between creation and close, across all transports.
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "scriptpilot_active_sessions",
        "Number of task sessions currently open"
    )
    .unwrap();

    /// Completed runs by outcome.
    pub static ref RUNS_TOTAL: CounterVec = register_counter_vec!(
        "scriptpilot_runs_total",
        "Total number of task runs",
        &["result"]  // "success" or "failure"
    )
    .unwrap();

    /// Dispatched commands by kind.
    pub static ref COMMANDS_TOTAL: CounterVec = register_counter_vec!(
        "scriptpilot_commands_total",
        "Total number of dispatched commands",
        &["kind"]
    )
    .unwrap();

    /// Main-sequence duration, excluding cleanup.
    pub static ref RUN_DURATION_SECONDS: Histogram = register_histogram!(
        "scriptpilot_run_duration_seconds",
        "Task run duration in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap();
}

/// Render all registered metrics in Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
