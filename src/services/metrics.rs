//! Prometheus metrics for the reconciliation worker.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for batch runs by terminal status.
pub static BATCH_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_batch_runs_total",
        "Total number of batch processing runs",
        &["status"]
    )
    .expect("Failed to register BATCH_RUNS")
});

/// Counter for transaction classifications by outcome state.
pub static TRANSACTIONS_CLASSIFIED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_transactions_classified_total",
        "Total number of transactions classified",
        &["state"]
    )
    .expect("Failed to register TRANSACTIONS_CLASSIFIED")
});

/// Counter for unmatched-rate alerts raised.
pub static ALERTS_RAISED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "reconciliation_alerts_raised_total",
        "Total number of unmatched-rate alerts raised"
    )
    .expect("Failed to register ALERTS_RAISED")
});

/// Counter for manual review decisions.
pub static REVIEW_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_review_decisions_total",
        "Total number of manual review decisions",
        &["decision"]
    )
    .expect("Failed to register REVIEW_DECISIONS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&BATCH_RUNS);
    Lazy::force(&TRANSACTIONS_CLASSIFIED);
    Lazy::force(&ALERTS_RAISED);
    Lazy::force(&REVIEW_DECISIONS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
