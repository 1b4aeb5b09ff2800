use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

const HISTOGRAM_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

const HISTOGRAM_BUCKETS_SECONDS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
];

pub fn describe() {
    describe_counter!(
        "tracing_error_events",
        "Cumulative count of all ERROR-level tracing events."
    );
    describe_histogram!(
        "lake_db_query_latency_ms",
        "Analytical store operation total latency in milliseconds (queue wait + execution)."
    );
    describe_counter!(
        "lake_db_query_errors_total",
        "Analytical store operation errors."
    );
    describe_counter!(
        "lake_files_completed_total",
        "Source files loaded to completion, per exchange."
    );
    describe_counter!(
        "lake_files_failed_total",
        "Source files whose load failed, per exchange."
    );
    describe_counter!(
        "lake_files_skipped_total",
        "Source files skipped, by reason (not_found, shutdown)."
    );
    describe_counter!(
        "lake_records_loaded_total",
        "Bronze records inserted, per exchange."
    );
    describe_histogram!(
        "lake_file_load_seconds",
        "Wall-clock duration of one (exchange, date) load."
    );
    describe_counter!(
        "lake_remote_mirror_failures_total",
        "Remote ledger mirror writes that failed and degraded the mirror."
    );
}

/// Expose a Prometheus scrape endpoint for the run. Port 0 disables it
/// (useful for one-shot invocations and tests).
pub fn install_prometheus(port: u16) -> Result<()> {
    if port == 0 {
        tracing::info!("prometheus exporter disabled");
        return Ok(());
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("_ms".to_string()), HISTOGRAM_BUCKETS_MS)?
        .set_buckets_for_metric(
            Matcher::Suffix("_seconds".to_string()),
            HISTOGRAM_BUCKETS_SECONDS,
        )?
        .install()?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
