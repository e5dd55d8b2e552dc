use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Allocation decisions ────────────────────────────────────────

/// Counter: allocate() outcomes. Labels: placement.
pub const ALLOCATIONS_TOTAL: &str = "apron_allocations_total";

/// Counter: civil occupants displaced to the military pool.
pub const TRANSFERS_TOTAL: &str = "apron_transfers_total";

/// Counter: overflow flights recalled to civil spots.
pub const RECALLS_TOTAL: &str = "apron_recalls_total";

/// Counter: allocations released.
pub const RELEASES_TOTAL: &str = "apron_releases_total";

/// Counter: notifications created. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "apron_notifications_total";

/// Gauge: notifications held in memory after eviction.
pub const NOTIFICATIONS_RETAINED: &str = "apron_notifications_retained";

/// Gauge: civil occupancy percentage after the last decision.
pub const CIVIL_OCCUPANCY_PERCENT: &str = "apron_civil_occupancy_percent";

// ── Sync pipeline ────────────────────────────────────────────────

/// Counter: sync runs. Labels: source, outcome.
pub const SYNC_RUNS_TOTAL: &str = "apron_sync_runs_total";

/// Counter: per-flight results inside a sync. Labels: outcome (successful, failed, skipped).
pub const SYNC_FLIGHTS_TOTAL: &str = "apron_sync_flights_total";

/// Histogram: sync wall time in seconds.
pub const SYNC_DURATION_SECONDS: &str = "apron_sync_duration_seconds";

/// Counter: telemetry records applied to known flights.
pub const TELEMETRY_UPDATES_TOTAL: &str = "apron_telemetry_updates_total";

/// Counter: retried external calls. Labels: operation.
pub const PROVIDER_RETRIES_TOTAL: &str = "apron_provider_retries_total";

// ── Scheduler ────────────────────────────────────────────────────

/// Counter: job runs. Labels: job, outcome (ok, failed).
pub const JOB_RUNS_TOTAL: &str = "apron_job_runs_total";

/// Counter: ticks skipped because the previous run was still going. Labels: job.
pub const JOB_SKIPPED_TOTAL: &str = "apron_job_skipped_total";

/// Counter: ticks dropped for arriving past the misfire grace. Labels: job.
pub const JOB_MISFIRED_TOTAL: &str = "apron_job_misfired_total";

// ── Prediction cache ─────────────────────────────────────────────

/// Counter: cache lookups. Labels: result (hit, miss, error).
pub const CACHE_LOOKUPS_TOTAL: &str = "apron_cache_lookups_total";

/// Counter: cache writes that failed and were dropped.
pub const CACHE_WRITE_ERRORS_TOTAL: &str = "apron_cache_write_errors_total";

// ── Storage ──────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "apron_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "apron_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
