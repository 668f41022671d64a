//! Prometheus metrics for Convoy observability.
//!
//! Exposes metrics compatible with Prometheus/OpenMetrics format:
//! - `convoy_uptime_seconds` - Gauge of container uptime
//! - `convoy_sync_queue_size` - Gauge of pending sync jobs
//! - `convoy_sync_jobs_active` - Gauge of jobs currently in flight
//! - `convoy_election_transitions_total{transition}` - Counter of role changes
//! - `convoy_conflict_resolutions_total{strategy,outcome}` - Counter of resolutions
//! - `convoy_cache_hits_total` / `convoy_cache_misses_total` - Cache effectiveness
//! - `convoy_cache_stale_reads_total` - Stale entries served on fetch failure
//! - `convoy_cache_invalidations_total` - Entries dropped after a peer write
//! - `convoy_state_cache_size` - Gauge of local cache entries
//! - `convoy_heartbeat_failures_total` - Counter of failed renewals
//! - `convoy_lease_expires_timestamp` - Gauge of the lease deadline (unix)
//! - `convoy_job_duration_seconds{status}` - Histogram of per-job latency
//!
//! Recording is pure bookkeeping and never fails the caller; if the global
//! recorder was never installed the macros are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_START_TIME: OnceLock<Instant> = OnceLock::new();

/// Buckets sized for store round trips: most jobs finish in tens of
/// milliseconds, a slow conditional write plus conflict resolution can take
/// a few seconds.
const JOB_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Initialize the Prometheus recorder. Must be called once at startup
/// before any metrics are recorded.
pub fn init_metrics() -> PrometheusHandle {
    let _ = METRICS_START_TIME.get_or_init(Instant::now);

    let handle = PROMETHEUS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new()
            .set_buckets(JOB_LATENCY_BUCKETS)
            .expect("histogram bucket list is non-empty");
        let handle = builder
            .install_recorder()
            .expect("Prometheus recorder already installed");

        describe_gauge!("convoy_uptime_seconds", "Container uptime in seconds");
        describe_gauge!("convoy_sync_queue_size", "Number of pending sync jobs");
        describe_gauge!(
            "convoy_sync_jobs_active",
            "Number of sync jobs currently in flight"
        );
        describe_counter!(
            "convoy_election_transitions_total",
            "Election role transitions by kind"
        );
        describe_counter!(
            "convoy_conflict_resolutions_total",
            "Conflict resolutions by strategy and outcome"
        );
        describe_counter!("convoy_cache_hits_total", "State cache hits");
        describe_counter!("convoy_cache_misses_total", "State cache misses");
        describe_counter!(
            "convoy_cache_stale_reads_total",
            "Stale cache entries served because the store fetch failed"
        );
        describe_counter!(
            "convoy_cache_invalidations_total",
            "Cache entries dropped because a peer wrote the key"
        );
        describe_gauge!("convoy_state_cache_size", "Entries in the local state cache");
        describe_counter!(
            "convoy_heartbeat_failures_total",
            "Failed lease renewal attempts"
        );
        describe_gauge!(
            "convoy_lease_expires_timestamp",
            "Unix timestamp when the current lease expires"
        );
        describe_histogram!(
            "convoy_job_duration_seconds",
            "Per-job processing latency in seconds"
        );

        handle
    });

    handle.clone()
}

/// Get the Prometheus handle. Returns None if metrics were never installed.
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Record an election transition. `kind` is one of `acquired`, `renewed`,
/// `lost`, `demoted`, `released`.
pub fn record_transition(kind: &str) {
    let labels = [("transition", kind.to_string())];
    counter!("convoy_election_transitions_total", &labels).increment(1);
}

pub fn record_heartbeat_failure() {
    counter!("convoy_heartbeat_failures_total").increment(1);
}

pub fn set_lease_expiry(unix_seconds: i64) {
    gauge!("convoy_lease_expires_timestamp").set(unix_seconds as f64);
}

pub fn record_conflict_resolution(strategy: &str, outcome: &str) {
    let labels = [
        ("strategy", strategy.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("convoy_conflict_resolutions_total", &labels).increment(1);
}

pub fn record_cache_hit() {
    counter!("convoy_cache_hits_total").increment(1);
}

pub fn record_cache_miss() {
    counter!("convoy_cache_misses_total").increment(1);
}

pub fn record_stale_read() {
    counter!("convoy_cache_stale_reads_total").increment(1);
}

pub fn record_cache_invalidation() {
    counter!("convoy_cache_invalidations_total").increment(1);
}

pub fn set_cache_size(entries: usize) {
    gauge!("convoy_state_cache_size").set(entries as f64);
}

pub fn set_queue_size(pending: i64) {
    gauge!("convoy_sync_queue_size").set(pending as f64);
}

pub fn set_jobs_active(active: usize) {
    gauge!("convoy_sync_jobs_active").set(active as f64);
}

pub fn record_job_duration(status: &str, seconds: f64) {
    let labels = [("status", status.to_string())];
    histogram!("convoy_job_duration_seconds", &labels).record(seconds);
}

fn update_uptime_gauge() {
    if let Some(start) = METRICS_START_TIME.get() {
        gauge!("convoy_uptime_seconds").set(start.elapsed().as_secs_f64());
    }
}

/// Render all metrics in Prometheus text format.
pub fn render_metrics() -> String {
    update_uptime_gauge();

    if let Some(handle) = get_prometheus_handle() {
        handle.render()
    } else {
        String::from("# Metrics not initialized\n")
    }
}
