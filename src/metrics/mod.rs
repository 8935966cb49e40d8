use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::info;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Daemon loop metrics
    pub static ref PASSES_TOTAL: IntCounter = IntCounter::new(
        "laminar_passes_total",
        "Total number of update passes started"
    ).unwrap();

    pub static ref PASSES_SKIPPED: IntCounter = IntCounter::new(
        "laminar_passes_skipped_total",
        "Total number of passes skipped while paused"
    ).unwrap();

    pub static ref PASS_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "laminar_pass_duration_seconds",
            "Time spent on a full update pass"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0])
    ).unwrap();

    // Update metrics
    pub static ref FILES_SCANNED: IntCounter = IntCounter::new(
        "laminar_files_scanned_total",
        "Total number of files scanned for image references"
    ).unwrap();

    pub static ref CANDIDATES_FOUND: IntCounter = IntCounter::new(
        "laminar_candidates_found_total",
        "Total number of image:tag candidates extracted from files"
    ).unwrap();

    pub static ref CHANGES_APPLIED: IntCounter = IntCounter::new(
        "laminar_changes_applied_total",
        "Total number of tag promotions written to files"
    ).unwrap();

    pub static ref POLICY_ERRORS: IntCounter = IntCounter::new(
        "laminar_policy_errors_total",
        "Total number of repository passes aborted by a misconfigured policy"
    ).unwrap();

    // Git metrics
    pub static ref COMMITS_TOTAL: IntCounter = IntCounter::new(
        "laminar_commits_total",
        "Total number of commits pushed"
    ).unwrap();

    pub static ref COMMIT_FAILURES: IntCounter = IntCounter::new(
        "laminar_commit_failures_total",
        "Total number of failed commit or push attempts"
    ).unwrap();

    pub static ref GIT_SYNC_FAILURES: IntCounter = IntCounter::new(
        "laminar_git_sync_failures_total",
        "Total number of failed clone or pull attempts"
    ).unwrap();

    // Registry metrics
    pub static ref REGISTRY_TAGS_INDEXED: IntCounter = IntCounter::new(
        "laminar_registry_tags_indexed_total",
        "Total number of registry tags written to the cache"
    ).unwrap();

    pub static ref REGISTRY_ERRORS: IntCounter = IntCounter::new(
        "laminar_registry_errors_total",
        "Total number of registry scan errors"
    ).unwrap();

    pub static ref CACHE_ENTRIES: IntGauge = IntGauge::new(
        "laminar_cache_entries",
        "Number of records in the tag cache"
    ).unwrap();

    // Control surface metrics
    pub static ref WEBHOOK_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "laminar_webhook_events_total",
        "Total number of webhook events received"
    ).unwrap();

    pub static ref PAUSES_TOTAL: IntCounter = IntCounter::new(
        "laminar_pauses_total",
        "Total number of pause requests accepted"
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY.register(Box::new(PASSES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(PASSES_SKIPPED.clone())).ok();
    REGISTRY.register(Box::new(PASS_DURATION.clone())).ok();
    REGISTRY.register(Box::new(FILES_SCANNED.clone())).ok();
    REGISTRY.register(Box::new(CANDIDATES_FOUND.clone())).ok();
    REGISTRY.register(Box::new(CHANGES_APPLIED.clone())).ok();
    REGISTRY.register(Box::new(POLICY_ERRORS.clone())).ok();
    REGISTRY.register(Box::new(COMMITS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(COMMIT_FAILURES.clone())).ok();
    REGISTRY
        .register(Box::new(GIT_SYNC_FAILURES.clone()))
        .ok();
    REGISTRY
        .register(Box::new(REGISTRY_TAGS_INDEXED.clone()))
        .ok();
    REGISTRY.register(Box::new(REGISTRY_ERRORS.clone())).ok();
    REGISTRY.register(Box::new(CACHE_ENTRIES.clone())).ok();
    REGISTRY
        .register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()))
        .ok();
    REGISTRY.register(Box::new(PAUSES_TOTAL.clone())).ok();

    info!("Metrics registered");
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buffer,
    )
        .into_response()
}
