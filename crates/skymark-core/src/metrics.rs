//! Prometheus metrics helpers for the listener.
//!
//! Centralizes recorder installation, the `/metrics` HTTP endpoint and the
//! descriptions of every metric the pipeline emits.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skymark_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics()?;
//! start_metrics_server(9090, handle).await?;
//!
//! metrics::counter!("listener_frames_received_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: stage name (`listener_`, `worker_`, `firehose_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only small closed sets (`reason`, `classification`, `queue`, `result`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_listener_metrics();
    Ok(handle)
}

/// Serve `/metrics` on `0.0.0.0:<port>`.
///
/// Binds before returning so a port conflict is reported to the caller; the
/// server itself runs as a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_listener_metrics() {
    // =========================================================================
    // Dispatcher
    // =========================================================================

    describe_counter!(
        "listener_frames_received_total",
        "Frames received from the stream source"
    );
    describe_gauge!(
        "listener_events_per_second",
        "Frame rate over the last measurement window"
    );
    describe_gauge!(
        "listener_queue_depth",
        "Frames waiting in the work queue"
    );
    describe_gauge!(
        "listener_cursor",
        "Last stream sequence number recorded as a resume point"
    );
    describe_gauge!(
        "listener_running",
        "Whether the listener is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Membership
    // =========================================================================

    describe_gauge!(
        "listener_membership_size",
        "Number of accounts in the current membership snapshot"
    );
    describe_counter!(
        "listener_membership_refresh_total",
        "Membership refresh attempts (label: result)"
    );

    // =========================================================================
    // Workers
    // =========================================================================

    describe_counter!(
        "worker_frames_processed_total",
        "Frames taken off the queue and processed"
    );
    describe_counter!(
        "worker_decode_errors_total",
        "Frames or records that failed to decode"
    );
    describe_counter!(
        "worker_commits_skipped_total",
        "Commits or operations skipped (label: reason)"
    );
    describe_counter!(
        "worker_posts_classified_total",
        "Posts classified (label: classification)"
    );
    describe_counter!(
        "worker_published_total",
        "Descriptors published (label: queue)"
    );
    describe_counter!(
        "worker_publish_errors_total",
        "Descriptor publish failures (label: queue)"
    );
    describe_counter!(
        "worker_panics_total",
        "Frames whose processing panicked"
    );
    describe_histogram!(
        "worker_commit_lag_seconds",
        "Delay between commit time and processing"
    );

    // =========================================================================
    // Source
    // =========================================================================

    describe_counter!(
        "firehose_reconnects_total",
        "Reconnections to the firehose after a dropped connection"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter carrying a single label.
#[inline]
pub fn increment_labeled(name: &'static str, label: &'static str, value: &'static str) {
    metrics::counter!(name, label => value).increment(1);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

/// Record a histogram observation.
#[inline]
pub fn observe(name: &'static str, value: f64) {
    metrics::histogram!(name).record(value);
}
