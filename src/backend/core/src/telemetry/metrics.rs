//! Prometheus metrics for the event store and controllers.
//!
//! Metric handles are always labelled with the emitting component; see
//! [`super::Telemetry`].

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(endpoint: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = endpoint.parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metric_descriptions();

    tracing::info!(endpoint = %addr, "Metrics initialized");
    Ok(())
}

/// Register descriptions for every metric this crate emits.
pub fn register_metric_descriptions() {
    describe_counter!(
        "fes_events_appended_total",
        "Events appended to the event store"
    );
    describe_counter!(
        "fes_events_decode_failures_total",
        "Messages delivered by a watch that could not be decoded"
    );
    describe_counter!(
        "fes_events_fanned_out_total",
        "Decoded events republished to in-process subscribers"
    );
    describe_histogram!(
        "fes_get_duration_seconds",
        Unit::Seconds,
        "Time to read and decode one aggregate's log"
    );
    describe_counter!(
        "controller_evaluations_total",
        "Evaluations admitted past the evaluation cache"
    );
    describe_counter!(
        "controller_evaluations_coalesced_total",
        "Triggers folded into an evaluation already in progress"
    );
    describe_counter!(
        "controller_actions_applied_total",
        "Converged actions applied, by action kind"
    );
    describe_counter!(
        "controller_evaluation_errors_total",
        "Evaluations that failed, including validation and store reads"
    );
    describe_counter!(
        "controller_action_errors_total",
        "Actions whose application returned an error"
    );
    describe_histogram!(
        "controller_convergence_iterations",
        Unit::Count,
        "Refinement steps taken before an action reached its fixed point"
    );
    describe_gauge!(
        "controller_eval_cache_size",
        "Aggregates currently held in the evaluation cache"
    );
    describe_counter!(
        "projection_cache_invalidations_total",
        "Projection cache entries invalidated"
    );
    describe_counter!("errors_total", "Errors constructed, by error code");
}
