//! Prometheus metrics for the healwatch service.
//!
//! The recorder is installed once at startup; `/metrics` renders the
//! current snapshot from the returned handle.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install the global recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and describe every metric the service emits.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a recorder is already installed.
pub fn install() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    register_metrics();
    Ok(handle)
}

/// Register descriptions for all metrics.
pub fn register_metrics() {
    // Event bus
    describe_counter!("event_bus.published", "Events appended and dispatched");
    describe_counter!("event_bus.rejected", "Publishes refused after shutdown");
    describe_counter!(
        "event_bus.persistence_failures",
        "Publishes that failed to append to the event log"
    );
    describe_counter!(
        "event_bus.handler.failures",
        "Handler errors and panics, labelled by handler"
    );
    describe_counter!("event_bus.shutdown", "Event bus shutdowns");

    // Event log
    describe_counter!("event_log.appended", "Rows written to the events table");
    describe_counter!("event_log.append_failures", "Failed event log inserts");
    describe_counter!("event_log.purged", "Events removed by manual deletion");

    // Projections and remediation
    describe_counter!(
        "projection.replayed_events",
        "Events replayed during projection catch-up"
    );
    describe_counter!(
        "remediation.transitions",
        "Controller transitions, labelled by the event published"
    );
    describe_counter!(
        "manual_actions.items",
        "Bulk action items requested, labelled by action"
    );

    // Hub
    describe_gauge!("hub.connections", "Live observer connections");
    describe_counter!(
        "hub.broadcast.evicted",
        "Connections removed after a failed or slow write"
    );
}
