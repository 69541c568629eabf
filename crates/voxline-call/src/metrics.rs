//! Prometheus metrics recording.
//!
//! The `record_*` helpers are no-ops until a recorder is installed.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use voxline_core::error::{Result, VoxlineError};
use voxline_core::types::{CallDirection, SessionEvent};

use crate::types::DisconnectCause;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| VoxlineError::Other(anyhow::anyhow!("failed to install metrics recorder: {e}")))
}

/// A call was created.
pub fn record_call_start(direction: CallDirection) {
    let labels = [("direction", direction.to_string())];
    metrics::counter!("calls_total", &labels).increment(1);
    metrics::gauge!("calls_active").increment(1.0);
}

/// A call reached Disconnected.
pub fn record_call_end(cause: &DisconnectCause, duration_secs: f64) {
    let labels = [("cause", cause.label().to_string())];
    metrics::gauge!("calls_active").decrement(1.0);
    metrics::counter!("calls_ended_total", &labels).increment(1);
    metrics::histogram!("call_duration_seconds").record(duration_secs);
}

/// A session event reached the orchestrator.
pub fn record_session_event(event: &SessionEvent) {
    let labels = [("kind", event.kind().to_string())];
    metrics::counter!("session_events_total", &labels).increment(1);
    if event.is_error() {
        record_error(event.kind());
    }
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

/// A call was refused by screening.
pub fn record_call_blocked() {
    metrics::counter!("calls_blocked_total").increment(1);
}
