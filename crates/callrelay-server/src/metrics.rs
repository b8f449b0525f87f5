//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup; a second install fails.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrade requests refused before the handshake (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Inbound events decoded (counter, labels: event).
pub const RELAY_MESSAGES_TOTAL: &str = "relay_messages_total";
/// Inbound frames dropped without dispatch (counter, labels: reason).
pub const RELAY_MESSAGES_DROPPED_TOTAL: &str = "relay_messages_dropped_total";
/// Frames enqueued to a recipient (counter).
pub const RELAY_DELIVERIES_TOTAL: &str = "relay_deliveries_total";
/// Frames a recipient's queue refused (counter).
pub const RELAY_DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
/// Events addressed to an identity with no connections (counter).
pub const RELAY_ROUTING_MISSES_TOTAL: &str = "relay_routing_misses_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(RELAY_ROUTING_MISSES_TOTAL).increment(2);
        });
        let output = render(&handle);
        assert!(output.contains("relay_routing_misses_total 2"));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_REJECTED_TOTAL,
            RELAY_MESSAGES_TOTAL,
            RELAY_MESSAGES_DROPPED_TOTAL,
            RELAY_DELIVERIES_TOTAL,
            RELAY_DELIVERY_FAILURES_TOTAL,
            RELAY_ROUTING_MISSES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
