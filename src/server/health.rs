use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::{error, info};

use crate::utils::error::GeminiError;

/// Server health metrics, registered in a dedicated Prometheus registry.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Number of sessions currently open.
    pub connections: IntGauge,
    /// Requests dispatched to the handler.
    pub requests_total: IntCounter,
    /// Connections dropped by the rate limiter or refused by the gatekeeper.
    pub rejected_connections_total: IntCounter,
    /// Connections that ended before a request could be dispatched.
    pub failed_requests_total: IntCounter,
    /// TLS handshakes that failed or timed out.
    pub handshake_failures_total: IntCounter,
    /// Handler failures and panics.
    pub response_errors_total: IntCounter,
    registry: Registry,
}

impl HealthMetrics {
    /// Creates the metrics and registers them.
    ///
    /// # Errors
    /// Fails only if a metric is malformed or registered twice.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Active connections")?;
        let requests_total = IntCounter::new("requests_total", "Requests dispatched to the handler")?;
        let rejected_connections_total =
            IntCounter::new("rejected_connections_total", "Connections refused before a request")?;
        let failed_requests_total =
            IntCounter::new("failed_requests_total", "Connections without a valid request")?;
        let handshake_failures_total =
            IntCounter::new("handshake_failures_total", "Failed TLS handshakes")?;
        let response_errors_total =
            IntCounter::new("response_errors_total", "Handler failures and panics")?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(rejected_connections_total.clone()))?;
        registry.register(Box::new(failed_requests_total.clone()))?;
        registry.register(Box::new(handshake_failures_total.clone()))?;
        registry.register(Box::new(response_errors_total.clone()))?;

        Ok(Self {
            connections,
            requests_total,
            rejected_connections_total,
            failed_requests_total,
            handshake_failures_total,
            response_errors_total,
            registry,
        })
    }

    /// Encodes every registered metric in the Prometheus text format.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn expose_metrics(&self) -> Result<String, GeminiError> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| GeminiError::ConfigurationError(format!("Metrics are not UTF-8: {e}")))
    }
}

/// Serves `/metrics` over plain HTTP on the given port until the process exits.
///
/// # Arguments
/// * `metrics` - The metrics shared with the Gemini server.
/// * `port` - Port to listen on, on all interfaces.
pub async fn serve_metrics_http(metrics: HealthMetrics, port: u16) -> Result<(), GeminiError> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Metrics available on http://{}/metrics", addr);

    axum::Server::try_bind(&addr)
        .map_err(|e| GeminiError::ConfigurationError(format!("Metrics bind error: {e}")))?
        .serve(app.into_make_service())
        .await
        .map_err(|e| GeminiError::ConfigurationError(format!("Metrics server error: {e}")))
}

async fn metrics_handler(State(metrics): State<HealthMetrics>) -> impl IntoResponse {
    match metrics.expose_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
