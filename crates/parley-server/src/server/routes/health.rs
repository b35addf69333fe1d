//! Health endpoint.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::warn;

use crate::server::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    connections: usize,
    participants: Vec<String>,
}

/// GET /health
///
/// Reports the live chat connections and who is on them. Unhealthy when the user
/// directory cannot be queried, since nobody could be admitted.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = match state.db.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!("Health check failed: {}", e);
            false
        }
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            service: "parley-server",
            version: env!("CARGO_PKG_VERSION"),
            connections: state.relay.registry().len(),
            participants: state
                .relay
                .registry()
                .identities()
                .into_iter()
                .map(|identity| identity.as_str().to_string())
                .collect(),
        }),
    )
}
