//! Liveness and database reachability

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: &'static str,
}

/// `GET /health`. 503 when the database cannot be reached.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.pool {
        Some(pool) if xainik_shared::ping(pool).await => "connected",
        Some(_) => "unreachable",
        None => "not_configured",
    };

    let (status_code, status) = if database == "unreachable" {
        tracing::warn!("Health check: database unreachable");
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        status_code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database,
        }),
    )
}
