//! Axum Handlers for plain HTTP routes.

use axum::response::Json;
use serde::Serialize;

#[derive(Serialize, Debug, PartialEq)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
