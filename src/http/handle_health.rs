//! Liveness and readiness endpoints.

use crate::http::context::AppContext;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub service: &'static str,
    pub status: &'static str,
    pub version: String,
}

/// `GET /liveness`
pub async fn handle_liveness(State(context): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "taskrelay",
        status: "up",
        version: context.config.version.clone(),
    })
}

/// `GET /readiness`
pub async fn handle_readiness(State(context): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "taskrelay",
        status: "up",
        version: context.config.version.clone(),
    })
}
