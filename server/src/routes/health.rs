//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database_version: String,
    pub collections: usize,
    pub harmonics: usize,
    pub connections: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        database_version: state.db.schema().database_version.clone(),
        collections: state.config.collections.len(),
        harmonics: state.db.harmonic_count().await,
        connections: state.conn_manager.connection_count(),
    })
}

async fn root() -> &'static str {
    "Harmony Sync Server"
}
