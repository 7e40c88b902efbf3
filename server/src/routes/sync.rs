//! Sync, action and write routes.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use harmony_engine::{ActionPayload, ActionResponse, RemoteSchema};
use serde_json::Value;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{
    handle_action, handle_catalog, handle_sync, handle_websocket_connection, handle_write,
    ActionCatalog, SyncQuery, SyncResponse,
};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/schema", get(schema_handler))
        .route("/sync/{collection}", get(sync_handler))
        .route("/actions", get(catalog_handler))
        .route("/actions/{name}", post(action_handler))
        .route("/write/{collection}/{action}", post(write_handler))
        .route("/ws", get(ws_handler))
}

/// GET /schema - Collections and versions.
async fn schema_handler(State(state): State<AppState>, _auth: AuthUser) -> Json<RemoteSchema> {
    Json(state.db.schema().clone())
}

/// GET /sync/{collection} - Snapshot or harmonics after a cursor.
async fn sync_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncResponse>> {
    let response = handle_sync(&state.db, &collection, query).await?;
    Ok(Json(response))
}

/// GET /actions - Names of the registered actions.
async fn catalog_handler(State(state): State<AppState>, _auth: AuthUser) -> Json<ActionCatalog> {
    Json(handle_catalog(&state))
}

/// POST /actions/{name} - Execute an action atomically.
async fn action_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(name): Path<String>,
    Json(payload): Json<ActionPayload>,
) -> Result<(StatusCode, Json<ActionResponse>)> {
    let (status, response) = handle_action(&state, &name, payload).await?;
    Ok((status, Json(response)))
}

/// POST /write/{collection}/{action} - Write one record or a batch.
async fn write_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, action)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<ActionResponse>)> {
    let (status, response) = handle_write(&state, &collection, &action, body).await?;
    Ok((status, Json(response)))
}

/// GET /ws - Upgrade to a push connection.
async fn ws_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let conn_manager = state.conn_manager.clone();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, conn_manager, auth.token))
}
