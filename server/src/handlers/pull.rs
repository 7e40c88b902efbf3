//! Pull handler - serves snapshots and harmonics to clients.

use crate::db::Database;
use crate::error::{AppError, Result};
use harmony_engine::transport::{HarmonicsResponse, SnapshotResponse};
use harmony_engine::HarmonicId;
use serde::{Deserialize, Serialize};

/// Query parameters for `GET /sync/{collection}`.
#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    /// Request a full snapshot
    #[serde(default)]
    pub initial: Option<bool>,
    /// Return harmonics after this id
    #[serde(default)]
    pub after: Option<String>,
}

/// Either a snapshot or an incremental batch.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SyncResponse {
    Snapshot(SnapshotResponse),
    Harmonics(HarmonicsResponse),
}

/// Process a pull request.
///
/// `after` wins over `initial`; with neither a snapshot is returned.
pub async fn handle_sync(db: &Database, collection: &str, query: SyncQuery) -> Result<SyncResponse> {
    let not_found = || AppError::NotFound(format!("collection '{collection}'"));

    if let Some(after) = query.after.filter(|a| !a.is_empty()) {
        let response = db
            .harmonics_after(collection, &HarmonicId::new(after))
            .await
            .ok_or_else(not_found)?;
        tracing::debug!(
            %collection,
            harmonics = response.harmonics.len(),
            "Serving harmonics"
        );
        return Ok(SyncResponse::Harmonics(response));
    }

    if query.initial == Some(false) {
        return Err(AppError::BadRequest(
            "either initial=true or after=<id> is required".to_string(),
        ));
    }

    let snapshot = db.snapshot(collection).await.ok_or_else(not_found)?;
    tracing::debug!(%collection, records = snapshot.records.len(), "Serving snapshot");
    Ok(SyncResponse::Snapshot(snapshot))
}
