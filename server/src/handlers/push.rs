//! Push handlers - actions and per-collection writes from clients.

use crate::db::{Applied, Refusal};
use crate::error::{AppError, Result};
use crate::AppState;
use axum::http::StatusCode;
use harmony_engine::transport::{ActionSummary, OperationResult};
use harmony_engine::{ActionOperation, ActionPayload, ActionResponse, DeltaOperation, ValidationErrors};
use serde::Serialize;
use serde_json::Value;

/// Response of `GET /actions`.
#[derive(Debug, Serialize)]
pub struct ActionCatalog {
    pub actions: Vec<String>,
}

pub fn handle_catalog(state: &AppState) -> ActionCatalog {
    ActionCatalog {
        actions: state.config.actions.clone(),
    }
}

fn response(success: bool, results: Vec<OperationResult>) -> ActionResponse {
    ActionResponse {
        success,
        summary: ActionSummary::from_results(&results),
        operations: results,
        validation_errors: None,
        message: None,
        queued: false,
    }
}

fn publish(state: &AppState, applied: &Applied) {
    for harmonic in &applied.harmonics {
        state.conn_manager.broadcast_harmonic(harmonic);
    }
}

/// Execute an action: every operation is applied or none is.
pub async fn handle_action(
    state: &AppState,
    name: &str,
    payload: ActionPayload,
) -> Result<(StatusCode, ActionResponse)> {
    if !state.config.actions.is_empty() && !state.config.actions.iter().any(|a| a == name) {
        return Err(AppError::NotFound(format!("action '{name}'")));
    }
    if let Some(op) = payload
        .operations
        .iter()
        .find(|op| !state.db.has_collection(&op.table))
    {
        return Err(AppError::NotFound(format!("collection '{}'", op.table)));
    }

    match state.db.apply_atomically(&payload.operations).await {
        Ok(applied) => {
            tracing::info!(
                action = %name,
                operations = applied.results.len(),
                "Action applied"
            );
            publish(state, &applied);
            Ok((StatusCode::OK, response(true, applied.results)))
        }
        Err(Refusal::Invalid(errors)) => {
            tracing::debug!(action = %name, %errors, "Action failed validation");
            let mut body = response(false, Vec::new());
            body.message = Some("The given data was invalid.".to_string());
            body.validation_errors = Some(errors);
            Ok((StatusCode::UNPROCESSABLE_ENTITY, body))
        }
        Err(Refusal::Failed {
            index,
            reason,
            results,
        }) => {
            tracing::info!(action = %name, index, %reason, "Action refused");
            let mut body = response(false, results);
            body.message = Some(reason);
            Ok((StatusCode::UNPROCESSABLE_ENTITY, body))
        }
    }
}

/// Items of a write request: a single object or `{ "items": [...] }`.
fn write_items(body: Value) -> Vec<Value> {
    match body {
        Value::Object(mut fields) if fields.len() == 1 && fields.contains_key("items") => {
            match fields.remove("items") {
                Some(Value::Array(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            }
        }
        other => vec![other],
    }
}

/// Write one or many records of a collection, each independently.
///
/// 200 when every item applied, 207 when some did, 422 when none did and
/// at least one failed validation, 409 otherwise.
pub async fn handle_write(
    state: &AppState,
    collection: &str,
    action: &str,
    body: Value,
) -> Result<(StatusCode, ActionResponse)> {
    if !state.db.has_collection(collection) {
        return Err(AppError::NotFound(format!("collection '{collection}'")));
    }
    let operation = DeltaOperation::parse(action)
        .ok_or_else(|| AppError::NotFound(format!("write action '{action}'")))?;

    let items = write_items(body);
    if items.is_empty() {
        return Err(AppError::BadRequest("no items to write".to_string()));
    }
    let operations: Vec<ActionOperation> = items
        .into_iter()
        .map(|data| ActionOperation {
            table: collection.to_string(),
            operation,
            data,
        })
        .collect();

    let (applied, errors) = state.db.apply_each(&operations).await;
    publish(state, &applied);

    let succeeded = applied.results.iter().filter(|r| r.success).count();
    let status = write_status(succeeded, applied.results.len(), &errors);
    tracing::info!(
        %collection,
        %action,
        items = applied.results.len(),
        succeeded,
        status = status.as_u16(),
        "Write processed"
    );

    let mut body = response(succeeded == applied.results.len(), applied.results);
    if !errors.is_empty() {
        body.validation_errors = Some(errors);
    }
    Ok((status, body))
}

fn write_status(succeeded: usize, total: usize, errors: &ValidationErrors) -> StatusCode {
    if succeeded == total {
        StatusCode::OK
    } else if succeeded > 0 {
        StatusCode::MULTI_STATUS
    } else if !errors.is_empty() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::CONFLICT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_and_batched_bodies() {
        assert_eq!(write_items(json!({"id": "a"})), vec![json!({"id": "a"})]);
        assert_eq!(
            write_items(json!({"items": [{"id": "a"}, {"id": "b"}]})).len(),
            2
        );
        // A record that merely has an `items` field among others is one item
        assert_eq!(
            write_items(json!({"id": "a", "items": [1, 2]})),
            vec![json!({"id": "a", "items": [1, 2]})]
        );
    }

    #[test]
    fn statuses() {
        let mut errors = ValidationErrors::new();
        assert_eq!(write_status(2, 2, &errors), StatusCode::OK);
        assert_eq!(write_status(1, 2, &errors), StatusCode::MULTI_STATUS);
        assert_eq!(write_status(0, 2, &errors), StatusCode::CONFLICT);
        errors.add("items.0.data", "The data field must be an object.");
        assert_eq!(write_status(0, 2, &errors), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
