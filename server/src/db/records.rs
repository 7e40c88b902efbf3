//! Record tables and the single-operation mutation rules.

use harmony_engine::{record, DeltaOperation, RecordId, ValidationErrors};
use serde_json::Value;
use std::collections::BTreeMap;

/// Rows of one collection keyed by id.
pub type Table = BTreeMap<RecordId, Value>;

/// All collection tables keyed by collection name.
pub type Tables = BTreeMap<String, Table>;

/// Why an operation could not be applied.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("record '{0}' already exists")]
    Duplicate(RecordId),

    #[error("record '{0}' not found")]
    NotFound(RecordId),
}

/// Structural checks run before any operation touches a table.
pub fn validate_operation(operation: DeltaOperation, data: &Value) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    if !data.is_object() {
        errors.add("data", "The data field must be an object.");
        return errors;
    }
    if operation != DeltaOperation::Create && record::record_id(data).is_none() {
        errors.add(record::ID_FIELD, "The id field is required.");
    }
    errors
}

/// Apply one validated operation to `tables`.
///
/// Returns the id and the stored record (`None` after a delete). Creates
/// without an id get a fresh UUID; creates and updates are stamped with
/// `updated_at`.
pub fn apply_operation(
    tables: &mut Tables,
    collection: &str,
    operation: DeltaOperation,
    data: &Value,
) -> Result<(RecordId, Option<Value>), OperationError> {
    let table = tables
        .get_mut(collection)
        .ok_or_else(|| OperationError::UnknownCollection(collection.to_string()))?;
    let now = Value::String(chrono::Utc::now().to_rfc3339());

    match operation {
        DeltaOperation::Create => {
            let id = record::record_id(data).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if table.contains_key(&id) {
                return Err(OperationError::Duplicate(id));
            }
            let mut row = data.clone();
            record::merge_into(&mut row, &serde_json::json!({ "id": id, "updated_at": now }));
            table.insert(id.clone(), row.clone());
            Ok((id, Some(row)))
        }
        DeltaOperation::Update => {
            let id = record::record_id(data).unwrap_or_default();
            let row = table
                .get_mut(&id)
                .ok_or_else(|| OperationError::NotFound(id.clone()))?;
            record::merge_into(row, data);
            record::merge_into(row, &serde_json::json!({ "updated_at": now }));
            Ok((id, Some(row.clone())))
        }
        DeltaOperation::Delete => {
            let id = record::record_id(data).unwrap_or_default();
            table
                .remove(&id)
                .ok_or_else(|| OperationError::NotFound(id.clone()))?;
            Ok((id, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tables() -> Tables {
        let mut tables = Tables::new();
        tables.insert("todos".to_string(), Table::new());
        tables
    }

    #[test]
    fn create_update_delete() {
        let mut tables = tables();
        let (id, row) =
            apply_operation(&mut tables, "todos", DeltaOperation::Create, &json!({"id": "a", "title": "x"}))
                .unwrap();
        assert_eq!(id, "a");
        assert!(row.unwrap()["updated_at"].is_string());

        let (_, row) = apply_operation(
            &mut tables,
            "todos",
            DeltaOperation::Update,
            &json!({"id": "a", "done": true}),
        )
        .unwrap();
        let row = row.unwrap();
        assert_eq!(row["title"], "x");
        assert_eq!(row["done"], true);

        let (_, row) =
            apply_operation(&mut tables, "todos", DeltaOperation::Delete, &json!({"id": "a"})).unwrap();
        assert!(row.is_none());
        assert!(tables["todos"].is_empty());
    }

    #[test]
    fn create_without_id_gets_uuid() {
        let mut tables = tables();
        let (id, _) =
            apply_operation(&mut tables, "todos", DeltaOperation::Create, &json!({"title": "x"})).unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn conflicts_are_reported() {
        let mut tables = tables();
        let create = json!({"id": "a"});
        apply_operation(&mut tables, "todos", DeltaOperation::Create, &create).unwrap();
        assert_eq!(
            apply_operation(&mut tables, "todos", DeltaOperation::Create, &create),
            Err(OperationError::Duplicate("a".into()))
        );
        assert_eq!(
            apply_operation(&mut tables, "todos", DeltaOperation::Update, &json!({"id": "b"})),
            Err(OperationError::NotFound("b".into()))
        );
        assert_eq!(
            apply_operation(&mut tables, "posts", DeltaOperation::Create, &create),
            Err(OperationError::UnknownCollection("posts".into()))
        );
    }

    #[test]
    fn structural_validation() {
        assert!(validate_operation(DeltaOperation::Create, &json!({"title": "x"})).is_empty());
        assert!(validate_operation(DeltaOperation::Update, &json!({"title": "x"}))
            .get("id")
            .is_some());
        assert!(validate_operation(DeltaOperation::Delete, &json!("a"))
            .get("data")
            .is_some());
    }
}
