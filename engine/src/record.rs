//! Helpers for working with records.
//!
//! A record is any JSON object carrying an `id` field. The id may arrive as a
//! string or an integer; tables key records by its string form.

use crate::{error::Result, Error, RecordId};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Name of the primary key field in every record.
pub const ID_FIELD: &str = "id";

/// Extract the normalized id of a record.
pub fn record_id(record: &Value) -> Option<RecordId> {
    match record.get(ID_FIELD)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the id of a record, failing when it is absent.
pub fn require_id(record: &Value) -> Result<RecordId> {
    record_id(record).ok_or(Error::MissingRecordId)
}

/// Shallow-merge the fields of `patch` into `target`.
///
/// Non-object targets are replaced by an empty object first, so the result
/// is always an object when `patch` is one.
pub fn merge_into(target: &mut Value, patch: &Value) {
    let Some(fields) = patch.as_object() else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(obj) = target {
        for (key, value) in fields {
            obj.insert(key.clone(), value.clone());
        }
    }
}

/// Total order over JSON values used when sorting records by a field.
///
/// Numbers compare numerically and strings lexicographically. Values of
/// different kinds order as null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_normalization() {
        assert_eq!(record_id(&json!({"id": "abc"})), Some("abc".into()));
        assert_eq!(record_id(&json!({"id": 42})), Some("42".into()));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"name": "x"})), None);
        assert!(matches!(
            require_id(&json!({"id": null})),
            Err(Error::MissingRecordId)
        ));
    }

    #[test]
    fn merge_overwrites_and_keeps() {
        let mut base = json!({"id": 1, "name": "A", "done": false});
        merge_into(&mut base, &json!({"done": true, "tag": "x"}));
        assert_eq!(base, json!({"id": 1, "name": "A", "done": true, "tag": "x"}));

        let mut empty = Value::Null;
        merge_into(&mut empty, &json!({"id": 2}));
        assert_eq!(empty, json!({"id": 2}));
    }

    #[test]
    fn value_ordering() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!("1"), &json!(1)), Ordering::Greater);
    }
}
