//! Change events ("harmonics") from the remote log.
//!
//! The server records every confirmed mutation as a harmonic with an id that
//! sorts in log order. Clients pull them in batches or receive them one at a
//! time through a push channel.

use crate::{delta::DeltaOperation, error::Result, record, CollectionName, Error, RecordId};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;

/// Sortable id of a harmonic.
///
/// Integer ids compare numerically; anything else (ULIDs, padded strings)
/// compares lexicographically. Integer ids are stored without leading zeros
/// so equality agrees with ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HarmonicId(String);

impl HarmonicId {
    pub fn new(id: impl Into<String>) -> Self {
        let raw: String = id.into();
        match raw.parse::<u128>() {
            Ok(n) => HarmonicId(n.to_string()),
            Err(_) => HarmonicId(raw),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u128> {
        self.0.parse().ok()
    }
}

impl From<u64> for HarmonicId {
    fn from(n: u64) -> Self {
        HarmonicId(n.to_string())
    }
}

impl From<&str> for HarmonicId {
    fn from(s: &str) -> Self {
        HarmonicId::new(s)
    }
}

impl Ord for HarmonicId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for HarmonicId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for HarmonicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for HarmonicId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0.parse::<u64>() {
            Ok(n) => serializer.serialize_u64(n),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for HarmonicId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        string_or_number(deserializer).map(HarmonicId::new)
    }
}

/// Accept a JSON string or integer and return its string form.
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// A change event as delivered by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Harmonic {
    pub id: HarmonicId,
    pub table_name: CollectionName,
    /// Record payload, usually a JSON-encoded string
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Raw operation name; unknown names surface as per-event decode errors
    pub operation: String,
    #[serde(deserialize_with = "string_or_number")]
    pub record_id: RecordId,
    #[serde(default)]
    pub rejected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<String>,
}

/// A harmonic whose payload has been decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChange {
    pub operation: DeltaOperation,
    pub record_id: RecordId,
    /// Full record for create/update; `None` for delete
    pub record: Option<serde_json::Value>,
}

impl Harmonic {
    /// Build a harmonic carrying `record` as its JSON-encoded payload.
    pub fn new(
        id: impl Into<HarmonicId>,
        table_name: impl Into<CollectionName>,
        operation: DeltaOperation,
        record_id: impl Into<RecordId>,
        record: Option<&serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            table_name: table_name.into(),
            data: record.map(|r| serde_json::Value::String(r.to_string())),
            operation: operation.as_str().to_string(),
            record_id: record_id.into(),
            rejected: false,
            rejected_reason: None,
        }
    }

    /// Mark this harmonic as a server-side rejection.
    pub fn into_rejected(mut self, reason: impl Into<String>) -> Self {
        self.rejected = true;
        self.rejected_reason = Some(reason.into());
        self
    }

    /// Decode the operation and payload.
    ///
    /// Create and update payloads must decode to a JSON object; a missing
    /// `id` field is filled in from `record_id`.
    pub fn decode(&self) -> Result<DecodedChange> {
        let operation = DeltaOperation::parse(&self.operation).ok_or_else(|| {
            Error::sync(
                &self.table_name,
                format!("harmonic {}: unknown operation '{}'", self.id, self.operation),
            )
        })?;

        if operation == DeltaOperation::Delete {
            return Ok(DecodedChange {
                operation,
                record_id: self.record_id.clone(),
                record: None,
            });
        }

        let mut payload = match &self.data {
            Some(serde_json::Value::String(encoded)) => serde_json::from_str(encoded)
                .map_err(|e| {
                    Error::sync(
                        &self.table_name,
                        format!("harmonic {}: undecodable payload: {e}", self.id),
                    )
                })?,
            Some(value) => value.clone(),
            None => serde_json::Value::Null,
        };

        let Some(fields) = payload.as_object_mut() else {
            return Err(Error::sync(
                &self.table_name,
                format!("harmonic {}: payload is not an object", self.id),
            ));
        };
        if !fields.contains_key(record::ID_FIELD) {
            fields.insert(
                record::ID_FIELD.to_string(),
                serde_json::Value::String(self.record_id.clone()),
            );
        }

        let record_id = record::record_id(&payload).unwrap_or_else(|| self.record_id.clone());
        Ok(DecodedChange {
            operation,
            record_id,
            record: Some(payload),
        })
    }
}
