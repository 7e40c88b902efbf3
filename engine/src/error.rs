//! Error types for the Harmony engine.

use crate::CollectionName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// All possible errors from the Harmony engine.
#[derive(Debug, Error)]
pub enum Error {
    // Caller errors
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("record has no usable id")]
    MissingRecordId,

    // Remote errors
    #[error("network error: {0}")]
    Network(String),

    #[error("server responded with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("action '{action}' rejected by server: {reason}")]
    ServerRejection { action: String, reason: String },

    #[error("invalid server response: {0}")]
    Decode(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    // Replication errors
    #[error("sync error in '{collection}': {message}")]
    Sync {
        collection: CollectionName,
        message: String,
    },

    #[error("sync engine is not initialized")]
    NotInitialized,

    // Local persistence errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("persisted state error: {0}")]
    State(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a sync error for one collection.
    pub fn sync(collection: impl Into<CollectionName>, message: impl Into<String>) -> Self {
        Error::Sync {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// True when the failure happened before a server could answer.
    ///
    /// Network failures are the only ones that fall back to offline handling.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// True when the same request may succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// True for a client-error status that refuses the request outright.
    ///
    /// 401, 408 and 429 are excluded: the same request may succeed later.
    pub fn is_explicit_rejection(&self) -> bool {
        match self {
            Error::Http { status, .. } => {
                (400..500).contains(status) && !matches!(status, 401 | 408 | 429)
            }
            Error::ServerRejection { .. } | Error::Validation(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Error::Decode(err.to_string());
        }
        match err.status() {
            Some(status) => Error::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Error::Network(err.to_string()),
        }
    }
}

/// Failures of the local table store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("store is closed")]
    Closed,

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("key '{key}' already exists in table '{table}'")]
    ConstraintViolation { table: String, key: String },

    #[error("failed to persist store: {0}")]
    Persistence(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// Field-level validation errors, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    /// Create an empty error set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message for a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    /// Merge another error set into this one, prefixing its field names.
    pub fn extend_prefixed(&mut self, prefix: &str, other: ValidationErrors) {
        for (field, messages) in other.0 {
            let key = if prefix.is_empty() {
                field
            } else {
                format!("{prefix}.{field}")
            };
            self.0.entry(key).or_default().extend(messages);
        }
    }

    /// Messages recorded for one field.
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
