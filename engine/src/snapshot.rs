//! Snapshot types for persisting and restoring the local store.
//!
//! Snapshots are the bridge between the in-memory tables and the file on
//! disk. `BTreeMap`s everywhere keep the serialized form deterministic.

use crate::{
    error::{Result, StorageError},
    store::TableSet,
    CollectionName,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of every table in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    /// Generation the tables were opened at, if any
    pub generation: Option<u32>,
    /// Base, shadow and delta tables per collection
    pub collections: BTreeMap<CollectionName, TableSet>,
}

impl StoreSnapshot {
    pub fn new(generation: Option<u32>, collections: BTreeMap<CollectionName, TableSet>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            generation,
            collections,
        }
    }

    /// Total rows across all base tables.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(|t| t.base.count()).sum()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| StorageError::Persistence(e.to_string()).into())
    }

    /// Deserialize from JSON and rebuild secondary indexes.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut snapshot: Self =
            serde_json::from_str(json).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            ))
            .into());
        }

        for tables in snapshot.collections.values_mut() {
            tables.delta.rebuild_indexes();
        }
        Ok(snapshot)
    }
}
