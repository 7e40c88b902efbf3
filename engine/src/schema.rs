//! Remote schema descriptor and storage generation.
//!
//! The server declares which collections exist and a version pair. When
//! either version changes from what this client saw last, the local store is
//! rebuilt at a new generation number derived from the pair.

use crate::{CollectionName, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound for generation numbers. Generations are always in
/// `1..=MAX_GENERATION`.
pub const MAX_GENERATION: u32 = 1_000_000_000;

/// Column description of one collection, as declared by the server.
///
/// Servers send either an index string (`"++id, title, created_at"`), a list
/// of column names, or an object keyed by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    Indexes(String),
    Columns(Vec<String>),
    Described(BTreeMap<String, serde_json::Value>),
}

impl ColumnSpec {
    /// Plain column names in declaration order.
    pub fn columns(&self) -> Vec<String> {
        match self {
            ColumnSpec::Indexes(spec) => spec
                .split(',')
                .map(|c| c.trim().trim_start_matches(['+', '&', '*']).to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            ColumnSpec::Columns(columns) => columns.clone(),
            ColumnSpec::Described(map) => map.keys().cloned().collect(),
        }
    }
}

/// The `GET schema` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSchema {
    pub schema: BTreeMap<CollectionName, ColumnSpec>,
    pub schema_version: SchemaVersion,
    /// Migration batch and count, e.g. `"12_48"`
    pub database_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

impl RemoteSchema {
    /// Declared collection names, sorted.
    pub fn collections(&self) -> Vec<CollectionName> {
        self.schema.keys().cloned().collect()
    }

    pub fn version_pair(&self) -> VersionPair {
        VersionPair {
            schema_version: self.schema_version,
            database_version: self.database_version.clone(),
        }
    }
}

/// Server-declared schema and database versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionPair {
    pub schema_version: SchemaVersion,
    pub database_version: String,
}

impl VersionPair {
    pub fn new(schema_version: SchemaVersion, database_version: impl Into<String>) -> Self {
        Self {
            schema_version,
            database_version: database_version.into(),
        }
    }

    /// Storage generation for this pair.
    pub fn generation(&self) -> u32 {
        generation_number(&self.database_version, self.schema_version)
    }
}

/// Versions this client has seen before, each possibly unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownVersions {
    pub schema_version: Option<SchemaVersion>,
    pub database_version: Option<String>,
}

impl KnownVersions {
    /// Decide whether moving to `current` requires a rebuild.
    ///
    /// Only a change from a previously seen value counts; a first sighting
    /// never triggers a rebuild. Schema changes are reported first.
    pub fn rebuild_reason(&self, current: &VersionPair) -> Option<RebuildReason> {
        if let Some(previous) = self.schema_version {
            if previous != current.schema_version {
                return Some(RebuildReason::Schema {
                    from: previous,
                    to: current.schema_version,
                });
            }
        }
        if let Some(previous) = &self.database_version {
            if *previous != current.database_version {
                return Some(RebuildReason::Database {
                    from: previous.clone(),
                    to: current.database_version.clone(),
                });
            }
        }
        None
    }
}

/// Why the local store is being rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RebuildReason {
    Schema { from: SchemaVersion, to: SchemaVersion },
    Database { from: String, to: String },
}

impl std::fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebuildReason::Schema { from, to } => write!(f, "schema version {from} -> {to}"),
            RebuildReason::Database { from, to } => {
                write!(f, "database version {from} -> {to}")
            }
        }
    }
}

/// 32-bit wrapping `h = h * 31 + byte` string hash.
fn string_hash(input: &str) -> i32 {
    input
        .bytes()
        .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(i32::from(b)))
}

fn bound(hash: i32) -> u32 {
    hash.unsigned_abs() % MAX_GENERATION + 1
}

/// Generation number for a version pair.
pub fn generation_number(database_version: &str, schema_version: SchemaVersion) -> u32 {
    bound(string_hash(&format!("{database_version}:{schema_version}")))
}

/// Stable generation number derived from collection specs alone.
///
/// `BTreeMap` ordering keeps the input canonical regardless of how the specs
/// were assembled.
pub fn schema_fingerprint(specs: &BTreeMap<CollectionName, ColumnSpec>) -> u32 {
    let canonical: Vec<String> = specs
        .iter()
        .map(|(name, spec)| format!("{name}({})", spec.columns().join(",")))
        .collect();
    bound(string_hash(&canonical.join(";")))
}
