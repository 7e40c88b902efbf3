//! The shared database handle.

use super::{apply_operation, validate_operation, HarmonicLog, Table, Tables};
use crate::config::Config;
use harmony_engine::{
    transport::{HarmonicsResponse, OperationResult, SnapshotResponse},
    ActionOperation, ColumnSpec, Harmonic, HarmonicId, RemoteSchema, ValidationErrors,
};
use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
    log: HarmonicLog,
}

/// Operations that were applied, with the harmonics they produced.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    pub results: Vec<OperationResult>,
    pub harmonics: Vec<Harmonic>,
}

/// Why an atomic batch was not applied.
#[derive(Debug, Clone)]
pub enum Refusal {
    /// Field errors keyed `operations.{index}.{field}`
    Invalid(ValidationErrors),
    /// Operation `index` failed; nothing was committed
    Failed {
        index: usize,
        reason: String,
        results: Vec<OperationResult>,
    },
}

/// In-memory database shared by all handlers.
#[derive(Debug)]
pub struct Database {
    inner: RwLock<Inner>,
    schema: RemoteSchema,
}

impl Database {
    /// Create empty tables for every configured collection.
    pub fn new(config: &Config) -> Self {
        let tables = config
            .collections
            .iter()
            .map(|c| (c.clone(), Table::new()))
            .collect();
        let schema = RemoteSchema {
            schema: config
                .collections
                .iter()
                .map(|c| (c.clone(), ColumnSpec::Indexes("++id, updated_at".to_string())))
                .collect(),
            schema_version: config.schema_version,
            database_version: config.database_version(),
            generated_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        Self {
            inner: RwLock::new(Inner {
                tables,
                log: HarmonicLog::new(),
            }),
            schema,
        }
    }

    pub fn schema(&self) -> &RemoteSchema {
        &self.schema
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        self.schema.schema.contains_key(collection)
    }

    /// Every record of a collection with the log position it reflects.
    pub async fn snapshot(&self, collection: &str) -> Option<SnapshotResponse> {
        let inner = self.inner.read().await;
        let table = inner.tables.get(collection)?;
        Some(SnapshotResponse {
            records: table.values().cloned().collect(),
            latest_harmonic_id: inner.log.latest(),
        })
    }

    /// Harmonics of a collection after `after`.
    pub async fn harmonics_after(
        &self,
        collection: &str,
        after: &HarmonicId,
    ) -> Option<HarmonicsResponse> {
        if !self.has_collection(collection) {
            return None;
        }
        let inner = self.inner.read().await;
        let harmonics = inner.log.after(collection, after);
        let latest_harmonic_id = harmonics.last().map(|h| h.id.clone());
        Some(HarmonicsResponse {
            harmonics,
            latest_harmonic_id,
        })
    }

    /// Apply every operation or none.
    pub async fn apply_atomically(
        &self,
        operations: &[ActionOperation],
    ) -> Result<Applied, Refusal> {
        let mut errors = ValidationErrors::new();
        for (index, op) in operations.iter().enumerate() {
            errors.extend_prefixed(
                &format!("operations.{index}"),
                validate_operation(op.operation, &op.data),
            );
        }
        if !errors.is_empty() {
            return Err(Refusal::Invalid(errors));
        }

        let mut inner = self.inner.write().await;
        let mut staged = inner.tables.clone();
        let mut changes = Vec::with_capacity(operations.len());
        let mut results = Vec::with_capacity(operations.len());

        for (index, op) in operations.iter().enumerate() {
            match apply_operation(&mut staged, &op.table, op.operation, &op.data) {
                Ok((id, row)) => {
                    results.push(result(index, op, row.clone().unwrap_or_else(|| op.data.clone()), None));
                    changes.push((op, id, row));
                }
                Err(e) => {
                    results.push(result(index, op, op.data.clone(), Some(e.to_string())));
                    return Err(Refusal::Failed {
                        index,
                        reason: e.to_string(),
                        results,
                    });
                }
            }
        }

        inner.tables = staged;
        let harmonics = changes
            .into_iter()
            .map(|(op, id, row)| inner.log.append(&op.table, op.operation, id, row.as_ref()))
            .collect();
        Ok(Applied { results, harmonics })
    }

    /// Apply operations independently; failures do not affect the others.
    ///
    /// Validation failures are returned keyed `items.{index}.{field}`.
    pub async fn apply_each(&self, operations: &[ActionOperation]) -> (Applied, ValidationErrors) {
        let mut inner = self.inner.write().await;
        let Inner { tables, log } = &mut *inner;
        let mut applied = Applied::default();
        let mut errors = ValidationErrors::new();

        for (index, op) in operations.iter().enumerate() {
            let invalid = validate_operation(op.operation, &op.data);
            if !invalid.is_empty() {
                let message = invalid.to_string();
                errors.extend_prefixed(&format!("items.{index}"), invalid);
                applied
                    .results
                    .push(result(index, op, op.data.clone(), Some(message)));
                continue;
            }
            match apply_operation(tables, &op.table, op.operation, &op.data) {
                Ok((id, row)) => {
                    applied
                        .harmonics
                        .push(log.append(&op.table, op.operation, id, row.as_ref()));
                    applied.results.push(result(
                        index,
                        op,
                        row.unwrap_or_else(|| op.data.clone()),
                        None,
                    ));
                }
                Err(e) => {
                    applied
                        .results
                        .push(result(index, op, op.data.clone(), Some(e.to_string())));
                }
            }
        }
        (applied, errors)
    }

    /// Length of the harmonic log.
    pub async fn harmonic_count(&self) -> usize {
        self.inner.read().await.log.len()
    }

    /// Number of rows in a collection.
    pub async fn count(&self, collection: &str) -> Option<usize> {
        self.inner
            .read()
            .await
            .tables
            .get(collection)
            .map(Table::len)
    }
}

fn result(index: usize, op: &ActionOperation, data: Value, error: Option<String>) -> OperationResult {
    OperationResult {
        success: error.is_none(),
        index,
        operation: op.operation.as_str().to_string(),
        data,
        error,
    }
}
