//! LocalStore - the embedded, versioned table store.
//!
//! Every collection is backed by three physical tables:
//!
//! - `<collection>`: server-confirmed records (base)
//! - `<collection>_shadow`: optimistic record versions
//! - `<collection>_delta`: the write log of attempted local mutations
//!
//! The store is opened at a generation number. Reopening at the same
//! generation is a no-op; a new generation reopens against the newly declared
//! collection set. Mutations are transactional: a failed transaction leaves
//! every table it touched unchanged. Each committed mutation bumps the
//! revision of the affected collections so live queries can recompute.

use crate::{
    delta::{DeltaEntry, DeltaOperation, LocalId, SyncStatus},
    error::{Result, StorageError},
    record,
    snapshot::StoreSnapshot,
    state::write_atomically,
    CollectionName, Error, RecordId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// Suffix of shadow table names.
pub const SHADOW_SUFFIX: &str = "_shadow";
/// Suffix of delta table names.
pub const DELTA_SUFFIX: &str = "_delta";

/// The three physical tables of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Base,
    Shadow,
    Delta,
}

impl TableKind {
    /// Physical table name for a collection.
    pub fn table_name(&self, collection: &str) -> String {
        match self {
            TableKind::Base => collection.to_string(),
            TableKind::Shadow => format!("{collection}{SHADOW_SUFFIX}"),
            TableKind::Delta => format!("{collection}{DELTA_SUFFIX}"),
        }
    }
}

/// Records keyed by normalized id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRows {
    #[serde(default)]
    name: String,
    rows: BTreeMap<RecordId, Value>,
}

impl RecordRows {
    fn named(name: String) -> Self {
        Self {
            name,
            rows: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// Insert or replace a record.
    pub fn put(&mut self, record: Value) -> Result<RecordId> {
        let id = record::require_id(&record)?;
        self.rows.insert(id.clone(), record);
        Ok(id)
    }

    /// Insert a record, failing if its id is taken.
    pub fn add(&mut self, record: Value) -> Result<RecordId> {
        let id = record::require_id(&record)?;
        if self.rows.contains_key(&id) {
            return Err(StorageError::ConstraintViolation {
                table: self.name.clone(),
                key: id,
            }
            .into());
        }
        self.rows.insert(id.clone(), record);
        Ok(id)
    }

    /// Upsert many records. Every record is checked for an id before any
    /// row is written.
    pub fn bulk_put(&mut self, records: Vec<Value>) -> Result<usize> {
        let keyed = records
            .into_iter()
            .map(|r| record::require_id(&r).map(|id| (id, r)))
            .collect::<Result<Vec<_>>>()?;
        let count = keyed.len();
        self.rows.extend(keyed);
        Ok(count)
    }

    /// Insert many records, failing without writes if any id is taken or
    /// repeated.
    pub fn bulk_add(&mut self, records: Vec<Value>) -> Result<usize> {
        let mut seen = BTreeSet::new();
        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let id = record::require_id(&record)?;
            if self.rows.contains_key(&id) || !seen.insert(id.clone()) {
                return Err(StorageError::ConstraintViolation {
                    table: self.name.clone(),
                    key: id,
                }
                .into());
            }
            keyed.push((id, record));
        }
        let count = keyed.len();
        self.rows.extend(keyed);
        Ok(count)
    }

    pub fn delete(&mut self, id: &str) -> Option<Value> {
        self.rows.remove(id)
    }

    /// Delete many records, returning how many existed.
    pub fn bulk_delete<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter(|id| self.rows.remove(id.as_ref()).is_some())
            .count()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All records in key order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.rows.values()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.rows.values().cloned().collect()
    }
}

/// The write log of one collection, with compound indexes on
/// `(operation, sync_status)` and `(action_name, sync_status)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRows {
    rows: BTreeMap<LocalId, DeltaEntry>,
    next_id: LocalId,
    #[serde(skip)]
    by_operation: BTreeMap<(DeltaOperation, SyncStatus), BTreeSet<LocalId>>,
    #[serde(skip)]
    by_action: BTreeMap<(String, SyncStatus), BTreeSet<LocalId>>,
}

impl DeltaRows {
    /// Append an entry and return its assigned local id.
    pub fn add(&mut self, mut entry: DeltaEntry) -> LocalId {
        self.next_id += 1;
        entry.local_id = self.next_id;
        self.index(&entry);
        self.rows.insert(entry.local_id, entry);
        self.next_id
    }

    pub fn get(&self, local_id: LocalId) -> Option<&DeltaEntry> {
        self.rows.get(&local_id)
    }

    /// Move an entry to a new status.
    ///
    /// Returns `false` (and changes nothing) if the entry does not exist or
    /// its current status does not allow the transition.
    pub fn set_status(
        &mut self,
        local_id: LocalId,
        status: SyncStatus,
        reason: Option<String>,
    ) -> bool {
        let Some(current) = self.rows.get(&local_id) else {
            return false;
        };
        if !current.sync_status.can_transition_to(status) {
            return false;
        }
        let Some(mut entry) = self.rows.remove(&local_id) else {
            return false;
        };
        self.unindex(&entry);
        entry.sync_status = status;
        if reason.is_some() {
            entry.rejected_reason = reason;
        }
        self.index(&entry);
        self.rows.insert(local_id, entry);
        true
    }

    pub fn delete(&mut self, local_id: LocalId) -> Option<DeltaEntry> {
        let entry = self.rows.remove(&local_id)?;
        self.unindex(&entry);
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.by_operation.clear();
        self.by_action.clear();
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }

    /// All entries in append order.
    pub fn entries(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.rows.values()
    }

    /// Entries matching `(operation, status)`, in append order.
    pub fn where_operation(&self, operation: DeltaOperation, status: SyncStatus) -> Vec<&DeltaEntry> {
        self.lookup(self.by_operation.get(&(operation, status)))
    }

    /// Entries matching `(action_name, status)`, in append order.
    pub fn where_action(&self, action_name: &str, status: SyncStatus) -> Vec<&DeltaEntry> {
        self.lookup(self.by_action.get(&(action_name.to_string(), status)))
    }

    /// Ids of records with a pending delete.
    pub fn pending_delete_ids(&self) -> BTreeSet<RecordId> {
        self.where_operation(DeltaOperation::Delete, SyncStatus::Pending)
            .into_iter()
            .filter_map(DeltaEntry::record_id)
            .collect()
    }

    /// Whether any pending or failed entry targets `record_id`.
    pub fn has_unresolved_for(&self, record_id: &str) -> bool {
        self.rows.values().any(|e| {
            e.sync_status.is_unresolved() && e.record_id().as_deref() == Some(record_id)
        })
    }

    pub(crate) fn rebuild_indexes(&mut self) {
        self.by_operation.clear();
        self.by_action.clear();
        let entries: Vec<DeltaEntry> = self.rows.values().cloned().collect();
        for entry in &entries {
            self.index(entry);
        }
        if let Some(max) = self.rows.keys().next_back() {
            self.next_id = self.next_id.max(*max);
        }
    }

    fn lookup(&self, ids: Option<&BTreeSet<LocalId>>) -> Vec<&DeltaEntry> {
        ids.map(|ids| ids.iter().filter_map(|id| self.rows.get(id)).collect())
            .unwrap_or_default()
    }

    fn index(&mut self, entry: &DeltaEntry) {
        self.by_operation
            .entry((entry.operation, entry.sync_status))
            .or_default()
            .insert(entry.local_id);
        if let Some(name) = &entry.action_name {
            self.by_action
                .entry((name.clone(), entry.sync_status))
                .or_default()
                .insert(entry.local_id);
        }
    }

    fn unindex(&mut self, entry: &DeltaEntry) {
        if let Some(ids) = self.by_operation.get_mut(&(entry.operation, entry.sync_status)) {
            ids.remove(&entry.local_id);
        }
        if let Some(name) = &entry.action_name {
            if let Some(ids) = self.by_action.get_mut(&(name.clone(), entry.sync_status)) {
                ids.remove(&entry.local_id);
            }
        }
    }
}

/// Base, shadow and delta tables of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSet {
    pub base: RecordRows,
    pub shadow: RecordRows,
    pub delta: DeltaRows,
}

impl TableSet {
    pub fn new(collection: &str) -> Self {
        Self {
            base: RecordRows::named(TableKind::Base.table_name(collection)),
            shadow: RecordRows::named(TableKind::Shadow.table_name(collection)),
            delta: DeltaRows::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    open: bool,
    generation: Option<u32>,
    collections: BTreeMap<CollectionName, TableSet>,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::Closed.into())
        }
    }
}

/// A set of mutations applied atomically.
///
/// Collections are backed up on first mutable access; if the transaction
/// closure fails, every touched collection is restored.
pub struct Transaction<'a> {
    inner: &'a mut Inner,
    backups: BTreeMap<CollectionName, TableSet>,
}

impl<'a> Transaction<'a> {
    /// Mutable access to a collection's tables.
    pub fn tables(&mut self, collection: &str) -> Result<&mut TableSet> {
        if !self.inner.collections.contains_key(collection) {
            return Err(Error::CollectionNotFound(collection.to_string()));
        }
        if !self.backups.contains_key(collection) {
            let current = self.inner.collections[collection].clone();
            self.backups.insert(collection.to_string(), current);
        }
        self.inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    /// Read-only access that does not count as a touch.
    pub fn peek(&self, collection: &str) -> Result<&TableSet> {
        self.inner
            .collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    pub fn base(&mut self, collection: &str) -> Result<&mut RecordRows> {
        Ok(&mut self.tables(collection)?.base)
    }

    pub fn shadow(&mut self, collection: &str) -> Result<&mut RecordRows> {
        Ok(&mut self.tables(collection)?.shadow)
    }

    pub fn delta(&mut self, collection: &str) -> Result<&mut DeltaRows> {
        Ok(&mut self.tables(collection)?.delta)
    }

    /// Names of every collection in the store.
    pub fn collections(&self) -> Vec<CollectionName> {
        self.inner.collections.keys().cloned().collect()
    }
}

/// The embedded table store.
#[derive(Debug)]
pub struct LocalStore {
    inner: RwLock<Inner>,
    path: Option<PathBuf>,
    revisions: Mutex<HashMap<CollectionName, watch::Sender<u64>>>,
}

impl LocalStore {
    /// Create a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            path: None,
            revisions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store persisted to a snapshot file at `path`.
    ///
    /// Existing contents are loaded but the store stays closed until
    /// [`LocalStore::initialize_schema`] opens it.
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut inner = Inner::default();
        match std::fs::read_to_string(&path) {
            Ok(json) => {
                let snapshot = StoreSnapshot::from_json(&json)?;
                inner.generation = snapshot.generation;
                inner.collections = snapshot.collections;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Persistence(e.to_string()).into()),
        }
        Ok(Self {
            inner: RwLock::new(inner),
            path: Some(path),
            revisions: Mutex::new(HashMap::new()),
        })
    }

    /// Snapshot file backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Open the store at `generation` with tables for `collections`.
    ///
    /// Same generation: reopen, creating tables only for collections that
    /// are missing. New generation: collections no longer declared are
    /// dropped, new ones are created, surviving ones keep their rows.
    pub fn initialize_schema(&self, collections: &[CollectionName], generation: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let upgrade = inner.generation.is_some_and(|g| g != generation);

        if upgrade {
            tracing::info!(
                from = ?inner.generation,
                to = generation,
                "Reopening local store at new generation"
            );
            inner.open = false;
            inner
                .collections
                .retain(|name, _| collections.iter().any(|c| c == name));
        }

        for name in collections {
            inner
                .collections
                .entry(name.clone())
                .or_insert_with(|| TableSet::new(name));
        }
        inner.generation = Some(generation);
        inner.open = true;

        self.persist(&inner)?;
        let touched: Vec<_> = inner.collections.keys().cloned().collect();
        drop(inner);
        self.bump(&touched);
        Ok(())
    }

    /// Close the store. Rows are kept; operations fail until reopened.
    pub fn close(&self) {
        self.inner.write().open = false;
    }

    /// Drop every table and the backing file. The store is left closed with
    /// no generation.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let touched: Vec<_> = inner.collections.keys().cloned().collect();
        inner.open = false;
        inner.generation = None;
        inner.collections.clear();

        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Persistence(e.to_string()).into()),
            }
        }
        drop(inner);
        self.bump(&touched);
        tracing::info!("Local store destroyed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().open
    }

    pub fn generation(&self) -> Option<u32> {
        self.inner.read().generation
    }

    /// Declared collection names.
    pub fn collections(&self) -> Vec<CollectionName> {
        self.inner.read().collections.keys().cloned().collect()
    }

    /// Run `f` against an open store as one atomic unit.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;

        let mut tx = Transaction {
            inner: &mut inner,
            backups: BTreeMap::new(),
        };
        let outcome = f(&mut tx);
        let backups = std::mem::take(&mut tx.backups);

        match outcome {
            Ok(value) => {
                if backups.is_empty() {
                    return Ok(value);
                }
                if let Err(e) = self.persist(&inner) {
                    for (name, tables) in backups {
                        inner.collections.insert(name, tables);
                    }
                    return Err(e);
                }
                drop(inner);
                let touched: Vec<_> = backups.into_keys().collect();
                self.bump(&touched);
                Ok(value)
            }
            Err(e) => {
                for (name, tables) in backups {
                    inner.collections.insert(name, tables);
                }
                Err(e)
            }
        }
    }

    /// Run `f` with read access to one collection's tables.
    pub fn read<R>(&self, collection: &str, f: impl FnOnce(&TableSet) -> R) -> Result<R> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        let tables = inner
            .collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(f(tables))
    }

    /// Handle to a base or shadow table by physical name.
    pub fn table(&self, name: &str) -> Result<RecordTable<'_>> {
        let (collection, kind) = self.resolve(name)?;
        match kind {
            TableKind::Delta => Err(StorageError::UnknownTable(name.to_string()).into()),
            kind => Ok(RecordTable {
                store: self,
                collection,
                kind,
            }),
        }
    }

    pub fn base(&self, collection: &str) -> Result<RecordTable<'_>> {
        self.table(&TableKind::Base.table_name(collection))
    }

    pub fn shadow(&self, collection: &str) -> Result<RecordTable<'_>> {
        self.table(&TableKind::Shadow.table_name(collection))
    }

    /// Handle to a collection's delta table.
    pub fn delta(&self, collection: &str) -> Result<DeltaTable<'_>> {
        let (collection, kind) = self.resolve(&TableKind::Delta.table_name(collection))?;
        debug_assert_eq!(kind, TableKind::Delta);
        Ok(DeltaTable {
            store: self,
            collection,
        })
    }

    /// Subscribe to the revision counter of a collection.
    ///
    /// The value changes on every committed mutation of the collection's
    /// base, shadow or delta table, and on reopen or destroy.
    pub fn subscribe(&self, collection: &str) -> watch::Receiver<u64> {
        self.revisions
            .lock()
            .entry(collection.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Export all tables as a snapshot.
    pub fn export_state(&self) -> StoreSnapshot {
        let inner = self.inner.read();
        StoreSnapshot::new(inner.generation, inner.collections.clone())
    }

    fn resolve(&self, name: &str) -> Result<(CollectionName, TableKind)> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        if inner.collections.contains_key(name) {
            return Ok((name.to_string(), TableKind::Base));
        }
        for (suffix, kind) in [
            (SHADOW_SUFFIX, TableKind::Shadow),
            (DELTA_SUFFIX, TableKind::Delta),
        ] {
            if let Some(collection) = name.strip_suffix(suffix) {
                if inner.collections.contains_key(collection) {
                    return Ok((collection.to_string(), kind));
                }
            }
        }
        Err(StorageError::UnknownTable(name.to_string()).into())
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = StoreSnapshot::new(inner.generation, inner.collections.clone());
        let json = snapshot.to_json()?;
        write_atomically(path, json.as_bytes())
            .map_err(|e| StorageError::Persistence(e.to_string()).into())
    }

    fn bump(&self, collections: &[CollectionName]) {
        let revisions = self.revisions.lock();
        for name in collections {
            if let Some(sender) = revisions.get(name) {
                sender.send_modify(|rev| *rev += 1);
            }
        }
    }
}

/// Handle to a base or shadow table.
///
/// Every call is its own transaction.
#[derive(Debug, Clone)]
pub struct RecordTable<'a> {
    store: &'a LocalStore,
    collection: CollectionName,
    kind: TableKind,
}

impl RecordTable<'_> {
    pub fn name(&self) -> String {
        self.kind.table_name(&self.collection)
    }

    fn rows<'t>(kind: TableKind, tables: &'t TableSet) -> &'t RecordRows {
        match kind {
            TableKind::Shadow => &tables.shadow,
            _ => &tables.base,
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut RecordRows) -> Result<R>) -> Result<R> {
        let kind = self.kind;
        self.store.transaction(|tx| {
            let tables = tx.tables(&self.collection)?;
            match kind {
                TableKind::Shadow => f(&mut tables.shadow),
                _ => f(&mut tables.base),
            }
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        let kind = self.kind;
        self.store
            .read(&self.collection, |t| Self::rows(kind, t).get(id).cloned())
    }

    pub fn count(&self) -> Result<usize> {
        let kind = self.kind;
        self.store
            .read(&self.collection, |t| Self::rows(kind, t).count())
    }

    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let kind = self.kind;
        self.store
            .read(&self.collection, |t| Self::rows(kind, t).to_vec())
    }

    pub fn put(&self, record: Value) -> Result<RecordId> {
        self.mutate(|rows| rows.put(record))
    }

    pub fn add(&self, record: Value) -> Result<RecordId> {
        self.mutate(|rows| rows.add(record))
    }

    pub fn bulk_put(&self, records: Vec<Value>) -> Result<usize> {
        self.mutate(|rows| rows.bulk_put(records))
    }

    pub fn bulk_add(&self, records: Vec<Value>) -> Result<usize> {
        self.mutate(|rows| rows.bulk_add(records))
    }

    pub fn delete(&self, id: &str) -> Result<Option<Value>> {
        self.mutate(|rows| Ok(rows.delete(id)))
    }

    pub fn bulk_delete(&self, ids: &[RecordId]) -> Result<usize> {
        self.mutate(|rows| Ok(rows.bulk_delete(ids)))
    }

    pub fn clear(&self) -> Result<()> {
        self.mutate(|rows| {
            rows.clear();
            Ok(())
        })
    }
}

/// Handle to a delta table.
#[derive(Debug, Clone)]
pub struct DeltaTable<'a> {
    store: &'a LocalStore,
    collection: CollectionName,
}

impl DeltaTable<'_> {
    pub fn add(&self, entry: DeltaEntry) -> Result<LocalId> {
        self.store
            .transaction(|tx| Ok(tx.delta(&self.collection)?.add(entry)))
    }

    pub fn get(&self, local_id: LocalId) -> Result<Option<DeltaEntry>> {
        self.store
            .read(&self.collection, |t| t.delta.get(local_id).cloned())
    }

    pub fn set_status(
        &self,
        local_id: LocalId,
        status: SyncStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        self.store.transaction(|tx| {
            Ok(tx
                .delta(&self.collection)?
                .set_status(local_id, status, reason))
        })
    }

    pub fn where_operation(
        &self,
        operation: DeltaOperation,
        status: SyncStatus,
    ) -> Result<Vec<DeltaEntry>> {
        self.store.read(&self.collection, |t| {
            t.delta
                .where_operation(operation, status)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn where_action(&self, action_name: &str, status: SyncStatus) -> Result<Vec<DeltaEntry>> {
        self.store.read(&self.collection, |t| {
            t.delta
                .where_action(action_name, status)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn to_vec(&self) -> Result<Vec<DeltaEntry>> {
        self.store
            .read(&self.collection, |t| t.delta.entries().cloned().collect())
    }

    pub fn count(&self) -> Result<usize> {
        self.store.read(&self.collection, |t| t.delta.count())
    }

    pub fn clear(&self) -> Result<()> {
        self.store.transaction(|tx| {
            tx.delta(&self.collection)?.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store() -> LocalStore {
        let store = LocalStore::in_memory();
        store
            .initialize_schema(&["todos".into(), "users".into()], 1)
            .unwrap();
        store
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = LocalStore::in_memory();
        assert!(matches!(
            store.base("todos"),
            Err(Error::Storage(StorageError::Closed))
        ));

        let store = open_store();
        store.close();
        assert!(!store.is_open());
        assert!(matches!(
            store.transaction(|_| Ok(())),
            Err(Error::Storage(StorageError::Closed))
        ));
    }

    #[test]
    fn physical_table_names() {
        let store = open_store();
        assert_eq!(store.table("todos").unwrap().name(), "todos");
        assert_eq!(store.table("todos_shadow").unwrap().name(), "todos_shadow");
        assert!(store.delta("todos").is_ok());
        assert!(matches!(
            store.table("todos_delta"),
            Err(Error::Storage(StorageError::UnknownTable(_)))
        ));
        assert!(matches!(
            store.table("posts"),
            Err(Error::Storage(StorageError::UnknownTable(_)))
        ));
    }

    #[test]
    fn crud_and_bulk() {
        let store = open_store();
        let todos = store.base("todos").unwrap();

        todos.put(json!({"id": 1, "title": "A"})).unwrap();
        todos
            .bulk_put(vec![json!({"id": 2, "title": "B"}), json!({"id": "3"})])
            .unwrap();
        assert_eq!(todos.count().unwrap(), 3);
        assert_eq!(todos.get("1").unwrap().unwrap()["title"], "A");

        assert!(matches!(
            todos.add(json!({"id": 1})),
            Err(Error::Storage(StorageError::ConstraintViolation { .. }))
        ));

        assert_eq!(todos.bulk_delete(&["1".into(), "9".into()]).unwrap(), 1);
        todos.clear().unwrap();
        assert_eq!(todos.count().unwrap(), 0);
    }

    #[test]
    fn bulk_add_is_all_or_nothing() {
        let store = open_store();
        let todos = store.base("todos").unwrap();
        todos.put(json!({"id": "2"})).unwrap();

        let result = todos.bulk_add(vec![json!({"id": "1"}), json!({"id": "2"})]);
        assert!(result.is_err());
        assert_eq!(todos.count().unwrap(), 1);

        let result = todos.bulk_add(vec![json!({"id": "5"}), json!({"id": "5"})]);
        assert!(result.is_err());
        assert_eq!(todos.count().unwrap(), 1);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = open_store();
        let result: Result<()> = store.transaction(|tx| {
            tx.base("todos")?.put(json!({"id": "1"}))?;
            tx.shadow("users")?.put(json!({"id": "u"}))?;
            tx.base("todos")?.put(json!({"title": "no id"}))?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::MissingRecordId)));
        assert_eq!(store.base("todos").unwrap().count().unwrap(), 0);
        assert_eq!(store.shadow("users").unwrap().count().unwrap(), 0);
    }

    #[test]
    fn delta_indexes_follow_status() {
        let store = open_store();
        let delta = store.delta("todos").unwrap();

        let first = delta
            .add(
                DeltaEntry::pending(DeltaOperation::Delete, json!({"id": "5"}), 10)
                    .with_action("archive", None),
            )
            .unwrap();
        let second = delta
            .add(DeltaEntry::pending(DeltaOperation::Create, json!({"id": "6"}), 11))
            .unwrap();
        assert_eq!((first, second), (1, 2));

        assert_eq!(
            delta
                .where_operation(DeltaOperation::Delete, SyncStatus::Pending)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            delta
                .where_action("archive", SyncStatus::Pending)
                .unwrap()
                .len(),
            1
        );

        assert!(delta
            .set_status(first, SyncStatus::Rejected, Some("nope".into()))
            .unwrap());
        assert!(!delta.set_status(first, SyncStatus::Synced, None).unwrap());
        assert!(delta
            .where_action("archive", SyncStatus::Pending)
            .unwrap()
            .is_empty());
        let rejected = delta.where_action("archive", SyncStatus::Rejected).unwrap();
        assert_eq!(rejected[0].rejected_reason.as_deref(), Some("nope"));
    }

    #[test]
    fn same_generation_is_noop_reopen() {
        let store = open_store();
        store.base("todos").unwrap().put(json!({"id": "1"})).unwrap();

        store
            .initialize_schema(&["todos".into(), "users".into()], 1)
            .unwrap();
        assert_eq!(store.base("todos").unwrap().count().unwrap(), 1);
        assert_eq!(store.generation(), Some(1));
    }

    #[test]
    fn new_generation_reshapes_tables() {
        let store = open_store();
        store.base("todos").unwrap().put(json!({"id": "1"})).unwrap();
        store.base("users").unwrap().put(json!({"id": "u"})).unwrap();

        store
            .initialize_schema(&["todos".into(), "posts".into()], 2)
            .unwrap();
        assert_eq!(store.generation(), Some(2));
        assert_eq!(store.collections(), vec!["posts", "todos"]);
        assert_eq!(store.base("todos").unwrap().count().unwrap(), 1);
        assert!(store.base("users").is_err());
    }

    #[test]
    fn revisions_bump_on_commit() {
        let store = open_store();
        let mut rx = store.subscribe("todos");
        let before = *rx.borrow_and_update();

        store.shadow("todos").unwrap().put(json!({"id": "1"})).unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update() > before);

        // Reads and untouched collections do not notify
        store.base("users").unwrap().put(json!({"id": "u"})).unwrap();
        store.base("todos").unwrap().count().unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn file_persistence_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = LocalStore::open_at(&path).unwrap();
            store.initialize_schema(&["todos".into()], 4).unwrap();
            store.base("todos").unwrap().put(json!({"id": "1"})).unwrap();
            store
                .delta("todos")
                .unwrap()
                .add(DeltaEntry::pending(DeltaOperation::Delete, json!({"id": "1"}), 1))
                .unwrap();
        }

        let store = LocalStore::open_at(&path).unwrap();
        assert_eq!(store.generation(), Some(4));
        assert!(!store.is_open());
        store.initialize_schema(&["todos".into()], 4).unwrap();
        assert_eq!(store.base("todos").unwrap().count().unwrap(), 1);
        let pending = store
            .read("todos", |t| t.delta.pending_delete_ids())
            .unwrap();
        assert!(pending.contains("1"));

        store.destroy().unwrap();
        assert!(!path.exists());
        assert_eq!(store.generation(), None);
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(
            LocalStore::open_at(&path),
            Err(Error::Storage(StorageError::Corrupt(_)))
        ));
    }
}
