//! QueryOverlay - the merged read view of a collection.
//!
//! Readers never look at base or shadow tables directly. The overlay runs a
//! query against both, lets optimistic shadow rows override confirmed base
//! rows, appends optimistic creates and hides records with a pending delete.

use crate::{
    error::Result,
    record::{self, compare_values},
    store::LocalStore,
    RecordId,
};
use futures::Stream;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

/// Filter/sort function run independently over base and shadow rows.
pub type SelectFn = Arc<dyn Fn(Vec<Value>) -> Vec<Value> + Send + Sync>;

/// A query over one collection.
#[derive(Clone, Default)]
pub struct Query {
    select: Option<SelectFn>,
    sort_key: Option<String>,
}

impl Query {
    /// All rows, no re-sort.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style method to set the row selection function.
    pub fn select<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
    {
        self.select = Some(Arc::new(f));
        self
    }

    /// Builder-style method to re-sort merged rows by a field.
    pub fn sort_by(mut self, key: impl Into<String>) -> Self {
        self.sort_key = Some(key.into());
        self
    }

    pub fn sort_key(&self) -> Option<&str> {
        self.sort_key.as_deref()
    }

    fn run(&self, rows: Vec<Value>) -> Vec<Value> {
        match &self.select {
            Some(select) => select(rows),
            None => rows,
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("select", &self.select.as_ref().map(|_| "<fn>"))
            .field("sort_key", &self.sort_key)
            .finish()
    }
}

/// Whether the base rows were ordered ascending by `key`.
///
/// Fewer than two rows count as ascending.
fn is_ascending(base: &[Value], key: &str) -> bool {
    match (base.first(), base.last()) {
        (Some(first), Some(last)) if base.len() >= 2 => {
            let a = first.get(key).unwrap_or(&Value::Null);
            let b = last.get(key).unwrap_or(&Value::Null);
            compare_values(a, b).is_le()
        }
        _ => true,
    }
}

/// Merge query results from base and shadow.
///
/// Shadow rows replace base rows with the same id in place; shadow-only rows
/// are appended in shadow order. With a sort key the result is re-sorted in
/// the direction the base rows came in. Records in `pending_deletes` are
/// removed last.
pub fn merge(
    base: Vec<Value>,
    shadow: Vec<Value>,
    pending_deletes: &BTreeSet<RecordId>,
    sort_key: Option<&str>,
) -> Vec<Value> {
    let ascending = sort_key.map(|key| is_ascending(&base, key));

    let mut slots: Vec<Option<Value>> = Vec::with_capacity(shadow.len());
    let mut by_id: HashMap<RecordId, usize> = HashMap::with_capacity(shadow.len());
    for row in shadow {
        if let Some(id) = record::record_id(&row) {
            by_id.insert(id, slots.len());
        }
        slots.push(Some(row));
    }

    let mut merged: Vec<Value> = Vec::with_capacity(base.len() + slots.len());
    for row in base {
        let replacement = record::record_id(&row)
            .and_then(|id| by_id.get(&id).copied())
            .and_then(|slot| slots[slot].take());
        merged.push(replacement.unwrap_or(row));
    }
    merged.extend(slots.into_iter().flatten());

    if let (Some(key), Some(ascending)) = (sort_key, ascending) {
        merged.sort_by(|a, b| {
            let order = compare_values(
                a.get(key).unwrap_or(&Value::Null),
                b.get(key).unwrap_or(&Value::Null),
            );
            if ascending {
                order
            } else {
                order.reverse()
            }
        });
    }

    if !pending_deletes.is_empty() {
        merged.retain(|row| {
            record::record_id(row)
                .map(|id| !pending_deletes.contains(&id))
                .unwrap_or(true)
        });
    }
    merged
}

/// Merged reads over a [`LocalStore`].
#[derive(Debug, Clone)]
pub struct QueryOverlay {
    store: Arc<LocalStore>,
}

impl QueryOverlay {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Evaluate `query` once against the current tables.
    pub fn query(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        let (base, shadow, pending_deletes) = self.store.read(collection, |t| {
            (
                t.base.to_vec(),
                t.shadow.to_vec(),
                t.delta.pending_delete_ids(),
            )
        })?;
        Ok(merge(
            query.run(base),
            query.run(shadow),
            &pending_deletes,
            query.sort_key(),
        ))
    }

    /// Shorthand for every visible record of a collection.
    pub fn all(&self, collection: &str) -> Result<Vec<Value>> {
        self.query(collection, &Query::new())
    }

    /// The visible version of one record.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.store.read(collection, |t| {
            if t.delta.pending_delete_ids().contains(id) {
                return None;
            }
            t.shadow.get(id).or_else(|| t.base.get(id)).cloned()
        })
    }

    /// Subscribe to the merged result of `query`.
    pub fn watch(&self, collection: &str, query: Query) -> LiveQuery {
        LiveQuery {
            overlay: self.clone(),
            collection: collection.to_string(),
            query,
            revisions: self.store.subscribe(collection),
            trigger: None,
            primed: false,
        }
    }
}

/// A restartable live query.
///
/// The first [`LiveQuery::next`] yields the current result; later calls wait
/// until the collection's base, shadow or delta table changes (or the
/// attached trigger fires) and recompute from scratch.
#[derive(Debug)]
pub struct LiveQuery {
    overlay: QueryOverlay,
    collection: String,
    query: Query,
    revisions: watch::Receiver<u64>,
    trigger: Option<watch::Receiver<()>>,
    primed: bool,
}

impl LiveQuery {
    /// Builder-style method to recompute whenever `trigger` changes.
    pub fn with_trigger(mut self, trigger: watch::Receiver<()>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Make the next call yield immediately again.
    pub fn restart(&mut self) {
        self.primed = false;
    }

    /// Wait for the next result. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Result<Vec<Value>>> {
        if self.primed && !self.wait_for_change().await {
            return None;
        }
        self.primed = true;
        self.revisions.borrow_and_update();
        if let Some(trigger) = &mut self.trigger {
            trigger.borrow_and_update();
        }
        Some(self.overlay.query(&self.collection, &self.query))
    }

    async fn wait_for_change(&mut self) -> bool {
        loop {
            let Some(trigger) = &mut self.trigger else {
                return self.revisions.changed().await.is_ok();
            };
            tokio::select! {
                changed = self.revisions.changed() => return changed.is_ok(),
                fired = trigger.changed() => {
                    if fired.is_ok() {
                        return true;
                    }
                }
            }
            // Trigger sender dropped; keep following the store alone
            self.trigger = None;
        }
    }

    /// Adapt into a stream of results.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Value>>> + Send {
        futures::stream::unfold(self, |mut live| async move {
            live.next().await.map(|item| (item, live))
        })
    }
}
