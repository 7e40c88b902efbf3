//! OptimisticWriteCoordinator - remote actions with optimistic local effects.
//!
//! An action is a named server procedure applied to a list of intents
//! (`create`/`update`/`delete` against a table). The coordinator records a
//! pending delta row per intent, mirrors the intent into the shadow table so
//! readers see it immediately, and then asks the server. Confirmation marks
//! the rows synced; refusal rolls the shadow back and marks them rejected.
//! While offline the rows simply stay pending and are replayed later by
//! [`OptimisticWriteCoordinator::sync_offline_actions_from_deltas`].

use crate::{
    delta::{DeltaEntry, DeltaOperation, LocalId, SyncStatus},
    engine::SyncNotification,
    error::{Result, ValidationErrors},
    now_millis,
    queue::{OfflineRequestQueue, OptimisticMarker},
    record,
    store::{LocalStore, TableSet, Transaction},
    transport::{
        ActionOperation, ActionPayload, ActionResponse, Connectivity, HttpResponse,
        OutboundRequest, RemoteActionTransport, RequestTransport,
    },
    validation::ValidationSchema,
    CollectionName, Error, Timestamp,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Records the intents of one action call.
#[derive(Debug, Clone, Default)]
pub struct ActionCollector {
    intents: Vec<ActionOperation>,
}

impl ActionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, table: &str, operation: DeltaOperation, data: Value) -> &mut Self {
        self.intents.push(ActionOperation {
            table: table.to_string(),
            operation,
            data,
        });
        self
    }

    pub fn create(&mut self, table: &str, data: Value) -> &mut Self {
        self.push(table, DeltaOperation::Create, data)
    }

    pub fn update(&mut self, table: &str, data: Value) -> &mut Self {
        self.push(table, DeltaOperation::Update, data)
    }

    pub fn delete(&mut self, table: &str, data: Value) -> &mut Self {
        self.push(table, DeltaOperation::Delete, data)
    }

    pub fn intents(&self) -> &[ActionOperation] {
        &self.intents
    }

    pub fn into_intents(self) -> Vec<ActionOperation> {
        self.intents
    }
}

/// How an action call is carried out.
#[derive(Debug, Clone)]
pub struct ActionOptions {
    /// Apply intents to shadow tables before the server answers
    pub optimistic: bool,
    /// Skip the network and defer the call
    pub offline: bool,
    /// Check intents against `validation_schema` first
    pub validate: bool,
    pub validation_schema: Option<ValidationSchema>,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            optimistic: true,
            offline: false,
            validate: false,
            validation_schema: None,
        }
    }
}

impl ActionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Validate intents against `schema` before anything else happens.
    pub fn validate_with(mut self, schema: ValidationSchema) -> Self {
        self.validate = true;
        self.validation_schema = Some(schema);
        self
    }
}

/// Result of replaying deferred actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Action calls issued
    pub groups: usize,
    /// Delta rows confirmed
    pub synced: usize,
    /// Delta rows left for another attempt
    pub failed: usize,
    /// Delta rows refused and rolled back
    pub rejected: usize,
}

/// A single-record write over `write/{collection}/{action}`.
pub struct WriteRequest {
    pub collection: CollectionName,
    pub action: DeltaOperation,
    /// Record to show locally before the server confirms
    pub optimistic: Option<Value>,
    /// Body sent to the server
    pub server: Value,
    /// Called once with the final outcome
    pub on_result: Option<Box<dyn FnOnce(&Result<WriteOutcome>) + Send>>,
}

impl WriteRequest {
    pub fn new(collection: impl Into<CollectionName>, action: DeltaOperation, server: Value) -> Self {
        Self {
            collection: collection.into(),
            action,
            optimistic: None,
            server,
            on_result: None,
        }
    }

    pub fn with_optimistic(mut self, record: Value) -> Self {
        self.optimistic = Some(record);
        self
    }

    pub fn on_result(mut self, f: impl FnOnce(&Result<WriteOutcome>) + Send + 'static) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest")
            .field("collection", &self.collection)
            .field("action", &self.action)
            .field("optimistic", &self.optimistic)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server answered with a 2xx status
    Sent(HttpResponse),
    /// Deferred to the offline queue under this request id
    Queued(String),
}

/// A delta row written for one intent.
type Written = (CollectionName, LocalId);

/// Apply one intent to the shadow table.
fn apply_to_shadow(tables: &mut TableSet, operation: DeltaOperation, data: &Value) -> Result<()> {
    match operation {
        DeltaOperation::Create => {
            tables.shadow.put(data.clone())?;
        }
        DeltaOperation::Update => {
            let id = record::require_id(data)?;
            let mut row = tables
                .shadow
                .get(&id)
                .or_else(|| tables.base.get(&id))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            record::merge_into(&mut row, data);
            tables.shadow.put(row)?;
        }
        DeltaOperation::Delete => {
            let id = record::require_id(data)?;
            tables.shadow.delete(&id);
        }
    }
    Ok(())
}

/// Append pending delta rows for `intents`, optionally mirroring each into
/// the shadow table. Intents are handled in order.
fn record_intents(
    tx: &mut Transaction<'_>,
    intents: &[ActionOperation],
    action: Option<(&str, Option<&Value>)>,
    timestamp: Timestamp,
    optimistic: bool,
) -> Result<Vec<Written>> {
    let mut written = Vec::with_capacity(intents.len());
    for intent in intents {
        let mut entry = DeltaEntry::pending(intent.operation, intent.data.clone(), timestamp);
        if let Some((name, data)) = action {
            entry = entry.with_action(name, data.cloned());
        }
        let tables = tx.tables(&intent.table)?;
        let local_id = tables.delta.add(entry);
        if optimistic {
            apply_to_shadow(tables, intent.operation, &intent.data)?;
        }
        written.push((intent.table.clone(), local_id));
    }
    Ok(written)
}

fn mark(tx: &mut Transaction<'_>, rows: &[Written], status: SyncStatus) -> Result<usize> {
    let mut changed = 0;
    for (collection, local_id) in rows {
        if tx.delta(collection)?.set_status(*local_id, status, None) {
            changed += 1;
        }
    }
    Ok(changed)
}

/// The record a confirmed write was stored as: the server's copy when the
/// response carries one with an id, otherwise the record that was sent.
pub(crate) fn confirmed_record<'a>(response: &'a Value, sent: Option<&'a Value>) -> Option<&'a Value> {
    [&response["operations"][0]["data"], &response["data"], response]
        .into_iter()
        .chain(sent)
        .find(|candidate| record::record_id(candidate).is_some())
}

/// Settle the shadow row of a confirmed create whose record the server
/// stored under another id.
///
/// The row moves to the server id unless that record is already known
/// locally. With no id to go on the row is dropped and the record shows up
/// with its change event. Rows still targeted by unresolved writes stay.
pub(crate) fn retire_temporary_id(
    tx: &mut Transaction<'_>,
    collection: &str,
    local_id: LocalId,
    confirmed: Option<&Value>,
) -> Result<()> {
    let tables = tx.tables(collection)?;
    let Some(entry) = tables.delta.get(local_id) else {
        return Ok(());
    };
    if entry.operation != DeltaOperation::Create {
        return Ok(());
    }
    let Some(temporary) = entry.record_id() else {
        return Ok(());
    };
    let server_id = confirmed.and_then(record::record_id);
    if server_id.as_deref() == Some(temporary.as_str()) || tables.delta.has_unresolved_for(&temporary) {
        return Ok(());
    }

    let Some(mut row) = tables.shadow.delete(&temporary) else {
        return Ok(());
    };
    if let (Some(server_id), Some(confirmed)) = (server_id, confirmed) {
        if !tables.base.contains(&server_id) && !tables.shadow.contains(&server_id) {
            record::merge_into(&mut row, confirmed);
            tables.shadow.put(row)?;
        }
    }
    tracing::debug!(%collection, %temporary, "Retired temporary record id");
    Ok(())
}

/// Reject delta rows and undo their shadow effects, newest first.
///
/// A created record loses its shadow row. An updated or deleted record gets
/// its shadow row restored from base while other unresolved writes still
/// target it, and loses it otherwise. Rows that were already settled are
/// left alone. Returns how many rows were rejected.
pub(crate) fn roll_back(tx: &mut Transaction<'_>, rows: &[Written], reason: &str) -> Result<usize> {
    let mut rejected = Vec::new();
    for (collection, local_id) in rows {
        let delta = tx.delta(collection)?;
        if delta.set_status(*local_id, SyncStatus::Rejected, Some(reason.to_string())) {
            rejected.push((collection.clone(), *local_id));
        }
    }

    for (collection, local_id) in rejected.iter().rev() {
        let tables = tx.tables(collection)?;
        let Some(entry) = tables.delta.get(*local_id) else {
            continue;
        };
        let operation = entry.operation;
        let Some(id) = entry.record_id() else {
            continue;
        };
        let restore = match operation {
            DeltaOperation::Create => None,
            DeltaOperation::Update | DeltaOperation::Delete => tables
                .delta
                .has_unresolved_for(&id)
                .then(|| tables.base.get(&id).cloned())
                .flatten(),
        };
        match restore {
            Some(row) => {
                tables.shadow.put(row)?;
            }
            None => {
                tables.shadow.delete(&id);
            }
        }
    }
    Ok(rejected.len())
}

/// Executes named actions with optimistic local effects.
pub struct OptimisticWriteCoordinator {
    store: Arc<LocalStore>,
    actions: Arc<dyn RemoteActionTransport>,
    requests: Arc<dyn RequestTransport>,
    queue: Arc<OfflineRequestQueue>,
    connectivity: Connectivity,
    notifications: broadcast::Sender<SyncNotification>,
}

impl std::fmt::Debug for OptimisticWriteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticWriteCoordinator")
            .field("store", &self.store)
            .field("connectivity", &self.connectivity)
            .finish_non_exhaustive()
    }
}

impl OptimisticWriteCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        actions: Arc<dyn RemoteActionTransport>,
        requests: Arc<dyn RequestTransport>,
        queue: Arc<OfflineRequestQueue>,
        connectivity: Connectivity,
        notifications: broadcast::Sender<SyncNotification>,
    ) -> Self {
        Self {
            store,
            actions,
            requests,
            queue,
            connectivity,
            notifications,
        }
    }

    fn notify_rejected(&self, action: &str, reason: &str) {
        let _ = self.notifications.send(SyncNotification::ActionRejected {
            action: action.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Execute the action `name`.
    ///
    /// `build` is called once to collect intents and may return action-level
    /// data. Validation failures return before any storage or network work.
    /// When offline (or the server is unreachable) the intents are kept as
    /// pending delta rows and a synthesized success marked `queued` is
    /// returned.
    pub async fn execute_action<F>(
        &self,
        name: &str,
        build: F,
        options: ActionOptions,
    ) -> Result<ActionResponse>
    where
        F: FnOnce(&mut ActionCollector) -> Option<Value>,
    {
        let mut collector = ActionCollector::new();
        let action_data = build(&mut collector);
        let intents = collector.into_intents();

        if options.validate {
            if let Some(schema) = &options.validation_schema {
                let errors = validate_intents(schema, &intents, action_data.as_ref());
                if !errors.is_empty() {
                    return Err(Error::Validation(errors));
                }
            }
        }

        let timestamp = now_millis();
        let mut written = Vec::new();
        if options.optimistic {
            written = self.store.transaction(|tx| {
                record_intents(
                    tx,
                    &intents,
                    Some((name, action_data.as_ref())),
                    timestamp,
                    true,
                )
            })?;
            tracing::debug!(action = %name, intents = intents.len(), "Applied optimistic intents");
        }

        if options.offline || !self.connectivity.is_online() {
            return self.defer(name, &intents, action_data.as_ref(), written, timestamp);
        }

        let payload = ActionPayload {
            operations: intents.clone(),
            data: action_data.clone(),
        };
        match self.actions.execute(name, &payload).await {
            Ok(response) if !response.is_rejection() => {
                self.store.transaction(|tx| mark(tx, &written, SyncStatus::Synced))?;
                Ok(response)
            }
            Ok(response) => {
                let reason = response.rejection_reason();
                self.reject(name, &written, &reason)?;
                match response.validation_errors {
                    Some(errors) if !errors.is_empty() => Err(Error::Validation(errors)),
                    _ => Err(Error::ServerRejection {
                        action: name.to_string(),
                        reason,
                    }),
                }
            }
            Err(e) if e.is_network() => {
                tracing::info!(action = %name, error = %e, "Server unreachable; deferring action");
                self.defer(name, &intents, action_data.as_ref(), written, timestamp)
            }
            Err(e) if e.is_explicit_rejection() => {
                let reason = e.to_string();
                self.reject(name, &written, &reason)?;
                Err(Error::ServerRejection {
                    action: name.to_string(),
                    reason,
                })
            }
            Err(e) => {
                self.store.transaction(|tx| mark(tx, &written, SyncStatus::Failed))?;
                Err(e)
            }
        }
    }

    /// Keep the intents as replayable pending rows and report success.
    fn defer(
        &self,
        name: &str,
        intents: &[ActionOperation],
        action_data: Option<&Value>,
        written: Vec<Written>,
        timestamp: Timestamp,
    ) -> Result<ActionResponse> {
        if written.is_empty() && !intents.is_empty() {
            self.store.transaction(|tx| {
                record_intents(tx, intents, Some((name, action_data)), timestamp, false)
            })?;
        }
        tracing::info!(action = %name, intents = intents.len(), "Action queued for replay");
        Ok(ActionResponse::queued(intents))
    }

    fn reject(&self, name: &str, written: &[Written], reason: &str) -> Result<usize> {
        let rejected = self.store.transaction(|tx| roll_back(tx, written, reason))?;
        tracing::warn!(action = %name, %reason, rows = rejected, "Action rejected; rolled back");
        self.notify_rejected(name, reason);
        Ok(rejected)
    }

    /// Replay actions recorded while offline.
    ///
    /// Pending and failed rows carrying an action name are grouped by that
    /// name and sent as one call per group, oldest group first.
    pub async fn sync_offline_actions_from_deltas(&self) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        if !self.connectivity.is_online() {
            return Ok(summary);
        }

        let mut groups: BTreeMap<String, Vec<(CollectionName, DeltaEntry)>> = BTreeMap::new();
        for collection in self.store.collections() {
            let rows: Vec<DeltaEntry> = self.store.read(&collection, |t| {
                t.delta
                    .entries()
                    .filter(|e| e.sync_status.is_unresolved() && e.action_name.is_some())
                    .cloned()
                    .collect()
            })?;
            for row in rows {
                let name = row.action_name.clone().unwrap_or_default();
                groups.entry(name).or_default().push((collection.clone(), row));
            }
        }

        let mut ordered: Vec<(String, Vec<(CollectionName, DeltaEntry)>)> = groups.into_iter().collect();
        for (_, rows) in &mut ordered {
            rows.sort_by_key(|(_, e)| (e.timestamp, e.local_id));
        }
        ordered.sort_by_key(|(_, rows)| rows.first().map(|(_, e)| e.timestamp));

        for (name, rows) in ordered {
            summary.groups += 1;
            let written: Vec<Written> = rows.iter().map(|(c, e)| (c.clone(), e.local_id)).collect();
            let payload = ActionPayload {
                operations: rows
                    .iter()
                    .map(|(collection, entry)| ActionOperation {
                        table: collection.clone(),
                        operation: entry.operation,
                        data: entry.data.clone(),
                    })
                    .collect(),
                data: rows.iter().find_map(|(_, e)| e.action_data.clone()),
            };

            match self.actions.execute(&name, &payload).await {
                Ok(response) if !response.is_rejection() => {
                    summary.synced += self
                        .store
                        .transaction(|tx| mark(tx, &written, SyncStatus::Synced))?;
                }
                Ok(response) => {
                    summary.rejected += self.reject(&name, &written, &response.rejection_reason())?;
                }
                Err(e) if e.is_explicit_rejection() => {
                    summary.rejected += self.reject(&name, &written, &e.to_string())?;
                }
                Err(e) => {
                    tracing::warn!(action = %name, error = %e, "Replay failed; will retry");
                    summary.failed += self
                        .store
                        .transaction(|tx| mark(tx, &written, SyncStatus::Failed))?;
                }
            }
        }

        if summary.groups > 0 {
            tracing::info!(
                groups = summary.groups,
                synced = summary.synced,
                failed = summary.failed,
                rejected = summary.rejected,
                "Replayed offline actions"
            );
        }
        Ok(summary)
    }

    /// Write one record through `write/{collection}/{action}`.
    ///
    /// With optimistic data the record shows up locally right away. Offline,
    /// unreachable or retryable failures defer the write to the offline
    /// queue.
    pub async fn write(&self, request: WriteRequest) -> Result<WriteOutcome> {
        let WriteRequest {
            collection,
            action,
            optimistic,
            server,
            on_result,
        } = request;

        let result = self.write_inner(&collection, action, optimistic, server).await;
        if let Some(callback) = on_result {
            callback(&result);
        }
        result
    }

    async fn write_inner(
        &self,
        collection: &str,
        action: DeltaOperation,
        optimistic: Option<Value>,
        server: Value,
    ) -> Result<WriteOutcome> {
        let marker = match optimistic {
            Some(record) => {
                let intent = ActionOperation {
                    table: collection.to_string(),
                    operation: action,
                    data: record,
                };
                let written = self.store.transaction(|tx| {
                    record_intents(tx, std::slice::from_ref(&intent), None, now_millis(), true)
                })?;
                written.into_iter().next().map(|(collection, local_id)| OptimisticMarker {
                    collection,
                    local_id,
                })
            }
            None => None,
        };

        let outbound = OutboundRequest {
            url: format!("write/{collection}/{action}"),
            method: "POST".to_string(),
            body: Some(server),
            headers: BTreeMap::new(),
        };
        let rows: Vec<Written> = marker
            .iter()
            .map(|m| (m.collection.clone(), m.local_id))
            .collect();

        if !self.connectivity.is_online() {
            let id = self.queue.cache_request(outbound, marker)?;
            return Ok(WriteOutcome::Queued(id));
        }

        let failure = match self.requests.send(&outbound).await {
            Ok(response) if response.is_success() => {
                let confirmed = confirmed_record(&response.body, outbound.body.as_ref());
                self.store.transaction(|tx| {
                    mark(tx, &rows, SyncStatus::Synced)?;
                    for (collection, local_id) in &rows {
                        retire_temporary_id(tx, collection, *local_id, confirmed)?;
                    }
                    Ok(())
                })?;
                return Ok(WriteOutcome::Sent(response));
            }
            Ok(response) => Error::Http {
                status: response.status,
                message: response.body.to_string(),
            },
            Err(e) => e,
        };

        if failure.is_network() || failure.is_retryable() {
            tracing::info!(%collection, error = %failure, "Write deferred to offline queue");
            let id = self.queue.cache_request(outbound, marker)?;
            return Ok(WriteOutcome::Queued(id));
        }

        let name = format!("write/{collection}/{action}");
        if failure.is_explicit_rejection() {
            let reason = failure.to_string();
            self.reject(&name, &rows, &reason)?;
            return Err(Error::ServerRejection {
                action: name,
                reason,
            });
        }

        self.store.transaction(|tx| mark(tx, &rows, SyncStatus::Failed))?;
        Err(failure)
    }
}

/// Check every non-delete intent and the action-level data.
///
/// Updates are validated as partial records. Errors are keyed
/// `operations.{index}.{field}` and `data.{field}`.
pub fn validate_intents(
    schema: &ValidationSchema,
    intents: &[ActionOperation],
    action_data: Option<&Value>,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    for (index, intent) in intents.iter().enumerate() {
        if intent.operation == DeltaOperation::Delete {
            continue;
        }
        if let Some(rules) = schema.rules_for(&intent.table) {
            let partial = intent.operation == DeltaOperation::Update;
            errors.extend_prefixed(
                &format!("operations.{index}"),
                rules.validate(&intent.data, partial),
            );
        }
    }
    if let Some(rules) = schema.action_rules() {
        let empty = Value::Object(Map::new());
        errors.extend_prefixed("data", rules.validate(action_data.unwrap_or(&empty), false));
    }
    errors
}
