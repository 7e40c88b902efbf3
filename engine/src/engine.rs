//! SyncEngine - startup orchestration and change-event application.
//!
//! The engine owns the replication loop: it fetches the remote schema,
//! decides whether the local store has to be rebuilt, pulls every
//! collection (full snapshot on first sync, incremental afterwards) and
//! applies pushed or pulled harmonics to base tables. Confirmed changes
//! retire the shadow rows of records with no outstanding local writes.

use crate::{
    action::{OptimisticWriteCoordinator, ReplaySummary},
    config::EngineConfig,
    delta::DeltaOperation,
    error::Result,
    harmonic::{Harmonic, HarmonicId},
    http::HttpTransport,
    overlay::QueryOverlay,
    queue::{OfflineRequestQueue, QueueReport},
    record,
    schema::{KnownVersions, RebuildReason, VersionPair},
    state::{keys, FileStateStore, MemoryStateStore, StateStore},
    store::{LocalStore, Transaction},
    transport::{Connectivity, RemoteActionTransport, RequestTransport, SyncTransport},
    CollectionName, Error, RecordId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Uninitialized,
    FetchingSchema,
    RebuildDecision,
    Rebuilding,
    FullResync,
    SteadyState,
    /// Startup failed; call `fetch_and_initialize_schema` again
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::Uninitialized => "uninitialized",
            SyncState::FetchingSchema => "fetching_schema",
            SyncState::RebuildDecision => "rebuild_decision",
            SyncState::Rebuilding => "rebuilding",
            SyncState::FullResync => "full_resync",
            SyncState::SteadyState => "steady_state",
            SyncState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Events broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotification {
    RebuildStarted {
        reason: RebuildReason,
    },
    RebuildCompleted {
        generation: u32,
    },
    /// The server refused a change; sent once per harmonic id
    HarmonicRejected {
        collection: CollectionName,
        harmonic_id: HarmonicId,
        record_id: RecordId,
        reason: Option<String>,
    },
    CollectionError {
        collection: CollectionName,
        message: String,
    },
    /// An optimistic action was refused and rolled back
    ActionRejected {
        action: String,
        reason: String,
    },
}

/// Result of [`SyncEngine::fetch_and_initialize_schema`].
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildOutcome {
    pub rebuilt: bool,
    pub reason: Option<RebuildReason>,
    pub generation: u32,
    pub collections: Vec<CollectionName>,
}

/// Result of [`SyncEngine::initialize_tables`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub synced: Vec<CollectionName>,
    /// Collection name and error message
    pub failed: Vec<(CollectionName, String)>,
}

/// Result of applying a batch of harmonics to one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Records written by create events (or loaded by a snapshot)
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub rejected: usize,
    /// Per-event decode errors
    pub errors: Vec<String>,
    /// Cursor after the batch
    pub cursor: Option<HarmonicId>,
}

/// What happened to a single pushed harmonic.
#[derive(Debug, Clone, PartialEq)]
pub enum HarmonicOutcome {
    Applied,
    Rejected,
    /// Discarded because a rebuild is running
    Dropped,
    /// Could not be applied; recorded in the failed-event journal
    Failed(String),
}

/// A harmonic that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedHarmonic {
    pub collection: CollectionName,
    pub harmonic: Harmonic,
    pub error: String,
    pub failed_at: String,
}

/// Result of [`SyncEngine::reconnect`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectReport {
    pub queue: QueueReport,
    pub actions: ReplaySummary,
    pub tables: SyncReport,
}

/// Clears the rebuild flag when a rebuild ends, however it ends.
struct RebuildGuard<'a>(&'a AtomicBool);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Builder for [`SyncEngine`].
#[derive(Default)]
pub struct SyncEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<LocalStore>>,
    state: Option<Arc<dyn StateStore>>,
    sync: Option<Arc<dyn SyncTransport>>,
    actions: Option<Arc<dyn RemoteActionTransport>>,
    requests: Option<Arc<dyn RequestTransport>>,
    connectivity: Option<Connectivity>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn sync_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.sync = Some(transport);
        self
    }

    pub fn action_transport(mut self, transport: Arc<dyn RemoteActionTransport>) -> Self {
        self.actions = Some(transport);
        self
    }

    pub fn request_transport(mut self, transport: Arc<dyn RequestTransport>) -> Self {
        self.requests = Some(transport);
        self
    }

    /// Use one transport for pulls, actions and raw requests.
    pub fn transport<T>(self, transport: Arc<T>) -> Self
    where
        T: SyncTransport + RemoteActionTransport + RequestTransport + 'static,
    {
        self.sync_transport(transport.clone())
            .action_transport(transport.clone())
            .request_transport(transport)
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Assemble the engine.
    ///
    /// Missing pieces fall back to the configuration: file-backed store and
    /// state under `data_dir` (in-memory without one) and an
    /// [`HttpTransport`] against `base_url`.
    pub fn build(self) -> Result<SyncEngine> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(match config.store_path() {
                Some(path) => LocalStore::open_at(path)?,
                None => LocalStore::in_memory(),
            }),
        };

        let state: Arc<dyn StateStore> = match self.state {
            Some(state) => state,
            None => match config.state_path() {
                Some(path) => Arc::new(FileStateStore::open(path)?),
                None => Arc::new(MemoryStateStore::new()),
            },
        };

        let http = if self.sync.is_none() || self.actions.is_none() || self.requests.is_none() {
            Some(Arc::new(HttpTransport::from_config(&config)?))
        } else {
            None
        };
        let sync: Arc<dyn SyncTransport> = match (self.sync, &http) {
            (Some(t), _) => t,
            (None, Some(h)) => h.clone(),
            (None, None) => return Err(Error::NotInitialized),
        };
        let actions: Arc<dyn RemoteActionTransport> = match (self.actions, &http) {
            (Some(t), _) => t,
            (None, Some(h)) => h.clone(),
            (None, None) => return Err(Error::NotInitialized),
        };
        let requests: Arc<dyn RequestTransport> = match (self.requests, &http) {
            (Some(t), _) => t,
            (None, Some(h)) => h.clone(),
            (None, None) => return Err(Error::NotInitialized),
        };

        let connectivity = self.connectivity.unwrap_or_default();
        let (notifications, _) = broadcast::channel(256);
        let queue = Arc::new(
            OfflineRequestQueue::new(
                state.clone(),
                requests.clone(),
                connectivity.clone(),
                config.clone(),
            )
            .with_store(store.clone()),
        );
        let actions = OptimisticWriteCoordinator::new(
            store.clone(),
            actions,
            requests,
            queue.clone(),
            connectivity.clone(),
            notifications.clone(),
        );

        Ok(SyncEngine {
            overlay: QueryOverlay::new(store.clone()),
            config,
            store,
            state,
            sync,
            actions,
            queue,
            connectivity,
            status: watch::channel(SyncState::Uninitialized).0,
            notifications,
            collections: RwLock::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            rebuilding: AtomicBool::new(false),
            rejected_seen: Mutex::new(HashSet::new()),
            collection_errors: RwLock::new(HashMap::new()),
        })
    }
}

/// The client-side synchronization engine.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<LocalStore>,
    state: Arc<dyn StateStore>,
    sync: Arc<dyn SyncTransport>,
    overlay: QueryOverlay,
    actions: OptimisticWriteCoordinator,
    queue: Arc<OfflineRequestQueue>,
    connectivity: Connectivity,
    status: watch::Sender<SyncState>,
    notifications: broadcast::Sender<SyncNotification>,
    collections: RwLock<Vec<CollectionName>>,
    locks: Mutex<HashMap<CollectionName, Arc<tokio::sync::Mutex<()>>>>,
    rebuilding: AtomicBool,
    rejected_seen: Mutex<HashSet<(CollectionName, HarmonicId)>>,
    collection_errors: RwLock<HashMap<CollectionName, String>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("user_id", &self.config.user_id)
            .field("state", &self.state())
            .field("collections", &*self.collections.read())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn overlay(&self) -> &QueryOverlay {
        &self.overlay
    }

    pub fn actions(&self) -> &OptimisticWriteCoordinator {
        &self.actions
    }

    pub fn queue(&self) -> &OfflineRequestQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn state(&self) -> SyncState {
        *self.status.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifications.subscribe()
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::SeqCst)
    }

    /// Collections declared by the last fetched schema.
    pub fn collections(&self) -> Vec<CollectionName> {
        self.collections.read().clone()
    }

    /// Last error of a background sync of `collection`, if any.
    pub fn collection_error(&self, collection: &str) -> Option<String> {
        self.collection_errors.read().get(collection).cloned()
    }

    fn set_state(&self, state: SyncState) {
        self.status.send_replace(state);
        tracing::debug!(%state, "Sync state changed");
    }

    fn notify(&self, notification: SyncNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn record_collection_error(&self, collection: &str, message: String) {
        self.collection_errors
            .write()
            .insert(collection.to_string(), message.clone());
        self.notify(SyncNotification::CollectionError {
            collection: collection.to_string(),
            message,
        });
    }

    fn collection_lock(&self, collection: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(collection.to_string())
            .or_default()
            .clone()
    }

    // Persisted state

    /// Sync cursor of a collection for the configured user.
    pub fn cursor(&self, collection: &str) -> Result<Option<HarmonicId>> {
        self.state
            .load(&keys::cursor(&self.config.user_id, collection))
    }

    /// Move the cursor forward; never moves it back.
    fn advance_cursor(&self, collection: &str, id: &HarmonicId) -> Result<HarmonicId> {
        match self.cursor(collection)? {
            Some(current) if current >= *id => Ok(current),
            _ => {
                self.state
                    .save(&keys::cursor(&self.config.user_id, collection), id)?;
                Ok(id.clone())
            }
        }
    }

    fn clear_cursors(&self) -> Result<()> {
        for key in self
            .state
            .keys_with_prefix(&keys::cursor_prefix(&self.config.user_id))?
        {
            self.state.remove(&key)?;
        }
        Ok(())
    }

    fn known_versions(&self) -> Result<KnownVersions> {
        let user = &self.config.user_id;
        Ok(KnownVersions {
            schema_version: self.state.load(&keys::schema_version(user))?,
            database_version: self.state.load(&keys::database_version(user))?,
        })
    }

    fn save_versions(&self, pair: &VersionPair) -> Result<()> {
        let user = &self.config.user_id;
        self.state
            .save(&keys::schema_version(user), &pair.schema_version)?;
        self.state
            .save(&keys::database_version(user), &pair.database_version)
    }

    /// Harmonics that could not be applied, oldest first.
    pub fn failed_events(&self) -> Result<Vec<FailedHarmonic>> {
        Ok(self
            .state
            .load::<Vec<FailedHarmonic>>(keys::FAILED_HARMONICS)?
            .unwrap_or_default())
    }

    pub fn clear_failed_events(&self) -> Result<()> {
        self.state.remove(keys::FAILED_HARMONICS)
    }

    fn journal_failures(&self, collection: &str, failures: Vec<(Harmonic, String)>) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        let mut journal = self.failed_events()?;
        let failed_at = chrono::Utc::now().to_rfc3339();
        journal.extend(failures.into_iter().map(|(harmonic, error)| FailedHarmonic {
            collection: collection.to_string(),
            harmonic,
            error,
            failed_at: failed_at.clone(),
        }));
        let overflow = journal
            .len()
            .saturating_sub(self.config.failed_journal_capacity);
        journal.drain(..overflow);
        self.state.save(keys::FAILED_HARMONICS, &journal)
    }

    // Startup

    /// Fetch the remote schema and open the local store, rebuilding it if
    /// the server's schema or database version changed since last time.
    pub async fn fetch_and_initialize_schema(&self) -> Result<RebuildOutcome> {
        self.set_state(SyncState::FetchingSchema);
        let result = self.initialize_schema().await;
        match &result {
            Ok(_) => self.set_state(SyncState::SteadyState),
            Err(e) => {
                tracing::error!(error = %e, "Schema initialization failed");
                self.set_state(SyncState::Failed);
            }
        }
        result
    }

    async fn initialize_schema(&self) -> Result<RebuildOutcome> {
        let schema = self.sync.fetch_schema().await?;
        self.set_state(SyncState::RebuildDecision);

        let pair = schema.version_pair();
        let collections = schema.collections();
        let generation = pair.generation();
        *self.collections.write() = collections.clone();

        let reason = self.known_versions()?.rebuild_reason(&pair);
        if let Some(reason) = &reason {
            self.rebuild(reason, &pair, &collections).await?;
        } else {
            self.store.initialize_schema(&collections, generation)?;
            self.save_versions(&pair)?;
            tracing::info!(
                generation,
                collections = collections.len(),
                "Local store opened"
            );
        }

        Ok(RebuildOutcome {
            rebuilt: reason.is_some(),
            reason,
            generation,
            collections,
        })
    }

    async fn rebuild(
        &self,
        reason: &RebuildReason,
        pair: &VersionPair,
        collections: &[CollectionName],
    ) -> Result<()> {
        tracing::warn!(%reason, "Rebuilding local store");
        self.notify(SyncNotification::RebuildStarted {
            reason: reason.clone(),
        });
        self.rebuilding.store(true, Ordering::SeqCst);
        let _guard = RebuildGuard(&self.rebuilding);
        self.set_state(SyncState::Rebuilding);

        self.store.close();
        self.store.destroy()?;
        self.clear_cursors()?;
        self.rejected_seen.lock().clear();
        self.collection_errors.write().clear();

        let generation = pair.generation();
        self.store.initialize_schema(collections, generation)?;

        self.set_state(SyncState::FullResync);
        for collection in collections {
            let count = self.full_resync(collection).await?;
            tracing::debug!(%collection, records = count, "Collection resynced");
        }
        self.save_versions(pair)?;

        tracing::info!(generation, "Local store rebuilt");
        self.notify(SyncNotification::RebuildCompleted { generation });
        Ok(())
    }

    /// Replace a collection's base table with a server snapshot.
    ///
    /// Shadow rows of snapshot records without unresolved writes are retired.
    async fn full_resync(&self, collection: &str) -> Result<usize> {
        let snapshot = self.sync.fetch_snapshot(collection).await?;
        let records = snapshot.records;
        let ids: Vec<RecordId> = records.iter().filter_map(record::record_id).collect();
        let count = self.store.transaction(|tx| {
            let base = tx.base(collection)?;
            base.clear();
            let count = base.bulk_put(records)?;
            reconcile_shadow(tx, collection, ids.iter())?;
            Ok(count)
        })?;
        if let Some(latest) = &snapshot.latest_harmonic_id {
            self.advance_cursor(collection, latest)?;
        }
        Ok(count)
    }

    /// Sync every declared collection in turn.
    ///
    /// A failing collection is logged and remembered in its error state; the
    /// others still sync.
    pub async fn initialize_tables(&self) -> Result<SyncReport> {
        if !self.store.is_open() {
            return Err(Error::NotInitialized);
        }
        let mut report = SyncReport::default();
        for collection in self.collections() {
            match self.sync_collection(&collection).await {
                Ok(outcome) => {
                    tracing::debug!(
                        %collection,
                        created = outcome.created,
                        updated = outcome.updated,
                        deleted = outcome.deleted,
                        "Collection synced"
                    );
                    if outcome.errors.is_empty() {
                        self.collection_errors.write().remove(&collection);
                    }
                    report.synced.push(collection);
                }
                Err(e) => {
                    tracing::error!(%collection, error = %e, "Collection sync failed");
                    self.record_collection_error(&collection, e.to_string());
                    report.failed.push((collection, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Fetch and fixup startup in one call.
    pub async fn start(&self) -> Result<SyncReport> {
        self.fetch_and_initialize_schema().await?;
        self.initialize_tables().await
    }

    /// Bring one collection up to date.
    ///
    /// An empty base table is loaded from a snapshot; otherwise harmonics
    /// after the cursor are pulled and applied.
    pub async fn sync_collection(&self, collection: &str) -> Result<BatchOutcome> {
        let lock = self.collection_lock(collection);
        let _serial = lock.lock().await;

        if self.store.base(collection)?.count()? == 0 {
            let created = self.full_resync(collection).await?;
            return Ok(BatchOutcome {
                created,
                cursor: self.cursor(collection)?,
                ..BatchOutcome::default()
            });
        }

        let after = self
            .cursor(collection)?
            .unwrap_or_else(|| HarmonicId::from(0u64));
        let response = self.sync.fetch_after(collection, &after).await?;
        let mut outcome = self.apply_batch(collection, response.harmonics)?;
        if let Some(latest) = &response.latest_harmonic_id {
            outcome.cursor = Some(self.advance_cursor(collection, latest)?);
        }
        Ok(outcome)
    }

    // Change events

    /// Apply a batch of pulled harmonics to `collection`.
    pub async fn process_harmonics(
        &self,
        harmonics: Vec<Harmonic>,
        collection: &str,
    ) -> Result<BatchOutcome> {
        let lock = self.collection_lock(collection);
        let _serial = lock.lock().await;
        self.apply_batch(collection, harmonics)
    }

    fn apply_batch(&self, collection: &str, mut harmonics: Vec<Harmonic>) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if harmonics.is_empty() {
            outcome.cursor = self.cursor(collection)?;
            return Ok(outcome);
        }
        harmonics.sort_by(|a, b| a.id.cmp(&b.id));
        let max_id = harmonics.iter().map(|h| h.id.clone()).max();

        // Last event per record; `None` is a delete
        let mut latest: BTreeMap<RecordId, Option<Value>> = BTreeMap::new();
        let mut failures = Vec::new();

        for harmonic in &harmonics {
            if harmonic.rejected {
                outcome.rejected += 1;
                self.notify_rejected(collection, harmonic);
                continue;
            }
            match harmonic.decode() {
                Ok(change) => {
                    let write = match (change.operation, change.record) {
                        (DeltaOperation::Create, Some(record)) => {
                            outcome.created += 1;
                            Some(record)
                        }
                        (DeltaOperation::Update, Some(record)) => {
                            outcome.updated += 1;
                            Some(record)
                        }
                        _ => {
                            outcome.deleted += 1;
                            None
                        }
                    };
                    latest.insert(change.record_id, write);
                }
                Err(e) => {
                    tracing::warn!(%collection, harmonic_id = %harmonic.id, error = %e, "Skipping undecodable harmonic");
                    outcome.errors.push(e.to_string());
                    failures.push((harmonic.clone(), e.to_string()));
                }
            }
        }

        let touched: Vec<RecordId> = latest.keys().cloned().collect();
        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for (id, write) in latest {
            match write {
                Some(record) => puts.push(record),
                None => deletes.push(id),
            }
        }
        self.store.transaction(|tx| {
            let base = tx.base(collection)?;
            base.bulk_delete(&deletes);
            base.bulk_put(puts)?;
            reconcile_shadow(tx, collection, touched.iter())
        })?;

        if let Some(max_id) = &max_id {
            outcome.cursor = Some(self.advance_cursor(collection, max_id)?);
        }
        if !failures.is_empty() {
            self.record_collection_error(
                collection,
                format!("{} harmonic(s) could not be applied", failures.len()),
            );
            self.journal_failures(collection, failures)?;
        }
        Ok(outcome)
    }

    /// Apply one pushed harmonic.
    ///
    /// Dropped while a rebuild runs. Rejections only notify and advance the
    /// cursor. An event that cannot be applied is journaled, marks the
    /// collection as errored and leaves the cursor where it was.
    pub async fn process_harmonic(&self, harmonic: Harmonic) -> Result<HarmonicOutcome> {
        if self.is_rebuilding() {
            tracing::debug!(harmonic_id = %harmonic.id, "Dropping harmonic during rebuild");
            return Ok(HarmonicOutcome::Dropped);
        }
        if !self.store.is_open() {
            return Err(Error::NotInitialized);
        }
        let collection = harmonic.table_name.clone();
        if !self.collections.read().contains(&collection) {
            return Err(Error::CollectionNotFound(collection));
        }

        let lock = self.collection_lock(&collection);
        let _serial = lock.lock().await;

        if harmonic.rejected {
            self.notify_rejected(&collection, &harmonic);
            self.advance_cursor(&collection, &harmonic.id)?;
            return Ok(HarmonicOutcome::Rejected);
        }

        match self.apply_one(&collection, &harmonic) {
            Ok(()) => {
                self.advance_cursor(&collection, &harmonic.id)?;
                Ok(HarmonicOutcome::Applied)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(%collection, harmonic_id = %harmonic.id, error = %message, "Failed to apply harmonic");
                self.record_collection_error(&collection, message.clone());
                self.journal_failures(&collection, vec![(harmonic, message.clone())])?;
                Ok(HarmonicOutcome::Failed(message))
            }
        }
    }

    /// Push entry point for change events.
    pub async fn on_change_event_pushed(&self, harmonic: Harmonic) -> Result<HarmonicOutcome> {
        self.process_harmonic(harmonic).await
    }

    fn apply_one(&self, collection: &str, harmonic: &Harmonic) -> Result<()> {
        let change = harmonic.decode()?;
        self.store.transaction(|tx| {
            let base = tx.base(collection)?;
            match change.record {
                Some(record) if change.operation != DeltaOperation::Delete => {
                    base.put(record)?;
                }
                _ => {
                    base.delete(&change.record_id);
                }
            }
            reconcile_shadow(tx, collection, std::iter::once(&change.record_id))
        })
    }

    fn notify_rejected(&self, collection: &str, harmonic: &Harmonic) {
        let first_sighting = self
            .rejected_seen
            .lock()
            .insert((collection.to_string(), harmonic.id.clone()));
        if !first_sighting {
            return;
        }
        tracing::warn!(
            %collection,
            harmonic_id = %harmonic.id,
            record_id = %harmonic.record_id,
            reason = ?harmonic.rejected_reason,
            "Server rejected change"
        );
        self.notify(SyncNotification::HarmonicRejected {
            collection: collection.to_string(),
            harmonic_id: harmonic.id.clone(),
            record_id: harmonic.record_id.clone(),
            reason: harmonic.rejected_reason.clone(),
        });
    }

    /// Replay offline work and catch up after connectivity returns.
    pub async fn reconnect(&self) -> Result<ReconnectReport> {
        if !self.connectivity.is_online() {
            return Ok(ReconnectReport::default());
        }
        tracing::info!("Reconnected; replaying offline work");
        let queue = self.queue.process_pending_requests().await?;
        let actions = self.actions.sync_offline_actions_from_deltas().await?;
        let tables = self.initialize_tables().await?;
        Ok(ReconnectReport {
            queue,
            actions,
            tables,
        })
    }

    /// Records currently visible in `collection`.
    pub fn records(&self, collection: &str) -> Result<Vec<Value>> {
        self.overlay.all(collection)
    }
}

/// Drop shadow rows of records that no longer have unresolved writes.
fn reconcile_shadow<'a>(
    tx: &mut Transaction<'_>,
    collection: &str,
    record_ids: impl Iterator<Item = &'a RecordId>,
) -> Result<()> {
    let tables = tx.tables(collection)?;
    for id in record_ids {
        if !tables.delta.has_unresolved_for(id) {
            tables.shadow.delete(id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaEntry, SyncStatus};
    use crate::schema::{ColumnSpec, RemoteSchema};
    use crate::transport::{MockTransport, SnapshotResponse};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn schema(version: u32, database: &str, collections: &[&str]) -> RemoteSchema {
        RemoteSchema {
            schema: collections
                .iter()
                .map(|c| (c.to_string(), ColumnSpec::Indexes("++id".into())))
                .collect::<BTreeMap<_, _>>(),
            schema_version: version,
            database_version: database.into(),
            generated_at: None,
        }
    }

    fn engine(transport: Arc<MockTransport>) -> SyncEngine {
        SyncEngine::builder()
            .config(EngineConfig::new("u1"))
            .transport(transport)
            .build()
            .unwrap()
    }

    fn upsert(id: u64, op: DeltaOperation, record: Value) -> Harmonic {
        let record_id = record["id"].as_str().unwrap_or_default().to_string();
        Harmonic::new(id, "todos", op, record_id, Some(&record))
    }

    async fn started(transport: Arc<MockTransport>) -> SyncEngine {
        transport.set_schema(schema(1, "1_1", &["todos"]));
        let engine = engine(transport);
        engine.fetch_and_initialize_schema().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn first_start_opens_without_rebuild() {
        let transport = Arc::new(MockTransport::new());
        transport.set_schema(schema(1, "1_1", &["todos", "users"]));
        let engine = engine(transport);
        assert_eq!(engine.state(), SyncState::Uninitialized);

        let outcome = engine.fetch_and_initialize_schema().await.unwrap();
        assert!(!outcome.rebuilt);
        assert_eq!(outcome.generation, VersionPair::new(1, "1_1").generation());
        assert_eq!(engine.state(), SyncState::SteadyState);
        assert_eq!(engine.store().collections(), vec!["todos", "users"]);

        // Unchanged versions: no rebuild the second time either
        let again = engine.fetch_and_initialize_schema().await.unwrap();
        assert!(!again.rebuilt);
        assert_eq!(again.generation, outcome.generation);
    }

    #[tokio::test]
    async fn version_change_rebuilds_and_resyncs() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport.clone()).await;
        engine
            .store()
            .base("todos")
            .unwrap()
            .put(json!({"id": "stale"}))
            .unwrap();
        engine
            .state
            .save(&keys::cursor("u1", "todos"), &HarmonicId::from(40u64))
            .unwrap();

        transport.set_schema(schema(2, "1_1", &["todos"]));
        transport.set_snapshot(
            "todos",
            SnapshotResponse {
                records: vec![json!({"id": "fresh"})],
                latest_harmonic_id: Some(HarmonicId::from(7u64)),
            },
        );
        let mut notifications = engine.subscribe();

        let outcome = engine.fetch_and_initialize_schema().await.unwrap();
        assert!(outcome.rebuilt);
        assert_eq!(outcome.reason, Some(RebuildReason::Schema { from: 1, to: 2 }));
        assert!(!engine.is_rebuilding());

        let rows = engine.records("todos").unwrap();
        assert_eq!(rows, vec![json!({"id": "fresh"})]);
        assert_eq!(engine.cursor("todos").unwrap(), Some(HarmonicId::from(7u64)));

        assert!(matches!(
            notifications.recv().await.unwrap(),
            SyncNotification::RebuildStarted { .. }
        ));
        assert!(matches!(
            notifications.recv().await.unwrap(),
            SyncNotification::RebuildCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn failed_rebuild_clears_guard() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport.clone()).await;

        transport.set_schema(schema(1, "2_5", &["todos"]));
        transport.fail_collection("todos");
        assert!(engine.fetch_and_initialize_schema().await.is_err());
        assert!(!engine.is_rebuilding());
        assert_eq!(engine.state(), SyncState::Failed);
    }

    #[tokio::test]
    async fn applying_a_harmonic_twice_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport).await;
        let event = upsert(1, DeltaOperation::Create, json!({"id": "a", "title": "A"}));

        engine.process_harmonic(event.clone()).await.unwrap();
        let once = engine.store().base("todos").unwrap().to_vec().unwrap();
        engine.process_harmonic(event).await.unwrap();
        let twice = engine.store().base("todos").unwrap().to_vec().unwrap();
        assert_eq!(once, twice);
        assert_eq!(engine.cursor("todos").unwrap(), Some(HarmonicId::from(1u64)));
    }

    #[tokio::test]
    async fn batch_cursor_is_max_id() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport).await;

        let batch = vec![
            upsert(3, DeltaOperation::Update, json!({"id": "a", "v": 3})),
            upsert(1, DeltaOperation::Create, json!({"id": "a", "v": 1})),
            upsert(2, DeltaOperation::Create, json!({"id": "b", "v": 2})),
        ];
        let outcome = engine.process_harmonics(batch, "todos").await.unwrap();

        assert_eq!(outcome.cursor, Some(HarmonicId::from(3u64)));
        assert_eq!((outcome.created, outcome.updated), (2, 1));
        let a = engine.store().base("todos").unwrap().get("a").unwrap().unwrap();
        assert_eq!(a["v"], 3);
    }

    #[tokio::test]
    async fn batch_recreate_after_delete_keeps_record() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport).await;

        let batch = vec![
            upsert(1, DeltaOperation::Create, json!({"id": "a", "v": 1})),
            Harmonic::new(2u64, "todos", DeltaOperation::Delete, "a", None),
            upsert(3, DeltaOperation::Create, json!({"id": "a", "v": 3})),
        ];
        let outcome = engine.process_harmonics(batch, "todos").await.unwrap();

        assert_eq!((outcome.created, outcome.deleted), (2, 1));
        let a = engine.store().base("todos").unwrap().get("a").unwrap().unwrap();
        assert_eq!(a["v"], 3);
    }

    #[tokio::test]
    async fn rejected_harmonic_notifies_once_and_skips_base() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport).await;
        let mut notifications = engine.subscribe();

        let rejected = upsert(5, DeltaOperation::Create, json!({"id": "x"})).into_rejected("dup");
        assert_eq!(
            engine.process_harmonic(rejected.clone()).await.unwrap(),
            HarmonicOutcome::Rejected
        );
        engine.process_harmonic(rejected).await.unwrap();

        assert_eq!(engine.store().base("todos").unwrap().count().unwrap(), 0);
        assert_eq!(engine.cursor("todos").unwrap(), Some(HarmonicId::from(5u64)));
        assert!(matches!(
            notifications.try_recv().unwrap(),
            SyncNotification::HarmonicRejected { ref reason, .. } if reason.as_deref() == Some("dup")
        ));
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn undecodable_harmonic_is_journaled_and_cursor_held() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport).await;
        engine
            .process_harmonic(upsert(1, DeltaOperation::Create, json!({"id": "a"})))
            .await
            .unwrap();

        let mut broken = upsert(2, DeltaOperation::Create, json!({"id": "b"}));
        broken.data = Some(Value::String("{not json".into()));
        let outcome = engine.process_harmonic(broken).await.unwrap();

        assert!(matches!(outcome, HarmonicOutcome::Failed(_)));
        assert_eq!(engine.cursor("todos").unwrap(), Some(HarmonicId::from(1u64)));
        assert_eq!(engine.failed_events().unwrap().len(), 1);
        assert!(engine.collection_error("todos").is_some());

        engine.clear_failed_events().unwrap();
        assert!(engine.failed_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirmed_change_retires_shadow_row() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport).await;
        let store = engine.store();
        store.shadow("todos").unwrap().put(json!({"id": "a", "v": 2})).unwrap();
        let local_id = store
            .delta("todos")
            .unwrap()
            .add(DeltaEntry::pending(DeltaOperation::Create, json!({"id": "a", "v": 2}), 1))
            .unwrap();

        let event = upsert(1, DeltaOperation::Create, json!({"id": "a", "v": 2}));
        engine.process_harmonic(event.clone()).await.unwrap();
        assert!(store.shadow("todos").unwrap().get("a").unwrap().is_some());

        store
            .delta("todos")
            .unwrap()
            .set_status(local_id, SyncStatus::Synced, None)
            .unwrap();
        engine.process_harmonic(event).await.unwrap();
        assert!(store.shadow("todos").unwrap().get("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_retires_settled_shadow_rows() {
        let transport = Arc::new(MockTransport::new());
        let engine = started(transport.clone()).await;
        let store = engine.store();
        store.shadow("todos").unwrap().put(json!({"id": "a"})).unwrap();
        store.shadow("todos").unwrap().put(json!({"id": "b"})).unwrap();
        store
            .delta("todos")
            .unwrap()
            .add(DeltaEntry::pending(DeltaOperation::Create, json!({"id": "b"}), 1))
            .unwrap();

        transport.set_snapshot(
            "todos",
            SnapshotResponse {
                records: vec![json!({"id": "a"}), json!({"id": "b"})],
                latest_harmonic_id: Some(HarmonicId::from(2u64)),
            },
        );
        engine.sync_collection("todos").await.unwrap();

        assert!(store.shadow("todos").unwrap().get("a").unwrap().is_none());
        // Still pending locally
        assert!(store.shadow("todos").unwrap().get("b").unwrap().is_some());
    }

    #[tokio::test]
    async fn initialize_tables_isolates_failures() {
        let transport = Arc::new(MockTransport::new());
        transport.set_schema(schema(1, "1_1", &["todos", "users"]));
        transport.set_snapshot(
            "todos",
            SnapshotResponse {
                records: vec![json!({"id": "1"})],
                latest_harmonic_id: Some(HarmonicId::from(10u64)),
            },
        );
        transport.fail_collection("users");
        let engine = engine(transport.clone());
        engine.fetch_and_initialize_schema().await.unwrap();

        let report = engine.initialize_tables().await.unwrap();
        assert_eq!(report.synced, vec!["todos"]);
        assert_eq!(report.failed.len(), 1);
        assert!(engine.collection_error("users").is_some());

        transport.push_harmonics(
            "todos",
            vec![upsert(11, DeltaOperation::Delete, json!({"id": "1"}))],
        );
        let outcome = engine.sync_collection("todos").await.unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(engine.cursor("todos").unwrap(), Some(HarmonicId::from(11u64)));
    }

    #[tokio::test]
    async fn unknown_collection_and_closed_store() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(transport.clone());
        let event = upsert(1, DeltaOperation::Create, json!({"id": "a"}));
        assert!(matches!(
            engine.process_harmonic(event.clone()).await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(engine.initialize_tables().await, Err(Error::NotInitialized)));

        let engine = started(transport).await;
        let mut elsewhere = event;
        elsewhere.table_name = "posts".into();
        assert!(matches!(
            engine.process_harmonic(elsewhere).await,
            Err(Error::CollectionNotFound(_))
        ));
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn opened_engine() -> SyncEngine {
            let engine = engine(Arc::new(MockTransport::new()));
            engine
                .store()
                .initialize_schema(&["todos".to_string()], 1)
                .unwrap();
            engine
        }

        fn arb_batch() -> impl Strategy<Value = Vec<Harmonic>> {
            prop::collection::vec((0u8..4, 0u8..3, any::<u16>()), 1..20).prop_map(|events| {
                events
                    .into_iter()
                    .enumerate()
                    .map(|(i, (record, op, value))| {
                        let id = format!("r{record}");
                        let operation = match op {
                            0 => DeltaOperation::Create,
                            1 => DeltaOperation::Update,
                            _ => DeltaOperation::Delete,
                        };
                        let body = json!({"id": id, "value": value});
                        Harmonic::new(i as u64 + 1, "todos", operation, id, Some(&body))
                    })
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn prop_batch_cursor_is_max_regardless_of_order(
                (batch, shuffled) in arb_batch().prop_flat_map(|b| (Just(b.clone()), Just(b).prop_shuffle()))
            ) {
                let expected = batch.iter().map(|h| h.id.clone()).max();

                let in_order = opened_engine();
                let a = in_order.apply_batch("todos", batch).unwrap();
                let shuffled_engine = opened_engine();
                let b = shuffled_engine.apply_batch("todos", shuffled).unwrap();

                prop_assert_eq!(a.cursor.clone(), expected);
                prop_assert_eq!(a.cursor, b.cursor);
                prop_assert_eq!(
                    in_order.store().base("todos").unwrap().to_vec().unwrap(),
                    shuffled_engine.store().base("todos").unwrap().to_vec().unwrap()
                );
            }

            #[test]
            fn prop_batch_matches_serial_apply(batch in arb_batch()) {
                let batched = opened_engine();
                batched.apply_batch("todos", batch.clone()).unwrap();

                let serial = opened_engine();
                for harmonic in &batch {
                    serial.apply_one("todos", harmonic).unwrap();
                }

                prop_assert_eq!(
                    batched.store().base("todos").unwrap().to_vec().unwrap(),
                    serial.store().base("todos").unwrap().to_vec().unwrap()
                );
            }

            #[test]
            fn prop_reapplying_a_batch_changes_nothing(batch in arb_batch()) {
                let engine = opened_engine();
                engine.apply_batch("todos", batch.clone()).unwrap();
                let once = engine.store().base("todos").unwrap().to_vec().unwrap();
                let cursor = engine.cursor("todos").unwrap();

                engine.apply_batch("todos", batch).unwrap();
                prop_assert_eq!(engine.store().base("todos").unwrap().to_vec().unwrap(), once);
                prop_assert_eq!(engine.cursor("todos").unwrap(), cursor);
            }
        }
    }
}
