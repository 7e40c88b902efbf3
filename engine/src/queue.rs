//! OfflineRequestQueue - outbound requests held while disconnected.
//!
//! Requests are persisted in the [`StateStore`] as they are cached. A replay
//! pass groups them by `(method, resource, action)`, sends batchable groups
//! as one `{ items: [...] }` request and the rest one by one, and keeps
//! failures around until they run out of retries.

use crate::{
    action,
    config::EngineConfig,
    delta::{LocalId, SyncStatus},
    error::Result,
    now_millis,
    state::{keys, StateStore},
    store::LocalStore,
    transport::{ActionResponse, Connectivity, HttpResponse, OutboundRequest, RequestTransport},
    CollectionName, Timestamp,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Points at the optimistic delta row written for a queued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticMarker {
    pub collection: CollectionName,
    pub local_id: LocalId,
}

/// A persisted outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineRequest {
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub timestamp: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_data: Option<OptimisticMarker>,
}

impl OfflineRequest {
    fn outbound(&self) -> OutboundRequest {
        OutboundRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
        }
    }

    /// Count a failed attempt. `None` once retries are exhausted.
    fn retry(mut self) -> Option<Self> {
        self.retry_count += 1;
        (self.retry_count < self.max_retries).then_some(self)
    }
}

/// How requests are grouped for replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub method: String,
    pub resource: String,
    pub action: Option<String>,
}

fn url_path(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(absolute) => absolute.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.trim_matches('/').to_string()
}

/// Derive the group key of a request from its method and URL path.
///
/// `write/{resource}/{action}` groups by resource and action,
/// `actions/{name}` by action name, and the bare `actions` catalog on its
/// own. Other paths group by the whole path.
pub fn group_key(method: &str, url: &str) -> GroupKey {
    let path = url_path(url);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let method = method.to_uppercase();

    for (i, segment) in segments.iter().enumerate() {
        match (*segment, segments.get(i + 1), segments.get(i + 2)) {
            ("write", Some(resource), Some(action)) => {
                return GroupKey {
                    method,
                    resource: resource.to_string(),
                    action: Some(action.to_string()),
                };
            }
            ("actions", Some(name), None) => {
                return GroupKey {
                    method,
                    resource: "actions".to_string(),
                    action: Some(name.to_string()),
                };
            }
            ("actions", None, None) => {
                return GroupKey {
                    method,
                    resource: "actions".to_string(),
                    action: None,
                };
            }
            _ => {}
        }
    }

    GroupKey {
        method,
        resource: path,
        action: None,
    }
}

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    /// Requests the server accepted
    pub sent: usize,
    /// Batch requests issued
    pub batched: usize,
    /// Requests kept for a later pass
    pub requeued: usize,
    /// Requests discarded after exhausting retries
    pub dropped: usize,
    /// Duplicate catalog fetches discarded
    pub deduplicated: usize,
}

/// Resets the processing flag when a pass ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Attempt {
    /// Confirmed; carries whatever the server echoed for the item
    Resolved(Value),
    Failed(String),
}

/// Persistent queue of outbound requests.
pub struct OfflineRequestQueue {
    state: Arc<dyn StateStore>,
    transport: Arc<dyn RequestTransport>,
    connectivity: Connectivity,
    config: EngineConfig,
    store: Option<Arc<LocalStore>>,
    processing: AtomicBool,
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for OfflineRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineRequestQueue")
            .field("processing", &self.processing)
            .field("max_retries", &self.config.max_retries)
            .finish_non_exhaustive()
    }
}

impl OfflineRequestQueue {
    pub fn new(
        state: Arc<dyn StateStore>,
        transport: Arc<dyn RequestTransport>,
        connectivity: Connectivity,
        config: EngineConfig,
    ) -> Self {
        Self {
            state,
            transport,
            connectivity,
            config,
            store: None,
            processing: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        }
    }

    /// Builder-style method to settle optimistic delta rows as requests
    /// resolve or are dropped.
    pub fn with_store(mut self, store: Arc<LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist a request for later replay and return its id.
    pub fn cache_request(
        &self,
        request: OutboundRequest,
        optimistic_data: Option<OptimisticMarker>,
    ) -> Result<String> {
        let entry = OfflineRequest {
            id: uuid::Uuid::new_v4().to_string(),
            url: request.url,
            method: request.method.to_uppercase(),
            body: request.body,
            headers: request.headers,
            timestamp: now_millis(),
            retry_count: 0,
            max_retries: self.config.max_retries,
            optimistic_data,
        };

        let _lock = self.persist_lock.lock();
        let mut pending = self.load()?;
        pending.push(entry.clone());
        self.state.save(keys::OFFLINE_REQUESTS, &pending)?;

        tracing::debug!(
            request_id = %entry.id,
            method = %entry.method,
            url = %entry.url,
            "Cached offline request"
        );
        Ok(entry.id)
    }

    /// Requests waiting for replay, oldest first.
    pub fn pending(&self) -> Result<Vec<OfflineRequest>> {
        self.load()
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    /// Discard every queued request.
    pub fn clear(&self) -> Result<()> {
        let _lock = self.persist_lock.lock();
        self.state.remove(keys::OFFLINE_REQUESTS)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    fn load(&self) -> Result<Vec<OfflineRequest>> {
        Ok(self
            .state
            .load::<Vec<OfflineRequest>>(keys::OFFLINE_REQUESTS)?
            .unwrap_or_default())
    }

    fn is_catalog(&self, request: &OfflineRequest) -> bool {
        request.method == "GET"
            && url_path(&request.url) == self.config.action_catalog_path.trim_matches('/')
    }

    fn is_batchable(&self, key: &GroupKey, members: usize) -> bool {
        members > 1
            && key.method == "POST"
            && matches!(key.action.as_deref(), Some("create" | "update" | "delete"))
            && self.config.batchable_resources.contains(&key.resource)
    }

    /// Replay every queued request once.
    ///
    /// Does nothing while offline or while another pass is running.
    pub async fn process_pending_requests(&self) -> Result<QueueReport> {
        let mut report = QueueReport::default();
        if !self.connectivity.is_online() {
            return Ok(report);
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Offline queue pass already running");
            return Ok(report);
        }
        let _guard = ProcessingGuard(&self.processing);

        let snapshot = self.load()?;
        if snapshot.is_empty() {
            return Ok(report);
        }
        tracing::info!(count = snapshot.len(), "Replaying offline requests");
        let seen: HashSet<String> = snapshot.iter().map(|r| r.id.clone()).collect();

        let mut order: Vec<GroupKey> = Vec::new();
        let mut groups: HashMap<GroupKey, Vec<OfflineRequest>> = HashMap::new();
        for request in snapshot {
            let key = group_key(&request.method, &request.url);
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(request);
        }

        let mut retained = Vec::new();
        let mut individually_sent = 0usize;

        for key in order {
            let mut members = groups.remove(&key).unwrap_or_default();

            if key.method == "GET" && members.first().is_some_and(|r| self.is_catalog(r)) {
                let mut urls = HashSet::new();
                let before = members.len();
                members.retain(|r| urls.insert(r.url.clone()));
                report.deduplicated += before - members.len();
            }

            if self.is_batchable(&key, members.len()) {
                report.batched += 1;
                let outcomes = self.send_batch(&key, &members).await;
                for (request, outcome) in members.into_iter().zip(outcomes) {
                    self.settle(request, outcome, &mut retained, &mut report);
                }
                continue;
            }

            for request in members {
                if individually_sent > 0 && !self.config.replay_delay.is_zero() {
                    tokio::time::sleep(self.config.replay_delay).await;
                }
                individually_sent += 1;
                let outcome = match self.transport.send(&request.outbound()).await {
                    Ok(response) if response.is_success() => Attempt::Resolved(response.body),
                    Ok(response) => Attempt::Failed(format!("status {}", response.status)),
                    Err(e) => Attempt::Failed(e.to_string()),
                };
                self.settle(request, outcome, &mut retained, &mut report);
            }
        }

        let _lock = self.persist_lock.lock();
        let arrived: Vec<OfflineRequest> = self
            .load()?
            .into_iter()
            .filter(|r| !seen.contains(&r.id))
            .collect();
        report.requeued = retained.len();
        retained.extend(arrived);
        self.state.save(keys::OFFLINE_REQUESTS, &retained)?;

        tracing::info!(
            sent = report.sent,
            batched = report.batched,
            requeued = report.requeued,
            dropped = report.dropped,
            "Offline queue pass finished"
        );
        Ok(report)
    }

    /// Send a group as one `{ items }` request and resolve each member by
    /// its index in the response.
    async fn send_batch(&self, key: &GroupKey, members: &[OfflineRequest]) -> Vec<Attempt> {
        let items: Vec<Value> = members
            .iter()
            .map(|r| r.body.clone().unwrap_or(Value::Null))
            .collect();
        let first = &members[0];
        let request = OutboundRequest {
            url: first.url.clone(),
            method: key.method.clone(),
            body: Some(json!({ "items": items })),
            headers: first.headers.clone(),
        };
        tracing::debug!(
            resource = %key.resource,
            action = ?key.action,
            items = members.len(),
            "Sending batched offline writes"
        );

        let failure = |reason: String| -> Vec<Attempt> {
            members
                .iter()
                .map(|_| Attempt::Failed(reason.clone()))
                .collect()
        };
        match self.transport.send(&request).await {
            Ok(response) => match batch_results(&response, members.len()) {
                Some(results) => results
                    .into_iter()
                    .map(|item| match item {
                        Some(data) => Attempt::Resolved(data),
                        None => Attempt::Failed(format!("batch item refused (status {})", response.status)),
                    })
                    .collect(),
                None => failure(format!("status {}", response.status)),
            },
            Err(e) => failure(e.to_string()),
        }
    }

    fn settle(
        &self,
        request: OfflineRequest,
        outcome: Attempt,
        retained: &mut Vec<OfflineRequest>,
        report: &mut QueueReport,
    ) {
        match outcome {
            Attempt::Resolved(confirmed) => {
                report.sent += 1;
                self.settle_optimistic(&request, SyncStatus::Synced, None);
                self.retire_temporary_id(&request, &confirmed);
            }
            Attempt::Failed(reason) => {
                let id = request.id.clone();
                let marker = request.optimistic_data.clone();
                match request.retry() {
                    Some(request) => {
                        tracing::debug!(
                            request_id = %id,
                            retry_count = request.retry_count,
                            %reason,
                            "Offline request failed; keeping for retry"
                        );
                        retained.push(request);
                    }
                    None => {
                        tracing::warn!(request_id = %id, %reason, "Dropping offline request after max retries");
                        report.dropped += 1;
                        if let Some(marker) = marker {
                            self.roll_back(&marker, &reason);
                        }
                    }
                }
            }
        }
    }

    fn settle_optimistic(&self, request: &OfflineRequest, status: SyncStatus, reason: Option<String>) {
        let (Some(store), Some(marker)) = (&self.store, &request.optimistic_data) else {
            return;
        };
        let result = store.transaction(|tx| {
            Ok(tx
                .delta(&marker.collection)?
                .set_status(marker.local_id, status, reason))
        });
        if let Err(e) = result {
            tracing::warn!(collection = %marker.collection, error = %e, "Failed to settle optimistic write");
        }
    }

    fn retire_temporary_id(&self, request: &OfflineRequest, confirmed: &Value) {
        let (Some(store), Some(marker)) = (&self.store, &request.optimistic_data) else {
            return;
        };
        let result = store.transaction(|tx| {
            let record = action::confirmed_record(confirmed, request.body.as_ref());
            action::retire_temporary_id(tx, &marker.collection, marker.local_id, record)
        });
        if let Err(e) = result {
            tracing::warn!(collection = %marker.collection, error = %e, "Failed to retire temporary record id");
        }
    }

    fn roll_back(&self, marker: &OptimisticMarker, reason: &str) {
        let Some(store) = &self.store else { return };
        let rows = [(marker.collection.clone(), marker.local_id)];
        if let Err(e) = store.transaction(|tx| action::roll_back(tx, &rows, reason).map(|_| ())) {
            tracing::warn!(collection = %marker.collection, error = %e, "Failed to roll back dropped write");
        }
    }
}

/// Per-item results of a batch response: the server's data for each item
/// that succeeded, `None` for each that did not. The whole result is `None`
/// when the response says nothing usable about individual items.
fn batch_results(response: &HttpResponse, count: usize) -> Option<Vec<Option<Value>>> {
    let parsed: Option<ActionResponse> = serde_json::from_value(response.body.clone()).ok();
    match parsed {
        Some(body) if !body.operations.is_empty() => Some(
            (0..count)
                .map(|i| {
                    body.operations
                        .iter()
                        .find(|op| op.index == i && op.success)
                        .map(|op| op.data.clone())
                })
                .collect(),
        ),
        _ if response.is_success() => Some(vec![Some(Value::Null); count]),
        _ => None,
    }
}
