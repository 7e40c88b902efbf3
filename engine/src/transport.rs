//! Transport layer abstraction for talking to the server.
//!
//! The engine consumes three narrow async traits. [`crate::http::HttpTransport`]
//! implements all of them over HTTP; [`MockTransport`] implements them in
//! process for tests.

use crate::{
    delta::DeltaOperation,
    error::{Result, ValidationErrors},
    harmonic::{Harmonic, HarmonicId},
    schema::RemoteSchema,
    CollectionName, Error,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// `GET sync/{collection}?initial=true` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default)]
    pub latest_harmonic_id: Option<HarmonicId>,
}

/// `GET sync/{collection}?after={id}` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarmonicsResponse {
    #[serde(default)]
    pub harmonics: Vec<Harmonic>,
    #[serde(default)]
    pub latest_harmonic_id: Option<HarmonicId>,
}

/// One intent inside an action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOperation {
    pub table: CollectionName,
    pub operation: DeltaOperation,
    pub data: Value,
}

/// `POST actions/{name}` request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub operations: Vec<ActionOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outcome of one operation of an action or batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub index: usize,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl ActionSummary {
    pub fn from_results(results: &[OperationResult]) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            successful,
            failed: results.len() - successful,
        }
    }
}

/// Response family shared by `actions/{name}` and `write/{collection}/{action}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub operations: Vec<OperationResult>,
    #[serde(default)]
    pub summary: ActionSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<ValidationErrors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set on responses synthesized for work deferred while offline
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub queued: bool,
}

impl ActionResponse {
    /// A response in which every operation succeeded.
    pub fn accepted(operations: &[ActionOperation]) -> Self {
        let results: Vec<OperationResult> = operations
            .iter()
            .enumerate()
            .map(|(index, op)| OperationResult {
                success: true,
                index,
                operation: op.operation.as_str().to_string(),
                data: op.data.clone(),
                error: None,
            })
            .collect();
        Self {
            success: true,
            summary: ActionSummary::from_results(&results),
            operations: results,
            validation_errors: None,
            message: None,
            queued: false,
        }
    }

    /// The success response returned when work is deferred while offline.
    pub fn queued(operations: &[ActionOperation]) -> Self {
        Self {
            queued: true,
            ..Self::accepted(operations)
        }
    }

    /// A refusal with a message and no applied operations.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            operations: Vec::new(),
            summary: ActionSummary::default(),
            validation_errors: None,
            message: Some(message.into()),
            queued: false,
        }
    }

    /// True when the server refused the action.
    pub fn is_rejection(&self) -> bool {
        !self.success || self.validation_errors.as_ref().is_some_and(|v| !v.is_empty())
    }

    /// Human-readable reason for a refusal.
    pub fn rejection_reason(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        if let Some(errors) = self.validation_errors.as_ref().filter(|v| !v.is_empty()) {
            return errors.to_string();
        }
        self.operations
            .iter()
            .find_map(|op| op.error.clone())
            .unwrap_or_else(|| "rejected by server".to_string())
    }
}

/// A generic outbound HTTP request, as cached by the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Path relative to the base URL, or an absolute URL
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pull side of the replication protocol.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn fetch_schema(&self) -> Result<RemoteSchema>;

    /// Full contents of a collection plus the log position they reflect.
    async fn fetch_snapshot(&self, collection: &str) -> Result<SnapshotResponse>;

    /// Harmonics of a collection strictly after `after`.
    async fn fetch_after(&self, collection: &str, after: &HarmonicId) -> Result<HarmonicsResponse>;
}

/// Named remote procedure calls.
///
/// Implementations return `Ok` whenever the server answered with an action
/// response body, including refusals; `Err` is reserved for transport
/// failures and unexpected statuses.
#[async_trait]
pub trait RemoteActionTransport: Send + Sync {
    async fn execute(&self, name: &str, payload: &ActionPayload) -> Result<ActionResponse>;
}

/// Raw request replay for the offline queue.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<HttpResponse>;
}

/// Shared online/offline flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            state: Arc::new(watch::channel(online).0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn set_online(&self, online: bool) {
        self.state.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    /// Observe transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// In-process transport for testing.
///
/// Holds a schema, per-collection snapshots and harmonic logs, and scripted
/// responses for actions and raw requests. Unscripted actions and requests
/// succeed.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    schema: Mutex<Option<RemoteSchema>>,
    snapshots: Mutex<HashMap<CollectionName, SnapshotResponse>>,
    harmonics: Mutex<HashMap<CollectionName, Vec<Harmonic>>>,
    failing: Mutex<HashSet<CollectionName>>,
    action_responses: Mutex<VecDeque<Result<ActionResponse>>>,
    request_responses: Mutex<VecDeque<Result<HttpResponse>>>,
    executed: Mutex<Vec<(String, ActionPayload)>>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            schema: Mutex::new(None),
            snapshots: Mutex::new(HashMap::new()),
            harmonics: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            action_responses: Mutex::new(VecDeque::new()),
            request_responses: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// While disconnected every call fails with a network error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_schema(&self, schema: RemoteSchema) {
        *self.schema.lock() = Some(schema);
    }

    pub fn set_snapshot(&self, collection: &str, snapshot: SnapshotResponse) {
        self.snapshots.lock().insert(collection.to_string(), snapshot);
    }

    /// Append harmonics to a collection's log.
    pub fn push_harmonics(&self, collection: &str, harmonics: Vec<Harmonic>) {
        self.harmonics
            .lock()
            .entry(collection.to_string())
            .or_default()
            .extend(harmonics);
    }

    /// Make pulls of a collection fail with a server error.
    pub fn fail_collection(&self, collection: &str) {
        self.failing.lock().insert(collection.to_string());
    }

    /// Queue the response for the next action call.
    pub fn respond_to_action(&self, response: Result<ActionResponse>) {
        self.action_responses.lock().push_back(response);
    }

    /// Queue the response for the next raw request.
    pub fn respond_to_request(&self, response: Result<HttpResponse>) {
        self.request_responses.lock().push_back(response);
    }

    /// Action calls received so far.
    pub fn executed(&self) -> Vec<(String, ActionPayload)> {
        self.executed.lock().clone()
    }

    /// Raw requests received so far.
    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Network("mock transport disconnected".into()))
        }
    }

    fn check_collection(&self, collection: &str) -> Result<()> {
        self.check_connected()?;
        if self.failing.lock().contains(collection) {
            return Err(Error::Http {
                status: 500,
                message: format!("sync of {collection} failed"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn fetch_schema(&self) -> Result<RemoteSchema> {
        self.check_connected()?;
        self.schema
            .lock()
            .clone()
            .ok_or_else(|| Error::Decode("no mock schema set".into()))
    }

    async fn fetch_snapshot(&self, collection: &str) -> Result<SnapshotResponse> {
        self.check_collection(collection)?;
        Ok(self
            .snapshots
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_after(&self, collection: &str, after: &HarmonicId) -> Result<HarmonicsResponse> {
        self.check_collection(collection)?;
        let log = self.harmonics.lock();
        let mut harmonics: Vec<Harmonic> = log
            .get(collection)
            .map(|all| all.iter().filter(|h| h.id > *after).cloned().collect())
            .unwrap_or_default();
        harmonics.sort_by(|a, b| a.id.cmp(&b.id));
        let latest_harmonic_id = harmonics.last().map(|h| h.id.clone());
        Ok(HarmonicsResponse {
            harmonics,
            latest_harmonic_id,
        })
    }
}

#[async_trait]
impl RemoteActionTransport for MockTransport {
    async fn execute(&self, name: &str, payload: &ActionPayload) -> Result<ActionResponse> {
        self.check_connected()?;
        self.executed
            .lock()
            .push((name.to_string(), payload.clone()));
        match self.action_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(ActionResponse::accepted(&payload.operations)),
        }
    }
}

#[async_trait]
impl RequestTransport for MockTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<HttpResponse> {
        self.check_connected()?;
        self.sent.lock().push(request.clone());
        if let Some(response) = self.request_responses.lock().pop_front() {
            return response;
        }
        let items = request
            .body
            .as_ref()
            .and_then(|b| b.get("items"))
            .and_then(Value::as_array)
            .map(Vec::len);
        let body = match items {
            Some(count) => {
                let results: Vec<OperationResult> = (0..count)
                    .map(|index| OperationResult {
                        success: true,
                        index,
                        operation: String::new(),
                        data: Value::Null,
                        error: None,
                    })
                    .collect();
                serde_json::to_value(ActionResponse {
                    success: true,
                    summary: ActionSummary::from_results(&results),
                    operations: results,
                    validation_errors: None,
                    message: None,
                    queued: false,
                })?
            }
            None => serde_json::json!({ "success": true }),
        };
        Ok(HttpResponse { status: 200, body })
    }
}
