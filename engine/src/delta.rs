//! Delta log entries.
//!
//! Every optimistic or offline write appends a delta row describing the
//! intended mutation. The row's sync status tracks what the server said
//! about it, which drives replay and rollback.

use crate::{record, RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// Auto-increment key of a delta row within its table.
pub type LocalId = u64;

/// Kind of mutation a delta row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOperation {
    Create,
    Update,
    Delete,
}

impl DeltaOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaOperation::Create => "create",
            DeltaOperation::Update => "update",
            DeltaOperation::Delete => "delete",
        }
    }

    /// Parse the lowercase wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create" => Some(DeltaOperation::Create),
            "update" => Some(DeltaOperation::Update),
            "delete" => Some(DeltaOperation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeltaOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side fate of a delta row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Applied locally, not yet confirmed.
    Pending,
    /// Confirmed by the server.
    Synced,
    /// Transport failure; eligible for replay.
    Failed,
    /// Explicitly refused by the server; rolled back.
    Rejected,
}

impl SyncStatus {
    /// Synced and rejected rows never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced | SyncStatus::Rejected)
    }

    /// Rows still waiting for the server (pending or failed).
    pub fn is_unresolved(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether a row in this status may move to `next`.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        !self.is_terminal() && next != SyncStatus::Pending
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// One row of a collection's write log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEntry {
    /// Assigned by the delta table on append
    #[serde(default)]
    pub local_id: LocalId,
    pub operation: DeltaOperation,
    /// Record data as sent by the caller
    pub data: serde_json::Value,
    pub sync_status: SyncStatus,
    /// Milliseconds since epoch when the intent was recorded
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<String>,
}

impl DeltaEntry {
    /// Create a pending entry.
    pub fn pending(
        operation: DeltaOperation,
        data: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            local_id: 0,
            operation,
            data,
            sync_status: SyncStatus::Pending,
            timestamp,
            action_name: None,
            action_data: None,
            rejected_reason: None,
        }
    }

    /// Tag the entry with the action that produced it.
    pub fn with_action(
        mut self,
        action_name: impl Into<String>,
        action_data: Option<serde_json::Value>,
    ) -> Self {
        self.action_name = Some(action_name.into());
        self.action_data = action_data;
        self
    }

    /// Id of the record this entry touches.
    pub fn record_id(&self) -> Option<RecordId> {
        record::record_id(&self.data)
    }
}
