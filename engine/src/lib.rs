//! # Harmony Engine
//!
//! An offline-first client sync engine.
//!
//! The engine keeps a local replica of server-side collections, lets the
//! application write optimistically while offline, and reconciles with the
//! server's ordered change log once connectivity returns.
//!
//! ## Core Concepts
//!
//! ### Tables
//!
//! Every collection is backed by three tables in the [`LocalStore`]:
//! - `base` - the last server-confirmed state
//! - `<name>_shadow` - optimistic overrides written locally
//! - `<name>_delta` - one row per pending local write ([`DeltaEntry`])
//!
//! ### Reads
//!
//! The [`QueryOverlay`] merges shadow rows over base rows and hides records
//! with a pending delete, so readers see their own writes immediately.
//!
//! ### Writes
//!
//! The [`OptimisticWriteCoordinator`] applies action intents to the shadow
//! tables, calls the server, and either confirms or rolls back. Raw HTTP
//! writes made while offline wait in the [`OfflineRequestQueue`].
//!
//! ### Sync
//!
//! The [`SyncEngine`] fetches the remote schema, rebuilds the store when the
//! schema or database version changes, and applies [`Harmonic`] change
//! events pulled in batches or pushed one at a time. Per-collection cursors
//! record how far each collection has been applied.
//!
//! ## Quick Start
//!
//! ```rust
//! use harmony_engine::{
//!     ActionOptions, ColumnSpec, EngineConfig, MockTransport, RemoteSchema, SyncEngine,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> harmony_engine::error::Result<()> {
//! // 1. A transport; HttpTransport talks to a real server
//! let transport = Arc::new(MockTransport::new());
//! transport.set_schema(RemoteSchema {
//!     schema: [("todos".to_string(), ColumnSpec::Indexes("++id, title".into()))].into(),
//!     schema_version: 1,
//!     database_version: "1_1".into(),
//!     generated_at: None,
//! });
//!
//! // 2. Build and start the engine
//! let engine = SyncEngine::builder()
//!     .config(EngineConfig::new("user_1"))
//!     .transport(transport)
//!     .build()?;
//! engine.start().await?;
//!
//! // 3. Write through an action
//! engine
//!     .actions()
//!     .execute_action(
//!         "create_todo",
//!         |a| {
//!             a.create("todos", json!({"id": "t1", "title": "Buy milk"}));
//!             None
//!         },
//!         ActionOptions::new(),
//!     )
//!     .await?;
//!
//! // 4. Read the merged view
//! let todos = engine.records("todos")?;
//! assert_eq!(todos[0]["title"], "Buy milk");
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! With a `data_dir` configured the store is written to `store.json` as a
//! [`StoreSnapshot`] after every transaction, and cursors, versions and the
//! offline queue live in `state.json` through [`FileStateStore`].

pub mod action;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod harmonic;
pub mod http;
pub mod overlay;
pub mod queue;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod transport;
pub mod validation;

// Re-export main types at crate root
pub use action::{
    ActionCollector, ActionOptions, OptimisticWriteCoordinator, ReplaySummary, WriteOutcome,
    WriteRequest,
};
pub use config::{ConfigError, EngineConfig};
pub use delta::{DeltaEntry, DeltaOperation, LocalId, SyncStatus};
pub use engine::{
    BatchOutcome, FailedHarmonic, HarmonicOutcome, RebuildOutcome, ReconnectReport, SyncEngine,
    SyncEngineBuilder, SyncNotification, SyncReport, SyncState,
};
pub use error::{Error, StorageError, ValidationErrors};
pub use harmonic::{Harmonic, HarmonicId};
pub use http::HttpTransport;
pub use overlay::{LiveQuery, Query, QueryOverlay};
pub use queue::{OfflineRequest, OfflineRequestQueue, OptimisticMarker, QueueReport};
pub use schema::{ColumnSpec, KnownVersions, RebuildReason, RemoteSchema, VersionPair};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::{FileStateStore, MemoryStateStore, StateStore};
pub use store::{LocalStore, TableKind};
pub use transport::{
    ActionOperation, ActionPayload, ActionResponse, Connectivity, HttpResponse, MockTransport,
    OutboundRequest, RemoteActionTransport, RequestTransport, SyncTransport,
};
pub use validation::{FieldRules, Rule, ValidationSchema};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
