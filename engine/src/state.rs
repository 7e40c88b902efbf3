//! Persisted client state kept outside the local store.
//!
//! Sync cursors and last-seen versions must survive a store rebuild, so they
//! live in a separate key/value store together with the offline request
//! queue and the failed-event journal.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Key/value persistence for engine state.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

impl dyn StateStore {
    /// Read and deserialize a value.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::State(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    /// Serialize and write a value.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?)
    }
}

/// Key layout of persisted state.
pub mod keys {
    pub const OFFLINE_REQUESTS: &str = "offline_requests";
    pub const FAILED_HARMONICS: &str = "failed_harmonics";

    pub fn cursor_prefix(user: &str) -> String {
        format!("sync_cursor:{user}:")
    }

    pub fn cursor(user: &str, collection: &str) -> String {
        format!("sync_cursor:{user}:{collection}")
    }

    pub fn schema_version(user: &str) -> String {
        format!("schema_version:{user}")
    }

    pub fn database_version(user: &str) -> String {
        format!("database_version:{user}")
    }
}

/// In-memory state, lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// State persisted as one JSON document on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new document.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStateStore {
    /// Open (or create) the state file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| Error::State(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::State(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        write_atomically(&self.path, &serde_json::to_vec_pretty(entries)?)
            .map_err(|e| Error::State(format!("{}: {e}", self.path.display())))
    }
}

/// Write `bytes` to `path` via a temporary file and rename.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_typed_roundtrip() {
        let store: Box<dyn StateStore> = Box::new(MemoryStateStore::new());
        store.save(&keys::cursor("u1", "todos"), &"42").unwrap();
        store.save(&keys::cursor("u1", "posts"), &"7").unwrap();
        store.save(&keys::cursor("u2", "todos"), &"1").unwrap();

        let cursor: Option<String> = store.load(&keys::cursor("u1", "todos")).unwrap();
        assert_eq!(cursor.as_deref(), Some("42"));
        assert_eq!(
            store.keys_with_prefix(&keys::cursor_prefix("u1")).unwrap(),
            vec!["sync_cursor:u1:posts", "sync_cursor:u1:todos"]
        );

        store.remove(&keys::cursor("u1", "todos")).unwrap();
        assert!(store.get(&keys::cursor("u1", "todos")).unwrap().is_none());
    }

    #[test]
    fn load_type_mismatch_is_state_error() {
        let store: Box<dyn StateStore> = Box::new(MemoryStateStore::new());
        store.set("k", json!({"not": "a number"})).unwrap();
        let result: Result<Option<u32>> = store.load("k");
        assert!(matches!(result, Err(Error::State(_))));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("engine.json");

        {
            let store = FileStateStore::open(&path).unwrap();
            store.set(&keys::schema_version("u1"), json!(3)).unwrap();
            store.set("transient", json!(true)).unwrap();
            store.remove("transient").unwrap();
        }

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(&keys::schema_version("u1")).unwrap(),
            Some(json!(3))
        );
        assert!(reopened.get("transient").unwrap().is_none());
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(matches!(FileStateStore::open(&path), Err(Error::State(_))));
    }
}
