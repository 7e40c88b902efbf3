//! Engine configuration.

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every engine component.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Owner of cursors and cached versions
    pub user_id: String,
    /// Server base URL used by the HTTP transport
    pub base_url: Option<String>,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Directory for the store snapshot and engine state files
    pub data_dir: Option<PathBuf>,
    /// Attempts per offline request before it is dropped
    pub max_retries: u32,
    /// Pause between individually replayed offline requests
    pub replay_delay: Duration,
    /// Resources whose queued writes may be sent as one batch
    pub batchable_resources: BTreeSet<String>,
    /// Entries kept in the failed-event journal
    pub failed_journal_capacity: usize,
    /// Path of the action catalog endpoint
    pub action_catalog_path: String,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: "guest".to_string(),
            base_url: None,
            auth_token: None,
            data_dir: None,
            max_retries: 3,
            replay_delay: Duration::from_millis(100),
            batchable_resources: BTreeSet::new(),
            failed_journal_capacity: 100,
            action_catalog_path: "actions".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_replay_delay(mut self, delay: Duration) -> Self {
        self.replay_delay = delay;
        self
    }

    /// Allow queued writes to `resource` to be batched.
    pub fn with_batchable_resource(mut self, resource: impl Into<String>) -> Self {
        self.batchable_resources.insert(resource.into());
        self
    }

    pub fn with_failed_journal_capacity(mut self, capacity: usize) -> Self {
        self.failed_journal_capacity = capacity;
        self
    }

    /// Location of the store snapshot file, if persistence is enabled.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("store.json"))
    }

    /// Location of the engine state file, if persistence is enabled.
    pub fn state_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("state.json"))
    }

    /// Load configuration from the environment (and a `.env` file if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(user_id) = lookup("HARMONY_USER_ID") {
            config.user_id = user_id;
        }

        if let Some(base_url) = lookup("HARMONY_BASE_URL") {
            url::Url::parse(&base_url).map_err(|_| ConfigError::InvalidBaseUrl(base_url.clone()))?;
            config.base_url = Some(base_url);
        }

        config.auth_token = lookup("HARMONY_AUTH_TOKEN");
        config.data_dir = lookup("HARMONY_DATA_DIR").map(PathBuf::from);

        if let Some(value) = lookup("HARMONY_MAX_RETRIES") {
            config.max_retries = value
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("HARMONY_MAX_RETRIES"))?;
        }

        if let Some(value) = lookup("HARMONY_REPLAY_DELAY_MS") {
            let millis: u64 = value
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("HARMONY_REPLAY_DELAY_MS"))?;
            config.replay_delay = Duration::from_millis(millis);
        }

        if let Some(value) = lookup("HARMONY_BATCHABLE_RESOURCES") {
            config.batchable_resources = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(value) = lookup("HARMONY_FAILED_JOURNAL_CAPACITY") {
            config.failed_journal_capacity = value
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("HARMONY_FAILED_JOURNAL_CAPACITY"))?;
        }

        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid HARMONY_BASE_URL value: {0}")]
    InvalidBaseUrl(String),

    #[error("Invalid {0} value")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.replay_delay, Duration::from_millis(100));
        assert!(config.store_path().is_none());
    }

    #[test]
    fn reads_variables() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("HARMONY_USER_ID", "u42"),
            ("HARMONY_BASE_URL", "https://api.example.com/harmony/"),
            ("HARMONY_DATA_DIR", "/tmp/harmony"),
            ("HARMONY_MAX_RETRIES", "5"),
            ("HARMONY_REPLAY_DELAY_MS", "0"),
            ("HARMONY_BATCHABLE_RESOURCES", "messages, comments,"),
        ]))
        .unwrap();

        assert_eq!(config.user_id, "u42");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.replay_delay, Duration::ZERO);
        assert_eq!(
            config.batchable_resources,
            ["comments", "messages"].into_iter().map(String::from).collect()
        );
        assert_eq!(
            config.state_path(),
            Some(PathBuf::from("/tmp/harmony/state.json"))
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            EngineConfig::from_lookup(lookup(&[("HARMONY_MAX_RETRIES", "many")])),
            Err(ConfigError::InvalidNumber("HARMONY_MAX_RETRIES"))
        );
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("HARMONY_BASE_URL", "not a url")])),
            Err(ConfigError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn builder() {
        let config = EngineConfig::new("alice")
            .with_base_url("http://localhost:3000")
            .with_max_retries(1)
            .with_batchable_resource("messages");
        assert_eq!(config.user_id, "alice");
        assert!(config.batchable_resources.contains("messages"));
    }
}
