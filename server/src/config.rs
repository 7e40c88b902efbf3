//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Bearer token clients must present; anonymous access when unset
    pub auth_secret: Option<String>,
    /// Collections served, in declaration order
    pub collections: Vec<String>,
    /// Version of the published schema
    pub schema_version: u32,
    /// Migration batch, the first half of the database version
    pub migration_batch: u32,
    /// Actions accepted by `POST /actions/{name}`; any name when empty
    pub actions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            auth_secret: None,
            collections: vec!["todos".to_string()],
            schema_version: 1,
            migration_batch: 1,
            actions: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);

        let port = match lookup("PORT") {
            Some(port) => port.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let auth_secret = lookup("AUTH_SECRET").filter(|s| !s.is_empty());

        let collections = match lookup("COLLECTIONS") {
            Some(list) => split_list(&list),
            None => defaults.collections,
        };
        if collections.is_empty() {
            return Err(ConfigError::NoCollections);
        }

        let schema_version = match lookup("SCHEMA_VERSION") {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("SCHEMA_VERSION"))?,
            None => defaults.schema_version,
        };

        let migration_batch = match lookup("MIGRATION_BATCH") {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("MIGRATION_BATCH"))?,
            None => defaults.migration_batch,
        };

        let actions = lookup("ACTIONS")
            .map(|list| split_list(&list))
            .unwrap_or_default();

        Ok(Self {
            host,
            port,
            auth_secret,
            collections,
            schema_version,
            migration_batch,
            actions,
        })
    }

    /// `"<batch>_<collection count>"`, published as the database version.
    pub fn database_version(&self) -> String {
        format!("{}_{}", self.migration_batch, self.collections.len())
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value")]
    InvalidNumber(&'static str),

    #[error("COLLECTIONS must name at least one collection")]
    NoCollections,
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
    fn defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database_version(), "1_1");
    }

    #[test]
    fn reads_lists_and_numbers() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("COLLECTIONS", "todos, projects,,users"),
            ("SCHEMA_VERSION", "4"),
            ("MIGRATION_BATCH", "7"),
            ("ACTIONS", "create_todo,archive"),
            ("AUTH_SECRET", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.collections, vec!["todos", "projects", "users"]);
        assert_eq!(config.database_version(), "7_3");
        assert_eq!(config.actions, vec!["create_todo", "archive"]);
        assert_eq!(config.auth_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            Config::from_lookup(lookup(&[("PORT", "http")])),
            Err(ConfigError::InvalidPort)
        );
        assert_eq!(
            Config::from_lookup(lookup(&[("SCHEMA_VERSION", "-1")])),
            Err(ConfigError::InvalidNumber("SCHEMA_VERSION"))
        );
        assert_eq!(
            Config::from_lookup(lookup(&[("COLLECTIONS", " , ")])),
            Err(ConfigError::NoCollections)
        );
    }
}
