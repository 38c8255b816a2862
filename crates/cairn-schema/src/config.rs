use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the transaction engine, watcher and presence subsystems.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub txn: TxnSection,
    #[serde(default)]
    pub watcher: WatcherSection,
    #[serde(default)]
    pub presence: PresenceSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TxnSection {
    /// Attempts before a lost race or a store failure is surfaced.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts; doubled on every retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// How long a document stamped by another in-flight transaction is waited
    /// on before that transaction is aborted.
    #[serde(default = "default_conflict_wait_ms")]
    pub conflict_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WatcherSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Entries retained by the capped change log.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PresenceSection {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// An agent is dead once no ping arrived for this many ping intervals.
    #[serde(default = "default_grace_multiplier")]
    pub grace_multiplier: u32,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    10
}
fn default_conflict_wait_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_log_capacity() -> usize {
    10_000
}
fn default_ping_interval_ms() -> u64 {
    1000
}
fn default_grace_multiplier() -> u32 {
    3
}

impl Default for TxnSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            conflict_wait_ms: default_conflict_wait_ms(),
        }
    }
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            grace_multiplier: default_grace_multiplier(),
        }
    }
}

impl TxnSection {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn conflict_wait(&self) -> Duration {
        Duration::from_millis(self.conflict_wait_ms)
    }
}

impl WatcherSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PresenceSection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn grace(&self) -> Duration {
        self.ping_interval() * self.grace_multiplier
    }
}

impl StateConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.txn.max_attempts == 0 {
            return Err(ConfigError::Invalid("txn.max_attempts must be at least 1".to_owned()));
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watcher.poll_interval_ms must be positive".to_owned(),
            ));
        }
        if self.watcher.log_capacity == 0 {
            return Err(ConfigError::Invalid("watcher.log_capacity must be positive".to_owned()));
        }
        if self.presence.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "presence.ping_interval_ms must be positive".to_owned(),
            ));
        }
        if self.presence.grace_multiplier < 2 {
            return Err(ConfigError::Invalid(
                "presence.grace_multiplier must be at least 2".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Attributes the environment itself understands. Anything else is an
/// unknown attribute and is propagated to the shared settings on connect.
pub const KNOWN_ENVIRON_ATTRS: &[&str] = &[
    "name",
    "type",
    "admin-secret",
    "authorized-keys",
    "ca-cert",
    "ca-private-key",
    "default-series",
    "state-server",
];

/// Local environment configuration, as read from an environments file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironConfig {
    attrs: Map<String, Value>,
}

impl EnvironConfig {
    pub fn from_attrs(attrs: Map<String, Value>) -> Result<Self, ConfigError> {
        let config = Self { attrs };
        if config.name().is_empty() {
            return Err(ConfigError::Invalid("environment name is missing".to_owned()));
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content)?;
        let value = serde_json::to_value(table)
            .map_err(|e| ConfigError::Invalid(format!("cannot convert attributes: {e}")))?;
        match value {
            Value::Object(attrs) => Self::from_attrs(attrs),
            _ => Err(ConfigError::Invalid("attributes must be a table".to_owned())),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn str_attr(&self, key: &str) -> &str {
        self.attrs.get(key).and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.str_attr("name")
    }

    pub fn env_type(&self) -> &str {
        self.str_attr("type")
    }

    /// The admin secret, or `None` when absent or empty.
    pub fn admin_secret(&self) -> Option<&str> {
        Some(self.str_attr("admin-secret")).filter(|s| !s.is_empty())
    }

    pub fn all_attrs(&self) -> &Map<String, Value> {
        &self.attrs
    }

    pub fn unknown_attrs(&self) -> Map<String, Value> {
        self.attrs
            .iter()
            .filter(|(k, _)| !KNOWN_ENVIRON_ATTRS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn without_attr(mut self, key: &str) -> Self {
        self.attrs.remove(key);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = StateConfig::from_toml_str("").unwrap();
        assert_eq!(config.txn.max_attempts, 3);
        assert_eq!(config.presence.grace_multiplier, 3);
        assert_eq!(config.presence.grace(), Duration::from_millis(3000));
        assert_eq!(config, StateConfig::default());
    }

    #[test]
    fn partial_sections_override() {
        let config = StateConfig::from_toml_str(
            "[txn]\nmax_attempts = 5\n[presence]\nping_interval_ms = 50\n",
        )
        .unwrap();
        assert_eq!(config.txn.max_attempts, 5);
        assert_eq!(config.txn.backoff_ms, 10);
        assert_eq!(config.presence.grace(), Duration::from_millis(150));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(StateConfig::from_toml_str("[txn]\nretries = 2\n").is_err());
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(StateConfig::from_toml_str("[txn]\nmax_attempts = 0\n").is_err());
        assert!(StateConfig::from_toml_str("[presence]\ngrace_multiplier = 1\n").is_err());
        assert!(StateConfig::from_toml_str("[watcher]\nlog_capacity = 0\n").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.toml");
        fs::write(&path, "[watcher]\npoll_interval_ms = 25\n").unwrap();
        let config = StateConfig::load(&path).unwrap();
        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn environ_unknown_attrs() {
        let env = EnvironConfig::from_toml_str(
            "name = \"erewhemos\"\ntype = \"dummy\"\nadmin-secret = \"really\"\nsecret = \"pork\"\n",
        )
        .unwrap();
        assert_eq!(env.name(), "erewhemos");
        assert_eq!(env.env_type(), "dummy");
        assert_eq!(env.admin_secret(), Some("really"));
        let unknown = env.unknown_attrs();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown["secret"], "pork");
    }

    #[test]
    fn environ_requires_name() {
        assert!(EnvironConfig::from_toml_str("type = \"dummy\"\n").is_err());
    }

    #[test]
    fn environ_attr_builders() {
        let env = EnvironConfig::from_toml_str("name = \"e\"\nadmin-secret = \"s\"\n")
            .unwrap()
            .without_attr("admin-secret")
            .with_attr("secret", "squirrel");
        assert_eq!(env.admin_secret(), None);
        assert_eq!(env.unknown_attrs()["secret"], "squirrel");
    }
}
