//! Configuration loading for the bridge
//!
//! Settings are resolved in this order, later sources winning:
//! 1. Built-in defaults
//! 2. JSON file (`bridge.json` in the shared config directory, or an explicit path)
//! 3. Environment variables (`BRIDGE_*`)

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connector::ConnectorOptions;
use crate::naming::NamingPolicy;
use crate::updates::{DispatcherConfig, FailPolicy, OverflowPolicy};

/// Settings filename in the shared config directory
const CONFIG_FILE: &str = "bridge.json";

/// Database filename in the data directory when no path is configured
const DATABASE_FILE: &str = "bridge.sqlite";

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// SQLite database; defaults to the data directory
    pub database_path: Option<PathBuf>,
    /// First path segment of exclusive folders (empty: not configured)
    pub folder_prefix: String,
    /// First path segment of labels (empty: not configured)
    pub labels_prefix: String,
    pub delimiter: String,
    pub flush_interval_ms: u64,
    pub delivery_capacity: usize,
    pub pending_limit: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub fail_policy: FailPolicy,
    pub ack_timeout_ms: Option<u64>,
    pub resync_cooldown_secs: u64,
    /// Passphrase the engine uses to protect per-user data
    pub engine_passphrase: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            folder_prefix: String::new(),
            labels_prefix: String::new(),
            delimiter: "/".to_string(),
            flush_interval_ms: 1000,
            delivery_capacity: 100,
            pending_limit: None,
            overflow_policy: OverflowPolicy::Block,
            fail_policy: FailPolicy::FailClosed,
            ack_timeout_ms: None,
            resync_cooldown_secs: 0,
            engine_passphrase: String::new(),
        }
    }
}

impl BridgeConfig {
    /// Load from the default config file (if present), then the environment
    pub fn load() -> Result<Self> {
        let base = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        base.with_env()
    }

    /// Load from a specific JSON file, then the environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let base: Self = config::load_json_file(path)?;
        base.with_env()
    }

    /// Parse settings from a JSON string. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse bridge config JSON")
    }

    /// Apply `BRIDGE_*` environment variables
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup("BRIDGE_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(prefix) = lookup("BRIDGE_FOLDER_PREFIX") {
            self.folder_prefix = prefix;
        }
        if let Some(prefix) = lookup("BRIDGE_LABELS_PREFIX") {
            self.labels_prefix = prefix;
        }
        if let Some(delimiter) = lookup("BRIDGE_DELIMITER") {
            self.delimiter = delimiter;
        }
        if let Some(raw) = lookup("BRIDGE_FLUSH_INTERVAL_MS") {
            self.flush_interval_ms = parse_var("BRIDGE_FLUSH_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("BRIDGE_DELIVERY_CAPACITY") {
            self.delivery_capacity = parse_var("BRIDGE_DELIVERY_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("BRIDGE_PENDING_LIMIT") {
            self.pending_limit = Some(parse_var("BRIDGE_PENDING_LIMIT", &raw)?);
        }
        if let Some(raw) = lookup("BRIDGE_OVERFLOW_POLICY") {
            self.overflow_policy = parse_enum("BRIDGE_OVERFLOW_POLICY", &raw)?;
        }
        if let Some(raw) = lookup("BRIDGE_FAIL_POLICY") {
            self.fail_policy = parse_enum("BRIDGE_FAIL_POLICY", &raw)?;
        }
        if let Some(raw) = lookup("BRIDGE_ACK_TIMEOUT_MS") {
            self.ack_timeout_ms = Some(parse_var("BRIDGE_ACK_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("BRIDGE_RESYNC_COOLDOWN_SECS") {
            self.resync_cooldown_secs = parse_var("BRIDGE_RESYNC_COOLDOWN_SECS", &raw)?;
        }
        if let Some(passphrase) = lookup("BRIDGE_ENGINE_PASSPHRASE") {
            self.engine_passphrase = passphrase;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            bail!("Mailbox delimiter must not be empty");
        }
        if self.flush_interval_ms == 0 {
            bail!("flush_interval_ms must be positive");
        }
        if self.pending_limit == Some(0) {
            bail!("pending_limit must be positive when set");
        }
        Ok(())
    }

    /// Database location: the configured path, or the shared data directory
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| config::data_dir().map(|dir| dir.join(DATABASE_FILE)))
    }

    /// Get the default config file path (~/.config/mailbridge/bridge.json)
    pub fn default_config_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }

    pub fn naming_policy(&self) -> NamingPolicy {
        NamingPolicy::new(self.folder_prefix.clone(), self.labels_prefix.clone())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            delivery_capacity: self.delivery_capacity,
            pending_limit: self.pending_limit,
            overflow_policy: self.overflow_policy,
            fail_policy: self.fail_policy,
            ack_timeout: self.ack_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions {
            naming: self.naming_policy(),
            delimiter: self.delimiter.clone(),
            dispatcher: self.dispatcher_config(),
            resync_cooldown_secs: self.resync_cooldown_secs,
        }
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value {:?} for {}", raw, name))
}

/// Parse a snake_case enum the same way the JSON file spells it
fn parse_enum<T: serde::de::DeserializeOwned>(name: &str, raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
        .with_context(|| format!("Invalid value {:?} for {}", raw, name))
}
