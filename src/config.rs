//! # Configuration Management
//!
//! Node configuration is a frozen struct built through `NodeConfigBuilder`.
//! Values come from a TOML file via the `config` crate, then `MERKLE_KV_*`
//! environment variables are layered on top, then the whole thing is
//! validated once in `NodeConfigBuilder::build()`; invalid values never
//! escape as a panic, only as `Error::Validation`.
//!
//! ## Example Configuration File (config.toml)
//! ```toml
//! host = "broker.example.com"
//! port = 8883
//! use_tls = true
//! client_id = "edge-phone-042"
//! node_id = "edge-phone-042"
//! topic_prefix = "merkle_kv"
//! persistence_enabled = true
//! storage_path = "data/edge-phone-042.journal"
//! ```

use crate::error::Error;
use crate::model::{validate_node_id, MAX_KEY_BYTES};
use anyhow::Context;
use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Whether this node may publish/subscribe replication traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationAccess {
    None,
    Read,
    ReadWrite,
}

impl Default for ReplicationAccess {
    fn default() -> Self {
        ReplicationAccess::ReadWrite
    }
}

/// Frozen node configuration. Construct via [`NodeConfigBuilder`]; every
/// field here has already passed validation by the time a caller holds one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,

    pub client_id: String,
    pub node_id: String,
    /// Credentials are optional, but when present TLS is mandatory (§4.A).
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_session_expiry_seconds")]
    pub session_expiry_seconds: u64,
    #[serde(default = "default_connection_timeout_seconds")]
    pub connection_timeout_seconds: u64,

    #[serde(default = "default_skew_max_future_ms")]
    pub skew_max_future_ms: u64,
    #[serde(default = "default_tombstone_retention_hours")]
    pub tombstone_retention_hours: u64,

    #[serde(default)]
    pub persistence_enabled: bool,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    #[serde(default)]
    pub replication_access: ReplicationAccess,
    #[serde(default)]
    pub is_controller: bool,

    #[serde(default = "default_max_queued_ops")]
    pub max_queued_ops: usize,
    #[serde(default = "default_queue_max_age_seconds")]
    pub queue_max_age_seconds: u64,
    #[serde(default = "default_queue_batch_size")]
    pub queue_batch_size: usize,
}

fn default_topic_prefix() -> String {
    "merkle_kv".to_string()
}
fn default_keep_alive_seconds() -> u64 {
    60
}
fn default_session_expiry_seconds() -> u64 {
    86_400
}
fn default_connection_timeout_seconds() -> u64 {
    20
}
fn default_skew_max_future_ms() -> u64 {
    crate::model::DEFAULT_SKEW_MAX_FUTURE_MS
}
fn default_tombstone_retention_hours() -> u64 {
    crate::model::DEFAULT_TOMBSTONE_RETENTION_HOURS
}
fn default_storage_path() -> String {
    "data/merkle_kv.journal".to_string()
}
fn default_max_queued_ops() -> usize {
    10_000
}
fn default_queue_max_age_seconds() -> u64 {
    7 * 24 * 3600
}
fn default_queue_batch_size() -> usize {
    50
}

impl NodeConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn queue_max_age(&self) -> Duration {
        Duration::from_secs(self.queue_max_age_seconds)
    }

    /// Load and validate a `NodeConfig` from a TOML file, with
    /// `MERKLE_KV_*` environment overrides layered on top.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("MERKLE_KV").separator("__"))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let config: NodeConfig = settings
            .try_deserialize()
            .context("deserializing node config")?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Normalize and validate a fully-populated config. `load` and
    /// `NodeConfigBuilder::build` both funnel through this so there is one
    /// place the §4.A rules are enforced.
    fn validate(&self) -> Result<(), String> {
        validate_node_id(&self.client_id).map_err(|e| format!("client_id: {e}"))?;
        validate_node_id(&self.node_id).map_err(|e| format!("node_id: {e}"))?;

        if (self.username.is_some() || self.password.is_some()) && !self.use_tls {
            return Err("use_tls must be true when credentials are set".to_string());
        }

        if self.topic_prefix.len() > MAX_KEY_BYTES {
            return Err(format!(
                "topic_prefix must be at most {} bytes",
                MAX_KEY_BYTES
            ));
        }

        Ok(())
    }
}

/// Builds a [`NodeConfig`] from explicit field assignments, defaults, and
/// `MERKLE_KV_*` environment overrides, validating once at `build()`.
#[derive(Debug, Clone)]
pub struct NodeConfigBuilder {
    host: String,
    port: u16,
    use_tls: bool,
    client_id: String,
    node_id: String,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: String,
    keep_alive_seconds: u64,
    session_expiry_seconds: u64,
    connection_timeout_seconds: u64,
    skew_max_future_ms: u64,
    tombstone_retention_hours: u64,
    persistence_enabled: bool,
    storage_path: String,
    replication_access: ReplicationAccess,
    is_controller: bool,
    max_queued_ops: usize,
    queue_max_age_seconds: u64,
    queue_batch_size: usize,
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            use_tls: false,
            client_id: String::new(),
            node_id: String::new(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            keep_alive_seconds: default_keep_alive_seconds(),
            session_expiry_seconds: default_session_expiry_seconds(),
            connection_timeout_seconds: default_connection_timeout_seconds(),
            skew_max_future_ms: default_skew_max_future_ms(),
            tombstone_retention_hours: default_tombstone_retention_hours(),
            persistence_enabled: false,
            storage_path: default_storage_path(),
            replication_access: ReplicationAccess::ReadWrite,
            is_controller: false,
            max_queued_ops: default_max_queued_ops(),
            queue_max_age_seconds: default_queue_max_age_seconds(),
            queue_batch_size: default_queue_batch_size(),
        }
    }
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.$name = value;
            self
        }
    };
}

impl NodeConfigBuilder {
    pub fn new(client_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    setter!(host, String);
    setter!(port, u16);
    setter!(use_tls, bool);
    setter!(topic_prefix, String);
    setter!(keep_alive_seconds, u64);
    setter!(session_expiry_seconds, u64);
    setter!(connection_timeout_seconds, u64);
    setter!(skew_max_future_ms, u64);
    setter!(tombstone_retention_hours, u64);
    setter!(persistence_enabled, bool);
    setter!(storage_path, String);
    setter!(replication_access, ReplicationAccess);
    setter!(is_controller, bool);
    setter!(max_queued_ops, usize);
    setter!(queue_max_age_seconds, u64);
    setter!(queue_batch_size, usize);

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Layer `MERKLE_KV_*` environment overrides onto the builder. Mirrors
    /// the teacher's single `CLIENT_PASSWORD` override, generalized to every
    /// field via a uniform prefix instead of one hardcoded variable.
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("MERKLE_KV_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("MERKLE_KV_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("MERKLE_KV_USE_TLS") {
            self.use_tls = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("MERKLE_KV_USERNAME") {
            self.username = Some(v);
        }
        if let Ok(v) = std::env::var("MERKLE_KV_PASSWORD") {
            self.password = Some(v);
        }
        if let Ok(v) = std::env::var("MERKLE_KV_TOPIC_PREFIX") {
            self.topic_prefix = v;
        }
        self
    }

    /// Normalize (strip surrounding `/`, collapse internal whitespace) and
    /// validate every field, producing a frozen `NodeConfig`.
    pub fn build(self) -> Result<NodeConfig, Error> {
        let topic_prefix = normalize_topic_prefix(&self.topic_prefix);

        let config = NodeConfig {
            host: self.host,
            port: self.port,
            use_tls: self.use_tls,
            client_id: self.client_id,
            node_id: self.node_id,
            username: self.username,
            password: self.password,
            topic_prefix,
            keep_alive_seconds: self.keep_alive_seconds,
            session_expiry_seconds: self.session_expiry_seconds,
            connection_timeout_seconds: self.connection_timeout_seconds,
            skew_max_future_ms: self.skew_max_future_ms,
            tombstone_retention_hours: self.tombstone_retention_hours,
            persistence_enabled: self.persistence_enabled,
            storage_path: self.storage_path,
            replication_access: self.replication_access,
            is_controller: self.is_controller,
            max_queued_ops: self.max_queued_ops,
            queue_max_age_seconds: self.queue_max_age_seconds,
            queue_batch_size: self.queue_batch_size,
        };

        config.validate().map_err(|reason| Error::Validation {
            field: "node_config",
            value: format!("{}:{}", config.host, config.port),
            reason,
        })?;

        Ok(config)
    }
}

/// Strip leading/trailing `/` and collapse runs of whitespace. An empty
/// result falls back to the canonical default prefix (§4.A).
fn normalize_topic_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    let collapsed: String = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        default_topic_prefix()
    } else {
        collapsed
    }
}
