use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors rejected at configuration intake. A config which fails validation
/// never produces a server runtime or touches storage.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file")]
    Parse(#[from] serde_json::Error),
    #[error("mongoUri must not be empty")]
    EmptyMongoUri,
    #[error("mongoDatabase and mongoCollection must not be empty")]
    EmptyMongoNamespace,
    #[error("queueCapacity must be greater than zero")]
    ZeroQueueCapacity,
    #[error("batchSize must be greater than zero")]
    ZeroBatchSize,
    #[error("server at index {0} has an empty id")]
    MissingServerId(usize),
    #[error("server id {0:?} is configured more than once")]
    DuplicateServerId(String),
    #[error("server {0:?} has an empty endpoint URL")]
    EmptyEndpoint(String),
    #[error("server {0:?} has a subscription with an empty node id")]
    EmptySubscriptionNode(String),
}

/// One monitored-item definition under a server subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDef {
    pub node_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub browse_path: String,
    /// Per-item sampling interval requested of the server, in milliseconds.
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u32,
    /// Requested publishing interval, in milliseconds. The session requests
    /// the minimum across all of its definitions.
    #[serde(default = "default_publishing_interval_ms")]
    pub publishing_interval_ms: u32,
    /// Server-side monitored item queue size.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,
    #[serde(default = "default_true")]
    pub discard_oldest: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A single OPC UA endpoint and the subscriptions held against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique, non-empty identifier. Stamped into every Sample.
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub endpoint_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the agent-wide default session timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<u32>,
    /// Overrides the agent-wide default keepalive interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_ms: Option<u32>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionDef>,
}

impl ServerConfig {
    /// The human-facing name: the display name when present, else the id.
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// The read-only configuration snapshot consumed on start and on hot-reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub mongo_uri: String,
    pub mongo_database: String,
    pub mongo_collection: String,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_probe_timeout_secs")]
    pub health_probe_timeout_secs: u64,
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Automatic document expiry in days. Zero disables the TTL index.
    #[serde(default)]
    pub ttl_days: u32,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u32,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Manual override: route every batch to the fallback sink.
    #[serde(default)]
    pub force_fallback: bool,
    /// Manual override: count batches without invoking any sink.
    #[serde(default)]
    pub dry_run: bool,

    /// Fallback data directory. When absent, the OS user-data directory is
    /// used (`<data dir>/fieldgate/fallback`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_dir: Option<PathBuf>,
    /// Days to keep archived fallback files. Zero keeps them forever.
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,
}

impl AgentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mongo_uri.is_empty() {
            return Err(ConfigError::EmptyMongoUri);
        }
        if self.mongo_database.is_empty() || self.mongo_collection.is_empty() {
            return Err(ConfigError::EmptyMongoNamespace);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        let mut seen = std::collections::HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            if server.id.is_empty() {
                return Err(ConfigError::MissingServerId(index));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::DuplicateServerId(server.id.clone()));
            }
            if server.endpoint_url.is_empty() {
                return Err(ConfigError::EmptyEndpoint(server.id.clone()));
            }
            if server.subscriptions.iter().any(|def| def.node_id.is_empty()) {
                return Err(ConfigError::EmptySubscriptionNode(server.id.clone()));
            }
        }
        Ok(())
    }

    /// The effective fallback data directory. An absent or empty path means
    /// the OS user-data default.
    pub fn fallback_dir(&self) -> PathBuf {
        match &self.fallback_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fieldgate")
                .join("fallback"),
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_secs)
    }
    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_sampling_interval_ms() -> u32 {
    1_000
}
fn default_publishing_interval_ms() -> u32 {
    1_000
}
fn default_queue_size() -> u32 {
    10
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_batch_size() -> usize {
    500
}
fn default_batch_timeout_ms() -> u64 {
    1_000
}
fn default_write_timeout_secs() -> u64 {
    5
}
fn default_health_interval_secs() -> u64 {
    5
}
fn default_health_probe_timeout_secs() -> u64 {
    2
}
fn default_health_failure_threshold() -> u32 {
    3
}
fn default_degraded_latency_ms() -> u64 {
    500
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    30
}
fn default_session_timeout_ms() -> u32 {
    60_000
}
fn default_keepalive_interval_ms() -> u32 {
    10_000
}
fn default_archive_retention_days() -> u32 {
    30
}
