//! Configuration Module
//!
//! Provides TOML-based configuration for RelayMQ with support for:
//! - Node identity
//! - Queue declarations and consumer settings
//! - Redistribution policy
//! - Body relay and spooling
//! - Cluster peers, reconnect policy and gossip discovery
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use cluster::{ClusterConfig, StaticPeer};
pub use metrics::MetricsConfig;

use crate::queue::validate_queue_name;

mod cluster;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node identity
    pub node: NodeConfig,
    /// Queue behaviour shared by all queues
    pub queues: QueuesConfig,
    /// Queues created at startup
    #[serde(default)]
    pub queue: Vec<QueueDeclaration>,
    /// Stranded-message redistribution
    pub redistribution: RedistributionConfig,
    /// Body chunking and spooling
    pub relay: RelayConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier (derived from the hostname if not set)
    pub id: Option<String>,
}

impl NodeConfig {
    /// Get the node ID, generating from hostname if not set
    pub fn get_node_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{}", rand_id()))
        })
    }
}

/// Generate a random ID for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}

/// How producer messages are spread across the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Round-robin over the local binding (if it has consumers) and peers
    /// advertising consumers
    #[default]
    OnDemand,
    /// Always enqueue locally
    Off,
}

/// Queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Maximum delivered-but-unacknowledged messages per consumer
    #[serde(default = "default_consumer_window")]
    pub consumer_window: usize,
    /// Producer load balancing policy
    #[serde(default)]
    pub load_balancing: LoadBalancing,
}

fn default_consumer_window() -> usize {
    1024
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            consumer_window: default_consumer_window(),
            load_balancing: LoadBalancing::default(),
        }
    }
}

/// A queue created at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
}

/// Redistribution policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedistributionConfig {
    /// Move stranded messages to peers with consumers
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long a binding must stay stranded before its messages move
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
    /// Period of the re-check for bindings that are still stranded
    #[serde(default = "default_recheck_interval", with = "humantime_serde")]
    pub recheck_interval: Duration,
    /// How long a node that failed a transfer is skipped
    #[serde(default = "default_failure_cooldown", with = "humantime_serde")]
    pub failure_cooldown: Duration,
}

fn default_true() -> bool {
    true
}

fn default_recheck_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_cooldown() -> Duration {
    Duration::from_secs(5)
}

impl Default for RedistributionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::ZERO,
            recheck_interval: default_recheck_interval(),
            failure_cooldown: default_failure_cooldown(),
        }
    }
}

/// Body relay settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Size of one relayed chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Bodies larger than this are spooled to disk
    #[serde(default = "default_large_message_threshold")]
    pub large_message_threshold: usize,
    /// Directory for spooled bodies
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_large_message_threshold() -> usize {
    100 * 1024
}

fn default_spool_dir() -> PathBuf {
    std::env::temp_dir().join("relaymq-spool")
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            large_message_threshold: default_large_message_threshold(),
            spool_dir: default_spool_dir(),
        }
    }
}

/// Room left in a frame for the chunk header
const FRAME_OVERHEAD: usize = 64;

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__NODE__ID=node-a` overrides `node.id`
    ///    - `RELAYMQ__CLUSTER__PEER_ADDR=0.0.0.0:7000` overrides `cluster.peer_addr`
    ///    - `RELAYMQ__REDISTRIBUTION__ENABLED=false` overrides `redistribution.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("queues.consumer_window", 1024)?
            .set_default("queues.load_balancing", "on_demand")?
            .set_default("redistribution.enabled", true)?
            .set_default("relay.chunk_size", 64 * 1024)?
            .set_default("relay.large_message_threshold", 100 * 1024)?
            .set_default("cluster.enabled", false)?
            .set_default("metrics.enabled", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (RELAYMQ__CLUSTER__ENABLED, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref id) = self.node.id {
            if id.trim().is_empty() {
                return Err(ConfigError::Validation("node.id must not be empty".to_string()));
            }
        }

        if self.queues.consumer_window == 0 {
            return Err(ConfigError::Validation(
                "queues.consumer_window must be at least 1".to_string(),
            ));
        }

        for decl in &self.queue {
            validate_queue_name(&decl.name)
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        if self.relay.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "relay.chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.relay.large_message_threshold < self.relay.chunk_size {
            return Err(ConfigError::Validation(format!(
                "relay.large_message_threshold ({}) must not be smaller than relay.chunk_size ({})",
                self.relay.large_message_threshold, self.relay.chunk_size
            )));
        }
        if self.relay.chunk_size + FRAME_OVERHEAD > self.cluster.max_frame_size {
            return Err(ConfigError::Validation(format!(
                "relay.chunk_size ({}) does not fit in cluster.max_frame_size ({})",
                self.relay.chunk_size, self.cluster.max_frame_size
            )));
        }

        self.validate_cluster()
    }

    fn validate_cluster(&self) -> Result<(), ConfigError> {
        let cluster = &self.cluster;
        if cluster.max_reconnect_attempts == 0 {
            return Err(ConfigError::Validation(
                "cluster.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if cluster.retry_interval > cluster.max_retry_interval {
            return Err(ConfigError::Validation(
                "cluster.retry_interval must not exceed cluster.max_retry_interval".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for peer in &cluster.peers {
            if peer.id.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Peer at {} has an empty id",
                    peer.addr
                )));
            }
            if self.node.id.as_deref() == Some(peer.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Peer '{}' has this node's own id",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Peer '{}' is configured twice",
                    peer.id
                )));
            }
            if peer.addr.port() == 0 || peer.addr.ip().is_unspecified() {
                return Err(ConfigError::Validation(format!(
                    "Peer '{}' has invalid address {}",
                    peer.id, peer.addr
                )));
            }
        }

        if cluster.gossip_enabled() && cluster.gossip_addr.port() == 0 {
            return Err(ConfigError::Validation(
                "cluster.gossip_addr needs a port when seeds are configured".to_string(),
            ));
        }

        Ok(())
    }
}
