//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `#[serde(default = ...)]` functions and `set_default` calls
//! 2. **Config file**: TOML file at `CHAINPOOL_CONFIG` (default `config/config.toml`)
//! 3. **Environment variables**: `CHAINPOOL__*` env vars override scalar fields
//!
//! All durations are configured in milliseconds.
//!
//! # Example
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [[chains]]
//! chain_id = 1
//!
//! [chains.pool]
//! selection_mode = "priority_level"
//! poll_interval_ms = 10000
//! sync_threshold = 5
//!
//! [[chains.nodes]]
//! name = "primary"
//! url = "https://eth-mainnet.example.com"
//! order = 1
//!
//! [[chains.nodes]]
//! name = "backup"
//! url = "https://eth-backup.example.com"
//! order = 2
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

use crate::{node::dialer::BackoffPolicy, pool::SelectionMode};

/// One configured RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique within its chain. Used in logs and metric labels.
    pub name: String,

    /// HTTP(S) JSON-RPC endpoint.
    pub url: String,

    /// Optional WebSocket endpoint. When set and the pool has `subscribe_new_heads`, the
    /// node receives new heads over it in addition to polling.
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Priority; lower is preferred. Defaults to `100`.
    #[serde(default = "default_order")]
    pub order: u32,

    /// Disabled nodes start `Unusable` and are never polled.
    #[serde(default)]
    pub disabled: bool,
}

fn default_order() -> u32 {
    100
}

impl NodeConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ws_url: None,
            order: default_order(),
            disabled: false,
        }
    }

    #[must_use]
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Health-checking and selection parameters shared by every node of one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default)]
    pub selection_mode: SelectionMode,

    /// Interval between head polls. Defaults to 10s.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on a single dial attempt. Defaults to 5s.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Bound on a single poll, verification or caller RPC. Defaults to 5s.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Maximum lag, in blocks, behind the pool's best head before a node is out of sync.
    /// Defaults to `5`.
    ///
    /// `0` disables lag detection entirely: no node is ever out of sync for lagging, and
    /// since staleness is measured from the moment a node starts lagging, no node is ever
    /// flagged stale either.
    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: u64,

    /// Consecutive poll or verification failures that make a node unreachable.
    /// Defaults to `5`.
    #[serde(default = "default_unreachable_threshold")]
    pub unreachable_threshold: u32,

    /// A node lagging for longer than this is flagged stale. Defaults to 3 minutes.
    /// Has no effect while `sync_threshold` is `0`.
    #[serde(default = "default_very_old_head_threshold_ms")]
    pub very_old_head_threshold_ms: u64,

    #[serde(default = "default_dial_backoff_base_ms")]
    pub dial_backoff_base_ms: u64,

    #[serde(default = "default_dial_backoff_max_ms")]
    pub dial_backoff_max_ms: u64,

    /// Jitter window as a fraction of the backoff delay, `0.0..=1.0`.
    #[serde(default = "default_dial_backoff_jitter")]
    pub dial_backoff_jitter: f64,

    /// Subscribe to new heads after verification when the transport supports it.
    #[serde(default)]
    pub subscribe_new_heads: bool,

    /// How often a node stuck on the wrong chain is re-queried for diagnostics.
    #[serde(default = "default_invalid_chain_id_recheck_interval_ms")]
    pub invalid_chain_id_recheck_interval_ms: u64,

    /// A node whose highest block has not advanced for this long is out of sync, unless it
    /// is the last live node of the pool. `0` disables the rule. Defaults to 3 minutes.
    #[serde(default = "default_no_new_heads_threshold_ms")]
    pub no_new_heads_threshold_ms: u64,

    /// How often the pool re-evaluates its active node and switches to a better one.
    /// `0` disables the lease; the active node then only changes when it stops being
    /// eligible or is outranked. Ignored in `RoundRobin` mode. Defaults to `0`.
    #[serde(default)]
    pub lease_duration_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_sync_threshold() -> u64 {
    5
}

fn default_unreachable_threshold() -> u32 {
    5
}

fn default_very_old_head_threshold_ms() -> u64 {
    180_000
}

fn default_dial_backoff_base_ms() -> u64 {
    1_000
}

fn default_dial_backoff_max_ms() -> u64 {
    30_000
}

fn default_dial_backoff_jitter() -> f64 {
    0.2
}

fn default_invalid_chain_id_recheck_interval_ms() -> u64 {
    60_000
}

fn default_no_new_heads_threshold_ms() -> u64 {
    180_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            selection_mode: SelectionMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            sync_threshold: default_sync_threshold(),
            unreachable_threshold: default_unreachable_threshold(),
            very_old_head_threshold_ms: default_very_old_head_threshold_ms(),
            dial_backoff_base_ms: default_dial_backoff_base_ms(),
            dial_backoff_max_ms: default_dial_backoff_max_ms(),
            dial_backoff_jitter: default_dial_backoff_jitter(),
            subscribe_new_heads: false,
            invalid_chain_id_recheck_interval_ms: default_invalid_chain_id_recheck_interval_ms(),
            no_new_heads_threshold_ms: default_no_new_heads_threshold_ms(),
            lease_duration_ms: 0,
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[must_use]
    pub fn very_old_head_threshold(&self) -> Duration {
        Duration::from_millis(self.very_old_head_threshold_ms)
    }

    #[must_use]
    pub fn invalid_chain_id_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.invalid_chain_id_recheck_interval_ms)
    }

    #[must_use]
    pub fn no_new_heads_threshold(&self) -> Duration {
        Duration::from_millis(self.no_new_heads_threshold_ms)
    }

    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Whether the pool runs a lease task: a non-zero duration outside `RoundRobin`.
    #[must_use]
    pub fn lease_enabled(&self) -> bool {
        self.lease_duration_ms > 0 && self.selection_mode != SelectionMode::RoundRobin
    }

    #[must_use]
    pub fn dial_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.dial_backoff_base_ms),
            max: Duration::from_millis(self.dial_backoff_max_ms),
            jitter: self.dial_backoff_jitter,
        }
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }
        if self.dial_timeout_ms == 0 {
            return Err("dial_timeout_ms must be greater than 0".to_string());
        }
        if self.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be greater than 0".to_string());
        }
        if self.unreachable_threshold == 0 {
            return Err("unreachable_threshold must be greater than 0".to_string());
        }
        if self.invalid_chain_id_recheck_interval_ms == 0 {
            return Err("invalid_chain_id_recheck_interval_ms must be greater than 0".to_string());
        }
        if self.dial_backoff_base_ms == 0 {
            return Err("dial_backoff_base_ms must be greater than 0".to_string());
        }
        if self.dial_backoff_max_ms < self.dial_backoff_base_ms {
            return Err("dial_backoff_max_ms must not be below dial_backoff_base_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.dial_backoff_jitter) {
            return Err("dial_backoff_jitter must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }
}

/// One chain and the endpoints that serve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ChainConfig {
    /// Validates the chain's settings and nodes.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err(format!("No nodes configured for chain {}", self.chain_id));
        }

        self.pool.validate().map_err(|e| format!("chain {}: {e}", self.chain_id))?;

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(format!("Empty node name on chain {}", self.chain_id));
            }
            if !names.insert(node.name.as_str()) {
                return Err(format!("Duplicate node name on chain {}: {}", self.chain_id, node.name));
            }
            if !node.url.starts_with("http://") && !node.url.starts_with("https://") {
                return Err(format!("Invalid URL for node {}: {}", node.name, node.url));
            }
            if let Some(ref ws_url) = node.ws_url {
                if !ws_url.starts_with("ws://") && !ws_url.starts_with("wss://") {
                    return Err(format!("Invalid WebSocket URL for node {}: {ws_url}", node.name));
                }
            }
        }
        Ok(())
    }
}

/// Metrics export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed. Defaults to `true`.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Port of the Prometheus scrape endpoint. Defaults to `9090`.
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_prometheus_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: default_metrics_enabled(), prometheus_port: default_prometheus_port() }
    }
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive. Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Top-level configuration of the node binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

fn default_environment() -> String {
    "development".to_string()
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `CHAINPOOL__` prefix override configuration values.
    /// Use `__` as a separator for nested fields (e.g., `CHAINPOOL__LOGGING__LEVEL=debug`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("environment", "development")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .set_default("metrics.enabled", true)?
            .set_default("metrics.prometheus_port", 9090)?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("CHAINPOOL").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml`, or from the path in `CHAINPOOL_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CHAINPOOL_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.chains.is_empty() {
            return Err("No chains configured".to_string());
        }

        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.chain_id) {
                return Err(format!("Duplicate chain id: {}", chain.chain_id));
            }
            chain.validate()?;
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(format!(
                "Invalid log format: {} (expected \"json\" or \"pretty\")",
                self.logging.format
            ));
        }

        if self.metrics.enabled && self.metrics.prometheus_port == 0 {
            return Err("Prometheus port must be greater than 0".to_string());
        }

        Ok(())
    }
}
