use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::messaging::frame::{DEFAULT_FRAME_CAPACITY, DEFAULT_MAX_TOPIC_LEN, RECORD_OVERHEAD};
use crate::routing::dispatcher::{DispatchOptions, MAX_TTL_SECONDS};

/// Top-level configuration for the routing core. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound for a publish ttl, in seconds.
    #[serde(default = "default_max_ttl_seconds")]
    pub max_ttl_seconds: u32,
    /// Messages the store worker may have queued before publishes skip it.
    #[serde(default = "default_store_queue_depth")]
    pub store_queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Idle frames kept for reuse across all peers.
    #[serde(default = "default_frame_pool_size")]
    pub frame_pool_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_topic_len")]
    pub max_topic_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Peers a fan-out filter is sized for.
    #[serde(default = "default_bloom_capacity")]
    pub bloom_capacity: usize,
    #[serde(default = "default_bloom_fp_rate")]
    pub bloom_fp_rate: f64,
    #[serde(default = "default_filter_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_ttl_seconds: default_max_ttl_seconds(),
            store_queue_depth: default_store_queue_depth(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            frame_capacity: default_frame_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            frame_pool_size: default_frame_pool_size(),
            max_message_size: default_max_message_size(),
            max_topic_len: default_max_topic_len(),
        }
    }
}

impl ClusterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Bytes one record of the largest allowed size occupies in a frame.
    pub fn max_record_len(&self) -> usize {
        self.max_message_size + RECORD_OVERHEAD + self.max_topic_len
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            bloom_capacity: default_bloom_capacity(),
            bloom_fp_rate: default_bloom_fp_rate(),
            pool_size: default_filter_pool_size(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a path resolved via MESHCAST_CONFIG or
    /// defaults to `config/meshcast.toml`. Applies MESHCAST_LOG_LEVEL on top.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Self::from_toml(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))
        }
    }

    pub fn from_toml(doc: &str) -> Result<Self> {
        Ok(toml::from_str(doc)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_ttl_seconds > MAX_TTL_SECONDS {
            bail!(
                "dispatch.max_ttl_seconds must not exceed {} (30 days)",
                MAX_TTL_SECONDS
            );
        }
        if self.dispatch.store_queue_depth == 0 {
            bail!("dispatch.store_queue_depth must be > 0");
        }
        let cluster = &self.cluster;
        if cluster.flush_interval_ms == 0 {
            bail!("cluster.flush_interval_ms must be > 0");
        }
        if cluster.max_topic_len == 0 {
            bail!("cluster.max_topic_len must be > 0");
        }
        if cluster.frame_capacity < cluster.max_record_len() {
            bail!(
                "cluster.frame_capacity {} cannot hold a maximal record of {} bytes",
                cluster.frame_capacity,
                cluster.max_record_len()
            );
        }
        if self.fanout.bloom_capacity == 0 {
            bail!("fanout.bloom_capacity must be > 0");
        }
        if !(self.fanout.bloom_fp_rate > 0.0 && self.fanout.bloom_fp_rate < 1.0) {
            bail!("fanout.bloom_fp_rate must be within (0, 1)");
        }
        if self.telemetry.log_level.trim().is_empty() {
            bail!("telemetry.log_level must be non-empty");
        }
        Ok(())
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_ttl: self.dispatch.max_ttl_seconds,
            bloom_capacity: self.fanout.bloom_capacity,
            bloom_fp_rate: self.fanout.bloom_fp_rate,
            filter_pool_size: self.fanout.pool_size,
            max_message_size: self.cluster.max_message_size,
            max_topic_len: self.cluster.max_topic_len,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("MESHCAST_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MESHCAST_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/meshcast.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_max_ttl_seconds() -> u32 {
    MAX_TTL_SECONDS
}

fn default_store_queue_depth() -> usize {
    8192
}

fn default_frame_capacity() -> usize {
    DEFAULT_FRAME_CAPACITY
}

fn default_flush_interval_ms() -> u64 {
    5
}

fn default_frame_pool_size() -> usize {
    64
}

fn default_max_message_size() -> usize {
    // Leaves room for the record header and a maximal topic in a default frame.
    default_frame_capacity() - RECORD_OVERHEAD - default_max_topic_len()
}

fn default_max_topic_len() -> usize {
    DEFAULT_MAX_TOPIC_LEN
}

fn default_bloom_capacity() -> usize {
    4096
}

fn default_bloom_fp_rate() -> f64 {
    0.01
}

fn default_filter_pool_size() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}
