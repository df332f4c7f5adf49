//! Recognized configuration options (spec §6).
//!
//! Mirrors `daemon-config-and-utils::config::Config`: a `serde`-derived
//! struct with a `Default` impl carrying the documented defaults, a
//! `from_file` constructor backed by `serde_json`, and a `from_env` overlay
//! for the subset of fields an operator may reasonably want to flip without
//! editing a file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// Default liveness timeout before a process is eligible for reclaim.
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u32 = 5_000;

/// Default per-queue ring capacity (must stay a power of two, spec recommends ≤ 256).
pub const DEFAULT_QUEUE_CAPACITY: u32 = 64;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u32 = 1_000;

/// Configuration for a single named buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub block_size: u32,
    pub block_count: u32,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Registry segment name (required in practice; empty string is invalid).
    pub registry_segment_name: String,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u32,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: u32,
    #[serde(default = "default_scheduler_workers")]
    pub scheduler_workers: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,
}

fn default_liveness_timeout_ms() -> u32 {
    DEFAULT_LIVENESS_TIMEOUT_MS
}

fn default_queue_capacity() -> u32 {
    DEFAULT_QUEUE_CAPACITY
}

fn default_scheduler_workers() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn default_heartbeat_interval_ms() -> u32 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_segment_name: String::new(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            pools: Vec::new(),
            queue_capacity: default_queue_capacity(),
            scheduler_workers: default_scheduler_workers(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `FLOWMESH_*` environment variables onto `self`.
    ///
    /// Only scalar fields are overridable from the environment; `pools` must
    /// come from the config file (matching the teacher's policy of limiting
    /// env overrides to operationally safe knobs).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("FLOWMESH_REGISTRY_SEGMENT_NAME") {
            self.registry_segment_name = name;
        }
        if let Some(v) = parse_env_u32("FLOWMESH_LIVENESS_TIMEOUT_MS") {
            self.liveness_timeout_ms = v;
        }
        if let Some(v) = parse_env_u32("FLOWMESH_QUEUE_CAPACITY") {
            self.queue_capacity = v;
        }
        if let Some(v) = parse_env_u32("FLOWMESH_SCHEDULER_WORKERS") {
            self.scheduler_workers = v;
        }
        if let Some(v) = parse_env_u32("FLOWMESH_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = v;
        }
    }

    /// Build a config by overlaying the environment onto the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Validate field invariants the spec requires (queue capacity power of
    /// two, non-empty registry segment name).
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.registry_segment_name.is_empty() {
            return Err(RuntimeError::Config(
                "registry.segment_name is required".into(),
            ));
        }
        if !self.queue_capacity.is_power_of_two() {
            return Err(RuntimeError::Config(
                "queue.capacity must be a power of two".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.liveness_timeout_ms, DEFAULT_LIVENESS_TIMEOUT_MS);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        assert!(config.pools.is_empty());
    }

    #[test]
    fn validate_rejects_empty_segment_name() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn validate_rejects_non_power_of_two_queue_capacity() {
        let mut config = Config::default();
        config.registry_segment_name = "/flowmesh_registry".into();
        config.queue_capacity = 100;
        assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn from_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.registry_segment_name = "/flowmesh_registry".into();
        config.pools.push(PoolConfig {
            name: "frames".into(),
            block_size: 4096,
            block_count: 256,
        });
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.registry_segment_name, config.registry_segment_name);
        assert_eq!(loaded.pools, config.pools);
    }
}
