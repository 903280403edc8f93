// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{RestartPolicy, StorageMode};

/// Name of the pool that always exists.
pub const DEFAULT_POOL: &str = "default";

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// storage = "file"
/// state_dir = ".stagehand"
/// on_restart = "fail"
/// stall_timeout = "10m"
///
/// [pool.containers]
/// concurrency = 8
/// backlog = 256
///
/// [driver]
/// latency = "50ms"
/// fail = ["cache"]
///
/// [pod]
/// name = "web"
///
/// [container.db]
/// image = "postgres:16"
///
/// [container.api]
/// image = "api:latest"
/// depends_on = ["db"]
/// ```
///
/// All sections are optional and have reasonable defaults. Durations are
/// still strings here; [`ConfigFile`] holds the validated form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: RawEngineSection,

    /// Worker pools from `[pool.<name>]`.
    #[serde(default)]
    pub pool: BTreeMap<String, PoolConfig>,

    #[serde(default)]
    pub driver: RawDriverSection,

    #[serde(default)]
    pub pod: PodSection,

    /// Containers of the pod from `[container.<name>]`, keyed by name.
    #[serde(default)]
    pub container: BTreeMap<String, ContainerConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEngineSection {
    #[serde(default)]
    pub storage: StorageMode,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default)]
    pub on_restart: RestartPolicy,

    /// Running tasks not updated for this long are failed by the supervisor.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout: String,

    #[serde(default = "default_supervise_interval")]
    pub supervise_interval: String,

    /// Pool used by task types registered without an explicit pool.
    #[serde(default = "default_pool_name")]
    pub default_pool: String,

    /// Pool serving the pod task types; falls back to `default_pool`.
    #[serde(default)]
    pub pod_pool: Option<String>,
}

fn default_state_dir() -> String {
    ".stagehand".to_string()
}

fn default_stall_timeout() -> String {
    "10m".to_string()
}

fn default_supervise_interval() -> String {
    "30s".to_string()
}

fn default_pool_name() -> String {
    DEFAULT_POOL.to_string()
}

impl Default for RawEngineSection {
    fn default() -> Self {
        Self {
            storage: StorageMode::default(),
            state_dir: default_state_dir(),
            on_restart: RestartPolicy::default(),
            stall_timeout: default_stall_timeout(),
            supervise_interval: default_supervise_interval(),
            default_pool: default_pool_name(),
            pod_pool: None,
        }
    }
}

/// `[pool.<name>]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Handlers of this pool running at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Queued work items before submissions are rejected.
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_backlog() -> usize {
    1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            backlog: default_backlog(),
        }
    }
}

impl PoolConfig {
    pub fn new(concurrency: usize, backlog: usize) -> Self {
        Self {
            concurrency,
            backlog,
        }
    }
}

/// `[driver]` section: knobs of the simulated container driver.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDriverSection {
    #[serde(default = "default_latency")]
    pub latency: String,

    /// Container names whose start fails.
    #[serde(default)]
    pub fail: Vec<String>,
}

fn default_latency() -> String {
    "50ms".to_string()
}

impl Default for RawDriverSection {
    fn default() -> Self {
        Self {
            latency: default_latency(),
            fail: Vec::new(),
        }
    }
}

/// `[pod]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PodSection {
    #[serde(default = "default_pod_name")]
    pub name: String,
}

fn default_pod_name() -> String {
    "demo".to_string()
}

impl Default for PodSection {
    fn default() -> Self {
        Self {
            name: default_pod_name(),
        }
    }
}

/// `[container.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    pub image: String,

    /// Names of containers that must be running before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Validated `[engine]` section.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageMode,
    pub state_dir: PathBuf,
    pub on_restart: RestartPolicy,
    pub stall_timeout: Duration,
    pub supervise_interval: Duration,
    pub default_pool: String,
    pub pod_pool: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageMode::Memory,
            state_dir: PathBuf::from(default_state_dir()),
            on_restart: RestartPolicy::Fail,
            stall_timeout: Duration::from_secs(600),
            supervise_interval: Duration::from_secs(30),
            default_pool: default_pool_name(),
            pod_pool: default_pool_name(),
        }
    }
}

/// Validated `[driver]` section.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub latency: Duration,
    pub fail: Vec<String>,
}

/// Validated configuration.
///
/// Construct through `ConfigFile::try_from(RawConfigFile)` so that the
/// invariants checked in [`crate::config::validate`] hold.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    /// Always contains [`DEFAULT_POOL`] and `engine.default_pool`.
    pub pool: BTreeMap<String, PoolConfig>,
    pub driver: DriverConfig,
    pub pod: PodSection,
    pub container: BTreeMap<String, ContainerConfig>,
}
