// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs`: the TOML-backed data model and its validated form.
//! - `loader.rs`: load a config file from disk.
//! - `validate.rs`: pool sanity, references, container dependency graph.
//! - `duration.rs`: `"250ms"` / `"3s"` / `"1m"` / `"2h"` strings.

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{
    ConfigFile, ContainerConfig, DEFAULT_POOL, DriverConfig, EngineConfig, PodSection,
    PoolConfig, RawConfigFile,
};
pub use validate::validate_config;
