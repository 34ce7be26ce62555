//! Configuration for fedtree.
//!
//! ## config.kdl - Operator preferences
//!
//! Located at `~/.config/fedtree/config.kdl`, or wherever `--config` /
//! `FEDTREE_CONFIG` points.
//!
//! Contains:
//! - `scheme` - "ws" or "wss"
//! - `retry-delay-ms` / `retry-max-delay-ms` - Reconnect schedule
//! - `address-poll-ms` - Poll interval while an address is missing
//! - `call-timeout-secs` - Upper bound on one agent call (0 disables)
//! - `role-path` - Endpoint path per tier (`root=`, `mid=`, `leaf=`)
//! - `topology` - Default topology file
//!
//! ## Precedence
//!
//! CLI flag > environment > config.kdl > defaults
//!
//! Use the [`resolver`] module for precedence resolution.

pub mod resolver;
pub mod schema;

use std::path::{Path, PathBuf};

use kdl::KdlDocument;

pub use resolver::{
    CALL_TIMEOUT_ENV, ConfigOverrides, DEFAULT_CALL_TIMEOUT_SECS, RETRY_DELAY_ENV, Resolved,
    ResolvedConfig, TOPOLOGY_ENV, ValueSource, resolve_config, resolve_config_with_env,
};
pub use schema::FedtreeConfig;

use crate::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FEDTREE_CONFIG";

/// Default location of config.kdl, if a config directory exists.
pub fn system_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fedtree").join("config.kdl"))
}

/// Read config.kdl at `path`. A missing file yields an empty config.
pub fn read_config(path: &Path) -> Result<FedtreeConfig> {
    if !path.exists() {
        return Ok(FedtreeConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let doc: KdlDocument = content
        .parse()
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    Ok(FedtreeConfig::from_kdl(&doc))
}

/// Load and resolve configuration.
///
/// `explicit` is the `--config` path; without it the system location is used.
pub fn load(explicit: Option<&Path>, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let path = explicit.map(Path::to_path_buf).or_else(system_config_path);
    let (file, label) = match path {
        Some(path) => (read_config(&path)?, path.display().to_string()),
        None => (FedtreeConfig::default(), "config.kdl".to_string()),
    };
    resolve_config(&file, &label, overrides)
}
