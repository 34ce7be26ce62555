//! Precedence resolution for configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. Environment variables (`FEDTREE_*`)
//! 3. config.kdl
//! 4. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::config::FedtreeConfig;
use crate::storage::DEFAULT_TOPOLOGY_FILE;
use crate::transport::{
    DEFAULT_ADDRESS_POLL, DEFAULT_RETRY_DELAY, RetryPolicy, RolePaths, TransportConfig,
};
use crate::{Error, Result};

/// Environment variable overriding the topology file.
pub const TOPOLOGY_ENV: &str = "FEDTREE_TOPOLOGY";
/// Environment variable overriding the call timeout (seconds, 0 disables).
pub const CALL_TIMEOUT_ENV: &str = "FEDTREE_CALL_TIMEOUT_SECS";
/// Environment variable overriding the retry delay (milliseconds).
pub const RETRY_DELAY_ENV: &str = "FEDTREE_RETRY_DELAY_MS";

/// Call timeout the CLI uses when nothing else is configured.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from environment variable
    EnvVar(String),
    /// Value from a config.kdl file
    File(String),
    /// Value from CLI flag
    CliFlag,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::File(path) => write!(f, "file:{}", path),
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub topology: Option<PathBuf>,
    pub call_timeout_secs: Option<u64>,
    pub retry_delay_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topology(mut self, path: impl Into<PathBuf>) -> Self {
        self.topology = Some(path.into());
        self
    }

    pub fn with_call_timeout_secs(mut self, secs: u64) -> Self {
        self.call_timeout_secs = Some(secs);
        self
    }

    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = Some(ms);
        self
    }
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub scheme: Resolved<String>,
    pub retry_delay_ms: Resolved<u64>,
    /// Set only when exponential backoff is configured
    pub retry_max_delay_ms: Option<Resolved<u64>>,
    pub address_poll_ms: Resolved<u64>,
    /// 0 means calls wait indefinitely
    pub call_timeout_secs: Resolved<u64>,
    pub role_paths: Resolved<RolePaths>,
    pub topology: Resolved<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            scheme: Resolved::new("ws".to_string(), ValueSource::Default),
            retry_delay_ms: Resolved::new(
                DEFAULT_RETRY_DELAY.as_millis() as u64,
                ValueSource::Default,
            ),
            retry_max_delay_ms: None,
            address_poll_ms: Resolved::new(
                DEFAULT_ADDRESS_POLL.as_millis() as u64,
                ValueSource::Default,
            ),
            call_timeout_secs: Resolved::new(DEFAULT_CALL_TIMEOUT_SECS, ValueSource::Default),
            role_paths: Resolved::new(RolePaths::default(), ValueSource::Default),
            topology: Resolved::new(PathBuf::from(DEFAULT_TOPOLOGY_FILE), ValueSource::Default),
        }
    }
}

impl ResolvedConfig {
    /// Path of the topology file.
    pub fn topology_path(&self) -> &PathBuf {
        &self.topology.value
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.retry_delay_ms.value);
        match &self.retry_max_delay_ms {
            Some(max) => RetryPolicy::Exponential {
                base,
                max: Duration::from_millis(max.value),
            },
            None => RetryPolicy::Fixed(base),
        }
    }

    /// Transport settings for the connection pool.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            scheme: self.scheme.value.clone(),
            retry: self.retry_policy(),
            address_poll: Duration::from_millis(self.address_poll_ms.value),
            call_timeout: match self.call_timeout_secs.value {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            role_paths: self.role_paths.value.clone(),
        }
    }
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", name, raw))),
        _ => Ok(None),
    }
}

/// Resolve configuration from the process environment.
///
/// `file` is the parsed config.kdl (empty if there is none) and
/// `file_label` names it for source tracking.
pub fn resolve_config(
    file: &FedtreeConfig,
    file_label: &str,
    overrides: &ConfigOverrides,
) -> Result<ResolvedConfig> {
    resolve_config_with_env(file, file_label, overrides, |name| std::env::var(name).ok())
}

/// Resolve configuration with an explicit environment lookup.
pub fn resolve_config_with_env(
    file: &FedtreeConfig,
    file_label: &str,
    overrides: &ConfigOverrides,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    file.validate().map_err(Error::Config)?;

    let mut result = ResolvedConfig::default();
    let from_file = || ValueSource::File(file_label.to_string());

    // Resolve scheme
    if let Some(ref scheme) = file.scheme {
        result.scheme = Resolved::new(scheme.clone(), from_file());
    }

    // Resolve retry delay
    if let Some(ms) = overrides.retry_delay_ms {
        result.retry_delay_ms = Resolved::new(ms, ValueSource::CliFlag);
    } else if let Some(ms) = env_u64(&env, RETRY_DELAY_ENV)? {
        result.retry_delay_ms = Resolved::new(ms, ValueSource::EnvVar(RETRY_DELAY_ENV.to_string()));
    } else if let Some(ms) = file.retry_delay_ms {
        result.retry_delay_ms = Resolved::new(ms, from_file());
    }
    if result.retry_delay_ms.value == 0 {
        return Err(Error::Config("retry delay must be positive".to_string()));
    }

    if let Some(max) = file.retry_max_delay_ms {
        result.retry_max_delay_ms = Some(Resolved::new(
            max.max(result.retry_delay_ms.value),
            from_file(),
        ));
    }

    if let Some(ms) = file.address_poll_ms {
        result.address_poll_ms = Resolved::new(ms, from_file());
    }

    // Resolve call timeout
    if let Some(secs) = overrides.call_timeout_secs {
        result.call_timeout_secs = Resolved::new(secs, ValueSource::CliFlag);
    } else if let Some(secs) = env_u64(&env, CALL_TIMEOUT_ENV)? {
        result.call_timeout_secs =
            Resolved::new(secs, ValueSource::EnvVar(CALL_TIMEOUT_ENV.to_string()));
    } else if let Some(secs) = file.call_timeout_secs {
        result.call_timeout_secs = Resolved::new(secs, from_file());
    }

    // Resolve role paths
    if file.role_path_root.is_some() || file.role_path_mid.is_some() || file.role_path_leaf.is_some()
    {
        let defaults = RolePaths::default();
        result.role_paths = Resolved::new(
            RolePaths {
                root: file.role_path_root.clone().unwrap_or(defaults.root),
                mid: file.role_path_mid.clone().unwrap_or(defaults.mid),
                leaf: file.role_path_leaf.clone().unwrap_or(defaults.leaf),
            },
            from_file(),
        );
    }

    // Resolve topology file
    if let Some(ref path) = overrides.topology {
        result.topology = Resolved::new(path.clone(), ValueSource::CliFlag);
    } else if let Some(path) = env(TOPOLOGY_ENV).filter(|p| !p.is_empty()) {
        result.topology = Resolved::new(
            PathBuf::from(path),
            ValueSource::EnvVar(TOPOLOGY_ENV.to_string()),
        );
    } else if let Some(ref path) = file.topology {
        result.topology = Resolved::new(PathBuf::from(path), from_file());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ==================== ValueSource Tests ====================

    #[test]
    fn test_value_source_display() {
        assert_eq!(
            format!("{}", ValueSource::EnvVar("FOO".to_string())),
            "env:FOO"
        );
        assert_eq!(
            format!("{}", ValueSource::File("/etc/config.kdl".to_string())),
            "file:/etc/config.kdl"
        );
        assert_eq!(format!("{}", ValueSource::CliFlag), "cli");
        assert_eq!(format!("{}", ValueSource::Default), "default");
    }

    // ==================== Config Resolution Tests ====================

    #[test]
    fn test_resolve_config_defaults() {
        let config = resolve_config_with_env(
            &FedtreeConfig::default(),
            "config.kdl",
            &ConfigOverrides::default(),
            env_from(&[]),
        )
        .unwrap();

        assert_eq!(config.scheme.value, "ws");
        assert_eq!(config.retry_delay_ms.value, 3000);
        assert_eq!(config.retry_delay_ms.source, ValueSource::Default);
        assert_eq!(config.call_timeout_secs.value, DEFAULT_CALL_TIMEOUT_SECS);
        assert_eq!(config.topology_path(), &PathBuf::from("topology.json"));
        assert_eq!(config.retry_policy(), RetryPolicy::Fixed(Duration::from_secs(3)));

        let transport = config.transport_config();
        assert_eq!(transport.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(transport.address_poll, Duration::from_secs(1));
        assert_eq!(transport.role_paths, RolePaths::default());
    }

    #[test]
    fn test_resolve_config_from_file() {
        let file = FedtreeConfig {
            retry_delay_ms: Some(500),
            retry_max_delay_ms: Some(4000),
            call_timeout_secs: Some(0),
            role_path_leaf: Some("edge".to_string()),
            topology: Some("/srv/topo.json".to_string()),
            ..Default::default()
        };
        let config =
            resolve_config_with_env(&file, "a.kdl", &ConfigOverrides::new(), env_from(&[])).unwrap();

        assert_eq!(config.retry_delay_ms.source, ValueSource::File("a.kdl".to_string()));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(4),
            }
        );
        assert_eq!(config.transport_config().call_timeout, None);
        assert_eq!(config.role_paths.value.leaf, "edge");
        assert_eq!(config.role_paths.value.root, "node");
        assert_eq!(config.topology_path(), &PathBuf::from("/srv/topo.json"));
    }

    #[test]
    fn test_resolve_config_precedence() {
        let file = FedtreeConfig {
            call_timeout_secs: Some(10),
            topology: Some("file.json".to_string()),
            ..Default::default()
        };
        let env = env_from(&[
            (CALL_TIMEOUT_ENV, "20"),
            (TOPOLOGY_ENV, "env.json"),
        ]);

        let config = resolve_config_with_env(&file, "c.kdl", &ConfigOverrides::new(), &env).unwrap();
        assert_eq!(config.call_timeout_secs.value, 20);
        assert_eq!(
            config.call_timeout_secs.source,
            ValueSource::EnvVar(CALL_TIMEOUT_ENV.to_string())
        );
        assert_eq!(config.topology_path(), &PathBuf::from("env.json"));

        let overrides = ConfigOverrides::new()
            .with_call_timeout_secs(5)
            .with_topology("cli.json");
        let config = resolve_config_with_env(&file, "c.kdl", &overrides, &env).unwrap();
        assert_eq!(config.call_timeout_secs.value, 5);
        assert_eq!(config.call_timeout_secs.source, ValueSource::CliFlag);
        assert_eq!(config.topology.source, ValueSource::CliFlag);
    }

    #[test]
    fn test_resolve_config_rejects_bad_env() {
        let err = resolve_config_with_env(
            &FedtreeConfig::default(),
            "c.kdl",
            &ConfigOverrides::new(),
            env_from(&[(RETRY_DELAY_ENV, "soon")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains(RETRY_DELAY_ENV));
    }

    #[test]
    fn test_resolve_config_rejects_invalid_file() {
        let file = FedtreeConfig {
            scheme: Some("tcp".to_string()),
            ..Default::default()
        };
        assert!(
            resolve_config_with_env(&file, "c.kdl", &ConfigOverrides::new(), env_from(&[]))
                .is_err()
        );
    }
}
