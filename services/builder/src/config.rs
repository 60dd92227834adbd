//! Configuration for the builder.
//!
//! Values are layered: built-in defaults, then an optional TOML file,
//! then `STEVEDORE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::BuildSettings;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Builder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Directory holding cached layers and pulled base-image blobs.
    pub cache_dir: PathBuf,

    /// Maximum number of layers built concurrently.
    pub max_concurrent_layers: usize,

    /// Deadline for `docker load`, in seconds. Zero disables it.
    pub daemon_timeout_secs: u64,

    /// Timeout for each registry request, in seconds.
    pub registry_timeout_secs: u64,

    /// Allow plain-HTTP registries when pulling base images.
    pub allow_insecure_registries: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_concurrent_layers: 4,
            daemon_timeout_secs: 600,
            registry_timeout_secs: 300,
            allow_insecure_registries: false,
            log_level: "info".to_string(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("dev", "stevedore", "stevedore")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".stevedore-cache"))
}

impl BuilderConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())
    }

    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|var| std::env::var(var).ok())
    }

    /// Parse a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `STEVEDORE_*` overrides read through `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("STEVEDORE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }

        if let Some(value) = lookup("STEVEDORE_MAX_CONCURRENT_LAYERS") {
            self.max_concurrent_layers = parse_var("STEVEDORE_MAX_CONCURRENT_LAYERS", value)?;
        }

        if let Some(value) = lookup("STEVEDORE_DAEMON_TIMEOUT") {
            self.daemon_timeout_secs = parse_var("STEVEDORE_DAEMON_TIMEOUT", value)?;
        }

        if let Some(value) = lookup("STEVEDORE_REGISTRY_TIMEOUT") {
            self.registry_timeout_secs = parse_var("STEVEDORE_REGISTRY_TIMEOUT", value)?;
        }

        if let Some(value) = lookup("STEVEDORE_ALLOW_INSECURE_REGISTRIES") {
            self.allow_insecure_registries =
                parse_var("STEVEDORE_ALLOW_INSECURE_REGISTRIES", value)?;
        }

        if let Some(level) = lookup("STEVEDORE_LOG_LEVEL") {
            self.log_level = level;
        }

        if self.max_concurrent_layers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "max_concurrent_layers",
                value: "0".to_string(),
            });
        }

        Ok(self)
    }

    /// Deadline applied to daemon subprocesses, if any.
    pub fn daemon_timeout(&self) -> Option<Duration> {
        (self.daemon_timeout_secs > 0).then(|| Duration::from_secs(self.daemon_timeout_secs))
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    /// Per-build settings derived from this configuration.
    pub fn settings(&self) -> BuildSettings {
        BuildSettings {
            max_concurrent_layers: self.max_concurrent_layers,
            daemon_timeout: self.daemon_timeout(),
            registry_timeout: self.registry_timeout(),
            allow_insecure_registries: self.allow_insecure_registries,
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value })
}
