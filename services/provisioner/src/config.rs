//! Configuration for the provisioning engine.
//!
//! Loaded once from TOML into immutable snapshot structs; the engine never
//! mutates configuration. Derived mutable state (quota caches, leak
//! candidates) lives in the components that own it, keyed by provider or
//! pool name.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use fleet_quota::{QuotaInformation, CORES, INSTANCES, RAM};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    /// Load and validate a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&raw)
    }

    /// Parse and validate a config document.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut provider_names = std::collections::HashSet::new();
        for provider in &self.providers {
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            let mut pool_names = std::collections::HashSet::new();
            for pool in &provider.pools {
                if !pool_names.insert(pool.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate pool name {} in provider {}",
                        pool.name, provider.name
                    )));
                }
                for label in &pool.labels {
                    if label.image.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "label {} in pool {} has no image",
                            label.name, pool.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// One cloud provider the engine may provision against.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// Registered driver used to build this provider's adapter.
    pub driver: String,

    /// Busy-poll budget for the provider loop, milliseconds.
    #[serde(default = "default_rate_ms")]
    pub rate_ms: u64,

    /// Wall-clock bound on one node launch, including retries.
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    /// Bound on the post-create reachability scan.
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,

    /// Additional create attempts after the first failure.
    #[serde(default = "default_launch_retries")]
    pub launch_retries: u32,

    /// Cap on concurrently handled requests per pool worker; absent means
    /// unlimited.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

impl ProviderConfig {
    pub fn rate(&self) -> Duration {
        Duration::from_millis(self.rate_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }
}

fn default_rate_ms() -> u64 {
    1000
}

fn default_launch_timeout_secs() -> u64 {
    3600
}

fn default_boot_timeout_secs() -> u64 {
    120
}

fn default_launch_retries() -> u32 {
    3
}

/// A named subdivision of a provider with its own caps and label set.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub name: String,

    /// Resource caps; any absent cap is unlimited.
    #[serde(default)]
    pub max_cores: Option<f64>,
    #[serde(default)]
    pub max_servers: Option<f64>,
    #[serde(default)]
    pub max_ram: Option<f64>,

    /// Arbitrary named maxima beyond the conventional three.
    #[serde(default)]
    pub max_resources: HashMap<String, f64>,

    #[serde(default)]
    pub labels: Vec<PoolLabelConfig>,
}

impl PoolConfig {
    /// The pool's resource budget: every key unbounded unless capped here.
    pub fn limits(&self) -> QuotaInformation {
        let mut limits = QuotaInformation::unlimited();
        if let Some(cores) = self.max_cores {
            limits.set(CORES, cores);
        }
        if let Some(servers) = self.max_servers {
            limits.set(INSTANCES, servers);
        }
        if let Some(ram) = self.max_ram {
            limits.set(RAM, ram);
        }
        for (name, value) in &self.max_resources {
            limits.set(name, *value);
        }
        limits
    }

    pub fn label(&self, name: &str) -> Option<&PoolLabelConfig> {
        self.labels.iter().find(|l| l.name == name)
    }

    /// True if every requested label is offered by this pool.
    pub fn supports_labels(&self, labels: &[String]) -> bool {
        labels.iter().all(|name| self.label(name).is_some())
    }
}

/// A node flavor/image combination a request may ask for.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolLabelConfig {
    pub name: String,

    /// Provider-side image reference used for the create call.
    pub image: String,

    /// Provider-side flavor/size hint, when the driver needs one.
    #[serde(default)]
    pub flavor: Option<String>,

    /// Target weight used when distributing grants across targets.
    #[serde(default)]
    pub min_ready: u32,
}
