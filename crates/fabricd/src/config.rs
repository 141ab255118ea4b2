//! Configuration file support for fabricd
//!
//! Loads and validates fabricd configuration from TOML files.
//! Default location: /etc/fabric/fabricd.toml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fabric_types::IpFamily;
use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};
use crate::types::DEFAULT_POD_LINK_SUFFIX;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fabric/fabricd.toml";

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of this node, compared with pod address owners
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Name suffixes of pod-side links, skipped by the address manager
    #[serde(default = "default_pod_link_suffixes")]
    pub pod_link_suffixes: Vec<String>,
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Desired-state JSON file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Seconds between passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_ipv4")]
    pub ipv4: bool,

    #[serde(default)]
    pub ipv6: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Complete fabricd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_default()
}

fn default_pod_link_suffixes() -> Vec<String> {
    vec![DEFAULT_POD_LINK_SUFFIX.to_string()]
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/run/fabric/desired-state.json")
}

fn default_interval_secs() -> u64 {
    30
}

fn default_ipv4() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            pod_link_suffixes: default_pod_link_suffixes(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            interval_secs: default_interval_secs(),
            ipv4: default_ipv4(),
            ipv6: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl FabricConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                FabricError::invalid_config(
                    path.display().to_string(),
                    format!("failed to parse config file: {}", e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "fabricd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(FabricError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            FabricError::invalid_config("config", format!("failed to serialize: {}", e))
        })?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the pass interval as Duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    /// Address families to reconcile
    pub fn families(&self) -> Vec<IpFamily> {
        let mut families = Vec::new();
        if self.sync.ipv4 {
            families.push(IpFamily::Ipv4);
        }
        if self.sync.ipv6 {
            families.push(IpFamily::Ipv6);
        }
        families
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(FabricError::invalid_config(
                "node.name",
                "must be set (or export NODE_NAME)",
            ));
        }

        if self.node.pod_link_suffixes.iter().any(|s| s.is_empty()) {
            return Err(FabricError::invalid_config(
                "node.pod_link_suffixes",
                "suffixes must not be empty",
            ));
        }

        if self.sync.interval_secs == 0 {
            return Err(FabricError::invalid_config(
                "sync.interval_secs",
                "must be > 0",
            ));
        }

        if self.families().is_empty() {
            return Err(FabricError::invalid_config(
                "sync",
                "at least one of ipv4 and ipv6 must be enabled",
            ));
        }

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(FabricError::invalid_config(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        Ok(())
    }
}
