//! dynmerge configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::merge::{DEFAULT_CAPACITY, DispatcherKind};

/// Main dynmerge configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Merge stage settings
    pub merge: MergeConfig,

    /// Settings for the `run` demo
    pub demo: DemoConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .dynmerge.yml
        let local_config = PathBuf::from(".dynmerge.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/dynmerge/dynmerge.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("dynmerge").join("dynmerge.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Render as YAML, as printed by `dm config`
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }
}

/// Merge stage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Per-inner-stream prefetch
    pub capacity: u64,

    /// Where inner subscriptions run
    pub dispatcher: DispatcherKind,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            dispatcher: DispatcherKind::Inline,
        }
    }
}

/// Settings for the `run` demo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of inner streams the outer producer emits
    #[serde(rename = "inner-streams")]
    pub inner_streams: usize,

    /// Values per inner stream
    #[serde(rename = "elements-per-stream")]
    pub elements_per_stream: usize,

    /// Downstream request batch size
    pub batch: u64,

    /// Give up waiting for the merge after this long
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            inner_streams: 8,
            elements_per_stream: 100,
            batch: 32,
            timeout_ms: 10_000,
        }
    }
}
