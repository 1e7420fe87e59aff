use crate::guardian::{GuardianConfig, HashAlgorithm};
use crate::infrastructure::ast_cache::DEFAULT_CAPACITY;
use crate::infrastructure::incremental::{IncrementalConfig, PriorityWeights};
use crate::infrastructure::pool::PoolOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = ".inquisidor.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolOptions,

    #[serde(default)]
    pub parse: ParseConfig,

    #[serde(default)]
    pub guardian: GuardianConfig,

    #[serde(default)]
    pub incremental: IncrementalConfig,

    /// Dispatch order is left untouched unless weights are configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PriorityWeights>,

    #[serde(default)]
    pub hash: HashConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub techniques: TechniquesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseConfig {
    /// Per-file parse bound; 0 disables it
    #[serde(default = "default_parse_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    /// Tried in order; the rolling fallback is always last
    #[serde(default = "HashAlgorithm::default_preference")]
    pub preference: Vec<HashAlgorithm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON-line run events under the `inquisidor::eventos` target
    #[serde(default = "default_false")]
    pub structured: bool,

    #[serde(default = "default_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniquesConfig {
    #[serde(default = "default_max_function_lines")]
    pub max_function_lines: usize,

    #[serde(default = "default_usage_min_files")]
    pub usage_min_files: u64,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_parse_timeout(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            preference: HashAlgorithm::default_preference(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            structured: false,
            level: default_level(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*".to_string()],
            exclude: vec![
                "**/node_modules/**".to_string(),
                "**/.git/**".to_string(),
                "**/target/**".to_string(),
                "**/__pycache__/**".to_string(),
                ".inquisidor/**".to_string(),
            ],
        }
    }
}

impl Default for TechniquesConfig {
    fn default() -> Self {
        Self {
            max_function_lines: default_max_function_lines(),
            usage_min_files: default_usage_min_files(),
        }
    }
}

fn default_false() -> bool { false }
fn default_parse_timeout() -> u64 { 5_000 }
fn default_cache_capacity() -> usize { DEFAULT_CAPACITY }
fn default_level() -> String { "info".to_string() }
fn default_max_function_lines() -> usize { 60 }
fn default_usage_min_files() -> u64 { 2 }

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Find `.inquisidor.toml` in `start` or its parents, falling back to defaults
    pub fn discover(start: &Path) -> Self {
        let mut current = Some(start.to_path_buf());

        while let Some(dir) = current {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                match Self::load(&config_path) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!(error = %e, "Ignoring unreadable config"),
                }
            }

            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default()
    }

    /// Anchor relative state paths at `base_dir`
    pub fn resolve_paths(mut self, base_dir: &Path) -> Self {
        if self.guardian.baseline_path.is_relative() {
            self.guardian.baseline_path = base_dir.join(&self.guardian.baseline_path);
        }
        if self.incremental.state_path.is_relative() {
            self.incremental.state_path = base_dir.join(&self.incremental.state_path);
        }
        self
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
