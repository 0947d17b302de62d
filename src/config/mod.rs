//! Repo configuration for the type-check gate
//!
//! `typegate.toml` declares the checker invocation, the locked environments
//! it may run in, and the source units the build graph would otherwise
//! supply. Values are validated on load; the effective config is also
//! fingerprinted (see [`config_digest`]) because it participates in
//! partition keys and cache keys.

mod digest;

pub use digest::{config_digest, DigestError};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-partition checker timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Default worker-pool width.
pub const DEFAULT_JOBS: usize = 4;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Checker invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Argv prefix for the checker; partition file paths are appended.
    #[serde(default = "default_tool_command")]
    pub command: Vec<String>,

    /// Checker config file, consumed opaquely by the tool and fingerprinted
    /// into the config digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,

    /// Exit codes that mean "ran fine, found type errors" rather than a
    /// checker crash.
    #[serde(default = "default_diagnostic_exit_codes")]
    pub diagnostic_exit_codes: Vec<i32>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: default_tool_command(),
            config_file: None,
            diagnostic_exit_codes: default_diagnostic_exit_codes(),
        }
    }
}

/// Execution limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Wall-clock budget per partition in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Concurrent partition executions.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            jobs: DEFAULT_JOBS,
        }
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Whether the result cache is consulted and written.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            enabled: true,
        }
    }
}

/// A locked environment registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Environment name.
    pub name: String,

    /// Lockfile path, relative to the config file's directory.
    pub lockfile: PathBuf,

    /// Resolves this environment serves. Defaults to `[name]`.
    #[serde(default)]
    pub resolves: Vec<String>,

    /// Wins over lower-precedence environments when both match a key.
    #[serde(default)]
    pub precedence: u32,
}

impl EnvironmentConfig {
    /// Resolves served by this environment.
    pub fn served_resolves(&self) -> Vec<String> {
        if self.resolves.is_empty() {
            vec![self.name.clone()]
        } else {
            self.resolves.clone()
        }
    }
}

/// A source unit: the per-unit metadata an upstream build graph would feed
/// the partitioner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Directory the unit's sources live under.
    pub root: PathBuf,

    /// Resolve identity for this unit's third-party dependencies.
    pub resolve: String,

    /// Interpreter constraint sets (OR of AND-sets).
    pub interpreter_constraints: Vec<String>,

    /// Globs selecting the unit's files, relative to `root`.
    #[serde(default = "default_include")]
    pub include: Vec<String>,
}

/// Root repo configuration (`typegate.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub tool: ToolConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default, rename = "environment")]
    pub environments: Vec<EnvironmentConfig>,

    #[serde(default, rename = "unit")]
    pub units: Vec<UnitConfig>,
}

impl RepoConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: RepoConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate bounds and cross-references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool.command.is_empty() {
            return Err(ConfigError::Validation(
                "tool.command must not be empty".to_string(),
            ));
        }

        // timeout_seconds must be in (0, 86400]
        if self.limits.timeout_seconds == 0 || self.limits.timeout_seconds > 86400 {
            return Err(ConfigError::Validation(format!(
                "limits.timeout_seconds must be in (0, 86400], got {}",
                self.limits.timeout_seconds
            )));
        }

        // jobs must be in [1, 256]
        if self.limits.jobs == 0 || self.limits.jobs > 256 {
            return Err(ConfigError::Validation(format!(
                "limits.jobs must be in [1, 256], got {}",
                self.limits.jobs
            )));
        }

        let mut names: Vec<&str> = self.environments.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                return Err(ConfigError::Validation(format!(
                    "duplicate environment name {:?}",
                    pair[0]
                )));
            }
        }

        for unit in &self.units {
            if unit.interpreter_constraints.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "unit {:?} declares no interpreter constraints",
                    unit.root.display()
                )));
            }
            if unit.resolve.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "unit {:?} declares no resolve",
                    unit.root.display()
                )));
            }
        }

        Ok(())
    }
}

fn default_tool_command() -> Vec<String> {
    vec!["mypy".to_string()]
}

fn default_diagnostic_exit_codes() -> Vec<i32> {
    vec![1]
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_jobs() -> usize {
    DEFAULT_JOBS
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".typegate/cache")
}

fn default_include() -> Vec<String> {
    vec!["**/*.py".to_string()]
}

fn default_true() -> bool {
    true
}
