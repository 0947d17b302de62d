//! Lockfile store for pinned checker environments
//!
//! Each locked environment describes the type checker's own execution
//! environment: the tool pin, the packages it runs with (plugins, stub
//! packages), and the interpreter versions the environment supports. The
//! store only reads lockfiles; generating or updating them is a separate,
//! user-invoked concern.
//!
//! Lockfile format:
//!
//! ```text
//! # tool: mypy==1.8.0
//! # interpreter_constraints: >=3.8,<3.12
//! attrs==23.1.0
//! types-requests==2.31.0.6
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::constraints::{ConstraintError, Constraints};

/// Lockfile store errors
#[derive(Debug, Error)]
pub enum LockfileError {
    #[error("unknown environment {name:?} (known: {})", known.join(", "))]
    UnknownEnvironment { name: String, known: Vec<String> },

    #[error("invalid lockfile {path}: {reason}")]
    InvalidLockfile { path: String, reason: String },

    #[error("failed to read lockfile {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid interpreter constraints in lockfile {path}: {source}")]
    Constraints {
        path: String,
        #[source]
        source: ConstraintError,
    },
}

/// A pinned `name==version` requirement.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PackagePin {
    pub name: String,
    pub version: String,
}

impl fmt::Display for PackagePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.name, self.version)
    }
}

/// An immutable, pinned description of the checker's runtime environment.
///
/// Loaded once per configured environment and never mutated; the content
/// hash over the raw lockfile bytes feeds every cache key derived from this
/// environment.
#[derive(Debug, Clone)]
pub struct LockedEnvironment {
    /// Environment name as registered in config
    pub name: String,
    /// The checker itself, pinned
    pub tool: PackagePin,
    /// Pinned package set the checker runs with
    pub pins: Vec<PackagePin>,
    /// Interpreter versions this environment supports
    pub constraints: Constraints,
    /// Precedence when several environments match one key (higher wins)
    pub precedence: u32,
    /// SHA-256 of the raw lockfile bytes
    pub content_hash: String,
    /// Where the lockfile was read from
    pub path: PathBuf,
}

impl LockedEnvironment {
    /// Load a locked environment from a lockfile on disk.
    pub fn load(name: &str, path: &Path, precedence: u32) -> Result<Self, LockfileError> {
        let bytes = fs::read(path).map_err(|e| LockfileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let content_hash = hex::encode(hasher.finalize());

        let text = String::from_utf8_lossy(&bytes);
        let mut tool: Option<PackagePin> = None;
        let mut constraint_strings: Vec<String> = Vec::new();
        let mut pins = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                let rest = rest.trim();
                if let Some(value) = rest.strip_prefix("tool:") {
                    tool = Some(parse_pin(value.trim()).ok_or_else(|| {
                        LockfileError::InvalidLockfile {
                            path: path.display().to_string(),
                            reason: format!("line {}: bad tool pin {:?}", lineno + 1, value.trim()),
                        }
                    })?);
                } else if let Some(value) = rest.strip_prefix("interpreter_constraints:") {
                    constraint_strings.extend(value.split("||").map(|s| s.trim().to_string()));
                }
                continue;
            }

            let pin = parse_pin(line).ok_or_else(|| LockfileError::InvalidLockfile {
                path: path.display().to_string(),
                reason: format!("line {}: expected name==version, got {:?}", lineno + 1, line),
            })?;
            pins.push(pin);
        }

        let tool = tool.ok_or_else(|| LockfileError::InvalidLockfile {
            path: path.display().to_string(),
            reason: "missing `# tool:` header".to_string(),
        })?;

        if constraint_strings.is_empty() {
            return Err(LockfileError::InvalidLockfile {
                path: path.display().to_string(),
                reason: "missing `# interpreter_constraints:` header".to_string(),
            });
        }

        let constraints = Constraints::parse_all(&constraint_strings).map_err(|e| {
            LockfileError::Constraints {
                path: path.display().to_string(),
                source: e,
            }
        })?;

        Ok(Self {
            name: name.to_string(),
            tool,
            pins,
            constraints,
            precedence,
            content_hash,
            path: path.to_path_buf(),
        })
    }

    /// Canonical `name==version` form of the tool pin.
    pub fn tool_identity(&self) -> String {
        self.tool.to_string()
    }
}

/// Read-only registry of locked environments, looked up by name.
#[derive(Debug, Default)]
pub struct LockfileStore {
    environments: BTreeMap<String, LockedEnvironment>,
}

impl LockfileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and register an environment, replacing any previous entry with
    /// the same name.
    pub fn register(
        &mut self,
        name: &str,
        path: &Path,
        precedence: u32,
    ) -> Result<(), LockfileError> {
        let env = LockedEnvironment::load(name, path, precedence)?;
        self.environments.insert(name.to_string(), env);
        Ok(())
    }

    /// Resolve an environment by name.
    pub fn resolve(&self, name: &str) -> Result<&LockedEnvironment, LockfileError> {
        self.environments
            .get(name)
            .ok_or_else(|| LockfileError::UnknownEnvironment {
                name: name.to_string(),
                known: self.names(),
            })
    }

    /// All registered environments in name order.
    pub fn environments(&self) -> impl Iterator<Item = &LockedEnvironment> {
        self.environments.values()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    /// Number of registered environments.
    pub fn len(&self) -> usize {
        self.environments.len()
    }

    /// True if no environments are registered.
    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

fn parse_pin(s: &str) -> Option<PackagePin> {
    let (name, version) = s.split_once("==")?;
    let name = name.trim();
    let version = version.trim();
    if name.is_empty() || version.is_empty() || version.contains("==") {
        return None;
    }
    Some(PackagePin {
        name: name.to_string(),
        version: version.to_string(),
    })
}
