//! Compatibility keys
//!
//! A compatibility key decides which source files may share one checker
//! invocation: the unit's interpreter constraints, its resolve identity, and
//! the effective config digest. Key derivation is pure; identical inputs
//! must yield byte-identical keys because the key's canonical string form
//! feeds partition ordering and cache digests.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constraints::Constraints;
use crate::lockenv::LockedEnvironment;

/// Key derivation and environment selection errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error(
        "no locked environment matches {path} (resolve {resolve:?}, constraints [{}]; known environments: {})",
        constraints.join(", "),
        known.join(", ")
    )]
    UnresolvableConstraints {
        path: String,
        resolve: String,
        constraints: Vec<String>,
        known: Vec<String>,
    },

    #[error(
        "ambiguous partition for resolve {resolve:?}: environments {:?} and {:?} both match at precedence {precedence}",
        first,
        second
    )]
    AmbiguousPartition {
        resolve: String,
        first: String,
        second: String,
        precedence: u32,
    },
}

/// A source file plus the per-unit metadata the build graph supplies for it.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Source file path
    pub path: PathBuf,
    /// Resolve identity of the owning unit
    pub resolve: String,
    /// Interpreter constraints of the owning unit
    pub constraints: Constraints,
}

/// The grouping key for checker invocations.
///
/// Compared structurally; ordered by canonical string form so partition
/// emission order is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompatibilityKey {
    /// Sorted raw constraint-set strings
    pub interpreter_constraints: Vec<String>,
    /// Resolve identity
    pub resolve: String,
    /// Effective config digest
    pub config_digest: String,
}

impl CompatibilityKey {
    /// Derive the key for a source unit. Pure: equal inputs give equal keys.
    pub fn for_unit(unit: &SourceUnit, config_digest: &str) -> Self {
        Self {
            interpreter_constraints: unit.constraints.sorted_raw(),
            resolve: unit.resolve.clone(),
            config_digest: config_digest.to_string(),
        }
    }

    /// Canonical string form, the basis for ordering and digests.
    pub fn canonical(&self) -> String {
        format!(
            "{}::{}::{}",
            self.resolve,
            self.interpreter_constraints.join(" || "),
            self.config_digest
        )
    }

    /// Short human label: resolve plus constraints, without the digest.
    pub fn label(&self) -> String {
        format!("{} ({})", self.resolve, self.interpreter_constraints.join(" || "))
    }
}

impl fmt::Display for CompatibilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl Ord for CompatibilityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

impl PartialOrd for CompatibilityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A locked environment together with the resolves it serves.
#[derive(Debug, Clone)]
pub struct EnvironmentBinding<'a> {
    pub environment: &'a LockedEnvironment,
    pub serves: Vec<String>,
}

/// Select the locked environment for a unit's key.
///
/// An environment matches when it serves the unit's resolve and its declared
/// interpreter constraints overlap the unit's. Among matches the strictly
/// highest precedence wins; a precedence tie between two environments is an
/// error surfaced with both candidates named.
pub fn select_environment<'a>(
    unit: &SourceUnit,
    bindings: &[EnvironmentBinding<'a>],
) -> Result<&'a LockedEnvironment, KeyError> {
    let mut matches: Vec<&LockedEnvironment> = bindings
        .iter()
        .filter(|b| b.serves.iter().any(|r| r == &unit.resolve))
        .filter(|b| b.environment.constraints.overlaps(&unit.constraints))
        .map(|b| b.environment)
        .collect();

    if matches.is_empty() {
        return Err(KeyError::UnresolvableConstraints {
            path: unit.path.display().to_string(),
            resolve: unit.resolve.clone(),
            constraints: unit.constraints.sorted_raw(),
            known: bindings
                .iter()
                .map(|b| b.environment.name.clone())
                .collect(),
        });
    }

    matches.sort_by(|a, b| {
        b.precedence
            .cmp(&a.precedence)
            .then_with(|| a.name.cmp(&b.name))
    });

    if matches.len() > 1 && matches[0].precedence == matches[1].precedence {
        return Err(KeyError::AmbiguousPartition {
            resolve: unit.resolve.clone(),
            first: matches[0].name.clone(),
            second: matches[1].name.clone(),
            precedence: matches[0].precedence,
        });
    }

    Ok(matches[0])
}
