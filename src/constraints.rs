//! Interpreter constraint parsing and overlap checks
//!
//! Units and locked environments both declare the interpreter versions they
//! are valid for (e.g. `CPython>=3.8,<3.12`). Partitioning only needs two
//! questions answered: does a version satisfy a constraint set, and do two
//! constraint sets admit at least one common version. Both are computed over
//! a bounded universe of CPython minor versions rather than a full version
//! algebra.

use std::fmt;

use thiserror::Error;

/// Versions considered when testing overlap: CPython 2.7 and 3.0..=3.30.
const UNIVERSE_MAX_MINOR: u32 = 30;

/// Constraint parse errors
#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("empty interpreter constraint")]
    Empty,

    #[error("unsupported constraint operator in {0:?}")]
    BadOperator(String),

    #[error("invalid version in constraint {0:?}")]
    BadVersion(String),
}

/// Comparison operator of a single constraint atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

/// One comparison against a major.minor interpreter version
#[derive(Debug, Clone, PartialEq, Eq)]
struct Atom {
    op: Op,
    major: u32,
    minor: u32,
}

impl Atom {
    fn holds(&self, major: u32, minor: u32) -> bool {
        let lhs = (major, minor);
        let rhs = (self.major, self.minor);
        match self.op {
            Op::Eq => lhs == rhs,
            Op::Ne => lhs != rhs,
            Op::Ge => lhs >= rhs,
            Op::Gt => lhs > rhs,
            Op::Le => lhs <= rhs,
            Op::Lt => lhs < rhs,
        }
    }
}

/// A conjunction of constraint atoms, e.g. `CPython>=3.8,<3.12`.
///
/// Retains the raw text it was parsed from; the raw form participates in
/// `CompatibilityKey` string rendering, so it must survive round trips
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintSet {
    raw: String,
    atoms: Vec<Atom>,
}

impl ConstraintSet {
    /// Parse a comma-joined constraint set.
    ///
    /// Each atom may carry an optional `CPython` prefix. Trailing version
    /// components beyond major.minor (`.1`, `.*`) are ignored: partition
    /// compatibility is a minor-version question.
    pub fn parse(raw: &str) -> Result<Self, ConstraintError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConstraintError::Empty);
        }

        let mut atoms = Vec::new();
        for part in trimmed.split(',') {
            let part = part.trim().trim_start_matches("CPython").trim();
            if part.is_empty() {
                return Err(ConstraintError::BadOperator(trimmed.to_string()));
            }

            let (op, rest) = if let Some(r) = part.strip_prefix("==") {
                (Op::Eq, r)
            } else if let Some(r) = part.strip_prefix("!=") {
                (Op::Ne, r)
            } else if let Some(r) = part.strip_prefix(">=") {
                (Op::Ge, r)
            } else if let Some(r) = part.strip_prefix("<=") {
                (Op::Le, r)
            } else if let Some(r) = part.strip_prefix('>') {
                (Op::Gt, r)
            } else if let Some(r) = part.strip_prefix('<') {
                (Op::Lt, r)
            } else {
                return Err(ConstraintError::BadOperator(part.to_string()));
            };

            let (major, minor) = parse_version(rest.trim())
                .ok_or_else(|| ConstraintError::BadVersion(part.to_string()))?;
            atoms.push(Atom { op, major, minor });
        }

        Ok(Self {
            raw: trimmed.to_string(),
            atoms,
        })
    }

    /// The raw text this set was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Check whether a major.minor version satisfies every atom.
    pub fn satisfies(&self, major: u32, minor: u32) -> bool {
        self.atoms.iter().all(|a| a.holds(major, minor))
    }

    /// Check whether any version in the universe satisfies both sets.
    pub fn overlaps(&self, other: &ConstraintSet) -> bool {
        universe().any(|(maj, min)| self.satisfies(maj, min) && other.satisfies(maj, min))
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A disjunction of constraint sets (a unit or environment may declare
/// several alternatives; any one of them matching is enough).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    sets: Vec<ConstraintSet>,
}

impl Constraints {
    /// Parse a list of constraint-set strings.
    pub fn parse_all(raw: &[String]) -> Result<Self, ConstraintError> {
        if raw.is_empty() {
            return Err(ConstraintError::Empty);
        }
        let sets = raw
            .iter()
            .map(|s| ConstraintSet::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sets })
    }

    /// The member constraint sets.
    pub fn sets(&self) -> &[ConstraintSet] {
        &self.sets
    }

    /// Raw set strings in sorted order, the canonical form used in keys.
    pub fn sorted_raw(&self) -> Vec<String> {
        let mut raw: Vec<String> = self.sets.iter().map(|s| s.raw.clone()).collect();
        raw.sort();
        raw.dedup();
        raw
    }

    /// True if some version satisfies one set from each side.
    pub fn overlaps(&self, other: &Constraints) -> bool {
        self.sets
            .iter()
            .any(|a| other.sets.iter().any(|b| a.overlaps(b)))
    }
}

fn universe() -> impl Iterator<Item = (u32, u32)> {
    std::iter::once((2, 7)).chain((0..=UNIVERSE_MAX_MINOR).map(|m| (3, m)))
}

fn parse_version(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    // Anything further ("1", "*") is below partition granularity.
    for extra in parts {
        if extra != "*" && extra.parse::<u32>().is_err() {
            return None;
        }
    }
    Some((major, minor))
}
