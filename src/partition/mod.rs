//! Partitioner
//!
//! Groups source units by compatibility key into the minimal set of checker
//! invocations. Emission order is deterministic: partitions ascend by the
//! key's canonical string form and files within a partition ascend by path.
//! Aggregation relies on this ordering, not on execution order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::key::{select_environment, CompatibilityKey, EnvironmentBinding, KeyError, SourceUnit};
use crate::lockenv::LockedEnvironment;

/// A batch of files sharing one compatible execution environment.
///
/// Immutable once constructed; consumed exactly once by the executor.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Grouping key
    pub key: CompatibilityKey,
    /// Member files, lexicographically sorted and deduped
    pub files: Vec<PathBuf>,
    /// The locked environment this batch runs in
    pub environment: LockedEnvironment,
}

impl Partition {
    /// Stable human label for logs and untagged diagnostics.
    pub fn label(&self) -> String {
        self.key.label()
    }
}

/// Group units into partitions.
///
/// Every input file lands in exactly one partition; duplicate paths within
/// one key collapse. An empty input produces an empty plan. Environment
/// selection failures (no overlap, precedence tie) abort partitioning
/// before anything executes.
pub fn partition(
    units: &[SourceUnit],
    config_digest: &str,
    bindings: &[EnvironmentBinding<'_>],
) -> Result<Vec<Partition>, KeyError> {
    let mut groups: BTreeMap<CompatibilityKey, (BTreeSet<PathBuf>, LockedEnvironment)> =
        BTreeMap::new();

    for unit in units {
        let key = CompatibilityKey::for_unit(unit, config_digest);
        match groups.get_mut(&key) {
            Some((files, _)) => {
                files.insert(unit.path.clone());
            }
            None => {
                let environment = select_environment(unit, bindings)?.clone();
                let mut files = BTreeSet::new();
                files.insert(unit.path.clone());
                groups.insert(key, (files, environment));
            }
        }
    }

    // BTreeMap iteration already ascends by key canonical form, and the
    // BTreeSet gives sorted files.
    Ok(groups
        .into_iter()
        .map(|(key, (files, environment))| Partition {
            key,
            files: files.into_iter().collect(),
            environment,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::Constraints;
    use std::io::Write;
    use std::path::Path;

    fn unit(path: &str, resolve: &str, ics: &[&str]) -> SourceUnit {
        SourceUnit {
            path: PathBuf::from(path),
            resolve: resolve.to_string(),
            constraints: Constraints::parse_all(
                &ics.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
            .unwrap(),
        }
    }

    fn lockfile(dir: &Path, name: &str, ics: &str) -> PathBuf {
        let path = dir.join(format!("{name}.lock"));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# tool: mypy==1.8.0").unwrap();
        writeln!(f, "# interpreter_constraints: {ics}").unwrap();
        path
    }

    fn single_binding<'a>(
        env: &'a LockedEnvironment,
        resolves: &[&str],
    ) -> Vec<EnvironmentBinding<'a>> {
        vec![EnvironmentBinding {
            environment: env,
            serves: resolves.iter().map(|s| s.to_string()).collect(),
        }]
    }

    #[test]
    fn test_empty_input_yields_no_partitions() {
        let partitions = partition(&[], "digest", &[]).unwrap();
        assert!(partitions.is_empty());
    }

    #[test]
    fn test_same_key_shares_one_partition() {
        let dir = tempfile::tempdir().unwrap();
        let env =
            LockedEnvironment::load("default", &lockfile(dir.path(), "default", ">=3.8"), 0)
                .unwrap();
        let bindings = single_binding(&env, &["default"]);

        let units = vec![
            unit("b.py", "default", &[">=3.8,<3.12"]),
            unit("a.py", "default", &[">=3.8,<3.12"]),
        ];
        let partitions = partition(&units, "digest", &bindings).unwrap();

        assert_eq!(partitions.len(), 1);
        assert_eq!(
            partitions[0].files,
            vec![PathBuf::from("a.py"), PathBuf::from("b.py")]
        );
    }

    #[test]
    fn test_distinct_resolves_split() {
        let dir = tempfile::tempdir().unwrap();
        let env =
            LockedEnvironment::load("shared", &lockfile(dir.path(), "shared", ">=3.8"), 0).unwrap();
        let bindings = single_binding(&env, &["app", "lib"]);

        let units = vec![
            unit("lib/x.py", "lib", &[">=3.8"]),
            unit("app/y.py", "app", &[">=3.8"]),
        ];
        let partitions = partition(&units, "digest", &bindings).unwrap();

        assert_eq!(partitions.len(), 2);
        // Ascending by key canonical form: "app::..." before "lib::...".
        assert_eq!(partitions[0].key.resolve, "app");
        assert_eq!(partitions[1].key.resolve, "lib");
    }

    #[test]
    fn test_no_loss_no_duplication() {
        let dir = tempfile::tempdir().unwrap();
        let env =
            LockedEnvironment::load("default", &lockfile(dir.path(), "default", ">=3.8"), 0)
                .unwrap();
        let bindings = single_binding(&env, &["a", "b", "c"]);

        let units: Vec<SourceUnit> = (0..20)
            .map(|i| {
                let resolve = ["a", "b", "c"][i % 3];
                unit(&format!("src/f{i:02}.py"), resolve, &[">=3.8"])
            })
            .collect();

        let partitions = partition(&units, "digest", &bindings).unwrap();

        let mut seen: Vec<PathBuf> = partitions
            .iter()
            .flat_map(|p| p.files.iter().cloned())
            .collect();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(total, seen.len(), "a file appeared in two partitions");
        assert_eq!(seen.len(), units.len());
    }

    #[test]
    fn test_duplicate_paths_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let env =
            LockedEnvironment::load("default", &lockfile(dir.path(), "default", ">=3.8"), 0)
                .unwrap();
        let bindings = single_binding(&env, &["default"]);

        let units = vec![
            unit("a.py", "default", &[">=3.8"]),
            unit("a.py", "default", &[">=3.8"]),
        ];
        let partitions = partition(&units, "digest", &bindings).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].files.len(), 1);
    }

    #[test]
    fn test_ordering_is_input_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let env =
            LockedEnvironment::load("default", &lockfile(dir.path(), "default", ">=3.8"), 0)
                .unwrap();
        let bindings = single_binding(&env, &["app", "lib"]);

        let mut units = vec![
            unit("z.py", "lib", &[">=3.8"]),
            unit("m.py", "app", &[">=3.8"]),
            unit("a.py", "lib", &[">=3.8"]),
        ];
        let first = partition(&units, "digest", &bindings).unwrap();
        units.reverse();
        let second = partition(&units, "digest", &bindings).unwrap();

        let shape =
            |ps: &[Partition]| -> Vec<(String, Vec<PathBuf>)> {
                ps.iter()
                    .map(|p| (p.key.canonical(), p.files.clone()))
                    .collect()
            };
        assert_eq!(shape(&first), shape(&second));
    }

    #[test]
    fn test_selection_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let env =
            LockedEnvironment::load("default", &lockfile(dir.path(), "default", "<3.9"), 0)
                .unwrap();
        let bindings = single_binding(&env, &["default"]);

        let units = vec![unit("a.py", "default", &[">=3.11"])];
        let err = partition(&units, "digest", &bindings).unwrap_err();
        assert!(matches!(err, KeyError::UnresolvableConstraints { .. }));
    }
}
