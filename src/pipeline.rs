//! Check pipeline orchestration
//!
//! Wires the stages together: load and digest config, load locked
//! environments, collect source units, partition, execute partitions on a
//! bounded worker pool, and aggregate. Per-partition execution failures are
//! collected rather than aborting siblings; only configuration-level errors
//! (bad config, unknown environment, unresolvable constraints) abort the
//! run before anything executes.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::{CacheError, ResultCache};
use crate::cancel::CancelToken;
use crate::config::{config_digest, ConfigError, DigestError, RepoConfig};
use crate::constraints::{ConstraintError, Constraints};
use crate::executor::{ExecutionFailure, ExecutionResult, Executor, ExecutorConfig};
use crate::key::{EnvironmentBinding, KeyError, SourceUnit};
use crate::lockenv::{LockfileError, LockfileStore};
use crate::partition::{partition, Partition};
use crate::report::AggregateReport;

/// Pipeline errors. All of these are "the checker could not run" conditions
/// and map to exit class 2.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("config digest error: {0}")]
    Digest(#[from] DigestError),

    #[error("lockfile error: {0}")]
    Lockfile(#[from] LockfileError),

    #[error("invalid unit constraints: {0}")]
    Constraints(#[from] ConstraintError),

    #[error("partitioning error: {0}")]
    Key(#[from] KeyError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("invalid target pattern {pattern:?}: {message}")]
    BadPattern { pattern: String, message: String },

    #[error(
        "{path} is claimed by units rooted at {} and {}; unit roots must not overlap",
        first.display(),
        second.display()
    )]
    OverlappingUnits {
        path: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Exit code for this error. Every pipeline error means the checker
    /// never produced a usable verdict, so they all land in the failure
    /// class.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline settings: config file location plus CLI overrides.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Project root; unit roots and lockfile paths resolve against it
    pub project_root: PathBuf,

    /// Path to the repo config file
    pub config_path: PathBuf,

    /// Override for `limits.jobs`
    pub jobs: Option<usize>,

    /// Override for `limits.timeout_seconds`
    pub timeout_seconds: Option<u64>,

    /// Skip cache lookups and writes for this run
    pub no_cache: bool,

    /// Verbose progress output on stderr
    pub verbose: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            config_path: PathBuf::from("typegate.toml"),
            jobs: None,
            timeout_seconds: None,
            no_cache: false,
            verbose: false,
        }
    }
}

/// The partition plan plus everything needed to execute it.
#[derive(Debug)]
pub struct Pipeline {
    settings: PipelineConfig,
    repo_config: RepoConfig,
    digest: String,
    store: LockfileStore,
}

impl Pipeline {
    /// Load config and locked environments. Fails fast on config errors and
    /// unknown environments, before any file collection.
    pub fn load(settings: PipelineConfig) -> PipelineResult<Self> {
        let mut repo_config = RepoConfig::from_file(&settings.config_path)?;

        if let Some(jobs) = settings.jobs {
            repo_config.limits.jobs = jobs;
        }
        if let Some(timeout) = settings.timeout_seconds {
            repo_config.limits.timeout_seconds = timeout;
        }
        repo_config.validate()?;

        let digest = config_digest(&repo_config, &settings.project_root)?;

        let mut store = LockfileStore::new();
        for env in &repo_config.environments {
            let path = settings.project_root.join(&env.lockfile);
            store.register(&env.name, &path, env.precedence)?;
        }

        if settings.verbose {
            eprintln!(
                "Loaded {} environment(s), config digest {}",
                store.len(),
                &digest[..12]
            );
        }

        Ok(Self {
            settings,
            repo_config,
            digest,
            store,
        })
    }

    /// The effective repo config after CLI overrides.
    pub fn repo_config(&self) -> &RepoConfig {
        &self.repo_config
    }

    /// The loaded lockfile store.
    pub fn store(&self) -> &LockfileStore {
        &self.store
    }

    /// Build the partition plan for a target selection without executing.
    pub fn plan(&self, patterns: &[String]) -> PipelineResult<Vec<Partition>> {
        let units = self.collect_units(patterns)?;
        let bindings = self.bindings()?;
        Ok(partition(&units, &self.digest, &bindings)?)
    }

    /// Run the full pipeline for a target selection.
    pub fn run(
        &self,
        patterns: &[String],
        cancel: &CancelToken,
    ) -> PipelineResult<AggregateReport> {
        let started = Instant::now();
        let run_id = ulid::Ulid::new().to_string();

        let partitions = self.plan(patterns)?;
        if partitions.is_empty() {
            if self.settings.verbose {
                eprintln!("No files selected; nothing to check");
            }
            return Ok(AggregateReport::empty(run_id));
        }

        if self.settings.verbose {
            eprintln!(
                "Checking {} file(s) in {} partition(s)",
                partitions.iter().map(|p| p.files.len()).sum::<usize>(),
                partitions.len()
            );
        }

        let cache = if self.repo_config.cache.enabled && !self.settings.no_cache {
            Some(ResultCache::open(
                &self.settings.project_root.join(&self.repo_config.cache.dir),
            )?)
        } else {
            None
        };

        let executor = Executor::new(
            ExecutorConfig {
                command: self.repo_config.tool.command.clone(),
                tool_config: self.repo_config.tool.config_file.clone(),
                diagnostic_exit_codes: self.repo_config.tool.diagnostic_exit_codes.clone(),
                timeout: Duration::from_secs(self.repo_config.limits.timeout_seconds),
                project_root: self.settings.project_root.clone(),
                sandbox_root: std::env::temp_dir().join("typegate"),
            },
            cache,
            &self.digest,
        );

        let outcomes = run_pool(
            &executor,
            &partitions,
            self.repo_config.limits.jobs,
            cancel,
        );

        let outcomes: Vec<(Partition, Result<ExecutionResult, ExecutionFailure>)> = partitions
            .into_iter()
            .zip(outcomes)
            .collect();

        let duration_ms = started.elapsed().as_millis() as u64;
        Ok(AggregateReport::aggregate(run_id, outcomes, duration_ms))
    }

    fn bindings(&self) -> PipelineResult<Vec<EnvironmentBinding<'_>>> {
        let mut bindings = Vec::with_capacity(self.repo_config.environments.len());
        for env_config in &self.repo_config.environments {
            let environment = self.store.resolve(&env_config.name)?;
            bindings.push(EnvironmentBinding {
                environment,
                serves: env_config.served_resolves(),
            });
        }
        Ok(bindings)
    }

    /// Expand config units into per-file source units, filtered by the CLI
    /// target patterns (empty selection means everything).
    fn collect_units(&self, patterns: &[String]) -> PipelineResult<Vec<SourceUnit>> {
        let selection = build_globset(patterns)?;
        let mut units = Vec::new();
        // Each file must be claimed by exactly one unit, or it would be
        // checked twice under two different keys.
        let mut claims: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();

        for unit in &self.repo_config.units {
            let constraints = Constraints::parse_all(&unit.interpreter_constraints)?;
            let include = build_globset(&unit.include)?;
            let root = self.settings.project_root.join(&unit.root);

            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    PipelineError::Io(io::Error::other(format!(
                        "walking {}: {e}",
                        root.display()
                    )))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let rel_to_unit = entry
                    .path()
                    .strip_prefix(&root)
                    .expect("walkdir entries live under their root");
                if let Some(ref include) = include {
                    if !include.is_match(rel_to_unit) {
                        continue;
                    }
                }

                let rel = entry
                    .path()
                    .strip_prefix(&self.settings.project_root)
                    .unwrap_or(entry.path())
                    .to_path_buf();

                if let Some(previous) = claims.insert(rel.clone(), unit.root.clone()) {
                    return Err(PipelineError::OverlappingUnits {
                        path: rel.display().to_string(),
                        first: previous,
                        second: unit.root.clone(),
                    });
                }

                if let Some(ref sel) = selection {
                    if !sel.is_match(&rel) {
                        continue;
                    }
                }

                units.push(SourceUnit {
                    path: rel,
                    resolve: unit.resolve.clone(),
                    constraints: constraints.clone(),
                });
            }
        }

        Ok(units)
    }
}

fn build_globset(patterns: &[String]) -> PipelineResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| PipelineError::BadPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| PipelineError::BadPattern {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })?;
    Ok(Some(set))
}

/// Execute partitions on a bounded worker pool.
///
/// Partitions are independent by construction, so workers pull indices from
/// a shared queue and write results into their own slot. Output order
/// matches input order regardless of scheduling.
fn run_pool(
    executor: &Executor,
    partitions: &[Partition],
    jobs: usize,
    cancel: &CancelToken,
) -> Vec<Result<ExecutionResult, ExecutionFailure>> {
    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..partitions.len()).collect());
    let slots: Vec<Mutex<Option<Result<ExecutionResult, ExecutionFailure>>>> =
        (0..partitions.len()).map(|_| Mutex::new(None)).collect();

    let workers = jobs.min(partitions.len()).max(1);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = {
                    let mut queue = queue.lock().expect("queue poisoned");
                    queue.pop_front()
                };
                let Some(index) = index else { break };

                let outcome = if cancel.is_cancelled() {
                    Err(ExecutionFailure::Cancelled)
                } else {
                    executor.execute(&partitions[index], cancel)
                };
                *slots[index].lock().expect("slot poisoned") = Some(outcome);
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .expect("slot poisoned")
                .unwrap_or(Err(ExecutionFailure::Cancelled))
        })
        .collect()
}

/// Convenience entry point: load and run in one call.
pub fn run_check(
    settings: PipelineConfig,
    patterns: &[String],
    cancel: &CancelToken,
) -> PipelineResult<AggregateReport> {
    let pipeline = Pipeline::load(settings)?;
    pipeline.run(patterns, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_file(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
    }

    fn write_script(root: &Path, rel: &str, body: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn write_lockfile(root: &Path, rel: &str, ics: &str) {
        write_file(
            root,
            rel,
            &format!("# tool: mypy==1.8.0\n# interpreter_constraints: {ics}\n"),
        );
    }

    fn settings(root: &Path) -> PipelineConfig {
        PipelineConfig {
            project_root: root.to_path_buf(),
            config_path: root.join("typegate.toml"),
            ..PipelineConfig::default()
        }
    }

    fn setup_project(root: &Path, checker_body: &str) {
        let script = write_script(root, "bin/check", checker_body);
        write_lockfile(root, "locks/default.lock", ">=3.8,<3.13");
        write_file(root, "src/app/a.py", "x = 1\n");
        write_file(root, "src/app/b.py", "y = 2\n");
        write_file(
            root,
            "typegate.toml",
            &format!(
                r#"
[tool]
command = ["{}"]

[cache]
dir = ".typegate/cache"

[[environment]]
name = "default"
lockfile = "locks/default.lock"

[[unit]]
root = "src/app"
resolve = "default"
interpreter_constraints = [">=3.9,<3.12"]
"#,
                script.display()
            ),
        );
    }

    #[test]
    fn test_plan_collects_and_partitions() {
        let dir = tempfile::tempdir().unwrap();
        setup_project(dir.path(), "exit 0");

        let pipeline = Pipeline::load(settings(dir.path())).unwrap();
        let plan = pipeline.plan(&[]).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].files.len(), 2);
        assert_eq!(plan[0].environment.name, "default");
    }

    #[test]
    fn test_pattern_selection() {
        let dir = tempfile::tempdir().unwrap();
        setup_project(dir.path(), "exit 0");

        let pipeline = Pipeline::load(settings(dir.path())).unwrap();
        let plan = pipeline.plan(&["**/a.py".to_string()]).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].files.len(), 1);
        assert!(plan[0].files[0].ends_with("a.py"));
    }

    #[test]
    fn test_bad_pattern() {
        let dir = tempfile::tempdir().unwrap();
        setup_project(dir.path(), "exit 0");

        let pipeline = Pipeline::load(settings(dir.path())).unwrap();
        let err = pipeline.plan(&["[".to_string()]).unwrap_err();
        assert!(matches!(err, PipelineError::BadPattern { .. }));
    }

    #[test]
    fn test_run_clean_project() {
        let dir = tempfile::tempdir().unwrap();
        setup_project(dir.path(), "exit 0");

        let report = run_check(settings(dir.path()), &[], &CancelToken::new()).unwrap();
        assert!(report.success);
        assert_eq!(report.exit_class.as_i32(), 0);
        assert_eq!(report.partitions_total, 1);
    }

    #[test]
    fn test_empty_selection_is_success() {
        let dir = tempfile::tempdir().unwrap();
        setup_project(dir.path(), "exit 0");

        let report = run_check(
            settings(dir.path()),
            &["**/nothing-matches.py".to_string()],
            &CancelToken::new(),
        )
        .unwrap();
        assert!(report.success);
        assert_eq!(report.partitions_total, 0);
    }

    #[test]
    fn test_missing_lockfile_aborts_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        setup_project(dir.path(), "exit 0");
        fs::remove_file(dir.path().join("locks/default.lock")).unwrap();

        let err = Pipeline::load(settings(dir.path())).unwrap_err();
        assert!(matches!(err, PipelineError::Lockfile(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_unresolvable_constraints_abort_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        // Checker would crash if invoked; it must never run.
        setup_project(dir.path(), "exit 9");
        write_lockfile(dir.path(), "locks/default.lock", "<3.7");

        let pipeline = Pipeline::load(settings(dir.path())).unwrap();
        let err = pipeline.run(&[], &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Key(_)));
    }

    #[test]
    fn test_overlapping_unit_roots_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "bin/check", "exit 0");
        write_lockfile(dir.path(), "locks/default.lock", ">=3.8");
        write_file(dir.path(), "src/app/a.py", "x = 1\n");
        write_file(
            dir.path(),
            "typegate.toml",
            &format!(
                r#"
[tool]
command = ["{}"]

[[environment]]
name = "default"
lockfile = "locks/default.lock"
resolves = ["wide", "narrow"]

[[unit]]
root = "src"
resolve = "wide"
interpreter_constraints = [">=3.9"]

[[unit]]
root = "src/app"
resolve = "narrow"
interpreter_constraints = [">=3.9"]
"#,
                script.display()
            ),
        );

        let pipeline = Pipeline::load(settings(dir.path())).unwrap();
        let err = pipeline.plan(&[]).unwrap_err();
        assert!(matches!(err, PipelineError::OverlappingUnits { .. }));
        let message = err.to_string();
        assert!(message.contains("src/app/a.py"));
        assert!(message.contains("src/app"));
    }

    #[test]
    fn test_cancelled_run_reports_failure_class() {
        let dir = tempfile::tempdir().unwrap();
        setup_project(dir.path(), "exit 0");

        let token = CancelToken::new();
        token.cancel();
        let report = run_check(settings(dir.path()), &[], &token).unwrap();
        assert_eq!(report.exit_class.as_i32(), 2);
        assert_eq!(report.failures.len(), 1);
    }
}
