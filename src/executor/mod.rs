//! Sandboxed execution of checker invocations
//!
//! One partition maps to at most one subprocess run. The executor first
//! derives the cache key from every input that can affect the checker's
//! answer (file contents, locked environment hash, config digest, tool
//! identity, argv); a hit returns the stored result without spawning. On a
//! miss it materializes an isolated directory with only the partition's
//! files, the lockfile, and the tool config, runs the checker there with a
//! wall-clock budget, and commits normal completions to the cache.
//!
//! Outcome taxonomy:
//! - exit 0: clean run
//! - exit in the configured diagnostic set: normal run carrying type errors
//! - anything else, a timeout, or a cancellation: [`ExecutionFailure`],
//!   which is never cached

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{CacheEntry, ResultCache};
use crate::cancel::CancelToken;
use crate::partition::Partition;

/// Poll interval while waiting on the checker subprocess.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Environment variable naming the locked environment inside the sandbox.
pub const ENV_ENVIRONMENT: &str = "TYPEGATE_ENVIRONMENT";

/// Environment variable pointing at the materialized lockfile.
pub const ENV_LOCKFILE: &str = "TYPEGATE_LOCKFILE";

/// A failure of the checker process itself, distinct from reported type
/// errors. Never cached.
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("checker timed out after {limit_seconds}s")]
    Timeout { limit_seconds: u64 },

    #[error("checker run cancelled")]
    Cancelled,

    #[error("failed to spawn checker {command:?}: {message}")]
    Spawn { command: String, message: String },

    #[error("checker crashed with exit {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Crashed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("failed to materialize sandbox: {0}")]
    Sandbox(String),

    #[error("result cache error: {0}")]
    Cache(String),
}

/// A completed checker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Checker exit code (0 or a configured diagnostic code)
    pub exit_code: i32,
    /// Combined stdout+stderr
    pub output: String,
    /// Wall-clock duration in milliseconds (of the original run, for hits)
    pub duration_ms: u64,
    /// Whether this result was served from the cache
    pub from_cache: bool,
}

impl ExecutionResult {
    /// True if the checker reported type errors.
    pub fn has_diagnostics(&self) -> bool {
        self.exit_code != 0
    }
}

/// Inputs that define one executor, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Argv prefix; partition file paths are appended
    pub command: Vec<String>,
    /// Tool config file to materialize into each sandbox
    pub tool_config: Option<PathBuf>,
    /// Exit codes that mean "diagnostics found", not "crashed"
    pub diagnostic_exit_codes: Vec<i32>,
    /// Wall-clock budget per partition
    pub timeout: Duration,
    /// Project root that partition file paths are relative to
    pub project_root: PathBuf,
    /// Directory sandboxes are created under
    pub sandbox_root: PathBuf,
}

/// Executes partitions, consulting and feeding the result cache.
pub struct Executor {
    config: ExecutorConfig,
    cache: Option<ResultCache>,
    config_digest: String,
}

#[derive(Serialize)]
struct CacheKeyInputs<'a> {
    files: Vec<(String, String)>,
    environment_hash: &'a str,
    config_digest: &'a str,
    tool_identity: String,
    command: &'a [String],
}

impl Executor {
    /// Create an executor. `cache` is `None` when caching is disabled.
    pub fn new(config: ExecutorConfig, cache: Option<ResultCache>, config_digest: &str) -> Self {
        Self {
            config,
            cache,
            config_digest: config_digest.to_string(),
        }
    }

    /// Compute the cache key for a partition: a digest over the ordered
    /// file contents, the environment hash, the config digest, and the tool
    /// invocation.
    pub fn cache_key(&self, partition: &Partition) -> Result<String, ExecutionFailure> {
        let mut files = Vec::with_capacity(partition.files.len());
        for path in &partition.files {
            let abs = self.absolute(path);
            let bytes = fs::read(&abs).map_err(|e| {
                ExecutionFailure::Sandbox(format!("failed to read {}: {e}", abs.display()))
            })?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            files.push((path.display().to_string(), hex::encode(hasher.finalize())));
        }

        let inputs = CacheKeyInputs {
            files,
            environment_hash: &partition.environment.content_hash,
            config_digest: &self.config_digest,
            tool_identity: partition.environment.tool_identity(),
            command: &self.config.command,
        };

        let value = serde_json::to_value(&inputs)
            .map_err(|e| ExecutionFailure::Cache(e.to_string()))?;
        let canonical = serde_json_canonicalizer::to_vec(&value)
            .map_err(|e| ExecutionFailure::Cache(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Execute a partition, via the cache when possible.
    pub fn execute(
        &self,
        partition: &Partition,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let key = self.cache_key(partition)?;

        if let Some(ref cache) = self.cache {
            match cache.lookup(&key) {
                Ok(Some(entry)) => {
                    return Ok(ExecutionResult {
                        exit_code: entry.exit_code,
                        output: entry.output,
                        duration_ms: entry.duration_ms,
                        from_cache: true,
                    });
                }
                Ok(None) => {}
                Err(e) => return Err(ExecutionFailure::Cache(e.to_string())),
            }
        }

        if cancel.is_cancelled() {
            return Err(ExecutionFailure::Cancelled);
        }

        let result = self.run_in_sandbox(partition, cancel)?;

        if let Some(ref cache) = self.cache {
            let entry = CacheEntry::new(
                &key,
                result.exit_code,
                result.output.clone(),
                &partition.environment.tool_identity(),
                result.duration_ms,
            );
            cache
                .insert(&entry)
                .map_err(|e| ExecutionFailure::Cache(e.to_string()))?;
        }

        Ok(result)
    }

    fn run_in_sandbox(
        &self,
        partition: &Partition,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let sandbox = Sandbox::materialize(&self.config, partition)?;
        let started = Instant::now();

        let mut command = Command::new(&self.config.command[0]);
        command
            .args(&self.config.command[1..])
            .args(partition.files.iter().map(|p| p.as_os_str()))
            .current_dir(sandbox.path())
            .env(ENV_ENVIRONMENT, &partition.environment.name)
            .env(ENV_LOCKFILE, sandbox.lockfile_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| ExecutionFailure::Spawn {
            command: self.config.command.join(" "),
            message: e.to_string(),
        })?;

        // Drain pipes on threads so a chatty checker cannot deadlock the
        // poll loop on a full pipe buffer.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || drain(stdout));
        let stderr_reader = std::thread::spawn(move || drain(stderr));

        let deadline = started + self.config.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    return Err(ExecutionFailure::Spawn {
                        command: self.config.command.join(" "),
                        message: e.to_string(),
                    });
                }
            }

            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecutionFailure::Cancelled);
            }

            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecutionFailure::Timeout {
                    limit_seconds: self.config.timeout.as_secs(),
                });
            }

            std::thread::sleep(WAIT_POLL_INTERVAL);
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut output = stdout_reader.join().unwrap_or_default();
        output.push_str(&stderr_reader.join().unwrap_or_default());

        let exit_code = match status.code() {
            Some(code) => code,
            None => {
                // Killed by a signal outside our control.
                return Err(ExecutionFailure::Crashed {
                    exit_code: None,
                    output,
                });
            }
        };

        if exit_code != 0 && !self.config.diagnostic_exit_codes.contains(&exit_code) {
            return Err(ExecutionFailure::Crashed {
                exit_code: Some(exit_code),
                output,
            });
        }

        Ok(ExecutionResult {
            exit_code,
            output,
            duration_ms,
            from_cache: false,
        })
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.project_root.join(path)
        }
    }
}

/// An isolated execution directory, removed on drop.
struct Sandbox {
    root: PathBuf,
    lockfile: PathBuf,
}

impl Sandbox {
    fn materialize(config: &ExecutorConfig, partition: &Partition) -> Result<Self, ExecutionFailure> {
        let root = config
            .sandbox_root
            .join(format!("sandbox-{}", ulid::Ulid::new()));
        fs::create_dir_all(&root)
            .map_err(|e| ExecutionFailure::Sandbox(format!("create {}: {e}", root.display())))?;

        for file in &partition.files {
            let rel = if file.is_absolute() {
                file.strip_prefix(&config.project_root).map_err(|_| {
                    ExecutionFailure::Sandbox(format!(
                        "{} is outside the project root",
                        file.display()
                    ))
                })?
            } else {
                file.as_path()
            };

            let src = if file.is_absolute() {
                file.clone()
            } else {
                config.project_root.join(file)
            };
            let dst = root.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    ExecutionFailure::Sandbox(format!("create {}: {e}", parent.display()))
                })?;
            }
            fs::copy(&src, &dst).map_err(|e| {
                ExecutionFailure::Sandbox(format!("copy {}: {e}", src.display()))
            })?;
        }

        let lockfile = root.join("environment.lock");
        fs::copy(&partition.environment.path, &lockfile).map_err(|e| {
            ExecutionFailure::Sandbox(format!(
                "copy lockfile {}: {e}",
                partition.environment.path.display()
            ))
        })?;

        if let Some(ref tool_config) = config.tool_config {
            let src = if tool_config.is_absolute() {
                tool_config.clone()
            } else {
                config.project_root.join(tool_config)
            };
            let name = src.file_name().ok_or_else(|| {
                ExecutionFailure::Sandbox(format!("bad tool config path {}", src.display()))
            })?;
            fs::copy(&src, root.join(name)).map_err(|e| {
                ExecutionFailure::Sandbox(format!("copy tool config {}: {e}", src.display()))
            })?;
        }

        Ok(Self { root, lockfile })
    }

    fn path(&self) -> &Path {
        &self.root
    }

    fn lockfile_path(&self) -> &Path {
        &self.lockfile
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        if pipe.read_to_end(&mut bytes).is_ok() {
            buf = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    buf
}
