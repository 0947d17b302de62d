//! typegate - Type-check gate
//!
//! This crate implements typegate, a gate that runs an external static type
//! checker over a codebase with multiple dependency resolves and
//! interpreter constraints. Files are partitioned into the minimal number
//! of compatible checker invocations, each invocation runs in an isolated
//! sandbox against a pinned checker environment, results are cached by
//! input digest, and per-partition outcomes merge into one report.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod constraints;
pub mod executor;
pub mod key;
pub mod lockenv;
pub mod partition;
pub mod pipeline;
pub mod report;

pub use cancel::CancelToken;
pub use config::RepoConfig;
pub use executor::{ExecutionFailure, ExecutionResult, Executor};
pub use key::{CompatibilityKey, SourceUnit};
pub use lockenv::{LockedEnvironment, LockfileStore};
pub use partition::{partition, Partition};
pub use pipeline::{run_check, Pipeline, PipelineConfig, PipelineError};
pub use report::{AggregateReport, ExitClass};
