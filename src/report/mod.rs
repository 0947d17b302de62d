//! Aggregate reporting
//!
//! Merges per-partition outcomes into one verdict. Aggregation sorts by
//! partition key before concatenating, so the final diagnostic ordering is
//! identical no matter how the worker pool interleaved execution. Failure
//! of the checker itself (timeout, crash) is kept distinct from "type
//! errors found": they demand different user remediation and map to
//! different exit classes.

mod parser;

pub use parser::{DiagnosticLine, OutputParser};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::{ExecutionFailure, ExecutionResult};
use crate::partition::Partition;

/// Schema version for the machine-readable report
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for the machine-readable report
pub const REPORT_SCHEMA_ID: &str = "typegate/report@1";

/// Overall verdict class, also the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitClass {
    /// All partitions ran and reported nothing
    Clean,
    /// At least one partition reported type errors; the checker itself ran
    /// fine everywhere
    Diagnostics,
    /// The checker could not run for at least one partition, or the run was
    /// aborted before execution
    Failure,
}

impl ExitClass {
    /// Process exit code for this class.
    pub fn as_i32(self) -> i32 {
        match self {
            ExitClass::Clean => 0,
            ExitClass::Diagnostics => 1,
            ExitClass::Failure => 2,
        }
    }
}

/// A partition whose checker run failed outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Partition label
    pub partition: String,
    /// Failure description
    pub message: String,
}

/// The merged result of one `check` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Run identifier
    pub run_id: String,

    /// When the report was created
    pub created_at: DateTime<Utc>,

    /// True only when every partition ran and reported nothing
    pub success: bool,

    /// Verdict class (also the exit code)
    pub exit_class: ExitClass,

    /// Merged diagnostics in partition-key order
    pub diagnostics: Vec<DiagnosticLine>,

    /// Partitions whose checker run failed
    pub failures: Vec<FailureRecord>,

    /// Partitions that ran a subprocess
    pub partitions_executed: usize,

    /// Partitions served from the cache
    pub partitions_cached: usize,

    /// Total partitions in the plan
    pub partitions_total: usize,

    /// Wall-clock duration of the whole run in milliseconds
    pub duration_ms: u64,
}

impl AggregateReport {
    /// Merge per-partition outcomes.
    ///
    /// `outcomes` may arrive in any order; they are sorted by partition key
    /// here, at aggregation time.
    pub fn aggregate(
        run_id: String,
        mut outcomes: Vec<(Partition, Result<ExecutionResult, ExecutionFailure>)>,
        duration_ms: u64,
    ) -> Self {
        outcomes.sort_by(|a, b| a.0.key.cmp(&b.0.key));

        let parser = OutputParser::new();
        let mut diagnostics = Vec::new();
        let mut failures = Vec::new();
        let mut executed = 0;
        let mut cached = 0;
        let total = outcomes.len();

        for (partition, outcome) in &outcomes {
            match outcome {
                Ok(result) => {
                    if result.from_cache {
                        cached += 1;
                    } else {
                        executed += 1;
                    }
                    if result.has_diagnostics() {
                        diagnostics.extend(parser.parse(&result.output, &partition.label()));
                    }
                }
                Err(failure) => {
                    executed += 1;
                    failures.push(FailureRecord {
                        partition: partition.label(),
                        message: failure.to_string(),
                    });
                }
            }
        }

        let exit_class = if !failures.is_empty() {
            ExitClass::Failure
        } else if !diagnostics.is_empty() {
            ExitClass::Diagnostics
        } else {
            ExitClass::Clean
        };

        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            schema_id: REPORT_SCHEMA_ID.to_string(),
            run_id,
            created_at: Utc::now(),
            success: exit_class == ExitClass::Clean,
            exit_class,
            diagnostics,
            failures,
            partitions_executed: executed,
            partitions_cached: cached,
            partitions_total: total,
            duration_ms,
        }
    }

    /// Report for an empty plan: trivially successful.
    pub fn empty(run_id: String) -> Self {
        Self::aggregate(run_id, Vec::new(), 0)
    }

    /// Human-readable one-paragraph summary.
    pub fn human_summary(&self) -> String {
        let mut lines = Vec::new();

        for diag in &self.diagnostics {
            lines.push(diag.text.clone());
        }
        for failure in &self.failures {
            lines.push(format!(
                "FAILED {}: {}",
                failure.partition, failure.message
            ));
        }

        let verdict = match self.exit_class {
            ExitClass::Clean => "clean".to_string(),
            ExitClass::Diagnostics => format!("{} diagnostic line(s)", self.diagnostics.len()),
            ExitClass::Failure => format!("{} partition(s) failed to run", self.failures.len()),
        };
        lines.push(format!(
            "{}: {} partition(s), {} executed, {} cached, {} ms",
            verdict,
            self.partitions_total,
            self.partitions_executed,
            self.partitions_cached,
            self.duration_ms
        ));

        lines.join("\n")
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
