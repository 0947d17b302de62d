//! Checker output parsing
//!
//! Splits the checker's combined output into attributable diagnostic lines.
//! Lines in the usual `path:line: severity: message` shape keep their own
//! attribution; anything else (tool banners, summaries, tracebacks that
//! survived a diagnostic exit) is prefixed with the partition label so no
//! emitted line is orphaned.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// One line of the merged diagnostic stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLine {
    /// Source path the line refers to, when the tool qualified it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,

    /// The line as emitted (with the partition prefix for unqualified lines)
    pub text: String,
}

/// Parses checker output into tagged lines.
pub struct OutputParser {
    line_re: Regex,
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            // path:line[:col]: severity: message
            line_re: Regex::new(r"^([^:\s][^:]*):(\d+)(?::\d+)?: *(error|warning|note): *(.*)$")
                .expect("diagnostic regex is valid"),
        }
    }

    /// Parse one partition's output. `label` names the partition for lines
    /// the tool did not qualify with a path.
    pub fn parse(&self, output: &str, label: &str) -> Vec<DiagnosticLine> {
        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| match self.line_re.captures(line) {
                Some(caps) => DiagnosticLine {
                    source_path: Some(caps[1].to_string()),
                    text: line.to_string(),
                },
                None => DiagnosticLine {
                    source_path: None,
                    text: format!("[{label}] {line}"),
                },
            })
            .collect()
    }
}
