//! Shared test fixtures: a throwaway project with a stub checker
//!
//! The stub checker is a shell script that reports an error line for every
//! file containing the marker `BAD`, mimicking the `path:line: severity:
//! message` output shape of a real checker.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use typegate::pipeline::PipelineConfig;

pub struct TestProject {
    pub dir: tempfile::TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> PipelineConfig {
        PipelineConfig {
            project_root: self.root().to_path_buf(),
            config_path: self.root().join("typegate.toml"),
            ..PipelineConfig::default()
        }
    }

    pub fn write_file(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub fn write_script(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// A checker that flags files containing `BAD` and exits 1 when any
    /// were flagged. It also appends one line per invocation to
    /// `invocations.log` so tests can count subprocess spawns.
    pub fn write_checker(&self) -> PathBuf {
        let log = self.root().join("invocations.log");
        self.write_script(
            "bin/check",
            &format!(
                r#"echo invoked >> {log}
fail=0
for f in "$@"; do
  if grep -q BAD "$f"; then
    echo "$f:1: error: name 'BAD' is not defined"
    fail=1
  fi
done
exit $fail"#,
                log = log.display()
            ),
        )
    }

    pub fn write_lockfile(&self, rel: &str, ics: &str) {
        self.write_file(
            rel,
            &format!("# tool: mypy==1.8.0\n# interpreter_constraints: {ics}\nattrs==23.1.0\n"),
        );
    }

    pub fn invocation_count(&self) -> usize {
        fs::read_to_string(self.root().join("invocations.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// Count entries in the on-disk result cache.
    pub fn cache_entry_count(&self) -> usize {
        let cache_dir = self.root().join(".typegate/cache");
        if !cache_dir.exists() {
            return 0;
        }
        walkdir::WalkDir::new(cache_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().map(|x| x == "json").unwrap_or(false)
            })
            .count()
    }
}
