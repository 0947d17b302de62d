//! Config fingerprinting
//!
//! The effective configuration participates in both the partition key and
//! the execution cache key, so it needs a stable digest: canonical JSON of
//! the config structure plus the raw bytes of the referenced tool config
//! file. Canonicalization keeps the digest independent of TOML key order.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::RepoConfig;

/// Digest computation errors
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to canonicalize config: {0}")]
    Canonicalize(String),

    #[error("failed to read tool config {path}: {source}")]
    ToolConfigIo {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Compute the effective config digest.
///
/// `root` anchors the relative `tool.config_file` path. A missing
/// `config_file` declaration digests the config alone; a declared but
/// unreadable file is an error rather than a silently different digest.
pub fn config_digest(config: &RepoConfig, root: &Path) -> Result<String, DigestError> {
    let value = serde_json::to_value(config)?;
    let canonical = serde_json_canonicalizer::to_vec(&value)
        .map_err(|e| DigestError::Canonicalize(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);

    if let Some(ref tool_config) = config.tool.config_file {
        let path = root.join(tool_config);
        let bytes = fs::read(&path).map_err(|e| DigestError::ToolConfigIo {
            path: path.display().to_string(),
            source: e,
        })?;
        hasher.update(b"\0tool-config\0");
        hasher.update(&bytes);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_digest_is_stable() {
        let config = RepoConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let a = config_digest(&config, dir.path()).unwrap();
        let b = config_digest(&config, dir.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_digest_tracks_config_changes() {
        let dir = tempfile::tempdir().unwrap();
        let base = RepoConfig::default();
        let mut changed = RepoConfig::default();
        changed.tool.command = vec!["pyright".to_string()];

        let a = config_digest(&base, dir.path()).unwrap();
        let b = config_digest(&changed, dir.path()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_tracks_tool_config_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RepoConfig::default();
        config.tool.config_file = Some("mypy.ini".into());

        let path = dir.path().join("mypy.ini");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"[mypy]\nstrict = True\n").unwrap();
        let a = config_digest(&config, dir.path()).unwrap();

        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"[mypy]\nstrict = False\n").unwrap();
        let b = config_digest(&config, dir.path()).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_declared_but_missing_tool_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RepoConfig::default();
        config.tool.config_file = Some("absent.ini".into());

        let err = config_digest(&config, dir.path()).unwrap_err();
        assert!(matches!(err, DigestError::ToolConfigIo { .. }));
    }
}
