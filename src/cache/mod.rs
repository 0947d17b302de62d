//! Result cache for checker invocations
//!
//! Filesystem-backed, keyed by the execution digest. Each entry is a single
//! JSON file published with a write-to-temp-then-rename, so concurrent
//! workers computing the same key cannot observe a torn entry. Inserts are
//! idempotent: two writers racing on one key produce byte-equivalent
//! entries (the key is a digest over every execution input), so whichever
//! rename lands last is indistinguishable from first-writer-wins. No
//! cross-cache lock exists; atomicity is per key.
//!
//! Failed executions (timeout, crash, cancellation) are never inserted;
//! that policy lives in the executor.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version for cache entries
pub const CACHE_ENTRY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for cache entries
pub const CACHE_ENTRY_SCHEMA_ID: &str = "typegate/cache_entry@1";

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt cache entry {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// A completed checker invocation, as stored in the cache.
///
/// Only normal completions are stored: a clean run or a run that reported
/// diagnostics. The entry echoes its own cache key so a lookup can detect
/// misfiled entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// The digest this entry is keyed by
    pub cache_key: String,

    /// Checker exit code (0 or a configured diagnostic code)
    pub exit_code: i32,

    /// Combined stdout+stderr of the checker
    pub output: String,

    /// Tool identity (`name==version`) that produced this result
    pub tool_identity: String,

    /// Wall-clock duration of the original execution in milliseconds
    pub duration_ms: u64,

    /// When the entry was created
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry for a completed invocation.
    pub fn new(
        cache_key: &str,
        exit_code: i32,
        output: String,
        tool_identity: &str,
        duration_ms: u64,
    ) -> Self {
        Self {
            schema_version: CACHE_ENTRY_SCHEMA_VERSION,
            schema_id: CACHE_ENTRY_SCHEMA_ID.to_string(),
            cache_key: cache_key.to_string(),
            exit_code,
            output,
            tool_identity: tool_identity.to_string(),
            duration_ms,
            created_at: Utc::now(),
        }
    }
}

/// Filesystem result cache.
#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
}

impl ResultCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Look up an entry by digest.
    pub fn lookup(&self, cache_key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(cache_key);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };

        let entry: CacheEntry =
            serde_json::from_str(&content).map_err(|e| CacheError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if entry.cache_key != cache_key {
            return Err(CacheError::Corrupt {
                path: path.display().to_string(),
                reason: format!(
                    "entry is keyed by {} but filed under {}",
                    entry.cache_key, cache_key
                ),
            });
        }

        Ok(Some(entry))
    }

    /// Insert an entry.
    ///
    /// Returns `false` without writing when an entry already exists for the
    /// key. The write goes to a temp file in the same directory and is
    /// published with a rename.
    pub fn insert(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let path = self.entry_path(&entry.cache_key);
        if path.exists() {
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(entry).map_err(|e| CacheError::Corrupt {
            path: path.display().to_string(),
            reason: format!("failed to serialize entry: {e}"),
        })?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let tmp = path.with_extension(format!("tmp.{}.{}", std::process::id(), nanos));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(true)
    }

    /// Whether an entry exists for the key.
    pub fn contains(&self, cache_key: &str) -> bool {
        self.entry_path(cache_key).exists()
    }

    /// Remove every entry, keeping the cache directory itself.
    pub fn clear(&self) -> Result<(), CacheError> {
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if shard.file_type()?.is_dir() {
                fs::remove_dir_all(shard.path())?;
            } else {
                fs::remove_file(shard.path())?;
            }
        }
        Ok(())
    }

    // Entries shard on the first two hex chars to keep directories small.
    fn entry_path(&self, cache_key: &str) -> PathBuf {
        let shard = if cache_key.len() >= 2 {
            &cache_key[..2]
        } else {
            "xx"
        };
        self.root.join(shard).join(format!("{cache_key}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(key, 0, String::new(), "mypy==1.8.0", 1234)
    }

    #[test]
    fn test_lookup_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        assert!(cache.lookup(&"ab".repeat(32)).unwrap().is_none());
    }

    #[test]
    fn test_insert_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key = "ab".repeat(32);

        let e = CacheEntry::new(&key, 1, "a.py:1: error: boom\n".to_string(), "mypy==1.8.0", 50);
        assert!(cache.insert(&e).unwrap());

        let found = cache.lookup(&key).unwrap().expect("entry should exist");
        assert_eq!(found.exit_code, 1);
        assert_eq!(found.output, "a.py:1: error: boom\n");
        assert_eq!(found.tool_identity, "mypy==1.8.0");
    }

    #[test]
    fn test_second_insert_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key = "cd".repeat(32);

        assert!(cache.insert(&entry(&key)).unwrap());
        assert!(!cache.insert(&entry(&key)).unwrap());
        assert!(cache.contains(&key));
    }

    #[test]
    fn test_corrupt_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key = "ef".repeat(32);

        let path = dir.path().join(&key[..2]).join(format!("{key}.json"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            cache.lookup(&key),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_misfiled_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key_a = "aa".repeat(32);
        let key_b = "bb".repeat(32);

        // File an entry for key_a under key_b's path.
        let path = dir.path().join(&key_b[..2]).join(format!("{key_b}.json"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_string(&entry(&key_a)).unwrap()).unwrap();

        assert!(matches!(
            cache.lookup(&key_b),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key = "0f".repeat(32);

        cache.insert(&entry(&key)).unwrap();
        assert!(cache.contains(&key));
        cache.clear().unwrap();
        assert!(!cache.contains(&key));
    }

    #[test]
    fn test_concurrent_inserts_agree() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResultCache::open(dir.path()).unwrap());
        let key = Arc::new("77".repeat(32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let key = Arc::clone(&key);
                std::thread::spawn(move || cache.insert(&entry(&key)).unwrap())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        // At least one writer must land, and the entry must be readable.
        assert!(wins >= 1);
        assert!(cache.lookup(&key).unwrap().is_some());
    }
}
