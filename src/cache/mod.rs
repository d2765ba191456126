// cache/mod.rs - Structured Per-Minion Cache
//
//! Structured cache consulted during reconciliation
//!
//! Provides:
//! - `MinionCache` trait for cache backends
//! - File-based cache laid out as `<root>/<bank>/<key>.p`
//! - In-memory cache (for testing)
//! - `CacheReconciler` which purges state for ids no longer trusted

pub mod reconcile;

pub use reconcile::{CacheReconciler, ReconcileReport};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::keys::store::{decode_record, encode_record};

/// Extension of entries written by the file cache
const ENTRY_SUFFIX: &str = ".p";

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid cache name: {0:?}")]
    InvalidName(String),
}

/// Cache backend trait
pub trait MinionCache: Send + Sync {
    /// Keys stored in a bank; a missing bank lists as empty
    fn list(&self, bank: &str) -> Result<Vec<String>, CacheError>;

    /// Drop one key, or the whole bank when `key` is `None`. Flushing
    /// something already absent succeeds.
    fn flush(&self, bank: &str, key: Option<&str>) -> Result<(), CacheError>;
}

fn check_name(name: &str) -> Result<(), CacheError> {
    let bad = name.is_empty()
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// File-based cache
#[derive(Debug, Clone)]
pub struct FileCache {
    /// Base path for banks
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bank_dir(&self, bank: &str) -> PathBuf {
        self.root.join(bank)
    }

    fn entry_path(&self, bank: &str, key: &str) -> PathBuf {
        self.bank_dir(bank).join(format!("{key}{ENTRY_SUFFIX}"))
    }

    /// Store a value under `bank/key`
    pub fn store<T: Serialize>(&self, bank: &str, key: &str, value: &T) -> Result<(), CacheError> {
        check_name(bank)?;
        check_name(key)?;
        let dir = self.bank_dir(bank);
        fs::create_dir_all(&dir).map_err(|e| CacheError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let bytes = encode_record(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let path = self.entry_path(bank, key);
        fs::write(&path, bytes).map_err(|e| CacheError::Io { path, source: e })
    }

    /// Fetch a value stored with [`FileCache::store`]
    pub fn fetch<T: DeserializeOwned>(&self, bank: &str, key: &str) -> Result<Option<T>, CacheError> {
        check_name(bank)?;
        check_name(key)?;
        let path = self.entry_path(bank, key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };
        decode_record(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

impl MinionCache for FileCache {
    fn list(&self, bank: &str) -> Result<Vec<String>, CacheError> {
        check_name(bank)?;
        let dir = self.bank_dir(bank);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::Io { path: dir, source: e }),
        };

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            // Sub-banks list by name, entries without their suffix
            let key = name.strip_suffix(ENTRY_SUFFIX).map(str::to_string).unwrap_or(name);
            keys.push(key);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn flush(&self, bank: &str, key: Option<&str>) -> Result<(), CacheError> {
        check_name(bank)?;
        let io_err = |path: &Path, e: io::Error| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        };

        let Some(key) = key else {
            let dir = self.bank_dir(bank);
            return match fs::remove_dir_all(&dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(&dir, e)),
            };
        };

        check_name(key)?;
        let entry = self.entry_path(bank, key);
        match fs::remove_file(&entry) {
            Ok(()) => debug!(bank, key, "Flushed cache entry"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&entry, e)),
        }

        let sub_bank = self.bank_dir(bank).join(key);
        match fs::remove_dir_all(&sub_bank) {
            Ok(()) => {
                debug!(bank, key, "Flushed cache bank");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&sub_bank, e)),
        }
    }
}

/// In-memory cache (for testing)
#[derive(Debug, Default)]
pub struct MemoryCache {
    banks: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bank: &str, key: &str, value: impl Into<Vec<u8>>) {
        self.banks
            .lock()
            .entry(bank.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn contains(&self, bank: &str, key: &str) -> bool {
        self.banks
            .lock()
            .get(bank)
            .is_some_and(|entries| entries.contains_key(key))
    }
}

impl MinionCache for MemoryCache {
    fn list(&self, bank: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .banks
            .lock()
            .get(bank)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn flush(&self, bank: &str, key: Option<&str>) -> Result<(), CacheError> {
        let mut banks = self.banks.lock();
        match key {
            None => {
                banks.remove(bank);
            }
            Some(key) => {
                if let Some(entries) = banks.get_mut(bank) {
                    entries.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_cache_store_list_flush() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());

        cache.store("minions", "m1", &"grains".to_string()).unwrap();
        cache.store("minions", "m2", &"grains".to_string()).unwrap();
        assert_eq!(cache.list("minions").unwrap(), vec!["m1", "m2"]);

        let value: Option<String> = cache.fetch("minions", "m1").unwrap();
        assert_eq!(value.as_deref(), Some("grains"));

        cache.flush("minions", Some("m1")).unwrap();
        assert_eq!(cache.list("minions").unwrap(), vec!["m2"]);
        assert!(cache.fetch::<String>("minions", "m1").unwrap().is_none());
    }

    #[test]
    fn test_file_cache_lists_sub_banks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        cache.store("minions/m1", "data", &1u32).unwrap();

        assert_eq!(cache.list("minions").unwrap(), vec!["m1"]);
        cache.flush("minions", Some("m1")).unwrap();
        assert!(cache.list("minions").unwrap().is_empty());
    }

    #[test]
    fn test_flush_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        cache.flush("minions", Some("ghost")).unwrap();
        cache.flush("nothing", None).unwrap();
        assert!(cache.list("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        assert!(matches!(
            cache.flush("minions", Some("..")),
            Err(CacheError::InvalidName(_))
        ));
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        cache.insert("minions", "m1", b"x".to_vec());
        cache.insert("minions", "m2", b"x".to_vec());

        cache.flush("minions", Some("m1")).unwrap();
        assert_eq!(cache.list("minions").unwrap(), vec!["m2"]);
        assert!(!cache.contains("minions", "m1"));
    }
}
