// keys/store.rs - Partitioned Key Store on the Filesystem

use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::state::KeyState;

/// Errors related to key store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid minion id: {0:?}")]
    InvalidId(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// What happened to one id during a move or delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum KeyOutcome {
    /// The mutation is durable
    Done,

    /// The key was not there any more (lost a race, or never existed)
    NotFound,

    /// The filesystem refused the operation
    PermissionDenied,

    /// Any other failure
    Failed(String),
}

impl KeyOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, KeyOutcome::Done)
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            KeyOutcome::Done => "done",
            KeyOutcome::NotFound => "not_found",
            KeyOutcome::PermissionDenied => "permission_denied",
            KeyOutcome::Failed(_) => "failed",
        }
    }

    fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => KeyOutcome::NotFound,
            io::ErrorKind::PermissionDenied => KeyOutcome::PermissionDenied,
            _ => KeyOutcome::Failed(err.to_string()),
        }
    }
}

/// Reject ids that cannot safely be used as a file name inside a partition.
/// Listings skip dot-files, so an id may not start with a dot either.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');
    if bad {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Sort ids case-insensitively, falling back to byte order for ties
pub fn sort_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
}

/// Encode a record with the store's binary envelope
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

/// Decode a record written by [`encode_record`]
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (record, _): (T, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(record)
}

/// Key store with one directory per trust state.
///
/// Every state change is a rename between partition directories, so an id is
/// never present in two partitions at once. Nothing here takes a lock: the
/// atomicity of `rename`, `unlink` and the temp-file write is what keeps
/// concurrent callers consistent.
#[derive(Debug, Clone)]
pub struct KeyStore<S: KeyState> {
    root: PathBuf,
    _layout: PhantomData<S>,
}

impl<S: KeyState> KeyStore<S> {
    /// Open a store rooted at the pki directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _layout: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing a partition
    pub fn partition_dir(&self, state: S) -> PathBuf {
        self.root.join(state.dir_name())
    }

    /// File holding one key
    pub fn key_path(&self, id: &str, state: S) -> PathBuf {
        self.partition_dir(state).join(id)
    }

    /// Create any missing partition directories
    pub fn ensure_partitions(&self) -> Result<(), StoreError> {
        for state in S::ALL {
            let dir = self.partition_dir(*state);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Sorted ids in one partition; a missing partition lists as empty
    pub fn list(&self, state: S) -> Vec<String> {
        let dir = self.partition_dir(state);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = ?dir, error = %e, "Failed to list key partition");
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if entry.path().is_file() {
                ids.push(name);
            }
        }
        sort_ids(&mut ids);
        ids
    }

    /// Every partition with its sorted ids, empty partitions included
    pub fn list_all(&self) -> BTreeMap<S, Vec<String>> {
        S::ALL.iter().map(|s| (*s, self.list(*s))).collect()
    }

    pub fn contains(&self, id: &str, state: S) -> bool {
        validate_id(id).is_ok() && self.key_path(id, state).is_file()
    }

    /// The partition currently holding `id`, if any
    pub fn locate(&self, id: &str) -> Option<S> {
        S::ALL.iter().copied().find(|s| self.contains(id, *s))
    }

    /// Raw payload of a key
    pub fn read(&self, id: &str, state: S) -> Result<Vec<u8>, StoreError> {
        validate_id(id)?;
        let path = self.key_path(id, state);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::KeyNotFound(id.to_string()),
            _ => StoreError::io(&path, e),
        })
    }

    /// Payload of a key as text
    pub fn read_to_string(&self, id: &str, state: S) -> Result<String, StoreError> {
        let bytes = self.read(id, state)?;
        String::from_utf8(bytes).map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    /// Write a key into a partition.
    ///
    /// The payload lands in a dot-prefixed temp file first and is renamed into
    /// place, so listings never observe a half-written key. Fails if the
    /// partition directory does not exist.
    pub fn write(&self, id: &str, state: S, payload: &[u8]) -> Result<(), StoreError> {
        validate_id(id)?;
        let dir = self.partition_dir(state);
        let tmp = dir.join(format!(".{}.{:016x}.tmp", id, rand::rng().next_u64()));
        let target = dir.join(id);

        fs::write(&tmp, payload).map_err(|e| StoreError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&target, e));
        }

        debug!(id, partition = state.dir_name(), "Wrote key");
        Ok(())
    }

    /// Move a key between partitions
    pub fn move_key(&self, id: &str, from: S, to: S) -> KeyOutcome {
        if let Err(e) = validate_id(id) {
            return KeyOutcome::Failed(e.to_string());
        }
        let source = self.key_path(id, from);
        if from == to {
            return if source.is_file() {
                KeyOutcome::Done
            } else {
                KeyOutcome::NotFound
            };
        }

        let target = self.key_path(id, to);
        match fs::rename(&source, &target) {
            Ok(()) => {
                debug!(id, from = from.dir_name(), to = to.dir_name(), "Moved key");
                KeyOutcome::Done
            }
            // A missing destination directory also reports NotFound; only call
            // it NotFound when the source is really gone.
            Err(e) if e.kind() == io::ErrorKind::NotFound && source.exists() => {
                KeyOutcome::Failed(format!("{}: {}", target.display(), e))
            }
            Err(e) => KeyOutcome::from_io(&e),
        }
    }

    /// Remove a key from a partition
    pub fn delete(&self, id: &str, state: S) -> KeyOutcome {
        if let Err(e) = validate_id(id) {
            return KeyOutcome::Failed(e.to_string());
        }
        let path = self.key_path(id, state);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id, partition = state.dir_name(), "Deleted key");
                KeyOutcome::Done
            }
            Err(e) => KeyOutcome::from_io(&e),
        }
    }
}
