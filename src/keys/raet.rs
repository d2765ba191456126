// keys/raet.rs - Three-Partition Structured Key Backend

use ed25519_dalek::{SigningKey, SECRET_KEY_LENGTH};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::fingerprint::{remote_finger, remote_key_text};
use super::matcher::MatchScope;
use super::state::{KeyMatches, KeyState, KeyStatus, RaetState};
use super::store::{decode_record, encode_record, StoreError};
use super::transition::{AcceptOptions, KeyRing, RejectOptions};
use super::{KeyDetails, KeyError};
use crate::observability::record_classification;
use crate::policy::{evaluate, AutoPolicy, Placement, Presented};

/// File name of the controller's own identity under the pki root
pub const LOCAL_KEY_FILE: &str = "local.key";

/// A minion's public identity as stored in a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKey {
    pub minion_id: String,
    pub public_key: String,
    pub verify_key: String,
}

impl RemoteKey {
    pub fn new(minion_id: &str, public_key: &str, verify_key: &str) -> Self {
        Self {
            minion_id: minion_id.to_string(),
            public_key: public_key.to_string(),
            verify_key: verify_key.to_string(),
        }
    }

    fn same_keys(&self, other: &RemoteKey) -> bool {
        self.public_key == other.public_key && self.verify_key == other.verify_key
    }

    /// `pub: <pub>\nverify: <verify>`
    pub fn text(&self) -> String {
        remote_key_text(&self.public_key, &self.verify_key)
    }

    pub fn finger(&self) -> String {
        remote_finger(&self.public_key, &self.verify_key)
    }
}

/// A remote key tagged with the partition it was read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteRecord {
    #[serde(flatten)]
    pub key: RemoteKey,
    pub acceptance: KeyStatus,
}

/// The controller's own identity: hex-encoded private and signing keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalKey {
    pub private_key: String,
    pub sign_key: String,
}

impl LocalKey {
    /// Fresh random identity
    pub fn generate() -> Self {
        let mut private_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut private_bytes);
        let mut sign_bytes = [0u8; SECRET_KEY_LENGTH];
        rand::rng().fill_bytes(&mut sign_bytes);

        Self {
            private_key: hex::encode(private_bytes),
            sign_key: hex::encode(sign_bytes),
        }
    }

    /// Hex verify key derived from the signing seed
    pub fn verify_key(&self) -> Result<String, KeyError> {
        let bytes = hex::decode(&self.sign_key)
            .map_err(|e| KeyError::InvalidLocalKey(e.to_string()))?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            KeyError::InvalidLocalKey(format!(
                "sign key is {} bytes, expected {}",
                b.len(),
                SECRET_KEY_LENGTH
            ))
        })?;
        Ok(hex::encode(SigningKey::from_bytes(&seed).verifying_key().as_bytes()))
    }

    /// sha256 hex of the derived verify key
    pub fn finger(&self) -> Result<String, KeyError> {
        Ok(hex::encode(Sha256::digest(self.verify_key()?.as_bytes())))
    }
}

/// Key backend for the raet transport.
///
/// Keys live in `accepted`, `pending` and `rejected` as encoded
/// [`RemoteKey`] records; there is no denied partition. The controller's own
/// identity is a single [`LocalKey`] in `local.key`, owner-read-only on disk.
/// New keys are classified on arrival by [`RaetKeys::status`].
pub struct RaetKeys {
    ring: KeyRing<RaetState>,
    policy: Arc<dyn AutoPolicy>,
    open_mode: bool,
    auto_accept: bool,
}

impl std::fmt::Debug for RaetKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaetKeys")
            .field("ring", &self.ring)
            .field("open_mode", &self.open_mode)
            .field("auto_accept", &self.auto_accept)
            .finish()
    }
}

impl RaetKeys {
    pub fn new(ring: KeyRing<RaetState>, policy: Arc<dyn AutoPolicy>) -> Self {
        Self {
            ring,
            policy,
            open_mode: false,
            auto_accept: false,
        }
    }

    pub fn with_open_mode(mut self, open_mode: bool) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    pub fn ring(&self) -> &KeyRing<RaetState> {
        &self.ring
    }

    /// Always true: raet has no socket to check
    pub fn check_master(&self) -> bool {
        true
    }

    fn local_path(&self) -> PathBuf {
        self.ring.store().root().join(LOCAL_KEY_FILE)
    }

    // Classification

    /// Classify a key presented by a minion and file it accordingly.
    ///
    /// New ids are written to the partition their verdict names. A pending
    /// key that policy now accepts or rejects goes through the regular
    /// accept/reject path, with its events and cache handling. A payload
    /// that differs from the stored one is reported rejected and the stored
    /// record is left as it is.
    pub fn status(&self, minion_id: &str, public_key: &str, verify_key: &str) -> Result<KeyStatus, KeyError> {
        let presented = RemoteKey::new(minion_id, public_key, verify_key);
        let store = self.ring.store();

        let current = match store.locate(minion_id) {
            Some(state) => {
                let same_payload = match self.read_remote(minion_id, state) {
                    Ok(Some(stored)) => stored.same_keys(&presented),
                    Ok(None) => false,
                    Err(e) => {
                        warn!(id = minion_id, error = %e, "Unreadable stored key");
                        false
                    }
                };
                Some(Presented { state, same_payload })
            }
            None => None,
        };

        let verdict = evaluate(
            minion_id,
            current,
            self.open_mode,
            self.auto_accept,
            self.policy.as_ref(),
        );
        record_classification(verdict.state.status().as_str(), verdict.reason.as_str());
        debug!(
            id = minion_id,
            state = %verdict.state.status(),
            reason = verdict.reason.as_str(),
            "Classified key"
        );

        match verdict.placement {
            Placement::Keep => {}
            Placement::Write => {
                for state in RaetState::ALL.iter().filter(|s| **s != verdict.state) {
                    let outcome = store.delete(minion_id, *state);
                    if outcome.is_done() {
                        debug!(id = minion_id, partition = state.dir_name(), "Replaced stored key");
                    }
                }
                store.write(minion_id, verdict.state, &encode_record(&presented)?)?;
            }
            Placement::Move { from } => {
                let pending = KeyMatches::from([(from.status(), vec![minion_id.to_string()])]);
                let transition = if verdict.state == RaetState::Accepted {
                    self.ring.accept(pending, AcceptOptions::default())
                } else {
                    self.ring.reject(pending, RejectOptions::default())
                };
                if transition.report.done().is_empty() {
                    warn!(id = minion_id, "Pending key moved away during classification");
                }
            }
        }

        Ok(verdict.state.status())
    }

    // Remote keys

    /// Stored record for `minion_id` in `state`; `None` when absent
    pub fn read_remote(&self, minion_id: &str, state: RaetState) -> Result<Option<RemoteKey>, KeyError> {
        match self.ring.store().read(minion_id, state) {
            Ok(bytes) => Ok(Some(decode_record(&bytes)?)),
            Err(StoreError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable remote key, tagged with its partition
    pub fn read_all_remote(&self) -> BTreeMap<String, RemoteRecord> {
        let mut out = BTreeMap::new();
        for (state, ids) in self.ring.store().list_all() {
            for id in ids {
                match self.read_remote(&id, state) {
                    Ok(Some(key)) => {
                        out.insert(
                            id,
                            RemoteRecord {
                                key,
                                acceptance: state.status(),
                            },
                        );
                    }
                    Ok(None) => {}
                    Err(e) => warn!(id = %id, error = %e, "Skipping unreadable key"),
                }
            }
        }
        out
    }

    /// `pub: ...\nverify: ...` text of the keys matching `pattern`
    pub fn key_str(&self, pattern: &str) -> KeyDetails {
        self.render_each(&self.ring.name_match(pattern, MatchScope::Active), RemoteKey::text)
    }

    pub fn key_str_all(&self) -> KeyDetails {
        self.render_each(&self.ring.list_keys(), RemoteKey::text)
    }

    /// Fingerprints of managed keys and the local identity matching `pattern`
    pub fn finger(&self, pattern: &str) -> KeyDetails {
        self.fingers(&self.ring.name_match(pattern, MatchScope::All))
    }

    pub fn finger_all(&self) -> KeyDetails {
        self.fingers(&self.ring.all_keys())
    }

    fn fingers(&self, matches: &KeyMatches) -> KeyDetails {
        let mut out = self.render_each(matches, RemoteKey::finger);
        if let Some(local) = matches.get(&KeyStatus::Local) {
            let group = out.entry(KeyStatus::Local).or_default();
            if !local.is_empty() {
                match self.read_local().and_then(|key| key.map(|k| k.finger()).transpose()) {
                    Ok(Some(finger)) => {
                        group.insert(LOCAL_KEY_FILE.to_string(), finger);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping unreadable local key"),
                }
            }
        }
        out
    }

    fn render_each(&self, matches: &KeyMatches, render: fn(&RemoteKey) -> String) -> KeyDetails {
        let mut out = KeyDetails::new();
        for (status, ids) in matches {
            let Some(state) = RaetState::from_status(*status) else {
                continue;
            };
            let group = out.entry(*status).or_default();
            for id in ids {
                match self.read_remote(id, state) {
                    Ok(Some(key)) => {
                        group.insert(id.clone(), render(&key));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(id = %id, error = %e, "Skipping unreadable key"),
                }
            }
        }
        out
    }

    // Local identity

    /// The controller's identity; `None` when none has been written
    pub fn read_local(&self) -> Result<Option<LocalKey>, KeyError> {
        let path = self.local_path();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(decode_record(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e).into()),
        }
    }

    /// Store the controller's identity, owner-read-only
    pub fn write_local(&self, private_key: &str, sign_key: &str) -> Result<(), KeyError> {
        let key = LocalKey {
            private_key: private_key.to_string(),
            sign_key: sign_key.to_string(),
        };
        let path = self.local_path();
        let bytes = encode_record(&key)?;
        write_owner_read_only(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
        info!(path = ?path, "Wrote local key");
        Ok(())
    }

    /// Generate and store a fresh identity
    pub fn generate_local(&self) -> Result<LocalKey, KeyError> {
        let key = LocalKey::generate();
        self.write_local(&key.private_key, &key.sign_key)?;
        Ok(key)
    }

    /// Remove the controller's identity. Returns whether one existed.
    pub fn delete_local(&self) -> Result<bool, KeyError> {
        let path = self.local_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e).into()),
        }
    }

    /// Remove the whole pki directory. Returns whether it existed.
    pub fn delete_pki_dir(&self) -> Result<bool, KeyError> {
        let root = self.ring.store().root();
        match fs::remove_dir_all(root) {
            Ok(()) => {
                warn!(path = ?root, "Removed pki directory");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(root, e).into()),
        }
    }
}

#[cfg(unix)]
fn write_owner_read_only(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if path.exists() {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn write_owner_read_only(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if path.exists() {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    fs::write(path, bytes)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}
