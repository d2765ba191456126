// keys/zmq.rs - Four-Partition PEM Key Backend

use std::path::PathBuf;
use tracing::{debug, warn};

use super::fingerprint::pem_finger;
use super::matcher::MatchScope;
use super::state::{KeyMatches, KeyState, KeyStatus, ZmqState};
use super::transition::KeyRing;
use super::KeyDetails;
use crate::config::HashType;

/// Socket the running controller listens on for publish requests
pub const PUBLISH_PULL_SOCKET: &str = "publish_pull.ipc";

/// Key backend for the zeromq and tcp transports.
///
/// Minion keys are PEM text files in `minions`, `minions_pre`,
/// `minions_rejected` and `minions_denied`; the controller's own `*.pem` and
/// `*.pub` files sit directly in the pki root.
#[derive(Debug)]
pub struct ZmqKeys {
    ring: KeyRing<ZmqState>,
    hash_type: HashType,
    sock_dir: PathBuf,
}

impl ZmqKeys {
    pub fn new(ring: KeyRing<ZmqState>, hash_type: HashType, sock_dir: impl Into<PathBuf>) -> Self {
        Self {
            ring,
            hash_type,
            sock_dir: sock_dir.into(),
        }
    }

    pub fn ring(&self) -> &KeyRing<ZmqState> {
        &self.ring
    }

    /// Whether a controller appears to be running
    pub fn check_master(&self) -> bool {
        let running = self.sock_dir.join(PUBLISH_PULL_SOCKET).exists();
        if !running {
            debug!(sock_dir = ?self.sock_dir, "Controller socket not found");
        }
        running
    }

    /// PEM text of the keys matching `pattern`
    pub fn key_str(&self, pattern: &str) -> KeyDetails {
        self.read_each(&self.ring.name_match(pattern, MatchScope::Active), |text| text)
    }

    /// PEM text of every managed key
    pub fn key_str_all(&self) -> KeyDetails {
        self.read_each(&self.ring.list_keys(), |text| text)
    }

    /// Fingerprints of managed and local keys matching `pattern`
    pub fn finger(&self, pattern: &str) -> KeyDetails {
        let matches = self.ring.name_match(pattern, MatchScope::All);
        self.read_each(&matches, |text| pem_finger(&text, self.hash_type))
    }

    /// Fingerprints of every managed and local key
    pub fn finger_all(&self) -> KeyDetails {
        self.read_each(&self.ring.all_keys(), |text| pem_finger(&text, self.hash_type))
    }

    fn read_each(&self, matches: &KeyMatches, render: impl Fn(String) -> String) -> KeyDetails {
        let mut out = KeyDetails::new();
        for (status, ids) in matches {
            let group = out.entry(*status).or_default();
            for id in ids {
                let text = match self.read_text(*status, id) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(id = %id, status = %status, error = %e, "Skipping unreadable key");
                        continue;
                    }
                };
                group.insert(id.clone(), render(text));
            }
        }
        out
    }

    fn read_text(&self, status: KeyStatus, id: &str) -> Result<String, String> {
        match ZmqState::from_status(status) {
            Some(state) => self.ring.store().read_to_string(id, state).map_err(|e| e.to_string()),
            None => {
                let path = self.ring.local().path(id);
                std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", path.display(), e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheReconciler, MemoryCache};
    use crate::events::NullBus;
    use crate::keys::store::KeyStore;
    use crate::keys::transition::LocalKeys;
    use crate::session::SessionKeyRotation;
    use std::fs;
    use std::sync::Arc;

    const PEM: &str = "-----BEGIN PUBLIC KEY-----\nMIIB\n-----END PUBLIC KEY-----\n";

    fn keys(dir: &std::path::Path) -> ZmqKeys {
        let pki = dir.join("pki");
        let store: KeyStore<ZmqState> = KeyStore::new(&pki);
        store.ensure_partitions().unwrap();
        let ring = KeyRing::new(
            store,
            LocalKeys::PemFiles(pki),
            Arc::new(NullBus),
            CacheReconciler::new(dir.join("cache"), "minions", Arc::new(MemoryCache::new())),
            SessionKeyRotation::new(dir.join("cache")),
        );
        ZmqKeys::new(ring, HashType::Sha256, dir.join("sock"))
    }

    #[test]
    fn test_check_master() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys(dir.path());
        assert!(!keys.check_master());

        fs::create_dir_all(dir.path().join("sock")).unwrap();
        fs::write(dir.path().join("sock").join(PUBLISH_PULL_SOCKET), b"").unwrap();
        assert!(keys.check_master());
    }

    #[test]
    fn test_key_str_and_finger() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys(dir.path());
        keys.ring().store().write("m1", ZmqState::Pending, PEM.as_bytes()).unwrap();
        fs::write(dir.path().join("pki/master.pub"), PEM).unwrap();

        let strs = keys.key_str("m1");
        assert_eq!(strs[&KeyStatus::Pending]["m1"], PEM);

        let fingers = keys.finger("*");
        let expected = pem_finger(PEM, HashType::Sha256);
        assert_eq!(fingers[&KeyStatus::Pending]["m1"], expected);
        assert_eq!(fingers[&KeyStatus::Local]["master.pub"], expected);

        let all = keys.finger_all();
        assert!(all[&KeyStatus::Accepted].is_empty());
        assert_eq!(all[&KeyStatus::Local].len(), 1);
    }
}
