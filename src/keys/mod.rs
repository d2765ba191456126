// keys/mod.rs - Minion Key Management
//
//! Trust management for minion keys
//!
//! Provides:
//! - Partitioned key store with one directory per trust state
//! - Glob matching over listings
//! - Accept, reject and delete as best-effort batches with events
//! - Classification of newly presented keys (raet)
//! - `KeyManager`, one operation set over both backends
//!
//! # Example
//!
//! ```ignore
//! use minion_keys::{KeyConfig, KeyManager};
//! use minion_keys::keys::AcceptOptions;
//!
//! let manager = KeyManager::builder(KeyConfig::load(None)?).build()?;
//! let accepted = manager.accept("web*", AcceptOptions::default());
//! ```

pub mod fingerprint;
pub mod matcher;
pub mod raet;
pub mod state;
pub mod store;
pub mod transition;
pub mod zmq;

pub use matcher::{KeyGlob, MatchScope};
pub use raet::{LocalKey, RaetKeys, RemoteKey, RemoteRecord};
pub use state::{KeyMatches, KeyState, KeyStatus, RaetState, StatusFilter, ZmqState};
pub use store::{KeyOutcome, KeyStore, StoreError};
pub use transition::{
    AcceptOptions, BatchReport, DeleteOptions, KeyChange, KeyRing, KeyTarget, LocalKeys,
    RejectOptions, Transition,
};
pub use zmq::ZmqKeys;

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheReconciler, FileCache, MinionCache, ReconcileReport};
use crate::config::{ConfigError, KeyConfig, Transport};
use crate::events::{EventBus, NullBus};
use crate::policy::{AutoKeyPolicy, AutoPolicy, PolicyError};
use crate::session::{SessionKeyRotation, SessionRevoker};

/// Per-key rendered values (key text or fingerprint), grouped by status
pub type KeyDetails = BTreeMap<KeyStatus, BTreeMap<String, String>>;

/// Errors surfaced by key management
#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("Invalid local key: {0}")]
    InvalidLocalKey(String),

    #[error("{0} is not supported by the {1} transport")]
    Unsupported(&'static str, Transport),
}

/// Key management over the backend the transport calls for
#[derive(Debug)]
pub enum KeyManager {
    Zmq(ZmqKeys),
    Raet(RaetKeys),
}

/// Run the same expression against whichever backend is active
macro_rules! with_backend {
    ($self:expr, $keys:ident => $body:expr) => {
        match $self {
            KeyManager::Zmq($keys) => $body,
            KeyManager::Raet($keys) => $body,
        }
    };
}

impl KeyManager {
    pub fn builder(config: KeyConfig) -> KeyManagerBuilder {
        KeyManagerBuilder::new(config)
    }

    /// Build with default collaborators
    pub fn new(config: KeyConfig) -> Result<Self, KeyError> {
        Self::builder(config).build()
    }

    pub fn transport(&self) -> &'static str {
        match self {
            KeyManager::Zmq(_) => "zeromq",
            KeyManager::Raet(_) => "raet",
        }
    }

    pub fn as_raet(&self) -> Option<&RaetKeys> {
        match self {
            KeyManager::Raet(keys) => Some(keys),
            KeyManager::Zmq(_) => None,
        }
    }

    pub fn as_zmq(&self) -> Option<&ZmqKeys> {
        match self {
            KeyManager::Zmq(keys) => Some(keys),
            KeyManager::Raet(_) => None,
        }
    }

    fn raet(&self, operation: &'static str) -> Result<&RaetKeys, KeyError> {
        self.as_raet()
            .ok_or(KeyError::Unsupported(operation, Transport::Zeromq))
    }

    // Listing and matching

    pub fn list_keys(&self) -> KeyMatches {
        with_backend!(self, keys => keys.ring().list_keys())
    }

    pub fn local_keys(&self) -> KeyMatches {
        with_backend!(self, keys => keys.ring().local_keys())
    }

    pub fn all_keys(&self) -> KeyMatches {
        with_backend!(self, keys => keys.ring().all_keys())
    }

    pub fn list_status(&self, selector: &str) -> KeyMatches {
        with_backend!(self, keys => keys.ring().list_status(selector))
    }

    pub fn name_match(&self, pattern: &str, scope: MatchScope) -> KeyMatches {
        with_backend!(self, keys => keys.ring().name_match(pattern, scope))
    }

    pub fn dict_match(&self, explicit: &KeyMatches) -> KeyMatches {
        with_backend!(self, keys => keys.ring().dict_match(explicit))
    }

    // Transitions

    pub fn accept(&self, target: impl Into<KeyTarget>, options: AcceptOptions) -> Transition {
        let target = target.into();
        with_backend!(self, keys => keys.ring().accept(target, options))
    }

    pub fn accept_all(&self) -> Transition {
        with_backend!(self, keys => keys.ring().accept_all())
    }

    pub fn reject(&self, target: impl Into<KeyTarget>, options: RejectOptions) -> Transition {
        let target = target.into();
        with_backend!(self, keys => keys.ring().reject(target, options))
    }

    pub fn reject_all(&self) -> Transition {
        with_backend!(self, keys => keys.ring().reject_all())
    }

    pub fn delete(&self, target: impl Into<KeyTarget>, options: DeleteOptions) -> Transition {
        let target = target.into();
        with_backend!(self, keys => keys.ring().delete(target, options))
    }

    pub fn delete_all(&self) -> Transition {
        with_backend!(self, keys => keys.ring().delete_all())
    }

    pub fn delete_denied(&self) -> Transition {
        with_backend!(self, keys => keys.ring().delete_denied())
    }

    pub fn reconcile(&self, preserve: &[String]) -> ReconcileReport {
        with_backend!(self, keys => keys.ring().reconcile(preserve))
    }

    // Key material

    pub fn key_str(&self, pattern: &str) -> KeyDetails {
        with_backend!(self, keys => keys.key_str(pattern))
    }

    pub fn key_str_all(&self) -> KeyDetails {
        with_backend!(self, keys => keys.key_str_all())
    }

    pub fn finger(&self, pattern: &str) -> KeyDetails {
        with_backend!(self, keys => keys.finger(pattern))
    }

    pub fn finger_all(&self) -> KeyDetails {
        with_backend!(self, keys => keys.finger_all())
    }

    pub fn check_master(&self) -> bool {
        with_backend!(self, keys => keys.check_master())
    }

    // Raet only

    /// Classify a key presented by a minion
    pub fn status(&self, minion_id: &str, public_key: &str, verify_key: &str) -> Result<KeyStatus, KeyError> {
        self.raet("status")?.status(minion_id, public_key, verify_key)
    }

    pub fn read_remote(&self, minion_id: &str, status: KeyStatus) -> Result<Option<RemoteKey>, KeyError> {
        let keys = self.raet("read_remote")?;
        match RaetState::from_status(status) {
            Some(state) => keys.read_remote(minion_id, state),
            None => Ok(None),
        }
    }

    pub fn read_all_remote(&self) -> Result<BTreeMap<String, RemoteRecord>, KeyError> {
        Ok(self.raet("read_all_remote")?.read_all_remote())
    }

    pub fn read_local(&self) -> Result<Option<LocalKey>, KeyError> {
        self.raet("read_local")?.read_local()
    }

    pub fn write_local(&self, private_key: &str, sign_key: &str) -> Result<(), KeyError> {
        self.raet("write_local")?.write_local(private_key, sign_key)
    }

    pub fn generate_local(&self) -> Result<LocalKey, KeyError> {
        self.raet("generate_local")?.generate_local()
    }

    pub fn delete_local(&self) -> Result<bool, KeyError> {
        self.raet("delete_local")?.delete_local()
    }

    pub fn delete_pki_dir(&self) -> Result<bool, KeyError> {
        self.raet("delete_pki_dir")?.delete_pki_dir()
    }
}

/// Wires a [`KeyManager`] to its collaborators
pub struct KeyManagerBuilder {
    config: KeyConfig,
    bus: Option<Arc<dyn EventBus>>,
    cache: Option<Arc<dyn MinionCache>>,
    revoker: Option<Arc<dyn SessionRevoker>>,
    policy: Option<Arc<dyn AutoPolicy>>,
}

impl KeyManagerBuilder {
    pub fn new(config: KeyConfig) -> Self {
        Self {
            config,
            bus: None,
            cache: None,
            revoker: None,
            policy: None,
        }
    }

    /// Where transition events go (default: dropped)
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Structured cache swept on reconciliation (default: file cache under the cachedir)
    pub fn with_cache(mut self, cache: Arc<dyn MinionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Channel for live session revocation on delete
    pub fn with_revoker(mut self, revoker: Arc<dyn SessionRevoker>) -> Self {
        self.revoker = Some(revoker);
        self
    }

    /// Auto policy for raet classification (default: the configured policy files)
    pub fn with_policy(mut self, policy: Arc<dyn AutoPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<KeyManager, KeyError> {
        let config = self.config;
        config.validate()?;
        std::fs::create_dir_all(&config.cachedir)
            .map_err(|e| StoreError::io(&config.cachedir, e))?;

        let bus = self.bus.unwrap_or_else(|| Arc::new(NullBus));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(FileCache::new(&config.cachedir)));
        let rotation = SessionKeyRotation::new(&config.cachedir);

        let manager = match config.transport {
            Transport::Zeromq | Transport::Tcp => {
                let store: KeyStore<ZmqState> = KeyStore::new(&config.pki_dir);
                store.ensure_partitions()?;
                let reconciler =
                    CacheReconciler::new(&config.cachedir, ZmqState::ACCEPTED.dir_name(), cache)
                        .preserve_minion_cache(config.preserve_minion_cache);
                let ring = finish_ring(
                    KeyRing::new(
                        store,
                        LocalKeys::PemFiles(config.pki_dir.clone()),
                        bus,
                        reconciler,
                        rotation,
                    ),
                    &config,
                    self.revoker,
                );
                KeyManager::Zmq(ZmqKeys::new(ring, config.hash_type, &config.sock_dir))
            }
            Transport::Raet => {
                let store: KeyStore<RaetState> = KeyStore::new(&config.pki_dir);
                store.ensure_partitions()?;
                let mut reconciler =
                    CacheReconciler::new(&config.cachedir, RaetState::ACCEPTED.dir_name(), cache)
                        .preserve_minion_cache(config.preserve_minion_cache);
                if let Some(road) = config.road_cache_dir() {
                    reconciler = reconciler.with_road_cache(road);
                }
                let ring = finish_ring(
                    KeyRing::new(
                        store,
                        LocalKeys::KeyFile(config.pki_dir.join(raet::LOCAL_KEY_FILE)),
                        bus,
                        reconciler,
                        rotation,
                    ),
                    &config,
                    self.revoker,
                );
                let policy = self
                    .policy
                    .unwrap_or_else(|| Arc::new(AutoKeyPolicy::from_config(&config)));
                KeyManager::Raet(
                    RaetKeys::new(ring, policy)
                        .with_open_mode(config.open_mode)
                        .with_auto_accept(config.auto_accept),
                )
            }
        };

        info!(
            transport = %config.transport,
            pki_dir = ?config.pki_dir,
            "Key manager ready"
        );
        Ok(manager)
    }
}

fn finish_ring<S: KeyState>(
    ring: KeyRing<S>,
    config: &KeyConfig,
    revoker: Option<Arc<dyn SessionRevoker>>,
) -> KeyRing<S> {
    let ring = ring.with_rotate_session_key(config.rotate_session_key);
    match revoker {
        Some(revoker) => ring.with_revoker(revoker),
        None => {
            debug!("No revocation channel configured");
            ring
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::ApplicationKind;
    use crate::events::{BroadcastBus, KeyAction, TransitionEvent};
    use crate::policy::GlobPolicy;
    use std::fs;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_role_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyConfig::master(dir.path()).with_role(None);
        assert!(matches!(
            KeyManager::new(config),
            Err(KeyError::Config(ConfigError::InvalidRole(_)))
        ));
    }

    #[test]
    fn test_raet_requires_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyConfig::master(dir.path())
            .with_transport(Transport::Raet)
            .with_id(None);
        assert!(matches!(
            KeyManager::new(config),
            Err(KeyError::Config(ConfigError::MissingId))
        ));
    }

    #[test]
    fn test_transport_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let tcp = KeyManager::new(KeyConfig::master(dir.path()).with_transport(Transport::Tcp)).unwrap();
        assert_eq!(tcp.transport(), "zeromq");
        assert_eq!(tcp.list_keys().len(), 4);
        assert!(matches!(
            tcp.read_local(),
            Err(KeyError::Unsupported("read_local", _))
        ));

        let dir = tempfile::tempdir().unwrap();
        let raet = KeyManager::new(
            KeyConfig::master(dir.path())
                .with_transport(Transport::Raet)
                .with_role(Some(ApplicationKind::Master)),
        )
        .unwrap();
        assert_eq!(raet.transport(), "raet");
        assert_eq!(raet.list_keys().len(), 3);
        assert!(raet.check_master());
    }

    #[test]
    fn test_pending_accept_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(BroadcastBus::new(16));
        let mut rx = bus.subscribe();
        let manager = KeyManager::builder(KeyConfig::master(dir.path()))
            .with_bus(bus)
            .build()
            .unwrap();

        let pre = dir.path().join("pki/minions_pre");
        fs::write(pre.join("m1"), "pem1").unwrap();
        fs::write(pre.join("m2"), "pem2").unwrap();

        let result = manager.accept("m*", AcceptOptions::default());
        assert_eq!(
            result.keys,
            KeyMatches::from([(KeyStatus::Accepted, ids(&["m1", "m2"]))])
        );
        assert_eq!(rx.try_recv().unwrap().event, TransitionEvent::new(KeyAction::Accept, "m1"));
        assert_eq!(rx.try_recv().unwrap().event, TransitionEvent::new(KeyAction::Accept, "m2"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_delete_all_purges_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let manager = KeyManager::builder(KeyConfig::master(dir.path()))
            .with_cache(cache.clone())
            .build()
            .unwrap();

        fs::write(dir.path().join("pki/minions/m1"), "pem").unwrap();
        fs::write(dir.path().join("pki/minions_denied/m2"), "pem").unwrap();
        fs::create_dir_all(dir.path().join("cache/minions/m1")).unwrap();
        cache.insert("minions", "m1", b"grains".to_vec());

        let result = manager.delete_all();
        assert!(result.keys.values().all(Vec::is_empty));
        assert!(!dir.path().join("cache/minions/m1").exists());
        assert!(!cache.contains("minions", "m1"));
        assert!(dir.path().join("cache/.dfn").exists());
    }

    #[test]
    fn test_preserve_minion_cache_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = KeyManager::new(KeyConfig::master(dir.path()).with_preserve_minion_cache(true)).unwrap();
        fs::write(dir.path().join("pki/minions/m1"), "pem").unwrap();
        fs::create_dir_all(dir.path().join("cache/minions/m1")).unwrap();

        fs::create_dir_all(dir.path().join("cache/minions/stale")).unwrap();

        let options = DeleteOptions {
            preserve_cache: true,
            ..DeleteOptions::default()
        };
        manager.delete("m1", options);
        assert!(dir.path().join("cache/minions/m1").exists());
        assert!(dir.path().join("cache/minions/stale").exists());

        manager.delete_all();
        assert!(!dir.path().join("cache/minions/m1").exists());
        assert!(!dir.path().join("cache/minions/stale").exists());
    }

    #[test]
    fn test_raet_classification_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyConfig::master(dir.path()).with_transport(Transport::Raet);
        let manager = KeyManager::builder(config)
            .with_policy(Arc::new(GlobPolicy::new().sign("web*").reject("bad*")))
            .build()
            .unwrap();

        assert_eq!(manager.status("web1", "p", "v").unwrap(), KeyStatus::Accepted);
        assert_eq!(manager.status("bad1", "p", "v").unwrap(), KeyStatus::Rejected);
        assert_eq!(manager.status("db1", "p", "v").unwrap(), KeyStatus::Pending);
        assert_eq!(manager.status("db1", "x", "v").unwrap(), KeyStatus::Rejected);

        assert_eq!(
            manager.list_keys(),
            KeyMatches::from([
                (KeyStatus::Accepted, ids(&["web1"])),
                (KeyStatus::Pending, ids(&["db1"])),
                (KeyStatus::Rejected, ids(&["bad1"])),
            ])
        );
    }

    #[test]
    fn test_raet_local_key_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = KeyManager::new(KeyConfig::master(dir.path()).with_transport(Transport::Raet)).unwrap();

        manager.write_local("P", "S").unwrap();
        let local = manager.read_local().unwrap().unwrap();
        assert_eq!((local.private_key.as_str(), local.sign_key.as_str()), ("P", "S"));
        assert_eq!(manager.local_keys()[&KeyStatus::Local], ids(&["local.key"]));
    }

    #[test]
    fn test_raet_road_cache_swept_on_reject() {
        let dir = tempfile::tempdir().unwrap();
        let manager = KeyManager::new(
            KeyConfig::master(dir.path())
                .with_transport(Transport::Raet)
                .with_id(Some("ctl")),
        )
        .unwrap();
        let road = dir.path().join("cache/raet/ctl_master/remote");
        fs::create_dir_all(&road).unwrap();
        fs::write(road.join("estate.gone.json"), r#"{"role": "gone"}"#).unwrap();

        manager.status("m1", "p", "v").unwrap();
        let result = manager.reject("m1", RejectOptions::default());

        assert!(!road.join("estate.gone.json").exists());
        assert_eq!(result.keys[&KeyStatus::Rejected], ids(&["m1"]));
    }
}
