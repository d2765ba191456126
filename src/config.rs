// config.rs - Key Management Configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::error;

/// Prefix of environment overrides, e.g. `MINION_KEYS__PKI_DIR`
pub const ENV_PREFIX: &str = "MINION_KEYS";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid application kind: {0}")]
    InvalidRole(String),

    #[error("Invalid id: the raet transport needs the controller id")]
    MissingId,
}

/// Transport the controller runs; selects the key backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Zeromq,
    Tcp,
    Raet,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Zeromq => "zeromq",
            Transport::Tcp => "tcp",
            Transport::Raet => "raet",
        })
    }
}

/// Application kind of the process holding the keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationKind {
    Master,
    Minion,
    Syndic,
    Caller,
}

impl ApplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationKind::Master => "master",
            ApplicationKind::Minion => "minion",
            ApplicationKind::Syndic => "syndic",
            ApplicationKind::Caller => "caller",
        }
    }
}

/// Digest used for PEM fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    #[default]
    Sha256,
    Sha512,
}

/// Key management configuration.
///
/// Built once, then handed to the backend constructors; nothing mutates it
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Root of the key partitions
    pub pki_dir: PathBuf,

    /// Root of per-minion cached state
    pub cachedir: PathBuf,

    /// Where the running controller keeps its sockets
    pub sock_dir: PathBuf,

    pub transport: Transport,

    /// Application kind; required
    pub role: Option<ApplicationKind>,

    /// Controller id; required by the raet transport
    pub id: Option<String>,

    pub hash_type: HashType,

    /// Accept every presented key, overwriting stored ones
    pub open_mode: bool,

    /// Accept every new key
    pub auto_accept: bool,

    /// File of globs naming ids to sign automatically
    pub autosign_file: Option<PathBuf>,

    /// File of globs naming ids to reject automatically
    pub autoreject_file: Option<PathBuf>,

    /// Minutes an autosign marker stays valid; 0 never expires
    pub autosign_timeout_mins: u64,

    /// Trust group-writable policy files
    pub permissive_pki_access: bool,

    /// Never purge cached minion state
    pub preserve_minion_cache: bool,

    /// Rotate the session key when trust is reduced
    pub rotate_session_key: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            pki_dir: PathBuf::from("/etc/minion-keys/pki/master"),
            cachedir: PathBuf::from("/var/cache/minion-keys/master"),
            sock_dir: PathBuf::from("/var/run/minion-keys/master"),
            transport: Transport::default(),
            role: None,
            id: None,
            hash_type: HashType::default(),
            open_mode: false,
            auto_accept: false,
            autosign_file: None,
            autoreject_file: None,
            autosign_timeout_mins: 120,
            permissive_pki_access: false,
            preserve_minion_cache: false,
            rotate_session_key: true,
        }
    }
}

impl KeyConfig {
    /// Master configuration with every directory under `root`
    pub fn master(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            pki_dir: root.join("pki"),
            cachedir: root.join("cache"),
            sock_dir: root.join("sock"),
            role: Some(ApplicationKind::Master),
            id: Some("master".to_string()),
            ..Self::default()
        }
    }

    /// Load from an optional file, then apply `MINION_KEYS__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let cfg: KeyConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check what the backends need before touching the disk
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(role) = self.role else {
            error!("Invalid application kind = ''");
            return Err(ConfigError::InvalidRole(String::new()));
        };
        if self.transport == Transport::Raet && self.id.as_deref().is_none_or(str::is_empty) {
            error!(role = role.as_str(), "Invalid id");
            return Err(ConfigError::MissingId);
        }
        Ok(())
    }

    /// Path of the raet road cache swept during reconciliation
    pub fn road_cache_dir(&self) -> Option<PathBuf> {
        let id = self.id.as_deref().filter(|id| !id.is_empty())?;
        let role = self.role?;
        Some(
            self.cachedir
                .join("raet")
                .join(format!("{}_{}", id, role.as_str()))
                .join("remote"),
        )
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_role(mut self, role: Option<ApplicationKind>) -> Self {
        self.role = role;
        self
    }

    pub fn with_id(mut self, id: Option<&str>) -> Self {
        self.id = id.map(str::to_string);
        self
    }

    pub fn with_hash_type(mut self, hash_type: HashType) -> Self {
        self.hash_type = hash_type;
        self
    }

    pub fn with_open_mode(mut self, open_mode: bool) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    pub fn with_autosign_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.autosign_file = Some(path.into());
        self
    }

    pub fn with_autoreject_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.autoreject_file = Some(path.into());
        self
    }

    pub fn with_autosign_timeout(mut self, minutes: u64) -> Self {
        self.autosign_timeout_mins = minutes;
        self
    }

    pub fn with_permissive_pki_access(mut self, permissive: bool) -> Self {
        self.permissive_pki_access = permissive;
        self
    }

    pub fn with_preserve_minion_cache(mut self, preserve: bool) -> Self {
        self.preserve_minion_cache = preserve;
        self
    }

    pub fn with_rotate_session_key(mut self, rotate: bool) -> Self {
        self.rotate_session_key = rotate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = KeyConfig::default();
        assert_eq!(cfg.transport, Transport::Zeromq);
        assert_eq!(cfg.autosign_timeout_mins, 120);
        assert!(cfg.rotate_session_key);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRole(_))));
    }

    #[test]
    fn test_raet_requires_id() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = KeyConfig::master(dir.path())
            .with_transport(Transport::Raet)
            .with_id(None);
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingId)));

        let cfg = cfg.with_id(Some("master"));
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.road_cache_dir().unwrap(),
            dir.path().join("cache/raet/master_master/remote")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.toml");
        std::fs::write(
            &path,
            r#"
pki_dir = "/srv/pki"
transport = "raet"
role = "master"
id = "ctl"
hash_type = "sha512"
auto_accept = true
"#,
        )
        .unwrap();

        let cfg = KeyConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.pki_dir, PathBuf::from("/srv/pki"));
        assert_eq!(cfg.transport, Transport::Raet);
        assert_eq!(cfg.role, Some(ApplicationKind::Master));
        assert_eq!(cfg.hash_type, HashType::Sha512);
        assert!(cfg.auto_accept);
        assert_eq!(cfg.autosign_timeout_mins, 120);
    }

    #[test]
    fn test_load_rejects_unknown_role() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.toml");
        std::fs::write(&path, "role = \"janitor\"\n").unwrap();
        assert!(matches!(KeyConfig::load(Some(&path)), Err(ConfigError::Load(_))));
    }
}
