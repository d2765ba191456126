// session.rs - Live Session Revocation and Session Key Rotation

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// Remote function that makes a minion drop its authenticated session
pub const REVOKE_FUNCTION: &str = "keys.revoke_auth";

/// Marker file the controller polls to know it must rotate its session key
pub const ROTATION_MARKER: &str = ".dfn";

/// Errors raised while revoking a live session
#[derive(Debug, Error)]
pub enum RevokeError {
    #[error("Cannot contact the controller: {0}")]
    Unreachable(String),
}

/// Sends revocation commands to minions.
///
/// Implementations must not block on the minion's reply: the command is
/// dispatched and the caller moves on.
pub trait SessionRevoker: Send + Sync {
    fn revoke(&self, id: &str) -> Result<(), RevokeError>;
}

/// A queued revocation command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeRequest {
    pub target: String,
    pub function: &'static str,
}

/// Revoker that hands commands to an async dispatcher over an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelRevoker {
    sender: mpsc::UnboundedSender<RevokeRequest>,
}

impl ChannelRevoker {
    /// Create a revoker and the receiving end the dispatcher drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RevokeRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SessionRevoker for ChannelRevoker {
    fn revoke(&self, id: &str) -> Result<(), RevokeError> {
        self.sender
            .send(RevokeRequest {
                target: id.to_string(),
                function: REVOKE_FUNCTION,
            })
            .map_err(|_| RevokeError::Unreachable("revocation dispatcher is gone".into()))
    }
}

/// Requests rotation of the controller's session encryption key
#[derive(Debug, Clone)]
pub struct SessionKeyRotation {
    cachedir: PathBuf,
}

impl SessionKeyRotation {
    pub fn new(cachedir: impl Into<PathBuf>) -> Self {
        Self {
            cachedir: cachedir.into(),
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.cachedir.join(ROTATION_MARKER)
    }

    /// Drop the rotation marker. Returns `false` when a rotation is already
    /// pending.
    pub fn request(&self) -> io::Result<bool> {
        let path = self.marker_path();
        info!("Rotating session key");
        match create_owner_read_only(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                info!("Session key rotation already requested");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.marker_path().is_file()
    }
}

#[cfg(unix)]
fn create_owner_read_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn create_owner_read_only(path: &Path) -> io::Result<()> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}
