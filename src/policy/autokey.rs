// policy/autokey.rs - File-Driven Auto Accept/Reject

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::{AutoPolicy, PolicyError};
use crate::config::KeyConfig;
use crate::keys::matcher::KeyGlob;

/// Directory under the pki root holding one-shot autosign markers
pub const AUTOSIGN_DIR: &str = "minions_autosign";

/// Auto policy backed by the controller's policy files.
///
/// `autosign_file` and `autoreject_file` hold one glob per line; blank lines
/// and lines starting with `#` are skipped. A policy file that other users
/// could have written is ignored. A marker file named after an id in
/// `<pki_dir>/minions_autosign/` grants that id a single auto-sign.
#[derive(Debug, Clone)]
pub struct AutoKeyPolicy {
    autosign_dir: PathBuf,
    auto_accept: bool,
    autosign_file: Option<PathBuf>,
    autoreject_file: Option<PathBuf>,
    autosign_timeout: Option<Duration>,
    permissive_pki_access: bool,
}

impl AutoKeyPolicy {
    pub fn from_config(config: &KeyConfig) -> Self {
        let timeout = match config.autosign_timeout_mins {
            0 => None,
            mins => Some(Duration::from_secs(mins.saturating_mul(60))),
        };
        Self {
            autosign_dir: config.pki_dir.join(AUTOSIGN_DIR),
            auto_accept: config.auto_accept,
            autosign_file: config.autosign_file.clone(),
            autoreject_file: config.autoreject_file.clone(),
            autosign_timeout: timeout,
            permissive_pki_access: config.permissive_pki_access,
        }
    }

    pub fn autosign_dir(&self) -> &Path {
        &self.autosign_dir
    }

    /// Globs listed in a policy file. A missing file holds no globs.
    pub fn read_globs(&self, path: &Path) -> Result<Vec<String>, PolicyError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        if !self.permissions_ok(path) {
            return Err(PolicyError::InsecurePermissions(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|e| PolicyError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    /// Whether `id` matches a glob in `path`; unreadable files match nothing
    fn check_list(&self, path: Option<&Path>, id: &str) -> bool {
        let Some(path) = path else {
            return false;
        };
        match self.read_globs(path) {
            Ok(globs) => globs.iter().any(|glob| KeyGlob::single(glob).matches(id)),
            Err(e) => {
                warn!(error = %e, "Ignoring policy file");
                false
            }
        }
    }

    #[cfg(unix)]
    fn permissions_ok(&self, path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let mode = meta.permissions().mode();
        if mode & 0o002 != 0 {
            return false;
        }
        if mode & 0o020 != 0 {
            return self.permissive_pki_access;
        }
        true
    }

    #[cfg(not(unix))]
    fn permissions_ok(&self, _path: &Path) -> bool {
        true
    }

    /// Drop markers older than the autosign timeout
    fn expire_markers(&self, timeout: Duration) {
        let Ok(entries) = fs::read_dir(&self.autosign_dir) else {
            return;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            let stale = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > timeout);
            if stale && path.is_file() {
                match fs::remove_file(&path) {
                    Ok(()) => debug!(path = ?path, "Expired autosign marker"),
                    Err(e) => warn!(path = ?path, error = %e, "Failed to expire autosign marker"),
                }
            }
        }
    }

    /// Consume the marker granting `id` a one-shot auto-sign
    fn check_autosign_dir(&self, id: &str) -> bool {
        if let Some(timeout) = self.autosign_timeout {
            self.expire_markers(timeout);
        }
        if id.is_empty() || id.contains('/') || id == "." || id == ".." {
            return false;
        }

        let marker = self.autosign_dir.join(id);
        if !marker.is_file() {
            return false;
        }
        match fs::remove_file(&marker) {
            Ok(()) => {
                info!(id, "Consumed autosign marker");
                true
            }
            // Someone else consumed it first
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(id, error = %e, "Failed to consume autosign marker");
                false
            }
        }
    }
}

impl AutoPolicy for AutoKeyPolicy {
    fn auto_reject(&self, id: &str) -> bool {
        self.check_list(self.autoreject_file.as_deref(), id)
    }

    fn auto_sign(&self, id: &str) -> bool {
        self.auto_accept
            || self.check_list(self.autosign_file.as_deref(), id)
            || self.check_autosign_dir(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> KeyConfig {
        KeyConfig::master(root)
    }

    fn write_policy(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
        }
    }

    #[test]
    fn test_autosign_file_globs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("autosign.conf");
        write_policy(&file, "# trusted racks\nweb*\n\n  db1  \n");

        let policy = AutoKeyPolicy::from_config(&config(dir.path()).with_autosign_file(&file));
        assert!(policy.auto_sign("web7"));
        assert!(policy.auto_sign("db1"));
        assert!(!policy.auto_sign("db2"));
        assert!(!policy.auto_sign("# trusted racks"));
        assert!(!policy.auto_reject("web7"));
    }

    #[test]
    fn test_auto_accept_implies_sign() {
        let dir = tempfile::tempdir().unwrap();
        let policy = AutoKeyPolicy::from_config(&config(dir.path()).with_auto_accept(true));
        assert!(policy.auto_sign("anything"));
    }

    #[test]
    fn test_autoreject_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("autoreject.conf");
        write_policy(&file, "evil*\n");

        let policy = AutoKeyPolicy::from_config(&config(dir.path()).with_autoreject_file(&file));
        assert!(policy.auto_reject("evil1"));
        assert!(!policy.auto_reject("good1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_policy_file_is_ignored() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("autosign.conf");
        write_policy(&file, "*\n");

        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();
        let policy = AutoKeyPolicy::from_config(&config(dir.path()).with_autosign_file(&file));
        assert!(!policy.auto_sign("m1"));

        fs::set_permissions(&file, fs::Permissions::from_mode(0o664)).unwrap();
        assert!(!policy.auto_sign("m1"));

        let permissive = AutoKeyPolicy::from_config(
            &config(dir.path())
                .with_autosign_file(&file)
                .with_permissive_pki_access(true),
        );
        assert!(permissive.auto_sign("m1"));
    }

    #[test]
    fn test_autosign_marker_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let policy = AutoKeyPolicy::from_config(&config(dir.path()));
        fs::create_dir_all(policy.autosign_dir()).unwrap();
        fs::write(policy.autosign_dir().join("m1"), b"").unwrap();

        assert!(policy.auto_sign("m1"));
        assert!(!policy.auto_sign("m1"));
        assert!(!policy.auto_sign("m2"));
    }

    #[test]
    fn test_stale_markers_expire() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = AutoKeyPolicy::from_config(&config(dir.path()));
        fs::create_dir_all(policy.autosign_dir()).unwrap();
        fs::write(policy.autosign_dir().join("m1"), b"").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        policy.autosign_timeout = Some(Duration::from_millis(1));
        assert!(!policy.auto_sign("m1"));
        assert!(!policy.autosign_dir().join("m1").exists());
    }
}
