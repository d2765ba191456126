// cache/reconcile.rs - Cache Reconciliation after Trust Changes

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::MinionCache;
use crate::observability::record_cache_purge;

/// Directory under the cachedir holding per-minion state
pub const MINION_CACHE_DIR: &str = "minions";

/// What one reconciliation pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Per-minion cache directories removed
    pub purged_dirs: Vec<String>,

    /// Structured cache entries flushed
    pub flushed: Vec<String>,

    /// Road-cache estate files removed
    pub removed_estates: Vec<PathBuf>,

    /// Failures recorded along the way; none of them stopped the pass
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn removed_count(&self) -> usize {
        self.purged_dirs.len() + self.flushed.len() + self.removed_estates.len()
    }
}

#[derive(Debug, Deserialize)]
struct EstateRecord {
    #[serde(default)]
    role: Option<String>,
}

/// Purges cached per-minion state for ids the key store no longer knows.
///
/// Three sources are swept, each independently: directories under
/// `<cachedir>/minions/`, entries of the structured cache bank named after
/// the accepted partition, and (raet only) the road cache of remote estates.
#[derive(Clone)]
pub struct CacheReconciler {
    cachedir: PathBuf,
    bank: String,
    cache: Arc<dyn MinionCache>,
    road_cache: Option<PathBuf>,
    preserve_minion_cache: bool,
}

impl std::fmt::Debug for CacheReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReconciler")
            .field("cachedir", &self.cachedir)
            .field("bank", &self.bank)
            .field("road_cache", &self.road_cache)
            .field("preserve_minion_cache", &self.preserve_minion_cache)
            .finish()
    }
}

impl CacheReconciler {
    pub fn new(cachedir: impl Into<PathBuf>, bank: impl Into<String>, cache: Arc<dyn MinionCache>) -> Self {
        Self {
            cachedir: cachedir.into(),
            bank: bank.into(),
            cache,
            road_cache: None,
            preserve_minion_cache: false,
        }
    }

    /// Also sweep the raet road cache kept in `dir`
    pub fn with_road_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.road_cache = Some(dir.into());
        self
    }

    /// Skip the whole sweep whenever a caller asks to preserve some ids.
    /// A pass with an empty preserve list still purges.
    pub fn preserve_minion_cache(mut self, preserve: bool) -> Self {
        self.preserve_minion_cache = preserve;
        self
    }

    pub fn minion_cache_dir(&self) -> PathBuf {
        self.cachedir.join(MINION_CACHE_DIR)
    }

    /// Remove cached state for every id that is neither known nor preserved.
    /// Running it twice in a row removes nothing the second time.
    pub fn reconcile(&self, known: &BTreeSet<String>, preserve: &[String]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.preserve_minion_cache && !preserve.is_empty() {
            debug!(preserved = preserve.len(), "Minion cache preserved by configuration");
            return report;
        }

        let keep = |id: &str| known.contains(id) || preserve.iter().any(|p| p == id);

        self.purge_dirs(&keep, &mut report);
        self.flush_bank(&keep, &mut report);
        if let Some(road) = &self.road_cache {
            purge_road_cache(road, &keep, &mut report);
        }

        if report.removed_count() > 0 {
            info!(
                dirs = report.purged_dirs.len(),
                flushed = report.flushed.len(),
                estates = report.removed_estates.len(),
                "Purged stale minion cache"
            );
        }
        record_cache_purge(&report);
        report
    }

    fn purge_dirs(&self, keep: &dyn Fn(&str) -> bool, report: &mut ReconcileReport) {
        let dir = self.minion_cache_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = ?dir, error = %e, "Failed to read minion cache");
                report.errors.push(format!("{}: {}", dir.display(), e));
                return;
            }
        };

        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let path = entry.path();
            if keep(&name) || !path.is_dir() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(id = %name, "Removed minion cache directory");
                    report.purged_dirs.push(name);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove minion cache directory");
                    report.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }
        report.purged_dirs.sort();
    }

    fn flush_bank(&self, keep: &dyn Fn(&str) -> bool, report: &mut ReconcileReport) {
        let listed = match self.cache.list(&self.bank) {
            Ok(listed) => listed,
            Err(e) => {
                warn!(bank = %self.bank, error = %e, "Failed to list cache bank");
                report.errors.push(e.to_string());
                return;
            }
        };

        for id in listed.into_iter().filter(|id| !keep(id)) {
            match self.cache.flush(&self.bank, Some(&id)) {
                Ok(()) => report.flushed.push(id),
                Err(e) => {
                    warn!(bank = %self.bank, id = %id, error = %e, "Failed to flush cache entry");
                    report.errors.push(e.to_string());
                }
            }
        }
    }
}

fn purge_road_cache(dir: &Path, keep: &dyn Fn(&str) -> bool, report: &mut ReconcileReport) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            report.errors.push(format!("{}: {}", dir.display(), e));
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(".json") else {
            continue;
        };
        match stem.split_once('.') {
            Some(("estate", name)) if !name.is_empty() => {}
            _ => continue,
        }

        let record: EstateRecord = match fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
        {
            Ok(record) => record,
            Err(e) => {
                warn!(path = ?path, error = %e, "Unreadable estate file");
                report.errors.push(format!("{}: {}", path.display(), e));
                continue;
            }
        };

        if record.role.as_deref().is_some_and(|role| keep(role)) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = ?path, "Removed stale estate");
                report.removed_estates.push(path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
        }
    }
    report.removed_estates.sort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileCache, MemoryCache};

    fn known(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_purges_unknown_dirs_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["m1", "m2", "m3"] {
            fs::create_dir_all(dir.path().join("minions").join(id)).unwrap();
        }
        let cache = Arc::new(MemoryCache::new());
        cache.insert("minions", "m1", b"x".to_vec());
        cache.insert("minions", "m4", b"x".to_vec());

        let reconciler = CacheReconciler::new(dir.path(), "minions", cache.clone());
        let report = reconciler.reconcile(&known(&["m1"]), &["m3".to_string()]);

        assert_eq!(report.purged_dirs, vec!["m2"]);
        assert_eq!(report.flushed, vec!["m4"]);
        assert!(report.is_clean());
        assert!(dir.path().join("minions/m1").is_dir());
        assert!(dir.path().join("minions/m3").is_dir());
        assert!(cache.contains("minions", "m1"));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("minions/gone")).unwrap();
        let cache = Arc::new(FileCache::new(dir.path()));
        let reconciler = CacheReconciler::new(dir.path(), "minions", cache);

        let first = reconciler.reconcile(&known(&[]), &[]);
        assert_eq!(first.purged_dirs, vec!["gone"]);

        let second = reconciler.reconcile(&known(&[]), &[]);
        assert_eq!(second.removed_count(), 0);
    }

    #[test]
    fn test_preserve_minion_cache_needs_preserved_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("minions/gone")).unwrap();
        fs::create_dir_all(dir.path().join("minions/kept")).unwrap();
        let reconciler = CacheReconciler::new(dir.path(), "minions", Arc::new(MemoryCache::new()))
            .preserve_minion_cache(true);

        let report = reconciler.reconcile(&known(&[]), &["kept".to_string()]);
        assert_eq!(report.removed_count(), 0);
        assert!(dir.path().join("minions/gone").is_dir());

        let report = reconciler.reconcile(&known(&[]), &[]);
        assert_eq!(report.purged_dirs, vec!["gone", "kept"]);
    }

    #[test]
    fn test_road_cache_purge() {
        let dir = tempfile::tempdir().unwrap();
        let road = dir.path().join("raet/master_master/remote");
        fs::create_dir_all(&road).unwrap();
        fs::write(road.join("estate.m1.json"), r#"{"role": "m1"}"#).unwrap();
        fs::write(road.join("estate.m2.json"), r#"{"role": "m2"}"#).unwrap();
        fs::write(road.join("other.m2.json"), r#"{"role": "m2"}"#).unwrap();

        let reconciler = CacheReconciler::new(dir.path(), "accepted", Arc::new(MemoryCache::new()))
            .with_road_cache(&road);
        let report = reconciler.reconcile(&known(&["m1"]), &[]);

        assert_eq!(report.removed_estates, vec![road.join("estate.m2.json")]);
        assert!(road.join("estate.m1.json").exists());
        assert!(road.join("other.m2.json").exists());
    }
}
