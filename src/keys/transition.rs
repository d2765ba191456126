// keys/transition.rs - Accept, Reject and Delete over a Key Store

use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::matcher::{dict_match, match_listing, MatchScope};
use super::state::{KeyMatches, KeyState, KeyStatus, StatusFilter};
use super::store::{sort_ids, KeyOutcome, KeyStore};
use crate::cache::{CacheReconciler, ReconcileReport};
use crate::events::{BusError, EventBus, KeyAction, TransitionEvent, KEY_EVENT_TAG};
use crate::observability::{
    record_batch_duration, record_key_transition, record_partition_sizes, record_revocation,
};
use crate::session::{SessionKeyRotation, SessionRevoker};

/// Controller-held identity files reported under [`KeyStatus::Local`]
#[derive(Debug, Clone)]
pub enum LocalKeys {
    /// Every `*.pub` and `*.pem` file directly in the directory
    PemFiles(PathBuf),

    /// One identity file
    KeyFile(PathBuf),
}

impl LocalKeys {
    /// Names of the local identity files that exist, sorted
    pub fn list(&self) -> Vec<String> {
        match self {
            LocalKeys::PemFiles(dir) => {
                let Ok(entries) = fs::read_dir(dir) else {
                    return Vec::new();
                };
                let mut names: Vec<String> = entries
                    .flatten()
                    .filter(|entry| entry.path().is_file())
                    .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                    .filter(|name| name.ends_with(".pub") || name.ends_with(".pem"))
                    .collect();
                sort_ids(&mut names);
                names
            }
            LocalKeys::KeyFile(path) => match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if path.is_file() => vec![name.to_string()],
                _ => Vec::new(),
            },
        }
    }

    /// Full path of a listed local identity file
    pub fn path(&self, name: &str) -> PathBuf {
        match self {
            LocalKeys::PemFiles(dir) => dir.join(name),
            LocalKeys::KeyFile(path) => path.clone(),
        }
    }
}

/// What a transition acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTarget {
    /// A glob, or comma-joined globs, matched against the active partitions
    Pattern(String),

    /// A previously computed status-to-ids mapping
    Matched(KeyMatches),
}

impl From<&str> for KeyTarget {
    fn from(pattern: &str) -> Self {
        KeyTarget::Pattern(pattern.to_string())
    }
}

impl From<String> for KeyTarget {
    fn from(pattern: String) -> Self {
        KeyTarget::Pattern(pattern)
    }
}

impl From<KeyMatches> for KeyTarget {
    fn from(matches: KeyMatches) -> Self {
        KeyTarget::Matched(matches)
    }
}

/// Extra source partitions drained by accept
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptOptions {
    pub include_rejected: bool,
    pub include_denied: bool,
}

/// Extra source partitions drained by reject
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectOptions {
    pub include_accepted: bool,
    pub include_denied: bool,
}

/// Delete behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Ask each minion to drop its live session
    pub revoke_auth: bool,

    /// Keep cached state of the matched accepted ids
    pub preserve_cache: bool,
}

/// Per-id record of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyChange {
    pub id: String,
    pub from: KeyStatus,
    pub outcome: KeyOutcome,
}

/// Everything a batch did, id by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub action: KeyAction,
    pub changes: Vec<KeyChange>,
    pub warnings: Vec<String>,
    pub cache: Option<ReconcileReport>,
    pub rotation_requested: bool,
}

impl BatchReport {
    fn new(action: KeyAction) -> Self {
        Self {
            action,
            changes: Vec::new(),
            warnings: Vec::new(),
            cache: None,
            rotation_requested: false,
        }
    }

    /// Ids whose mutation is durable
    pub fn done(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| c.outcome.is_done())
            .map(|c| c.id.as_str())
            .collect()
    }

    /// Changes that did not go through
    pub fn failures(&self) -> impl Iterator<Item = &KeyChange> {
        self.changes.iter().filter(|c| !c.outcome.is_done())
    }
}

/// Result of a transition: where the targeted keys live now, and the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub keys: KeyMatches,
    pub report: BatchReport,
}

/// The transition engine over one partition layout.
///
/// Batches are best effort: every id is moved or deleted on its own, a
/// failure is recorded in the report, and the rest of the batch carries on.
/// An event goes out only after the corresponding disk change succeeded.
pub struct KeyRing<S: KeyState> {
    store: KeyStore<S>,
    local: LocalKeys,
    bus: Arc<dyn EventBus>,
    reconciler: CacheReconciler,
    revoker: Option<Arc<dyn SessionRevoker>>,
    rotation: SessionKeyRotation,
    rotate_session_key: bool,
}

impl<S: KeyState> std::fmt::Debug for KeyRing<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("store", &self.store)
            .field("local", &self.local)
            .field("reconciler", &self.reconciler)
            .field("rotate_session_key", &self.rotate_session_key)
            .finish()
    }
}

impl<S: KeyState> KeyRing<S> {
    pub fn new(
        store: KeyStore<S>,
        local: LocalKeys,
        bus: Arc<dyn EventBus>,
        reconciler: CacheReconciler,
        rotation: SessionKeyRotation,
    ) -> Self {
        Self {
            store,
            local,
            bus,
            reconciler,
            revoker: None,
            rotation,
            rotate_session_key: true,
        }
    }

    pub fn with_revoker(mut self, revoker: Arc<dyn SessionRevoker>) -> Self {
        self.revoker = Some(revoker);
        self
    }

    pub fn with_rotate_session_key(mut self, rotate: bool) -> Self {
        self.rotate_session_key = rotate;
        self
    }

    pub fn store(&self) -> &KeyStore<S> {
        &self.store
    }

    pub fn local(&self) -> &LocalKeys {
        &self.local
    }

    // Listing

    /// Every managed partition with its ids, empty ones included
    pub fn list_keys(&self) -> KeyMatches {
        let listing: KeyMatches = self
            .store
            .list_all()
            .into_iter()
            .map(|(state, ids)| (state.status(), ids))
            .collect();
        record_partition_sizes(&listing);
        listing
    }

    /// Local identity files
    pub fn local_keys(&self) -> KeyMatches {
        KeyMatches::from([(KeyStatus::Local, self.local.list())])
    }

    /// Managed keys merged with local identity files
    pub fn all_keys(&self) -> KeyMatches {
        let mut keys = self.list_keys();
        keys.extend(self.local_keys());
        keys
    }

    /// Keys under one status selector ("acc", "pre", "un", "rej", "den", "all").
    /// Unknown selectors, and statuses this layout lacks, give an empty map.
    pub fn list_status(&self, selector: &str) -> KeyMatches {
        let Some(filter) = StatusFilter::parse(selector) else {
            return KeyMatches::new();
        };
        let Some(status) = filter.status() else {
            return self.all_keys();
        };
        match S::from_status(status) {
            Some(state) => KeyMatches::from([(status, self.store.list(state))]),
            None => KeyMatches::new(),
        }
    }

    /// Ids known to the store, in any partition
    pub fn known_ids(&self) -> BTreeSet<String> {
        self.store.list_all().into_values().flatten().collect()
    }

    // Matching

    pub fn name_match(&self, pattern: &str, scope: MatchScope) -> KeyMatches {
        let listing = match scope {
            MatchScope::Active => self.list_keys(),
            MatchScope::All => self.all_keys(),
        };
        match_listing(listing, pattern)
    }

    pub fn dict_match(&self, explicit: &KeyMatches) -> KeyMatches {
        dict_match(&self.store, explicit)
    }

    fn resolve(&self, target: &KeyTarget) -> KeyMatches {
        match target {
            KeyTarget::Pattern(pattern) => self.name_match(pattern, MatchScope::Active),
            KeyTarget::Matched(matches) => matches.clone(),
        }
    }

    fn after(&self, target: &KeyTarget, matches: &KeyMatches) -> KeyMatches {
        match target {
            KeyTarget::Pattern(pattern) => self.name_match(pattern, MatchScope::Active),
            KeyTarget::Matched(_) => self.dict_match(matches),
        }
    }

    // Transitions

    /// Move matched keys into the accepted partition. Pending keys always
    /// move; rejected and denied ones only when asked.
    pub fn accept(&self, target: impl Into<KeyTarget>, options: AcceptOptions) -> Transition {
        let target = target.into();
        let matches = self.resolve(&target);

        let mut sources = vec![S::PENDING];
        if options.include_rejected {
            sources.push(S::REJECTED);
        }
        if options.include_denied {
            sources.extend(S::DENIED);
        }

        let report = self.move_batch(KeyAction::Accept, &matches, &sources, S::ACCEPTED);
        Transition {
            keys: self.after(&target, &matches),
            report,
        }
    }

    /// Accept every pending key
    pub fn accept_all(&self) -> Transition {
        let pending = self.list_status("pre");
        let report = self.move_batch(KeyAction::Accept, &pending, &[S::PENDING], S::ACCEPTED);
        Transition {
            keys: self.list_keys(),
            report,
        }
    }

    /// Move matched keys into the rejected partition. Pending keys always
    /// move; accepted and denied ones only when asked.
    pub fn reject(&self, target: impl Into<KeyTarget>, options: RejectOptions) -> Transition {
        let target = target.into();
        let matches = self.resolve(&target);

        let mut sources = vec![S::PENDING];
        if options.include_accepted {
            sources.push(S::ACCEPTED);
        }
        if options.include_denied {
            sources.extend(S::DENIED);
        }

        let mut report = self.move_batch(KeyAction::Reject, &matches, &sources, S::REJECTED);
        self.reduce_trust(&mut report, &[], true);
        Transition {
            keys: self.after(&target, &matches),
            report,
        }
    }

    /// Reject every pending key
    pub fn reject_all(&self) -> Transition {
        let pending = self.list_status("pre");
        let mut report = self.move_batch(KeyAction::Reject, &pending, &[S::PENDING], S::REJECTED);
        self.reduce_trust(&mut report, &[], true);
        Transition {
            keys: self.list_keys(),
            report,
        }
    }

    /// Delete matched keys from whichever partition they were matched in
    pub fn delete(&self, target: impl Into<KeyTarget>, options: DeleteOptions) -> Transition {
        let target = target.into();
        let matches = self.resolve(&target);

        let mut report = BatchReport::new(KeyAction::Delete);
        let started = Instant::now();
        for (status, ids) in &matches {
            let Some(state) = S::from_status(*status) else {
                debug!(status = %status, "Skipping status without a partition");
                continue;
            };
            for id in sorted(ids) {
                if options.revoke_auth {
                    self.revoke(&id, &mut report);
                }
                let outcome = self.store.delete(&id, state);
                self.record(&mut report, id, *status, outcome);
            }
        }
        record_batch_duration(KeyAction::Delete.as_str(), started.elapsed());

        let preserve = if options.preserve_cache {
            matches.get(&KeyStatus::Accepted).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };
        self.reduce_trust(&mut report, &preserve, true);
        Transition {
            keys: self.after(&target, &matches),
            report,
        }
    }

    /// Delete every managed key
    pub fn delete_all(&self) -> Transition {
        let mut report = BatchReport::new(KeyAction::Delete);
        for (state, ids) in self.store.list_all() {
            for id in ids {
                let outcome = self.store.delete(&id, state);
                self.record(&mut report, id, state.status(), outcome);
            }
        }
        self.reduce_trust(&mut report, &[], true);
        Transition {
            keys: self.list_keys(),
            report,
        }
    }

    /// Delete every denied key. Denied keys never held a session, so the
    /// session key is left alone.
    pub fn delete_denied(&self) -> Transition {
        let mut report = BatchReport::new(KeyAction::Delete);
        if let Some(denied) = S::DENIED {
            for id in self.store.list(denied) {
                let outcome = self.store.delete(&id, denied);
                self.record(&mut report, id, denied.status(), outcome);
            }
        }
        self.reduce_trust(&mut report, &[], false);
        Transition {
            keys: self.list_keys(),
            report,
        }
    }

    /// Purge cached state for ids the store no longer knows
    pub fn reconcile(&self, preserve: &[String]) -> ReconcileReport {
        self.reconciler.reconcile(&self.known_ids(), preserve)
    }

    fn move_batch(&self, action: KeyAction, matches: &KeyMatches, sources: &[S], to: S) -> BatchReport {
        let mut report = BatchReport::new(action);
        let started = Instant::now();
        for from in sources {
            let Some(ids) = matches.get(&from.status()) else {
                continue;
            };
            for id in sorted(ids) {
                let outcome = self.store.move_key(&id, *from, to);
                self.record(&mut report, id, from.status(), outcome);
            }
        }
        record_batch_duration(action.as_str(), started.elapsed());

        let done = report.done().len();
        if done > 0 {
            info!(action = action.as_str(), keys = done, "Key transition complete");
        }
        report
    }

    fn record(&self, report: &mut BatchReport, id: String, from: KeyStatus, outcome: KeyOutcome) {
        record_key_transition(report.action.as_str(), outcome.label());
        match &outcome {
            KeyOutcome::Done => self.publish(report.action, &id),
            KeyOutcome::NotFound => debug!(id = %id, from = %from, "Key already gone"),
            other => warn!(
                id = %id,
                from = %from,
                action = report.action.as_str(),
                outcome = ?other,
                "Key transition failed"
            ),
        }
        report.changes.push(KeyChange { id, from, outcome });
    }

    fn publish(&self, action: KeyAction, id: &str) {
        match self.bus.publish(&TransitionEvent::new(action, id), KEY_EVENT_TAG) {
            Ok(()) => {}
            Err(BusError::NoSubscribers(_)) => debug!(id, "No listeners for key event"),
            Err(e) => warn!(id, error = %e, "Failed to publish key event"),
        }
    }

    fn revoke(&self, id: &str, report: &mut BatchReport) {
        if !self.rotate_session_key {
            let msg = format!(
                "Immediate auth revocation requested for {id} but session key rotation is disabled; \
                 the minion stays connected until the session key is rotated"
            );
            warn!("{msg}");
            report.warnings.push(msg);
            record_revocation(false);
            return;
        }

        let result = match &self.revoker {
            Some(revoker) => revoker.revoke(id).map_err(|e| e.to_string()),
            None => Err("no revocation channel configured".to_string()),
        };
        record_revocation(result.is_ok());
        if let Err(e) = result {
            let msg = format!(
                "Cannot contact the controller ({e}); the connection for {id} stays up until \
                 the session key is rotated or its auth is revoked"
            );
            warn!("{msg}");
            report.warnings.push(msg);
        }
    }

    /// Reconcile the cache and, when allowed, request a session key rotation
    fn reduce_trust(&self, report: &mut BatchReport, preserve: &[String], rotate: bool) {
        report.cache = Some(self.reconcile(preserve));

        if rotate && self.rotate_session_key {
            match self.rotation.request() {
                Ok(requested) => report.rotation_requested = requested,
                Err(e) => {
                    let msg = format!("Failed to request session key rotation: {e}");
                    warn!("{msg}");
                    report.warnings.push(msg);
                }
            }
        }
    }
}

fn sorted(ids: &[String]) -> Vec<String> {
    let mut ids = ids.to_vec();
    sort_ids(&mut ids);
    ids.dedup();
    ids
}
