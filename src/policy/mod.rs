// policy/mod.rs - Automatic Key Acceptance Policy
//
//! Auto-accept and auto-reject decisions for newly presented keys
//!
//! Provides:
//! - `AutoPolicy` predicates consulted by the classifier
//! - `AutoKeyPolicy`, driven by policy files and one-shot autosign markers
//! - `GlobPolicy`, an in-memory rule set
//! - `evaluate`, the pure classification of a presented key

pub mod autokey;
pub mod evaluator;

pub use autokey::AutoKeyPolicy;
pub use evaluator::{evaluate, Placement, Presented, Reason, Verdict};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::keys::matcher::KeyGlob;

/// Policy-related errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Refusing to use insecure policy file: {0}")]
    InsecurePermissions(PathBuf),
}

/// Externally owned allow/deny predicates. Consulted, never mutated.
pub trait AutoPolicy: Send + Sync {
    /// Should a key presented by `id` be refused outright
    fn auto_reject(&self, id: &str) -> bool;

    /// Should a key presented by `id` be accepted without an operator
    fn auto_sign(&self, id: &str) -> bool;
}

/// Policy that never fast-paths anything
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualPolicy;

impl AutoPolicy for ManualPolicy {
    fn auto_reject(&self, _id: &str) -> bool {
        false
    }

    fn auto_sign(&self, _id: &str) -> bool {
        false
    }
}

/// In-memory glob rules
#[derive(Debug, Clone, Default)]
pub struct GlobPolicy {
    sign: Vec<KeyGlob>,
    reject: Vec<KeyGlob>,
}

impl GlobPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Auto-sign ids matching `pattern`
    pub fn sign(mut self, pattern: &str) -> Self {
        self.sign.push(KeyGlob::single(pattern));
        self
    }

    /// Auto-reject ids matching `pattern`
    pub fn reject(mut self, pattern: &str) -> Self {
        self.reject.push(KeyGlob::single(pattern));
        self
    }
}

impl AutoPolicy for GlobPolicy {
    fn auto_reject(&self, id: &str) -> bool {
        self.reject.iter().any(|glob| glob.matches(id))
    }

    fn auto_sign(&self, id: &str) -> bool {
        self.sign.iter().any(|glob| glob.matches(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_policy() {
        let policy = GlobPolicy::new().sign("web*").reject("bad?");
        assert!(policy.auto_sign("web1"));
        assert!(!policy.auto_sign("db1"));
        assert!(policy.auto_reject("bad1"));
        assert!(!policy.auto_reject("bad10"));
    }

    #[test]
    fn test_manual_policy_never_decides() {
        assert!(!ManualPolicy.auto_sign("anything"));
        assert!(!ManualPolicy.auto_reject("anything"));
    }
}
