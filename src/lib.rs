// lib.rs - Minion Key Trust Management
//
// Partitioned storage of minion public keys, trust transitions between
// partitions, automatic classification, and cleanup of cached state for
// minions that are no longer trusted.

#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod events;
pub mod keys;
pub mod observability;
pub mod policy;
pub mod session;

// Re-export commonly used types
pub use cache::{CacheError, CacheReconciler, FileCache, MemoryCache, MinionCache, ReconcileReport};

pub use config::{ApplicationKind, ConfigError, HashType, KeyConfig, Transport};

pub use events::{BroadcastBus, EventBus, KeyAction, NullBus, TransitionEvent, KEY_EVENT_TAG};

pub use keys::{
    AcceptOptions, DeleteOptions, KeyDetails, KeyError, KeyManager, KeyManagerBuilder,
    KeyMatches, KeyOutcome, KeyStatus, MatchScope, RejectOptions, Transition,
};

pub use observability::{describe_metrics, init_tracing, TracingConfig, TracingFormat};

pub use policy::{AutoKeyPolicy, AutoPolicy, GlobPolicy, ManualPolicy, PolicyError};

pub use session::{ChannelRevoker, RevokeRequest, SessionKeyRotation, SessionRevoker};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{KeyConfig, Transport};
    pub use crate::events::{BroadcastBus, EventBus, TransitionEvent};
    pub use crate::keys::{
        AcceptOptions, DeleteOptions, KeyManager, KeyMatches, KeyStatus, MatchScope,
        RejectOptions,
    };
    pub use crate::policy::AutoPolicy;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
