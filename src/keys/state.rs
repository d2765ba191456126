// keys/state.rs - Trust States and Partition Layouts

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

/// Backend-independent name for the group a key was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Trusted; the minion may exchange commands with the controller
    Accepted,

    /// Submitted and waiting for a decision
    Pending,

    /// Explicitly refused
    Rejected,

    /// Refused by the transport because a key for the id already exists
    Denied,

    /// Controller-held identity files, reported by full-scope lookups only
    Local,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Accepted => "accepted",
            KeyStatus::Pending => "pending",
            KeyStatus::Rejected => "rejected",
            KeyStatus::Denied => "denied",
            KeyStatus::Local => "local",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key ids grouped by status
pub type KeyMatches = BTreeMap<KeyStatus, Vec<String>>;

/// A partition layout: the closed set of trust states one backend stores on disk.
///
/// Each state maps to exactly one directory under the pki root. Backends that
/// have no `Denied` partition say so with `DENIED = None`, so callers never need
/// to ask at runtime whether a state applies.
pub trait KeyState: Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every partition, in listing order
    const ALL: &'static [Self];

    const ACCEPTED: Self;
    const PENDING: Self;
    const REJECTED: Self;
    const DENIED: Option<Self>;

    /// Directory name of this partition under the pki root
    fn dir_name(self) -> &'static str;

    /// Uniform status reported to callers
    fn status(self) -> KeyStatus;

    /// Map a uniform status back onto this layout
    fn from_status(status: KeyStatus) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.status() == status)
    }
}

/// Four-partition layout used by the zeromq and tcp transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZmqState {
    Accepted,
    Pending,
    Rejected,
    Denied,
}

impl KeyState for ZmqState {
    const ALL: &'static [Self] = &[
        ZmqState::Accepted,
        ZmqState::Pending,
        ZmqState::Rejected,
        ZmqState::Denied,
    ];

    const ACCEPTED: Self = ZmqState::Accepted;
    const PENDING: Self = ZmqState::Pending;
    const REJECTED: Self = ZmqState::Rejected;
    const DENIED: Option<Self> = Some(ZmqState::Denied);

    fn dir_name(self) -> &'static str {
        match self {
            ZmqState::Accepted => "minions",
            ZmqState::Pending => "minions_pre",
            ZmqState::Rejected => "minions_rejected",
            ZmqState::Denied => "minions_denied",
        }
    }

    fn status(self) -> KeyStatus {
        match self {
            ZmqState::Accepted => KeyStatus::Accepted,
            ZmqState::Pending => KeyStatus::Pending,
            ZmqState::Rejected => KeyStatus::Rejected,
            ZmqState::Denied => KeyStatus::Denied,
        }
    }
}

/// Three-partition layout used by the raet transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaetState {
    Accepted,
    Pending,
    Rejected,
}

impl KeyState for RaetState {
    const ALL: &'static [Self] = &[RaetState::Accepted, RaetState::Pending, RaetState::Rejected];

    const ACCEPTED: Self = RaetState::Accepted;
    const PENDING: Self = RaetState::Pending;
    const REJECTED: Self = RaetState::Rejected;
    const DENIED: Option<Self> = None;

    fn dir_name(self) -> &'static str {
        match self {
            RaetState::Accepted => "accepted",
            RaetState::Pending => "pending",
            RaetState::Rejected => "rejected",
        }
    }

    fn status(self) -> KeyStatus {
        match self {
            RaetState::Accepted => KeyStatus::Accepted,
            RaetState::Pending => KeyStatus::Pending,
            RaetState::Rejected => KeyStatus::Rejected,
        }
    }
}

/// Status selector accepted by `list_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Accepted,
    Pending,
    Rejected,
    Denied,
    All,
}

impl StatusFilter {
    /// Parse an operator-supplied selector by prefix ("acc", "pre"/"un", "rej", "den", "all")
    pub fn parse(selector: &str) -> Option<Self> {
        let selector = selector.trim().to_ascii_lowercase();
        if selector.starts_with("acc") {
            Some(StatusFilter::Accepted)
        } else if selector.starts_with("pre") || selector.starts_with("un") {
            Some(StatusFilter::Pending)
        } else if selector.starts_with("rej") {
            Some(StatusFilter::Rejected)
        } else if selector.starts_with("den") {
            Some(StatusFilter::Denied)
        } else if selector.starts_with("all") {
            Some(StatusFilter::All)
        } else {
            None
        }
    }

    /// The status this selector names, or `None` for `All`
    pub fn status(&self) -> Option<KeyStatus> {
        match self {
            StatusFilter::Accepted => Some(KeyStatus::Accepted),
            StatusFilter::Pending => Some(KeyStatus::Pending),
            StatusFilter::Rejected => Some(KeyStatus::Rejected),
            StatusFilter::Denied => Some(KeyStatus::Denied),
            StatusFilter::All => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raet_has_no_denied_partition() {
        assert_eq!(RaetState::DENIED, None);
        assert_eq!(RaetState::from_status(KeyStatus::Denied), None);
        assert_eq!(RaetState::from_status(KeyStatus::Pending), Some(RaetState::Pending));
    }

    #[test]
    fn test_zmq_dir_names() {
        let dirs: Vec<_> = ZmqState::ALL.iter().map(|s| s.dir_name()).collect();
        assert_eq!(
            dirs,
            vec!["minions", "minions_pre", "minions_rejected", "minions_denied"]
        );
        assert_eq!(ZmqState::from_status(KeyStatus::Local), None);
    }

    #[test]
    fn test_status_filter_prefixes() {
        assert_eq!(StatusFilter::parse("accepted"), Some(StatusFilter::Accepted));
        assert_eq!(StatusFilter::parse("unaccepted"), Some(StatusFilter::Pending));
        assert_eq!(StatusFilter::parse("pre"), Some(StatusFilter::Pending));
        assert_eq!(StatusFilter::parse("rej"), Some(StatusFilter::Rejected));
        assert_eq!(StatusFilter::parse("denied"), Some(StatusFilter::Denied));
        assert_eq!(StatusFilter::parse("all"), Some(StatusFilter::All));
        assert_eq!(StatusFilter::parse("bogus"), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&KeyStatus::Accepted).unwrap();
        assert_eq!(json, "\"accepted\"");
    }
}
