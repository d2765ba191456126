// policy/evaluator.rs - Classification of Presented Keys

use serde::Serialize;

use super::AutoPolicy;
use crate::keys::state::KeyState;

/// What the store already holds for a presented id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presented<S> {
    /// Partition the id currently lives in
    pub state: S,

    /// Whether the stored payload equals the presented one
    pub same_payload: bool,
}

/// Why a verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    OpenMode,
    AlreadyRejected,
    AlreadyAccepted,
    Substituted,
    AutoRejected,
    AutoSigned,
    AutoAccept,
    AwaitingDecision,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::OpenMode => "open_mode",
            Reason::AlreadyRejected => "already_rejected",
            Reason::AlreadyAccepted => "already_accepted",
            Reason::Substituted => "substituted",
            Reason::AutoRejected => "auto_rejected",
            Reason::AutoSigned => "auto_signed",
            Reason::AutoAccept => "auto_accept",
            Reason::AwaitingDecision => "awaiting_decision",
        }
    }
}

/// What the store has to do to reflect a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement<S> {
    /// Leave the store untouched
    Keep,

    /// Write the presented payload into the verdict's partition, removing the
    /// id from every other partition first
    Write,

    /// Move the stored record from `from` into the verdict's partition
    Move { from: S },
}

/// Outcome of classifying one presented key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict<S> {
    pub state: S,
    pub placement: Placement<S>,
    pub reason: Reason,
}

impl<S> Verdict<S> {
    fn keep(state: S, reason: Reason) -> Self {
        Self {
            state,
            placement: Placement::Keep,
            reason,
        }
    }

    fn write(state: S, reason: Reason) -> Self {
        Self {
            state,
            placement: Placement::Write,
            reason,
        }
    }
}

/// Decide the trust state of a key presented by `id`.
///
/// Rules apply strictly in order and the first that fires wins. Policy
/// predicates are only consulted when a rule needs them, and `auto_reject`
/// is always asked before `auto_sign`, so a one-shot sign grant is not spent
/// on an id that ends up rejected. A payload that differs from the stored one
/// is never accepted.
pub fn evaluate<S: KeyState>(
    id: &str,
    current: Option<Presented<S>>,
    open_mode: bool,
    auto_accept: bool,
    policy: &dyn AutoPolicy,
) -> Verdict<S> {
    if open_mode {
        return Verdict::write(S::ACCEPTED, Reason::OpenMode);
    }

    let Some(current) = current else {
        return if auto_accept {
            Verdict::write(S::ACCEPTED, Reason::AutoAccept)
        } else if policy.auto_reject(id) {
            Verdict::write(S::REJECTED, Reason::AutoRejected)
        } else if policy.auto_sign(id) {
            Verdict::write(S::ACCEPTED, Reason::AutoSigned)
        } else {
            Verdict::write(S::PENDING, Reason::AwaitingDecision)
        };
    };

    if current.state == S::REJECTED || Some(current.state) == S::DENIED {
        return Verdict::keep(current.state, Reason::AlreadyRejected);
    }

    if current.state == S::ACCEPTED {
        return if current.same_payload {
            Verdict::keep(S::ACCEPTED, Reason::AlreadyAccepted)
        } else {
            Verdict::keep(S::REJECTED, Reason::Substituted)
        };
    }

    // Pending
    if !current.same_payload {
        return Verdict::keep(S::REJECTED, Reason::Substituted);
    }
    if policy.auto_reject(id) {
        Verdict {
            state: S::REJECTED,
            placement: Placement::Move { from: current.state },
            reason: Reason::AutoRejected,
        }
    } else if policy.auto_sign(id) {
        Verdict {
            state: S::ACCEPTED,
            placement: Placement::Move { from: current.state },
            reason: Reason::AutoSigned,
        }
    } else {
        Verdict::keep(current.state, Reason::AwaitingDecision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::state::RaetState;
    use crate::policy::{GlobPolicy, ManualPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pending(same_payload: bool) -> Option<Presented<RaetState>> {
        Some(Presented {
            state: RaetState::Pending,
            same_payload,
        })
    }

    #[test]
    fn test_open_mode_wins() {
        let current = Some(Presented {
            state: RaetState::Rejected,
            same_payload: false,
        });
        let verdict = evaluate("m1", current, true, false, &ManualPolicy);
        assert_eq!(verdict.state, RaetState::Accepted);
        assert_eq!(verdict.placement, Placement::Write);
    }

    #[test]
    fn test_rejected_stays_rejected() {
        let policy = GlobPolicy::new().sign("*");
        let current = Some(Presented {
            state: RaetState::Rejected,
            same_payload: true,
        });
        let verdict = evaluate("m1", current, false, true, &policy);
        assert_eq!(verdict.state, RaetState::Rejected);
        assert_eq!(verdict.placement, Placement::Keep);
    }

    #[test]
    fn test_accepted_substitution_is_rejected() {
        let current = Some(Presented {
            state: RaetState::Accepted,
            same_payload: false,
        });
        let verdict = evaluate("m1", current, false, false, &ManualPolicy);
        assert_eq!(verdict.state, RaetState::Rejected);
        assert_eq!(verdict.reason, Reason::Substituted);
        assert_eq!(verdict.placement, Placement::Keep);
    }

    #[test]
    fn test_pending_substitution_ignores_auto_sign() {
        let policy = GlobPolicy::new().sign("*");
        let verdict = evaluate("m1", pending(false), false, false, &policy);
        assert_eq!(verdict.state, RaetState::Rejected);
        assert_eq!(verdict.placement, Placement::Keep);
    }

    #[test]
    fn test_pending_reject_beats_sign() {
        let policy = GlobPolicy::new().sign("m*").reject("m1");
        let verdict = evaluate("m1", pending(true), false, false, &policy);
        assert_eq!(verdict.state, RaetState::Rejected);
        assert_eq!(
            verdict.placement,
            Placement::Move {
                from: RaetState::Pending
            }
        );

        let verdict = evaluate("m2", pending(true), false, false, &policy);
        assert_eq!(verdict.state, RaetState::Accepted);
    }

    #[test]
    fn test_pending_without_policy_stays() {
        let verdict = evaluate("m1", pending(true), false, false, &ManualPolicy);
        assert_eq!(verdict.state, RaetState::Pending);
        assert_eq!(verdict.placement, Placement::Keep);
    }

    #[test]
    fn test_new_id_order() {
        let both = GlobPolicy::new().sign("m1").reject("m1");
        let verdict = evaluate::<RaetState>("m1", None, false, false, &both);
        assert_eq!(verdict.state, RaetState::Rejected);
        assert_eq!(verdict.placement, Placement::Write);

        let verdict = evaluate::<RaetState>("m1", None, false, true, &both);
        assert_eq!(verdict.reason, Reason::AutoAccept);

        let verdict = evaluate::<RaetState>("m9", None, false, false, &both);
        assert_eq!(verdict.state, RaetState::Pending);
    }

    struct CountingPolicy {
        sign_calls: AtomicUsize,
    }

    impl AutoPolicy for CountingPolicy {
        fn auto_reject(&self, _id: &str) -> bool {
            true
        }

        fn auto_sign(&self, _id: &str) -> bool {
            self.sign_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_sign_not_consulted_after_reject() {
        let policy = CountingPolicy {
            sign_calls: AtomicUsize::new(0),
        };
        evaluate::<RaetState>("m1", None, false, false, &policy);
        evaluate("m1", pending(true), false, false, &policy);
        assert_eq!(policy.sign_calls.load(Ordering::SeqCst), 0);
    }
}
