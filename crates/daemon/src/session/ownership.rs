//! Attach authorization.
//!
//! Decides whether a client may attach to a session given the session's
//! status, its recorded owner and the requester's identity. The decision is a
//! pure function so it can be tested without any session machinery.

use super::lifecycle::SessionStatus;

/// How strictly ownership is enforced on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipPolicy {
    /// Any client may attach to any live session.
    #[default]
    Shared,
    /// A client presenting an identity different from the recorded owner is
    /// refused.
    Strict,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachDecision {
    /// Go ahead and attach.
    Attach,
    /// Refuse the attach.
    Deny,
    /// The session is closing or closed.
    AlreadyClosed {
        /// Whether the requester is the recorded owner.
        is_owner: bool,
    },
}

/// Returns whether `requester` is the recorded `owner`.
///
/// An absent identity on either side never matches.
pub fn is_owner(owner: Option<&str>, requester: Option<&str>) -> bool {
    matches!((owner, requester), (Some(o), Some(r)) if o == r)
}

/// Resolves an attach request.
pub fn resolve(
    status: SessionStatus,
    owner: Option<&str>,
    requester: Option<&str>,
    policy: OwnershipPolicy,
) -> AttachDecision {
    if status.is_terminal() {
        return AttachDecision::AlreadyClosed {
            is_owner: is_owner(owner, requester),
        };
    }

    match (policy, owner, requester) {
        (OwnershipPolicy::Strict, Some(owner), Some(requester)) if owner != requester => {
            AttachDecision::Deny
        }
        _ => AttachDecision::Attach,
    }
}
