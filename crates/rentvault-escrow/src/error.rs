//! # Escrow Error Types
//!
//! The typed result of every orchestrator operation. Callers (the web layer,
//! the CLI) match on the variant to choose a response; no variant is a bare
//! string. State machine rejections name the operation, the current status
//! and the statuses that would have been accepted.

use chrono::{DateTime, Utc};
use thiserror::Error;

use rentvault_core::{ClaimId, EscrowId, PartyId, ValidationError};

use crate::status::{EscrowStatus, Operation};

/// Which limit a [`EscrowError::LimitExceeded`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// Cumulative claim amounts against the deposit.
    ClaimAmount,
    /// Outflows against completed deposits.
    HeldBalance,
    /// A dispute award against the deposit.
    ResolutionAmount,
    /// A release rule amount against its component.
    ComponentAmount,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ClaimAmount => "cumulative claim amount",
            Self::HeldBalance => "held balance",
            Self::ResolutionAmount => "dispute resolution amount",
            Self::ComponentAmount => "component amount",
        })
    }
}

/// Errors returned by escrow operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EscrowError {
    /// The operation is not permitted in the escrow's current status.
    #[error("cannot {operation} {escrow_id} in status {current}; requires {}", format_states(.required))]
    InvalidTransition {
        /// The escrow.
        escrow_id: EscrowId,
        /// The attempted operation.
        operation: Operation,
        /// The status at the time of the attempt.
        current: EscrowStatus,
        /// The statuses in which the operation is permitted.
        required: Vec<EscrowStatus>,
    },

    /// Right state, wrong actor (or, for `fund`, wrong state).
    #[error("{actor} may not {operation} {escrow_id}: {reason}")]
    NotEligible {
        /// The escrow.
        escrow_id: EscrowId,
        /// The attempted operation.
        operation: Operation,
        /// The rejected actor.
        actor: String,
        /// Why the actor was rejected.
        reason: String,
    },

    /// The operation conflicts with recorded state.
    #[error("conflict on {escrow_id}: {reason}")]
    Conflict {
        /// The escrow.
        escrow_id: EscrowId,
        /// What conflicted.
        reason: String,
    },

    /// A claimant tried to respond to their own claim.
    #[error("{party} cannot respond to their own {claim_id}")]
    SelfResponse {
        /// The claim.
        claim_id: ClaimId,
        /// The claimant.
        party: PartyId,
    },

    /// An amount bound would be exceeded.
    #[error("{limit} exceeded on {escrow_id}: requested {requested}, available {available}")]
    LimitExceeded {
        /// The escrow.
        escrow_id: EscrowId,
        /// The bound that applies.
        limit: LimitKind,
        /// The requested amount in minor units.
        requested: u64,
        /// The remaining headroom in minor units.
        available: u64,
    },

    /// Optimistic concurrency retries were exhausted.
    #[error("{escrow_id} was modified concurrently; gave up after {attempts} attempts")]
    ConcurrentModification {
        /// The escrow.
        escrow_id: EscrowId,
        /// Attempts made.
        attempts: u32,
    },

    /// A referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind ("escrow", "claim", ...).
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A time window for the operation has elapsed.
    #[error("{window} for {escrow_id} closed at {closed_at}")]
    WindowClosed {
        /// The escrow.
        escrow_id: EscrowId,
        /// Which window ("claim window", "objection window", ...).
        window: &'static str,
        /// When it closed.
        closed_at: DateTime<Utc>,
    },

    /// Input failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A content digest could not be computed.
    #[error("digest computation failed: {0}")]
    Digest(String),

    /// The backing store failed for a reason other than a version race.
    #[error("store error: {0}")]
    Store(String),
}

impl EscrowError {
    /// Shorthand for a missing record.
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for a state conflict.
    pub fn conflict(escrow_id: EscrowId, reason: impl Into<String>) -> Self {
        Self::Conflict {
            escrow_id,
            reason: reason.into(),
        }
    }

    /// Whether this error rejects the operation because of the escrow status.
    pub fn is_status_rejection(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

fn format_states(states: &[EscrowStatus]) -> String {
    states
        .iter()
        .map(EscrowStatus::as_str)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_current_and_required() {
        let err = EscrowError::InvalidTransition {
            escrow_id: EscrowId::new(),
            operation: Operation::Escalate,
            current: EscrowStatus::Active,
            required: vec![EscrowStatus::Disputed],
        };
        let msg = format!("{err}");
        assert!(msg.contains("escalate"));
        assert!(msg.contains("ACTIVE"));
        assert!(msg.contains("DISPUTED"));
        assert!(err.is_status_rejection());
    }

    #[test]
    fn required_states_are_joined() {
        let err = EscrowError::InvalidTransition {
            escrow_id: EscrowId::new(),
            operation: Operation::ResolveDispute,
            current: EscrowStatus::Draft,
            required: vec![EscrowStatus::Disputed, EscrowStatus::Escalated],
        };
        assert!(format!("{err}").contains("DISPUTED | ESCALATED"));
    }

    #[test]
    fn limit_exceeded_display() {
        let err = EscrowError::LimitExceeded {
            escrow_id: EscrowId::new(),
            limit: LimitKind::ClaimAmount,
            requested: 12_000,
            available: 10_000,
        };
        let msg = format!("{err}");
        assert!(msg.contains("cumulative claim amount"));
        assert!(msg.contains("12000"));
        assert!(msg.contains("10000"));
        assert!(!err.is_status_rejection());
    }

    #[test]
    fn not_found_helper() {
        let id = ClaimId::new();
        let err = EscrowError::not_found("claim", id);
        assert_eq!(
            err,
            EscrowError::NotFound {
                kind: "claim",
                id: id.to_string()
            }
        );
    }

    #[test]
    fn validation_converts() {
        let err: EscrowError = ValidationError::EmptyPartyId.into();
        assert!(format!("{err}").contains("party id"));
    }
}
