//! # Escrow Status and Transition Table
//!
//! The lifecycle is a validated enum rather than a typestate: escrows are
//! loaded from a store with their status only known at runtime, and several
//! operations (rule firing, approvals) are legal across a set of states.
//!
//! ```text
//! DRAFT ─approve×2─▶ AGREED ─fund─▶ ACTIVE ─request_release─▶ RELEASE_PENDING
//!                                                                  │
//!                     ┌──────────────── settle ───────────┬────────┴── DISPUTE claim /
//!                     ▼                                   ▼             rounds exhausted
//!                 RELEASED                      PARTIALLY_RELEASED          │
//!                     │                                   │                 ▼
//!                     └──────────── close ────────┬───────┘             DISPUTED ─escalate─▶ ESCALATED
//!                                                 ▼                         │                  │
//!                                               CLOSED ◀──── resolve_dispute ┴──────────────────┘
//! ```
//!
//! Funding and activation are atomic: there is no observable FUNDED status;
//! `funded_at` and `activated_at` are stamped together.

use serde::{Deserialize, Serialize};

/// The lifecycle status of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    /// Terms are being negotiated; both parties may amend and must sign.
    Draft,
    /// Both parties signed the same contract version.
    Agreed,
    /// Funded and held for the lease term.
    Active,
    /// Move-out requested; the claim window is open.
    ReleasePending,
    /// Deposit released to the tenant in full.
    Released,
    /// Deposit released net of accepted deductions.
    PartiallyReleased,
    /// A dispute is open; automatic release is suspended.
    Disputed,
    /// A neutral assessment was requested.
    Escalated,
    /// Lifecycle complete. Terminal.
    Closed,
}

impl EscrowStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [EscrowStatus; 9] = [
        Self::Draft,
        Self::Agreed,
        Self::Active,
        Self::ReleasePending,
        Self::Released,
        Self::PartiallyReleased,
        Self::Disputed,
        Self::Escalated,
        Self::Closed,
    ];

    /// Statuses in which deposit funds are held by the escrow.
    pub const FUNDED: [EscrowStatus; 4] = [
        Self::Active,
        Self::ReleasePending,
        Self::Released,
        Self::PartiallyReleased,
    ];

    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Agreed => "AGREED",
            Self::Active => "ACTIVE",
            Self::ReleasePending => "RELEASE_PENDING",
            Self::Released => "RELEASED",
            Self::PartiallyReleased => "PARTIALLY_RELEASED",
            Self::Disputed => "DISPUTED",
            Self::Escalated => "ESCALATED",
            Self::Closed => "CLOSED",
        }
    }

    /// Parse a canonical status name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Valid target statuses from this status.
    pub fn valid_transitions(&self) -> &'static [EscrowStatus] {
        match self {
            Self::Draft => &[Self::Agreed],
            Self::Agreed => &[Self::Active],
            Self::Active => &[Self::ReleasePending],
            Self::ReleasePending => &[Self::Released, Self::PartiallyReleased, Self::Disputed],
            Self::Released | Self::PartiallyReleased => &[Self::Closed],
            Self::Disputed => &[Self::Escalated, Self::Closed],
            Self::Escalated => &[Self::Closed],
            Self::Closed => &[],
        }
    }

    /// Whether `to` is reachable in one step.
    pub fn can_transition_to(&self, to: EscrowStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every externally invocable operation on an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Sign the current contract version.
    Approve,
    /// Replace draft terms, starting a new contract version.
    AmendTerms,
    /// Deposit the total amount and activate.
    Fund,
    /// Record move-out and open the claim window.
    RequestRelease,
    /// Raise a deduction, refund or dispute claim.
    RaiseClaim,
    /// Accept, reject or counter a claim.
    RespondToClaim,
    /// Net accepted claims against the deposit and release.
    Settle,
    /// Request neutral assessment of a dispute.
    Escalate,
    /// Apply an externally decided dispute outcome.
    ResolveDispute,
    /// Close a released escrow.
    Close,
    /// Delete an unfunded draft.
    DeleteDraft,
    /// Modify a scheduled release rule.
    UpdateReleaseRule,
    /// Object to a release inside its objection window.
    ObjectToRelease,
    /// Request counterparty approval for a manual release.
    TriggerManualRelease,
    /// Approve or reject a pending approval request.
    RespondToApproval,
    /// Release a scheduled rule's amount. Driven by the sweeper only.
    ExecuteRelease,
}

impl Operation {
    /// Every operation, including the sweeper-driven [`Operation::ExecuteRelease`].
    pub const ALL: [Operation; 16] = [
        Self::Approve,
        Self::AmendTerms,
        Self::Fund,
        Self::RequestRelease,
        Self::RaiseClaim,
        Self::RespondToClaim,
        Self::Settle,
        Self::Escalate,
        Self::ResolveDispute,
        Self::Close,
        Self::DeleteDraft,
        Self::UpdateReleaseRule,
        Self::ObjectToRelease,
        Self::TriggerManualRelease,
        Self::RespondToApproval,
        Self::ExecuteRelease,
    ];

    /// The operation name used in errors and audit entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::AmendTerms => "amend_terms",
            Self::Fund => "fund",
            Self::RequestRelease => "request_release",
            Self::RaiseClaim => "raise_claim",
            Self::RespondToClaim => "respond_to_claim",
            Self::Settle => "settle",
            Self::Escalate => "escalate",
            Self::ResolveDispute => "resolve_dispute",
            Self::Close => "close",
            Self::DeleteDraft => "delete_draft",
            Self::UpdateReleaseRule => "update_release_rule",
            Self::ObjectToRelease => "object_to_release",
            Self::TriggerManualRelease => "trigger_manual_release",
            Self::RespondToApproval => "respond_to_approval",
            Self::ExecuteRelease => "execute_release",
        }
    }

    /// The statuses in which this operation is permitted.
    pub fn permitted_in(&self) -> &'static [EscrowStatus] {
        use EscrowStatus::*;
        match self {
            Self::Approve | Self::AmendTerms | Self::DeleteDraft => &[Draft],
            Self::Fund => &[Agreed],
            Self::RequestRelease | Self::UpdateReleaseRule => &[Active],
            Self::RaiseClaim | Self::RespondToClaim | Self::Settle => &[ReleasePending],
            Self::Escalate => &[Disputed],
            Self::ResolveDispute => &[Disputed, Escalated],
            Self::Close => &[Released, PartiallyReleased],
            Self::ObjectToRelease
            | Self::TriggerManualRelease
            | Self::RespondToApproval
            | Self::ExecuteRelease => &EscrowStatus::FUNDED,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
