#![deny(missing_docs)]

//! # rentvault-escrow: Deposit Escrow Lifecycle Engine
//!
//! Holds a rental deposit (plus first month, prepaid rent and utilities)
//! from contract signature to final payout.
//!
//! ## Components
//!
//! - **Store** ([`store`]): versioned persistence of the escrow aggregate;
//!   every write is a compare-and-swap on `version`.
//! - **Release rules** ([`release`]): one rule per held component, created
//!   at funding, fired by deadlines or released manually with approval.
//! - **Negotiator** ([`claim`], [`dispute`]): claims, counter-offers,
//!   settlement, disputes and their external resolution.
//! - **Deadlines** ([`deadline`], [`sweeper`]): scheduled actions, each
//!   fired exactly once by a two-phase claim-then-execute sweep.
//! - **Audit ledger** ([`audit`]): per-escrow SHA-256 hash chain of every
//!   committed action.
//! - **Orchestrator** ([`orchestrator`]): the only mutator, running every
//!   operation under optimistic concurrency and dispatching payments and
//!   notifications after commit.
//!
//! ## Lifecycle
//!
//! See [`status`] for the transition table. Domain methods on [`Escrow`]
//! are crate-private; callers go through [`EscrowEngine`].

pub mod audit;
mod changeset;
pub mod claim;
pub mod collaborators;
pub mod config;
pub mod deadline;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod orchestrator;
pub mod release;
pub mod status;
pub mod store;
pub mod sweeper;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use audit::{
    verify_chain, AuditDetails, AuditDraft, AuditError, AuditEvent, AuditLedger, AuditLogEntry,
    AUDIT_SCHEMA_VERSION,
};
pub use claim::{
    Claim, ClaimReply, ClaimRequest, ClaimResponse, ClaimStatus, ClaimType, ResponseAction,
    SettlementSummary,
};
pub use collaborators::{
    CollaboratorError, Collaborators, LoggingGateway, LoggingNotifier, Notification,
    NotificationKind, Notifier, OpenDirectory, PartyDirectory, PaymentGateway, RecordingGateway,
    RecordingNotifier, StaticDirectory,
};
pub use config::{ConfigError, EngineConfig, RetryPolicy};
pub use deadline::{
    AutoAction, Deadline, DeadlineKind, DeadlineOutcome, DeadlineStatus, DueDeadline,
    ProcessedDeadline, SweeperClaim,
};
pub use dispute::{Dispute, DisputeOrigin, DisputeResolution, DisputeStatus};
pub use error::{EscrowError, LimitKind};
pub use escrow::{
    Actor, ActorRole, ContractSnapshot, ContractTerms, Escrow, EscrowConfig, LeaseTerms,
    MonetaryBreakdown, NewEscrow, PartyRole, TermsAmendment, Timeline,
};
pub use orchestrator::EscrowEngine;
pub use release::{
    Component, ReleasePlan, ReleaseRule, ReleaseTrigger, RuleAmount, RuleStatus, RuleUpdate,
    TriggerType,
};
pub use status::{EscrowStatus, Operation};
pub use store::{EscrowStore, InMemoryEscrowStore, StoreError};
pub use sweeper::{SweepStats, Sweeper, SweeperError, SweeperHandle};
pub use transaction::{
    Approval, ApprovalStatus, Statement, Transaction, TransactionStatus, TransactionType,
};
