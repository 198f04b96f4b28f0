//! # External Collaborators
//!
//! The engine consumes three services it does not own: a party directory
//! that resolves landlord and tenant references, a payment gateway that moves
//! the money behind each COMPLETED transaction, and a notifier.
//!
//! Payment and notification calls happen after the state transition has
//! committed. A failure is logged at `warn` and never rolls the transition
//! back.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rentvault_core::{EscrowId, PartyId};

use crate::transaction::Transaction;

/// Failure reported by a collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The service could not be reached.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        /// Which collaborator.
        service: &'static str,
        /// Transport-level detail.
        reason: String,
    },

    /// The service refused the request.
    #[error("{service} rejected the request: {reason}")]
    Rejected {
        /// Which collaborator.
        service: &'static str,
        /// The refusal reason.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Both parties signed; the escrow awaits funding.
    ContractAgreed,
    /// A scheduled release is approaching.
    ReleaseUpcoming,
    /// A release was scheduled with an objection window.
    ReleaseScheduled,
    /// Funds left the escrow.
    FundsReleased,
    /// Move-out recorded and the claim window opened.
    ReleaseRequested,
    /// A claim awaits the recipient's response.
    ClaimRaised,
    /// The counterparty responded to a claim.
    ClaimResponded,
    /// A dispute was opened.
    DisputeOpened,
    /// A manual release awaits the recipient's approval.
    ApprovalRequested,
    /// An approval request was answered or expired.
    ApprovalResolved,
}

/// A message for one or more parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The escrow the message concerns.
    pub escrow_id: EscrowId,
    /// Who should receive it.
    pub recipients: Vec<PartyId>,
    /// Message category.
    pub kind: NotificationKind,
    /// Human-readable body.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Resolves party references. Identity itself is owned elsewhere.
pub trait PartyDirectory: Send + Sync + std::fmt::Debug {
    /// Whether `party` is a known landlord or tenant.
    fn is_known(&self, party: &PartyId) -> bool;
}

/// Executes the money movement behind a COMPLETED transaction.
pub trait PaymentGateway: Send + Sync + std::fmt::Debug {
    /// Move the funds for `transaction`.
    fn execute(&self, escrow_id: &EscrowId, transaction: &Transaction)
        -> Result<(), CollaboratorError>;
}

/// Fire-and-forget message delivery.
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Deliver `notification`.
    fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// A directory that accepts every party reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenDirectory;

impl PartyDirectory for OpenDirectory {
    fn is_known(&self, _party: &PartyId) -> bool {
        true
    }
}

/// A directory backed by a fixed set of parties.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    parties: HashSet<PartyId>,
}

impl StaticDirectory {
    /// Build a directory from the given parties.
    pub fn new(parties: impl IntoIterator<Item = PartyId>) -> Self {
        Self {
            parties: parties.into_iter().collect(),
        }
    }
}

impl PartyDirectory for StaticDirectory {
    fn is_known(&self, party: &PartyId) -> bool {
        self.parties.contains(party)
    }
}

/// A gateway that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingGateway;

impl PaymentGateway for LoggingGateway {
    fn execute(
        &self,
        escrow_id: &EscrowId,
        transaction: &Transaction,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(
            escrow_id = %escrow_id,
            transaction_id = %transaction.id,
            kind = %transaction.transaction_type,
            amount = transaction.amount.minor_units(),
            "payment executed"
        );
        Ok(())
    }
}

/// A notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        tracing::debug!(
            escrow_id = %notification.escrow_id,
            kind = ?notification.kind,
            recipients = notification.recipients.len(),
            "notification delivered"
        );
        Ok(())
    }
}

/// Records every call; optionally fails them all. For tests and the CLI.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    executed: Mutex<Vec<Transaction>>,
    fail: bool,
}

impl RecordingGateway {
    /// A gateway that accepts every payment.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway that records then rejects every payment.
    pub fn failing() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Payments seen so far.
    pub fn executed(&self) -> Vec<Transaction> {
        self.executed.lock().clone()
    }
}

impl PaymentGateway for RecordingGateway {
    fn execute(
        &self,
        _escrow_id: &EscrowId,
        transaction: &Transaction,
    ) -> Result<(), CollaboratorError> {
        self.executed.lock().push(transaction.clone());
        if self.fail {
            return Err(CollaboratorError::Unavailable {
                service: "payment gateway",
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Records every notification; optionally fails them all.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    /// A notifier that accepts every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that records then rejects every message.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Notifications seen so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Notifications of one kind.
    pub fn sent_of(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        self.sent.lock().push(notification.clone());
        if self.fail {
            return Err(CollaboratorError::Rejected {
                service: "notifier",
                reason: "quota exceeded".to_string(),
            });
        }
        Ok(())
    }
}

/// The collaborator set injected into the engine.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Party resolution.
    pub directory: Arc<dyn PartyDirectory>,
    /// Money movement.
    pub payments: Arc<dyn PaymentGateway>,
    /// Message delivery.
    pub notifier: Arc<dyn Notifier>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            directory: Arc::new(OpenDirectory),
            payments: Arc::new(LoggingGateway),
            notifier: Arc::new(LoggingNotifier),
        }
    }
}

impl Collaborators {
    /// Builder: replace the party directory.
    pub fn with_directory(mut self, directory: Arc<dyn PartyDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Builder: replace the payment gateway.
    pub fn with_payments(mut self, payments: Arc<dyn PaymentGateway>) -> Self {
        self.payments = payments;
        self
    }

    /// Builder: replace the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party(s: &str) -> PartyId {
        PartyId::new(s).unwrap()
    }

    #[test]
    fn static_directory_membership() {
        let dir = StaticDirectory::new([party("landlord-1"), party("tenant-1")]);
        assert!(dir.is_known(&party("tenant-1")));
        assert!(!dir.is_known(&party("stranger")));
        assert!(OpenDirectory.is_known(&party("stranger")));
    }

    #[test]
    fn failing_notifier_still_records() {
        let notifier = RecordingNotifier::failing();
        let n = Notification {
            escrow_id: EscrowId::new(),
            recipients: vec![party("tenant-1")],
            kind: NotificationKind::ClaimRaised,
            message: "claim raised".to_string(),
        };
        let err = notifier.notify(&n).unwrap_err();
        assert!(format!("{err}").contains("notifier"));
        assert_eq!(notifier.sent_of(NotificationKind::ClaimRaised).len(), 1);
        assert!(notifier.sent_of(NotificationKind::DisputeOpened).is_empty());
    }
}
