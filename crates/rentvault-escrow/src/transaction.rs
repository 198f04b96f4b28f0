//! # Ledger
//!
//! Money movements and counterparty approvals. Every outflow is checked
//! against the held balance when it is created and again when it completes,
//! so completed RELEASE, REFUND and DEDUCTION transactions can never exceed
//! completed deposits. PENDING outflows reserve their amount.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentvault_core::{Amount, ApprovalId, ClaimId, DeadlineId, EscrowId, PartyId, RuleId, TransactionId};

use crate::changeset::Changeset;
use crate::escrow::{Actor, Escrow};
use crate::error::{EscrowError, LimitKind};

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Direction and purpose of a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Funds into the escrow.
    Deposit,
    /// Scheduled or settled release to a party.
    Release,
    /// Money returned to the tenant.
    Refund,
    /// Deposit awarded to the landlord.
    Deduction,
}

impl TransactionType {
    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Release => "RELEASE",
            Self::Refund => "REFUND",
            Self::Deduction => "DEDUCTION",
        }
    }

    /// Whether this movement takes money out of the escrow.
    pub fn is_outflow(&self) -> bool {
        !matches!(self, Self::Deposit)
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement state of a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Awaiting an objection window or an approval.
    Pending,
    /// Handed to the payment gateway by an external process.
    Processing,
    /// Final. Counts toward the ledger.
    Completed,
    /// Objected to, rejected or expired.
    Failed,
}

/// A ledger movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Identity.
    pub id: TransactionId,
    /// Movement kind.
    pub transaction_type: TransactionType,
    /// Amount moved.
    pub amount: Amount,
    /// Who caused it.
    pub initiated_by: Actor,
    /// Recipient of an outflow.
    pub beneficiary: Option<PartyId>,
    /// Settlement state.
    pub status: TransactionStatus,
    /// External payment reference for deposits.
    pub reference: Option<String>,
    /// The release rule that produced it.
    pub rule_id: Option<RuleId>,
    /// The claim it settles.
    pub claim_id: Option<ClaimId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When it completed or failed.
    pub settled_at: Option<DateTime<Utc>>,
}

/// Parameters for a new outflow.
#[derive(Debug, Clone)]
pub(crate) struct Outflow {
    pub(crate) transaction_type: TransactionType,
    pub(crate) amount: Amount,
    pub(crate) beneficiary: PartyId,
    pub(crate) rule_id: Option<RuleId>,
    pub(crate) claim_id: Option<ClaimId>,
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// State of a counterparty sign-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Awaiting the approver.
    Pending,
    /// Approved; the transaction completed.
    Approved,
    /// Explicitly rejected.
    Rejected,
    /// No answer before the deadline. Treated as rejection.
    Expired,
}

/// Counterparty sign-off on a manual release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// Identity.
    pub id: ApprovalId,
    /// Rule being released.
    pub rule_id: RuleId,
    /// The PENDING transaction awaiting sign-off.
    pub transaction_id: TransactionId,
    /// Who asked.
    pub requested_by: PartyId,
    /// Who must answer.
    pub approver: PartyId,
    /// Current state.
    pub status: ApprovalStatus,
    /// Answer-by time.
    pub deadline: DateTime<Utc>,
    /// The APPROVAL_EXPIRY deadline record.
    pub deadline_id: DeadlineId,
    /// Request time.
    pub requested_at: DateTime<Utc>,
    /// When answered or expired.
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Statement
// ---------------------------------------------------------------------------

/// Read-only ledger summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// The escrow.
    pub escrow_id: EscrowId,
    /// Completed deposits.
    pub deposits: Amount,
    /// Completed releases.
    pub releases: Amount,
    /// Completed refunds.
    pub refunds: Amount,
    /// Completed deductions.
    pub deductions: Amount,
    /// Outflows awaiting objection or approval.
    pub pending: Amount,
    /// Deposits minus completed outflows.
    pub balance: Amount,
}

impl Escrow {
    fn sum_transactions(&self, pred: impl Fn(&Transaction) -> bool) -> Amount {
        self.transactions
            .iter()
            .filter(|t| pred(t))
            .fold(Amount::ZERO, |acc, t| acc.saturating_add(t.amount))
    }

    fn completed_of(&self, kind: TransactionType) -> Amount {
        self.sum_transactions(|t| {
            t.transaction_type == kind && t.status == TransactionStatus::Completed
        })
    }

    /// Completed deposits minus completed outflows.
    pub fn held_balance(&self) -> Amount {
        let outflows = self.sum_transactions(|t| {
            t.transaction_type.is_outflow() && t.status == TransactionStatus::Completed
        });
        self.completed_of(TransactionType::Deposit)
            .saturating_sub(outflows)
    }

    /// Outflows reserved but not yet completed.
    pub fn pending_outflows(&self) -> Amount {
        self.sum_transactions(|t| {
            t.transaction_type.is_outflow()
                && matches!(
                    t.status,
                    TransactionStatus::Pending | TransactionStatus::Processing
                )
        })
    }

    /// Ledger summary.
    pub fn statement(&self) -> Statement {
        Statement {
            escrow_id: self.id,
            deposits: self.completed_of(TransactionType::Deposit),
            releases: self.completed_of(TransactionType::Release),
            refunds: self.completed_of(TransactionType::Refund),
            deductions: self.completed_of(TransactionType::Deduction),
            pending: self.pending_outflows(),
            balance: self.held_balance(),
        }
    }

    /// Look up a transaction.
    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.id == id)
    }

    pub(crate) fn record_deposit(
        &mut self,
        amount: Amount,
        reference: &str,
        cx: &mut Changeset,
    ) -> TransactionId {
        let tx = Transaction {
            id: TransactionId::new(),
            transaction_type: TransactionType::Deposit,
            amount,
            initiated_by: cx.actor().clone(),
            beneficiary: None,
            status: TransactionStatus::Completed,
            reference: Some(reference.to_string()),
            rule_id: None,
            claim_id: None,
            created_at: cx.now(),
            settled_at: Some(cx.now()),
        };
        let id = tx.id;
        cx.pay(tx.clone());
        self.transactions.push(tx);
        id
    }

    /// Create an outflow, either PENDING (reserving its amount) or
    /// COMPLETED. Rejects anything the unreserved balance cannot cover.
    pub(crate) fn post_outflow(
        &mut self,
        outflow: Outflow,
        status: TransactionStatus,
        cx: &mut Changeset,
    ) -> Result<TransactionId, EscrowError> {
        let available = self.held_balance().saturating_sub(self.pending_outflows());
        if outflow.amount > available {
            return Err(EscrowError::LimitExceeded {
                escrow_id: self.id,
                limit: LimitKind::HeldBalance,
                requested: outflow.amount.minor_units(),
                available: available.minor_units(),
            });
        }
        let tx = Transaction {
            id: TransactionId::new(),
            transaction_type: outflow.transaction_type,
            amount: outflow.amount,
            initiated_by: cx.actor().clone(),
            beneficiary: Some(outflow.beneficiary),
            status,
            reference: None,
            rule_id: outflow.rule_id,
            claim_id: outflow.claim_id,
            created_at: cx.now(),
            settled_at: (status == TransactionStatus::Completed).then(|| cx.now()),
        };
        let id = tx.id;
        if status == TransactionStatus::Completed {
            cx.pay(tx.clone());
        }
        self.transactions.push(tx);
        Ok(id)
    }

    /// Complete a PENDING outflow.
    pub(crate) fn complete_transaction(
        &mut self,
        id: TransactionId,
        cx: &mut Changeset,
    ) -> Result<Amount, EscrowError> {
        let held = self.held_balance();
        let escrow_id = self.id;
        let tx = self
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EscrowError::not_found("transaction", id))?;
        if tx.status != TransactionStatus::Pending {
            return Err(EscrowError::conflict(
                escrow_id,
                format!("{id} is {:?}, not PENDING", tx.status),
            ));
        }
        if tx.amount > held {
            return Err(EscrowError::LimitExceeded {
                escrow_id,
                limit: LimitKind::HeldBalance,
                requested: tx.amount.minor_units(),
                available: held.minor_units(),
            });
        }
        tx.status = TransactionStatus::Completed;
        tx.settled_at = Some(cx.now());
        let amount = tx.amount;
        cx.pay(tx.clone());
        Ok(amount)
    }

    /// Fail a PENDING outflow, releasing its reservation.
    pub(crate) fn fail_transaction(
        &mut self,
        id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        let escrow_id = self.id;
        let tx = self
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EscrowError::not_found("transaction", id))?;
        if tx.status != TransactionStatus::Pending {
            return Err(EscrowError::conflict(
                escrow_id,
                format!("{id} is {:?}, not PENDING", tx.status),
            ));
        }
        tx.status = TransactionStatus::Failed;
        tx.settled_at = Some(now);
        Ok(())
    }

    /// Refund whatever is still held to the tenant. Used at closure.
    pub(crate) fn refund_residual(&mut self, cx: &mut Changeset) -> Result<Amount, EscrowError> {
        let residual = self.held_balance().saturating_sub(self.pending_outflows());
        if residual.is_zero() {
            return Ok(residual);
        }
        self.post_outflow(
            Outflow {
                transaction_type: TransactionType::Refund,
                amount: residual,
                beneficiary: self.tenant_id.clone(),
                rule_id: None,
                claim_id: None,
            },
            TransactionStatus::Completed,
            cx,
        )?;
        Ok(residual)
    }

    /// Look up an approval.
    pub fn approval(&self, id: ApprovalId) -> Option<&Approval> {
        self.approvals.iter().find(|a| a.id == id)
    }
}
