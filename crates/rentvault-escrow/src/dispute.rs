//! # Disputes
//!
//! A dispute suspends automatic settlement. It opens when a DISPUTE claim is
//! raised or when a claim runs out of counter-offer rounds, may be escalated
//! for neutral assessment, and ends with an externally decided
//! [`DisputeResolution`] that closes the escrow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentvault_core::{Amount, ClaimId, DisputeId};

use crate::audit::AuditEvent;
use crate::changeset::Changeset;
use crate::claim::ClaimStatus;
use crate::collaborators::NotificationKind;
use crate::deadline::DeadlineKind;
use crate::escrow::{validate_text, Actor, Escrow};
use crate::error::{EscrowError, LimitKind};
use crate::release::RuleStatus;
use crate::status::{EscrowStatus, Operation};
use crate::transaction::{ApprovalStatus, Outflow, TransactionStatus, TransactionType};

/// Dispute lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    /// Awaiting resolution.
    Open,
    /// Resolved; the escrow is closed.
    Resolved,
}

/// How a dispute began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum DisputeOrigin {
    /// A DISPUTE claim was raised.
    DisputeClaim {
        /// The claim.
        claim_id: ClaimId,
    },
    /// A claim exceeded its counter-offer rounds.
    RoundsExhausted {
        /// The claim.
        claim_id: ClaimId,
    },
}

/// The externally decided outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    /// Deposit awarded to the landlord. The rest goes to the tenant.
    pub deduction_to_landlord: Amount,
    /// Summary of the decision.
    pub summary: String,
    /// Who decided (arbitrator or assessment reference).
    pub decided_by: String,
}

/// An escalation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    /// Identity.
    pub id: DisputeId,
    /// How it began.
    pub origin: DisputeOrigin,
    /// Who caused it.
    pub raised_by: Actor,
    /// Lifecycle.
    pub status: DisputeStatus,
    /// When opened.
    pub opened_at: DateTime<Utc>,
    /// When escalated.
    pub escalated_at: Option<DateTime<Utc>>,
    /// Reference of the neutral-assessment request.
    pub assessment_reference: Option<String>,
    /// The outcome.
    pub resolution: Option<DisputeResolution>,
    /// When resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Escrow {
    /// The open dispute, if any.
    pub fn open_dispute_record(&self) -> Option<&Dispute> {
        self.disputes
            .iter()
            .rev()
            .find(|d| d.status == DisputeStatus::Open)
    }

    /// Move to DISPUTED and freeze automatic settlement.
    pub(crate) fn open_dispute(
        &mut self,
        operation: Operation,
        origin: DisputeOrigin,
        cx: &mut Changeset,
    ) -> Result<DisputeId, EscrowError> {
        let now = cx.now();
        self.transition(operation, EscrowStatus::Disputed)?;
        self.timeline.disputed_at = Some(now);

        let open_turns: Vec<_> = self
            .claims
            .iter()
            .filter(|c| c.status.is_open())
            .filter_map(|c| c.deadline_id)
            .collect();
        for id in open_turns {
            self.cancel_deadline(id);
        }
        self.cancel_deadlines_where(|d| d.kind == DeadlineKind::ClaimWindow);

        let dispute = Dispute {
            id: DisputeId::new(),
            origin,
            raised_by: cx.actor().clone(),
            status: DisputeStatus::Open,
            opened_at: now,
            escalated_at: None,
            assessment_reference: None,
            resolution: None,
            resolved_at: None,
        };
        let dispute_id = dispute.id;
        self.disputes.push(dispute);
        self.notify(
            cx,
            self.both_parties(),
            NotificationKind::DisputeOpened,
            format!("{dispute_id} opened; automatic release is suspended"),
        );
        self.audit(cx, AuditEvent::DisputeOpened { dispute_id, origin });
        Ok(dispute_id)
    }

    /// Request neutral assessment.
    pub(crate) fn escalate(
        &mut self,
        assessment_reference: Option<String>,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::Escalate)?;
        self.require_actor(Operation::Escalate, cx.actor())?;
        let assessment_reference = assessment_reference
            .map(|r| validate_text("assessment reference", r))
            .transpose()?;
        let now = cx.now();
        let escrow_id = self.id;
        let dispute = self
            .disputes
            .iter_mut()
            .rev()
            .find(|d| d.status == DisputeStatus::Open)
            .ok_or_else(|| EscrowError::conflict(escrow_id, "no open dispute"))?;
        dispute.escalated_at = Some(now);
        dispute.assessment_reference = assessment_reference.clone();
        let dispute_id = dispute.id;

        self.transition(Operation::Escalate, EscrowStatus::Escalated)?;
        self.timeline.escalated_at = Some(now);
        self.audit(
            cx,
            AuditEvent::Escalated {
                dispute_id,
                assessment_reference,
            },
        );
        Ok(())
    }

    /// Apply an external decision and close.
    pub(crate) fn resolve_dispute(
        &mut self,
        resolution: DisputeResolution,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::ResolveDispute)?;
        let summary = validate_text("resolution summary", resolution.summary)?;
        let decided_by = validate_text("resolution decided_by", resolution.decided_by)?;
        let deposit = self.amounts.deposit;
        let deducted = resolution.deduction_to_landlord;
        let released = deposit
            .checked_sub(deducted)
            .ok_or(EscrowError::LimitExceeded {
                escrow_id: self.id,
                limit: LimitKind::ResolutionAmount,
                requested: deducted.minor_units(),
                available: deposit.minor_units(),
            })?;
        let now = cx.now();
        let dispute_id = self
            .open_dispute_record()
            .map(|d| d.id)
            .ok_or_else(|| EscrowError::conflict(self.id, "no open dispute"))?;

        // Outstanding rule releases are void once arbitration decides.
        let pending: Vec<_> = self
            .release_rules
            .iter()
            .filter(|r| r.status == RuleStatus::Active)
            .filter_map(|r| r.pending_transaction)
            .collect();
        for tx in pending {
            self.fail_transaction(tx, now)?;
        }
        for rule in self
            .release_rules
            .iter_mut()
            .filter(|r| r.status == RuleStatus::Active)
        {
            rule.status = RuleStatus::Cancelled;
            rule.pending_transaction = None;
        }
        for approval in self
            .approvals
            .iter_mut()
            .filter(|a| a.status == ApprovalStatus::Pending)
        {
            approval.status = ApprovalStatus::Expired;
            approval.resolved_at = Some(now);
        }
        for claim in self.claims.iter_mut().filter(|c| c.status.is_open()) {
            claim.status = ClaimStatus::Disputed;
            claim.resolved_at = Some(now);
        }

        if !deducted.is_zero() {
            self.post_outflow(
                Outflow {
                    transaction_type: TransactionType::Deduction,
                    amount: deducted,
                    beneficiary: self.landlord_id.clone(),
                    rule_id: None,
                    claim_id: None,
                },
                TransactionStatus::Completed,
                cx,
            )?;
        }
        if !released.is_zero() {
            self.post_outflow(
                Outflow {
                    transaction_type: TransactionType::Release,
                    amount: released,
                    beneficiary: self.tenant_id.clone(),
                    rule_id: None,
                    claim_id: None,
                },
                TransactionStatus::Completed,
                cx,
            )?;
        }
        let refunded_residual = self.refund_residual(cx)?;
        self.cancel_open_deadlines();

        if let Some(dispute) = self.disputes.iter_mut().find(|d| d.id == dispute_id) {
            dispute.status = DisputeStatus::Resolved;
            dispute.resolution = Some(DisputeResolution {
                deduction_to_landlord: deducted,
                summary,
                decided_by,
            });
            dispute.resolved_at = Some(now);
        }
        self.transition(Operation::ResolveDispute, EscrowStatus::Closed)?;
        self.timeline.closed_at = Some(now);
        self.notify(
            cx,
            self.both_parties(),
            NotificationKind::FundsReleased,
            format!("{dispute_id} resolved: {deducted} to the landlord, {released} to the tenant"),
        );
        self.audit(
            cx,
            AuditEvent::DisputeResolved {
                dispute_id,
                deducted,
                released,
                refunded_residual,
            },
        );
        Ok(())
    }
}
