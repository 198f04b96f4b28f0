//! # Claim Negotiator
//!
//! Claims are raised while the escrow is RELEASE_PENDING and before the
//! claim window closes. The non-claimant answers; a counter-offer flips the
//! turn to the other side. Each side's answer has a response deadline whose
//! silent expiry counts as rejection.
//!
//! ## Bounds
//!
//! - The current amounts of all live claims (PENDING, COUNTER_OFFERED,
//!   ACCEPTED, DISPUTED) never exceed the deposit.
//! - A claim may be countered at most `settlement_rounds` times. The next
//!   counter forces the claim and the escrow into DISPUTED.
//!
//! ## Settlement
//!
//! The escrow is settlement-ready when no claim awaits a response and either
//! the claim window has elapsed or every claim was accepted. Responses and
//! expiries that make it ready settle in the same commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentvault_core::{days, Amount, ClaimId, DeadlineId, PartyId, TransactionId, ValidationError};

use crate::audit::AuditEvent;
use crate::changeset::Changeset;
use crate::collaborators::NotificationKind;
use crate::deadline::{AutoAction, DeadlineKind, DeadlineOutcome};
use crate::dispute::DisputeOrigin;
use crate::escrow::{validate_text, Escrow};
use crate::error::{EscrowError, LimitKind};
use crate::status::{EscrowStatus, Operation};
use crate::transaction::{Outflow, TransactionStatus, TransactionType};

/// What the claimant asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimType {
    /// Part of the deposit to the landlord.
    Deduction,
    /// Part of the deposit back to the tenant ahead of the remainder.
    Refund,
    /// No negotiation; the escrow goes straight to DISPUTED.
    Dispute,
}

/// Negotiation state of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    /// Awaiting the first response.
    Pending,
    /// Agreed at `agreed_amount`.
    Accepted,
    /// Refused.
    Rejected,
    /// A counter-offer awaits the other side.
    CounterOffered,
    /// Nobody answered in time. Treated as rejection.
    Expired,
    /// Moved into a dispute.
    Disputed,
}

impl ClaimStatus {
    /// Whether the claim awaits a response.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::CounterOffered)
    }

    /// Whether the claim's amount is still committed against the deposit.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Rejected | Self::Expired)
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::CounterOffered => "COUNTER_OFFERED",
            Self::Expired => "EXPIRED",
            Self::Disputed => "DISPUTED",
        })
    }
}

/// A response action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseAction {
    /// Agree to the current amount.
    Accept,
    /// Refuse the claim.
    Reject,
    /// Propose a different amount.
    CounterOffer,
}

/// One answer in the negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    /// Who answered.
    pub responder: PartyId,
    /// What they did.
    pub action: ResponseAction,
    /// Counter amount.
    pub amount: Option<Amount>,
    /// Free text.
    pub comment: Option<String>,
    /// Counter-offers made on the claim after this response.
    pub round: u32,
    /// When.
    pub responded_at: DateTime<Utc>,
}

/// A party's assertion about the deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Identity.
    pub id: ClaimId,
    /// Who raised it.
    pub claimant: PartyId,
    /// What it asks for.
    pub claim_type: ClaimType,
    /// The amount originally claimed.
    pub amount: Amount,
    /// The amount currently on the table.
    pub current_amount: Amount,
    /// The amount both sides agreed to.
    pub agreed_amount: Option<Amount>,
    /// What the claim is about.
    pub description: String,
    /// Negotiation state.
    pub status: ClaimStatus,
    /// Whose turn it is.
    pub awaiting: PartyId,
    /// Counter-offers made so far.
    pub rounds_used: u32,
    /// When the current turn expires.
    pub response_deadline: DateTime<Utc>,
    /// The CLAIM_RESPONSE deadline for the current turn.
    pub deadline_id: Option<DeadlineId>,
    /// Every answer so far.
    pub responses: Vec<ClaimResponse>,
    /// When raised.
    pub created_at: DateTime<Utc>,
    /// When it left the open states.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input to `raise_claim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// What it asks for.
    pub claim_type: ClaimType,
    /// The amount. Zero is allowed only for disputes.
    pub amount: Amount,
    /// What it is about.
    pub description: String,
}

/// Input to `respond_to_claim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReply {
    /// The action.
    pub action: ResponseAction,
    /// Required for a counter-offer.
    #[serde(default)]
    pub amount: Option<Amount>,
    /// Free text.
    #[serde(default)]
    pub comment: Option<String>,
}

/// What settlement paid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSummary {
    /// Remainder of the deposit to the tenant.
    pub released_to_tenant: Amount,
    /// Accepted refunds to the tenant.
    pub refunded_to_tenant: Amount,
    /// Accepted deductions to the landlord.
    pub deducted_to_landlord: Amount,
    /// RELEASED or PARTIALLY_RELEASED.
    pub status: EscrowStatus,
    /// The transactions created.
    pub transactions: Vec<TransactionId>,
}

impl Escrow {
    /// Look up a claim.
    pub fn claim(&self, id: ClaimId) -> Option<&Claim> {
        self.claims.iter().find(|c| c.id == id)
    }

    /// Claims awaiting a response.
    pub fn open_claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter().filter(|c| c.status.is_open())
    }

    /// Sum of live claim amounts, optionally leaving one claim out.
    pub fn committed_claim_amount(&self, excluding: Option<ClaimId>) -> Amount {
        self.claims
            .iter()
            .filter(|c| c.status.is_live() && Some(c.id) != excluding)
            .fold(Amount::ZERO, |acc, c| acc.saturating_add(c.current_amount))
    }

    fn check_claim_bound(&self, amount: Amount, excluding: Option<ClaimId>) -> Result<(), EscrowError> {
        let available = self
            .amounts
            .deposit
            .saturating_sub(self.committed_claim_amount(excluding));
        if amount > available {
            return Err(EscrowError::LimitExceeded {
                escrow_id: self.id,
                limit: LimitKind::ClaimAmount,
                requested: amount.minor_units(),
                available: available.minor_units(),
            });
        }
        Ok(())
    }

    /// Why settlement cannot run at `now`, if it cannot.
    pub fn settlement_blocker(&self, now: DateTime<Utc>) -> Option<String> {
        if self.status != EscrowStatus::ReleasePending {
            return Some(format!("escrow is {}", self.status));
        }
        let open = self.open_claims().count();
        if open > 0 {
            return Some(format!("{open} claim(s) awaiting response"));
        }
        let window_elapsed = self.claim_window_ends.is_some_and(|end| now >= end);
        let all_accepted = !self.claims.is_empty()
            && self.claims.iter().all(|c| c.status == ClaimStatus::Accepted);
        if window_elapsed || all_accepted {
            return None;
        }
        match self.claim_window_ends {
            Some(end) => Some(format!("claim window open until {end}")),
            None => Some("claim window not opened".to_string()),
        }
    }

    /// Whether settlement can run at `now`.
    pub fn settlement_ready(&self, now: DateTime<Utc>) -> bool {
        self.settlement_blocker(now).is_none()
    }

    // ── Raising ─────────────────────────────────────────────────────────

    pub(crate) fn raise_claim(
        &mut self,
        claimant: &PartyId,
        request: ClaimRequest,
        cx: &mut Changeset,
    ) -> Result<ClaimId, EscrowError> {
        self.require(Operation::RaiseClaim)?;
        let role = self.require_party(Operation::RaiseClaim, claimant)?;
        let now = cx.now();
        if let Some(end) = self.claim_window_ends {
            if now >= end {
                return Err(EscrowError::WindowClosed {
                    escrow_id: self.id,
                    window: "claim window",
                    closed_at: end,
                });
            }
        }
        let description = validate_text("claim description", request.description)?;
        if request.claim_type != ClaimType::Dispute && request.amount.is_zero() {
            return Err(ValidationError::ZeroAmount("claim amount").into());
        }
        self.check_claim_bound(request.amount, None)?;

        let counterparty = self.party(role.other()).clone();
        let response_deadline = now + days(self.config.response_window_days);
        let mut claim = Claim {
            id: ClaimId::new(),
            claimant: claimant.clone(),
            claim_type: request.claim_type,
            amount: request.amount,
            current_amount: request.amount,
            agreed_amount: None,
            description,
            status: ClaimStatus::Pending,
            awaiting: counterparty.clone(),
            rounds_used: 0,
            response_deadline,
            deadline_id: None,
            responses: Vec::new(),
            created_at: now,
            resolved_at: None,
        };
        let claim_id = claim.id;

        if request.claim_type == ClaimType::Dispute {
            claim.status = ClaimStatus::Disputed;
            claim.resolved_at = Some(now);
            self.claims.push(claim);
            self.audit(
                cx,
                AuditEvent::ClaimRaised {
                    claim_id,
                    claim_type: request.claim_type,
                    amount: request.amount,
                    response_deadline,
                },
            );
            self.open_dispute(
                Operation::RaiseClaim,
                DisputeOrigin::DisputeClaim { claim_id },
                cx,
            )?;
            return Ok(claim_id);
        }

        claim.deadline_id = Some(self.schedule_deadline(
            DeadlineKind::ClaimResponse,
            Some(response_deadline),
            AutoAction::ExpireClaim { claim_id, round: 0 },
            now,
        ));
        self.claims.push(claim);
        self.notify(
            cx,
            vec![counterparty],
            NotificationKind::ClaimRaised,
            format!(
                "{claimant} claims {} ({:?}); respond by {response_deadline}",
                request.amount, request.claim_type
            ),
        );
        self.audit(
            cx,
            AuditEvent::ClaimRaised {
                claim_id,
                claim_type: request.claim_type,
                amount: request.amount,
                response_deadline,
            },
        );
        Ok(claim_id)
    }

    // ── Responding ──────────────────────────────────────────────────────

    pub(crate) fn respond_to_claim(
        &mut self,
        responder: &PartyId,
        claim_id: ClaimId,
        reply: ClaimReply,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::RespondToClaim)?;
        let role = self.require_party(Operation::RespondToClaim, responder)?;
        let now = cx.now();
        let idx = self
            .claims
            .iter()
            .position(|c| c.id == claim_id)
            .ok_or_else(|| EscrowError::not_found("claim", claim_id))?;

        let claim = &self.claims[idx];
        if !claim.status.is_open() {
            return Err(EscrowError::conflict(
                self.id,
                format!("{claim_id} is {}", claim.status),
            ));
        }
        if claim.awaiting != *responder {
            if claim.claimant == *responder && claim.status == ClaimStatus::Pending {
                return Err(EscrowError::SelfResponse {
                    claim_id,
                    party: responder.clone(),
                });
            }
            return Err(EscrowError::NotEligible {
                escrow_id: self.id,
                operation: Operation::RespondToClaim,
                actor: responder.to_string(),
                reason: format!("{claim_id} awaits a response from {}", claim.awaiting),
            });
        }
        if now >= claim.response_deadline {
            return Err(EscrowError::WindowClosed {
                escrow_id: self.id,
                window: "claim response window",
                closed_at: claim.response_deadline,
            });
        }
        let comment = reply
            .comment
            .map(|c| validate_text("comment", c))
            .transpose()?;
        let old_deadline = claim.deadline_id;

        let mut force_dispute = false;
        match reply.action {
            ResponseAction::Accept => {
                let claim = &mut self.claims[idx];
                claim.status = ClaimStatus::Accepted;
                claim.agreed_amount = Some(claim.current_amount);
                claim.resolved_at = Some(now);
            }
            ResponseAction::Reject => {
                let claim = &mut self.claims[idx];
                claim.status = ClaimStatus::Rejected;
                claim.resolved_at = Some(now);
            }
            ResponseAction::CounterOffer => {
                let amount = reply
                    .amount
                    .ok_or(ValidationError::MissingField("counter-offer amount"))?;
                if amount.is_zero() {
                    return Err(ValidationError::ZeroAmount("counter-offer amount").into());
                }
                self.check_claim_bound(amount, Some(claim_id))?;
                let rounds = self.config.settlement_rounds;
                let response_window = days(self.config.response_window_days);
                let next_turn = self.party(role.other()).clone();
                let claim = &mut self.claims[idx];
                claim.rounds_used += 1;
                if claim.rounds_used > rounds {
                    claim.status = ClaimStatus::Disputed;
                    claim.resolved_at = Some(now);
                    force_dispute = true;
                } else {
                    claim.status = ClaimStatus::CounterOffered;
                    claim.current_amount = amount;
                    claim.awaiting = next_turn;
                    claim.response_deadline = now + response_window;
                }
            }
        }

        if let Some(id) = old_deadline {
            self.cancel_deadline(id);
        }
        let claim = &mut self.claims[idx];
        let round = claim.rounds_used;
        claim.responses.push(ClaimResponse {
            responder: responder.clone(),
            action: reply.action,
            amount: reply.amount,
            comment,
            round,
            responded_at: now,
        });
        let status = claim.status;
        let claimant = claim.claimant.clone();
        let response_deadline = claim.response_deadline;

        if status == ClaimStatus::CounterOffered {
            let deadline_id = self.schedule_deadline(
                DeadlineKind::ClaimResponse,
                Some(response_deadline),
                AutoAction::ExpireClaim { claim_id, round },
                now,
            );
            self.claims[idx].deadline_id = Some(deadline_id);
        }

        self.audit(
            cx,
            AuditEvent::ClaimResponded {
                claim_id,
                action: reply.action,
                amount: reply.amount,
                round,
                status,
            },
        );
        let recipient = if claimant == *responder {
            self.party(role.other()).clone()
        } else {
            claimant
        };
        self.notify(
            cx,
            vec![recipient],
            NotificationKind::ClaimResponded,
            format!("{claim_id} is now {status}"),
        );

        if force_dispute {
            self.open_dispute(
                Operation::RespondToClaim,
                DisputeOrigin::RoundsExhausted { claim_id },
                cx,
            )?;
            return Ok(());
        }
        self.settle_if_ready(cx)?;
        Ok(())
    }

    /// Silent expiry of a claim turn. Runs from the sweeper.
    pub(crate) fn expire_claim(
        &mut self,
        claim_id: ClaimId,
        round: u32,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::RespondToClaim)?;
        let escrow_id = self.id;
        let now = cx.now();
        let claim = self
            .claims
            .iter_mut()
            .find(|c| c.id == claim_id)
            .ok_or_else(|| EscrowError::not_found("claim", claim_id))?;
        if !claim.status.is_open() || claim.rounds_used != round {
            return Err(EscrowError::conflict(
                escrow_id,
                format!("{claim_id} no longer awaits the round {round} response"),
            ));
        }
        claim.status = ClaimStatus::Expired;
        claim.resolved_at = Some(now);
        self.audit(cx, AuditEvent::ClaimExpired { claim_id });
        self.settle_if_ready(cx)?;
        Ok(())
    }

    // ── Settlement ──────────────────────────────────────────────────────

    fn settle_if_ready(&mut self, cx: &mut Changeset) -> Result<(), EscrowError> {
        if self.settlement_ready(cx.now()) {
            self.settle(cx)?;
        }
        Ok(())
    }

    /// End-of-window auto-release. Defers while claims are open.
    pub(crate) fn auto_release(&mut self, cx: &mut Changeset) -> Result<DeadlineOutcome, EscrowError> {
        self.require(Operation::Settle)?;
        let open_claims = self.open_claims().count();
        if open_claims > 0 {
            self.audit(cx, AuditEvent::SettlementDeferred { open_claims });
            return Ok(DeadlineOutcome::Deferred);
        }
        self.settle(cx)?;
        Ok(DeadlineOutcome::Fired)
    }

    /// Net accepted claims against the deposit and pay out.
    pub(crate) fn settle(&mut self, cx: &mut Changeset) -> Result<SettlementSummary, EscrowError> {
        self.require(Operation::Settle)?;
        let now = cx.now();
        if let Some(reason) = self.settlement_blocker(now) {
            return Err(EscrowError::conflict(self.id, format!("not ready to settle: {reason}")));
        }

        let accepted = |kind: ClaimType| -> Vec<(ClaimId, Amount)> {
            self.claims
                .iter()
                .filter(|c| c.status == ClaimStatus::Accepted && c.claim_type == kind)
                .map(|c| (c.id, c.agreed_amount.unwrap_or(c.current_amount)))
                .collect()
        };
        let deductions = accepted(ClaimType::Deduction);
        let refunds = accepted(ClaimType::Refund);
        let deducted = Amount::checked_sum(deductions.iter().map(|(_, a)| *a), "deductions")?;
        let refunded = Amount::checked_sum(refunds.iter().map(|(_, a)| *a), "refunds")?;
        let claimed = deducted.checked_add(refunded, "settled claims")?;
        let released = self
            .amounts
            .deposit
            .checked_sub(claimed)
            .ok_or(EscrowError::LimitExceeded {
                escrow_id: self.id,
                limit: LimitKind::ClaimAmount,
                requested: claimed.minor_units(),
                available: self.amounts.deposit.minor_units(),
            })?;

        let mut transactions = Vec::new();
        for (claim_id, amount) in deductions {
            transactions.push(self.post_outflow(
                Outflow {
                    transaction_type: TransactionType::Deduction,
                    amount,
                    beneficiary: self.landlord_id.clone(),
                    rule_id: None,
                    claim_id: Some(claim_id),
                },
                TransactionStatus::Completed,
                cx,
            )?);
        }
        for (claim_id, amount) in refunds {
            transactions.push(self.post_outflow(
                Outflow {
                    transaction_type: TransactionType::Refund,
                    amount,
                    beneficiary: self.tenant_id.clone(),
                    rule_id: None,
                    claim_id: Some(claim_id),
                },
                TransactionStatus::Completed,
                cx,
            )?);
        }
        if !released.is_zero() {
            transactions.push(self.post_outflow(
                Outflow {
                    transaction_type: TransactionType::Release,
                    amount: released,
                    beneficiary: self.tenant_id.clone(),
                    rule_id: None,
                    claim_id: None,
                },
                TransactionStatus::Completed,
                cx,
            )?);
        }

        let status = if deducted.is_zero() {
            EscrowStatus::Released
        } else {
            EscrowStatus::PartiallyReleased
        };
        self.cancel_deadlines_where(|d| d.kind == DeadlineKind::ClaimWindow);
        self.transition(Operation::Settle, status)?;
        self.timeline.released_at = Some(now);

        let summary = SettlementSummary {
            released_to_tenant: released,
            refunded_to_tenant: refunded,
            deducted_to_landlord: deducted,
            status,
            transactions,
        };
        self.notify(
            cx,
            self.both_parties(),
            NotificationKind::FundsReleased,
            format!(
                "deposit settled: {released} released and {refunded} refunded to the tenant, {deducted} deducted to the landlord"
            ),
        );
        self.audit(
            cx,
            AuditEvent::Settled {
                released,
                refunded,
                deducted,
                status,
                transactions: summary.transactions.clone(),
            },
        );
        Ok(summary)
    }
}
