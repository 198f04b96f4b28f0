//! # Deadlines
//!
//! A [`Deadline`] binds a due time to an [`AutoAction`]. The sweeper fires
//! it in two commits:
//!
//! 1. **Claim.** The sweeper stamps `claimed_by` on an ACTIVE, due,
//!    untriggered deadline under optimistic concurrency. Only one claimant
//!    can win; the loser's commit conflicts, and on retry it sees the claim
//!    and walks away.
//! 2. **Execute.** The claimant runs the action against a scratch copy of
//!    the escrow. On success the copy replaces the escrow; on failure the
//!    escrow is left as it was and a `DeadlineFailed` audit entry records
//!    the error. Either way the deadline becomes COMPLETED with
//!    `triggered_at` set. If the execute commit itself cannot be made, a
//!    follow-up commit records the failure the same way; failing that, the
//!    claim is dropped so the next pass retries.
//!
//! A failed deadline is only retried through [`Escrow::reactivate_deadline`].
//! A claim whose executor died is also cleared there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentvault_core::{Amount, ApprovalId, ClaimId, DeadlineId, EscrowId, RuleId, SweeperId, TransactionId};

use crate::audit::AuditEvent;
use crate::changeset::Changeset;
use crate::escrow::Escrow;
use crate::error::EscrowError;
use crate::status::EscrowStatus;

/// What a deadline guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadlineKind {
    /// End of the claim window, or the deposit rule's trigger.
    ClaimWindow,
    /// A claim's response deadline.
    ClaimResponse,
    /// A non-deposit release rule's trigger.
    ReleaseRule,
    /// End of a release's objection window.
    ObjectionWindow,
    /// An approval request's answer-by time.
    ApprovalExpiry,
    /// Advance notice of a release.
    Notify,
}

impl std::fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ClaimWindow => "CLAIM_WINDOW",
            Self::ClaimResponse => "CLAIM_RESPONSE",
            Self::ReleaseRule => "RELEASE_RULE",
            Self::ObjectionWindow => "OBJECTION_WINDOW",
            Self::ApprovalExpiry => "APPROVAL_EXPIRY",
            Self::Notify => "NOTIFY",
        })
    }
}

/// The action a deadline performs, with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoAction {
    /// Record move-out on behalf of the parties.
    StartClaimWindow {
        /// The deposit rule.
        rule_id: RuleId,
    },
    /// Settle the deposit at the end of the claim window.
    AutoRelease {
        /// The deposit at the time the window opened.
        amount: Amount,
    },
    /// Fire a non-deposit rule.
    ReleaseRule {
        /// The rule.
        rule_id: RuleId,
    },
    /// Complete a release whose objection window passed in silence.
    CompleteRelease {
        /// The rule.
        rule_id: RuleId,
        /// The PENDING transaction.
        transaction_id: TransactionId,
    },
    /// Notify both parties of an upcoming release.
    Notify {
        /// The rule.
        rule_id: RuleId,
    },
    /// Expire an unanswered claim.
    ExpireClaim {
        /// The claim.
        claim_id: ClaimId,
        /// The negotiation round the deadline was set for.
        round: u32,
    },
    /// Expire an unanswered approval request.
    ExpireApproval {
        /// The approval.
        approval_id: ApprovalId,
    },
}

impl AutoAction {
    /// The action name used in logs and audit entries.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartClaimWindow { .. } => "START_CLAIM_WINDOW",
            Self::AutoRelease { .. } => "AUTO_RELEASE",
            Self::ReleaseRule { .. } => "RELEASE_RULE",
            Self::CompleteRelease { .. } => "COMPLETE_RELEASE",
            Self::Notify { .. } => "NOTIFY",
            Self::ExpireClaim { .. } => "EXPIRE_CLAIM",
            Self::ExpireApproval { .. } => "EXPIRE_APPROVAL",
        }
    }
}

/// Deadline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadlineStatus {
    /// Waiting to fire.
    Active,
    /// Fired (successfully or not).
    Completed,
    /// Made obsolete before firing.
    Cancelled,
}

/// The in-progress marker a sweeper sets before executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperClaim {
    /// The claiming sweeper.
    pub sweeper: SweeperId,
    /// When it claimed.
    pub claimed_at: DateTime<Utc>,
}

/// A scheduled autonomous trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    /// Identity.
    pub id: DeadlineId,
    /// What it guards.
    pub kind: DeadlineKind,
    /// Due time. `None` is a placeholder awaiting a date.
    pub due_at: Option<DateTime<Utc>>,
    /// What to do when due.
    pub action: AutoAction,
    /// Lifecycle.
    pub status: DeadlineStatus,
    /// Set by the sweeper that is executing it.
    pub claimed_by: Option<SweeperClaim>,
    /// When it fired.
    pub triggered_at: Option<DateTime<Utc>>,
    /// The action's error, if it failed.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Deadline {
    /// ACTIVE.
    pub fn is_active(&self) -> bool {
        self.status == DeadlineStatus::Active
    }

    /// ACTIVE, due, and neither claimed nor triggered.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active()
            && self.claimed_by.is_none()
            && self.triggered_at.is_none()
            && self.due_at.is_some_and(|due| due <= now)
    }
}

/// A due deadline located by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueDeadline {
    /// Owning escrow.
    pub escrow_id: EscrowId,
    /// The deadline.
    pub deadline_id: DeadlineId,
    /// Its due time.
    pub due_at: DateTime<Utc>,
}

/// How a deadline's action went.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadlineOutcome {
    /// The action ran and its effects were committed.
    Fired,
    /// The action ran but had to wait on open claims.
    Deferred,
    /// The action was rejected; the escrow is unchanged.
    Failed(EscrowError),
}

impl std::fmt::Display for DeadlineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fired => f.write_str("fired"),
            Self::Deferred => f.write_str("deferred"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// One deadline handled by a sweep pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDeadline {
    /// Owning escrow.
    pub escrow_id: EscrowId,
    /// The deadline.
    pub deadline_id: DeadlineId,
    /// Its kind.
    pub kind: DeadlineKind,
    /// Its action name.
    pub action: &'static str,
    /// What happened.
    pub outcome: DeadlineOutcome,
}

impl Escrow {
    /// Look up a deadline.
    pub fn deadline(&self, id: DeadlineId) -> Option<&Deadline> {
        self.deadlines.iter().find(|d| d.id == id)
    }

    /// Deadlines the sweeper may claim at `now`.
    pub fn due_deadlines(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Deadline> {
        self.deadlines.iter().filter(move |d| d.is_due(now))
    }

    pub(crate) fn schedule_deadline(
        &mut self,
        kind: DeadlineKind,
        due_at: Option<DateTime<Utc>>,
        action: AutoAction,
        now: DateTime<Utc>,
    ) -> DeadlineId {
        let id = DeadlineId::new();
        self.deadlines.push(Deadline {
            id,
            kind,
            due_at,
            action,
            status: DeadlineStatus::Active,
            claimed_by: None,
            triggered_at: None,
            last_error: None,
            created_at: now,
        });
        id
    }

    /// Cancel an ACTIVE, unclaimed deadline. A claimed deadline belongs to
    /// its sweeper and is left alone.
    pub(crate) fn cancel_deadline(&mut self, id: DeadlineId) -> bool {
        match self.deadlines.iter_mut().find(|d| d.id == id) {
            Some(d) if d.is_active() && d.claimed_by.is_none() => {
                d.status = DeadlineStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel_deadlines_where(&mut self, pred: impl Fn(&Deadline) -> bool) {
        for d in self.deadlines.iter_mut() {
            if d.is_active() && d.claimed_by.is_none() && pred(d) {
                d.status = DeadlineStatus::Cancelled;
            }
        }
    }

    pub(crate) fn cancel_open_deadlines(&mut self) {
        self.cancel_deadlines_where(|_| true);
    }

    /// Phase one: mark the deadline as being executed by `sweeper`.
    /// Returns false if it is no longer claimable.
    pub(crate) fn claim_deadline(
        &mut self,
        id: DeadlineId,
        sweeper: SweeperId,
        cx: &mut Changeset,
    ) -> bool {
        let now = cx.now();
        match self.deadlines.iter_mut().find(|d| d.id == id) {
            Some(d) if d.is_due(now) => {
                d.claimed_by = Some(SweeperClaim {
                    sweeper,
                    claimed_at: now,
                });
                cx.touch();
                true
            }
            _ => false,
        }
    }

    /// Phase two: run the action of a deadline claimed by `sweeper`.
    /// Returns `None` if `sweeper` does not hold the claim.
    pub(crate) fn execute_deadline(
        &mut self,
        id: DeadlineId,
        sweeper: SweeperId,
        cx: &mut Changeset,
    ) -> Option<ProcessedDeadline> {
        let deadline = self.deadline(id)?;
        let held = deadline.claimed_by.as_ref().map(|c| c.sweeper) == Some(sweeper);
        if !held || !deadline.is_active() || deadline.triggered_at.is_some() {
            return None;
        }
        let action = deadline.action.clone();
        let kind = deadline.kind;

        let mut scratch = self.clone();
        let mut scratch_cx = cx.fork();
        let outcome = match scratch.run_action(&action, &mut scratch_cx) {
            Ok(outcome) => {
                *self = scratch;
                cx.absorb(scratch_cx);
                outcome
            }
            Err(error) => {
                tracing::warn!(
                    escrow_id = %self.id,
                    deadline_id = %id,
                    action = action.name(),
                    error = %error,
                    "deadline action failed"
                );
                self.audit_deadline_failure(id, &action, &error, cx);
                DeadlineOutcome::Failed(error)
            }
        };

        Some(self.complete_deadline(id, kind, &action, outcome, cx))
    }

    /// Close out a deadline claimed by `sweeper` whose execute commit could
    /// not be made. The escrow is otherwise unchanged.
    pub(crate) fn record_deadline_failure(
        &mut self,
        id: DeadlineId,
        sweeper: SweeperId,
        error: EscrowError,
        cx: &mut Changeset,
    ) -> Option<ProcessedDeadline> {
        let deadline = self.deadline(id)?;
        let held = deadline.claimed_by.as_ref().map(|c| c.sweeper) == Some(sweeper);
        if !held || !deadline.is_active() || deadline.triggered_at.is_some() {
            return None;
        }
        let action = deadline.action.clone();
        let kind = deadline.kind;
        self.audit_deadline_failure(id, &action, &error, cx);
        Some(self.complete_deadline(id, kind, &action, DeadlineOutcome::Failed(error), cx))
    }

    /// Drop `sweeper`'s claim so the next pass can pick the deadline up.
    pub(crate) fn release_deadline_claim(
        &mut self,
        id: DeadlineId,
        sweeper: SweeperId,
        cx: &mut Changeset,
    ) -> bool {
        match self.deadlines.iter_mut().find(|d| d.id == id) {
            Some(d)
                if d.is_active()
                    && d.triggered_at.is_none()
                    && d.claimed_by.as_ref().map(|c| c.sweeper) == Some(sweeper) =>
            {
                d.claimed_by = None;
                cx.touch();
                true
            }
            _ => false,
        }
    }

    fn audit_deadline_failure(
        &self,
        id: DeadlineId,
        action: &AutoAction,
        error: &EscrowError,
        cx: &mut Changeset,
    ) {
        self.audit(
            cx,
            AuditEvent::DeadlineFailed {
                deadline_id: id,
                action: action.name().to_string(),
                error: error.to_string(),
            },
        );
    }

    fn complete_deadline(
        &mut self,
        id: DeadlineId,
        kind: DeadlineKind,
        action: &AutoAction,
        outcome: DeadlineOutcome,
        cx: &mut Changeset,
    ) -> ProcessedDeadline {
        let now = cx.now();
        if let Some(d) = self.deadlines.iter_mut().find(|d| d.id == id) {
            d.status = DeadlineStatus::Completed;
            d.triggered_at = Some(now);
            d.last_error = match &outcome {
                DeadlineOutcome::Failed(e) => Some(e.to_string()),
                _ => None,
            };
        }
        cx.touch();

        ProcessedDeadline {
            escrow_id: self.id,
            deadline_id: id,
            kind,
            action: action.name(),
            outcome,
        }
    }

    fn run_action(
        &mut self,
        action: &AutoAction,
        cx: &mut Changeset,
    ) -> Result<DeadlineOutcome, EscrowError> {
        match action {
            AutoAction::StartClaimWindow { .. } => {
                self.request_release(Some("release trigger reached".to_string()), cx)?
            }
            AutoAction::AutoRelease { .. } => return self.auto_release(cx),
            AutoAction::ReleaseRule { rule_id } => self.fire_release_rule(*rule_id, cx)?,
            AutoAction::CompleteRelease {
                rule_id,
                transaction_id,
            } => self.complete_release(*rule_id, *transaction_id, cx)?,
            AutoAction::Notify { rule_id } => self.notify_upcoming_release(*rule_id, cx)?,
            AutoAction::ExpireClaim { claim_id, round } => {
                self.expire_claim(*claim_id, *round, cx)?
            }
            AutoAction::ExpireApproval { approval_id } => {
                self.expire_approval(*approval_id, cx)?
            }
        }
        Ok(DeadlineOutcome::Fired)
    }

    /// Re-arm a failed deadline, or clear a claim whose executor died.
    pub(crate) fn reactivate_deadline(
        &mut self,
        id: DeadlineId,
        due_at: Option<DateTime<Utc>>,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        if self.status == EscrowStatus::Closed {
            return Err(EscrowError::conflict(self.id, "escrow is closed"));
        }
        let escrow_id = self.id;
        let d = self
            .deadlines
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| EscrowError::not_found("deadline", id))?;
        let failed = d.status == DeadlineStatus::Completed && d.last_error.is_some();
        let stuck = d.is_active() && d.claimed_by.is_some() && d.triggered_at.is_none();
        if !failed && !stuck {
            return Err(EscrowError::conflict(
                escrow_id,
                format!("{id} is neither failed nor stuck in a claim"),
            ));
        }
        d.status = DeadlineStatus::Active;
        d.claimed_by = None;
        d.triggered_at = None;
        d.last_error = None;
        if due_at.is_some() {
            d.due_at = due_at;
        }
        let due_at = d.due_at;
        self.audit(
            cx,
            AuditEvent::DeadlineReactivated {
                deadline_id: id,
                due_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use rentvault_core::days;

    #[test]
    fn placeholder_is_never_due() {
        let mut escrow = active();
        let id = escrow.schedule_deadline(
            DeadlineKind::ReleaseRule,
            None,
            AutoAction::ReleaseRule {
                rule_id: RuleId::new(),
            },
            t0(),
        );
        assert!(!escrow.deadline(id).unwrap().is_due(t0() + days(10_000)));
    }

    #[test]
    fn only_one_sweeper_can_claim() {
        let mut escrow = release_pending();
        let now = t0() + days(15);
        let id = claim_window_deadline(&escrow);
        let (a, b) = (SweeperId::new(), SweeperId::new());
        assert!(escrow.claim_deadline(id, a, &mut cx_system(now)));
        assert!(!escrow.claim_deadline(id, b, &mut cx_system(now)));
        assert!(escrow.execute_deadline(id, b, &mut cx_system(now)).is_none());

        let mut cx = cx_system(now);
        let processed = escrow.execute_deadline(id, a, &mut cx).unwrap();
        assert_eq!(processed.outcome, DeadlineOutcome::Fired);
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert!(escrow.execute_deadline(id, a, &mut cx_system(now)).is_none());
        assert_eq!(escrow.deadline(id).unwrap().status, DeadlineStatus::Completed);
    }

    #[test]
    fn failed_action_leaves_escrow_unchanged() {
        let mut escrow = release_pending();
        let now = t0() + days(15);
        let id = claim_window_deadline(&escrow);
        let sweeper = SweeperId::new();
        assert!(escrow.claim_deadline(id, sweeper, &mut cx_system(now)));
        // A status the action cannot run from.
        escrow.status = EscrowStatus::Closed;
        let before = escrow.clone();

        let mut cx = cx_system(now);
        let processed = escrow.execute_deadline(id, sweeper, &mut cx).unwrap();
        assert!(matches!(processed.outcome, DeadlineOutcome::Failed(_)));
        assert_eq!(escrow.transactions, before.transactions);
        assert_eq!(escrow.status, EscrowStatus::Closed);
        let d = escrow.deadline(id).unwrap();
        assert_eq!(d.status, DeadlineStatus::Completed);
        assert!(d.last_error.is_some());
        assert!(matches!(
            cx.events()[0].event,
            AuditEvent::DeadlineFailed { .. }
        ));
    }

    #[test]
    fn reactivation_requires_failure_or_stuck_claim() {
        let mut escrow = release_pending();
        let now = t0() + days(15);
        let id = claim_window_deadline(&escrow);
        let err = escrow
            .reactivate_deadline(id, None, &mut cx_system(now))
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));

        assert!(escrow.claim_deadline(id, SweeperId::new(), &mut cx_system(now)));
        escrow
            .reactivate_deadline(id, Some(now + days(1)), &mut cx_system(now))
            .unwrap();
        let d = escrow.deadline(id).unwrap();
        assert!(d.claimed_by.is_none());
        assert_eq!(d.due_at, Some(now + days(1)));
        assert!(!d.is_due(now));
        assert!(d.is_due(now + days(1)));
    }

    #[test]
    fn cancel_skips_claimed_deadline() {
        let mut escrow = release_pending();
        let now = t0() + days(15);
        let id = claim_window_deadline(&escrow);
        assert!(escrow.claim_deadline(id, SweeperId::new(), &mut cx_system(now)));
        assert!(!escrow.cancel_deadline(id));
        assert!(escrow.deadline(id).unwrap().is_active());
    }
}
