//! # Release Rule Engine
//!
//! At funding, one [`ReleaseRule`] is materialized per non-zero component,
//! each paired with the deadlines that drive it. Rules are evaluated only by
//! the sweeper (or, for MANUAL rules, through a counterparty approval).
//!
//! | Trigger         | Fires at               | Notice  | Objection window       |
//! |-----------------|------------------------|---------|------------------------|
//! | `LEASE_END`     | lease end              | 7 days  | claim window length    |
//! | `MOVE_IN_PLUS_5`| lease start + 5 days   | none    | 5 days                 |
//! | `SPECIFIC_DATE` | the given date         | 3 days  | response window length |
//! | `START_DATE`    | lease start            | none    | none                   |
//! | `MANUAL`        | on approved request    | none    | approval instead       |
//!
//! The deposit rule is different: its deadline starts the claim window
//! (`START_CLAIM_WINDOW` at trigger + `auto_release_days`) instead of
//! paying out, and objections to it are raised as claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentvault_core::{
    days, Amount, ApprovalId, BasisPoints, DeadlineId, PartyId, RuleId, TransactionId,
    ValidationError,
};

use crate::audit::AuditEvent;
use crate::changeset::Changeset;
use crate::collaborators::NotificationKind;
use crate::deadline::{AutoAction, DeadlineKind};
use crate::escrow::{validate_text, Escrow, EscrowConfig, LeaseTerms, PartyRole};
use crate::error::{EscrowError, LimitKind};
use crate::status::Operation;
use crate::transaction::{Approval, ApprovalStatus, Outflow, TransactionStatus, TransactionType};

const LEASE_END_NOTICE_DAYS: u32 = 7;
const SPECIFIC_DATE_NOTICE_DAYS: u32 = 3;
const MOVE_IN_DELAY_DAYS: u32 = 5;
const MOVE_IN_OBJECTION_DAYS: u32 = 5;
const MAX_NOTICE_DAYS: u32 = 90;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A held component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    /// Security deposit.
    Deposit,
    /// First month's rent.
    FirstMonth,
    /// Prepaid rent.
    Prepaid,
    /// Utilities.
    Utilities,
}

impl Component {
    /// Every component.
    pub const ALL: [Component; 4] = [
        Self::Deposit,
        Self::FirstMonth,
        Self::Prepaid,
        Self::Utilities,
    ];
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Deposit => "deposit",
            Self::FirstMonth => "first month",
            Self::Prepaid => "prepaid rent",
            Self::Utilities => "utilities",
        })
    }
}

/// The trigger kind recorded on a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// An explicit date.
    SpecificDate,
    /// Lease start.
    StartDate,
    /// Lease end.
    LeaseEnd,
    /// Lease start plus five days.
    MoveInPlus5,
    /// On an approved request.
    Manual,
}

/// A component's trigger as declared in the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", content = "date", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseTrigger {
    /// Fire at the given instant.
    SpecificDate(DateTime<Utc>),
    /// Fire at lease start.
    StartDate,
    /// Fire at lease end.
    LeaseEnd,
    /// Fire five days after lease start.
    MoveInPlus5,
    /// Release on an approved request.
    Manual,
}

impl ReleaseTrigger {
    /// The recorded trigger kind.
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::SpecificDate(_) => TriggerType::SpecificDate,
            Self::StartDate => TriggerType::StartDate,
            Self::LeaseEnd => TriggerType::LeaseEnd,
            Self::MoveInPlus5 => TriggerType::MoveInPlus5,
            Self::Manual => TriggerType::Manual,
        }
    }

    /// The firing instant, if it can be known from the lease.
    pub fn resolve(&self, lease: &LeaseTerms) -> Option<DateTime<Utc>> {
        match self {
            Self::SpecificDate(at) => Some(*at),
            Self::StartDate => Some(lease.start_date),
            Self::LeaseEnd => lease.end_date,
            Self::MoveInPlus5 => Some(lease.start_date + days(MOVE_IN_DELAY_DAYS)),
            Self::Manual => None,
        }
    }
}

/// Trigger per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePlan {
    /// Deposit trigger.
    pub deposit: ReleaseTrigger,
    /// First month trigger.
    pub first_month: ReleaseTrigger,
    /// Prepaid rent trigger.
    pub prepaid: ReleaseTrigger,
    /// Utilities trigger.
    pub utilities: ReleaseTrigger,
}

impl Default for ReleasePlan {
    fn default() -> Self {
        Self {
            deposit: ReleaseTrigger::LeaseEnd,
            first_month: ReleaseTrigger::StartDate,
            prepaid: ReleaseTrigger::MoveInPlus5,
            utilities: ReleaseTrigger::Manual,
        }
    }
}

impl ReleasePlan {
    /// The trigger for `component`.
    pub fn trigger_for(&self, component: Component) -> ReleaseTrigger {
        match component {
            Component::Deposit => self.deposit,
            Component::FirstMonth => self.first_month,
            Component::Prepaid => self.prepaid,
            Component::Utilities => self.utilities,
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// How much a rule releases. Exactly one of fixed or percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleAmount {
    /// A fixed amount.
    Fixed(Amount),
    /// A share of the component.
    Percentage(BasisPoints),
}

/// Rule lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    /// Scheduled or awaiting objection/approval.
    Active,
    /// Released (or, for the deposit, handed to the claim window).
    Completed,
    /// Objected to or voided.
    Cancelled,
}

/// An instruction to release one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRule {
    /// Identity.
    pub id: RuleId,
    /// The component released.
    pub component: Component,
    /// Trigger kind.
    pub trigger_type: TriggerType,
    /// Firing instant; `None` until known.
    pub trigger_date: Option<DateTime<Utc>>,
    /// How much.
    pub amount: RuleAmount,
    /// Whether parties get advance notice.
    pub requires_notification: bool,
    /// Days of notice.
    pub notification_days_before: u32,
    /// Whether the tenant may object once it fires.
    pub allow_objection: bool,
    /// Objection window length.
    pub objection_period_days: u32,
    /// Lifecycle.
    pub status: RuleStatus,
    /// The trigger deadline.
    pub deadline_id: Option<DeadlineId>,
    /// The NOTIFY deadline.
    pub notification_deadline_id: Option<DeadlineId>,
    /// A PENDING release awaiting objection or approval.
    pub pending_transaction: Option<TransactionId>,
    /// End of the running objection window.
    pub objection_deadline: Option<DateTime<Utc>>,
    /// The OBJECTION_WINDOW deadline.
    pub objection_deadline_id: Option<DeadlineId>,
    /// Materialization time.
    pub created_at: DateTime<Utc>,
}

/// A manual change to a scheduled rule. Absent fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleUpdate {
    /// New firing instant.
    #[serde(default)]
    pub trigger_date: Option<DateTime<Utc>>,
    /// New amount.
    #[serde(default)]
    pub amount: Option<RuleAmount>,
    /// Toggle advance notice.
    #[serde(default)]
    pub requires_notification: Option<bool>,
    /// New notice length.
    #[serde(default)]
    pub notification_days_before: Option<u32>,
}

impl RuleUpdate {
    fn is_empty(&self) -> bool {
        self.trigger_date.is_none()
            && self.amount.is_none()
            && self.requires_notification.is_none()
            && self.notification_days_before.is_none()
    }
}

struct TriggerParameters {
    requires_notification: bool,
    notification_days_before: u32,
    allow_objection: bool,
    objection_period_days: u32,
}

fn trigger_parameters(
    component: Component,
    trigger: TriggerType,
    config: &EscrowConfig,
) -> TriggerParameters {
    let (requires_notification, notification_days_before, allow_objection, objection_period_days) =
        match trigger {
            TriggerType::LeaseEnd => (true, LEASE_END_NOTICE_DAYS, true, config.claim_window_days),
            TriggerType::MoveInPlus5 => (false, 0, true, MOVE_IN_OBJECTION_DAYS),
            TriggerType::SpecificDate => (
                true,
                SPECIFIC_DATE_NOTICE_DAYS,
                true,
                config.response_window_days,
            ),
            TriggerType::StartDate | TriggerType::Manual => (false, 0, false, 0),
        };
    // Deposit objections go through the claim protocol.
    let allow_objection = allow_objection && component != Component::Deposit;
    TriggerParameters {
        requires_notification,
        notification_days_before,
        allow_objection,
        objection_period_days: if allow_objection { objection_period_days } else { 0 },
    }
}

impl Escrow {
    /// Look up a rule.
    pub fn release_rule(&self, id: RuleId) -> Option<&ReleaseRule> {
        self.release_rules.iter().find(|r| r.id == id)
    }

    /// The held amount of `component`.
    pub fn component_amount(&self, component: Component) -> Amount {
        match component {
            Component::Deposit => self.amounts.deposit,
            Component::FirstMonth => self.amounts.first_month,
            Component::Prepaid => self.amounts.prepaid,
            Component::Utilities => self.amounts.utilities,
        }
    }

    /// What `rule` releases.
    pub fn rule_amount(&self, rule: &ReleaseRule) -> Amount {
        let component = self.component_amount(rule.component);
        match rule.amount {
            RuleAmount::Fixed(a) => a.min(component),
            RuleAmount::Percentage(bp) => component.percentage(bp),
        }
    }

    fn rule_index(&self, id: RuleId) -> Result<usize, EscrowError> {
        self.release_rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| EscrowError::not_found("release rule", id))
    }

    /// Create rules and deadlines at funding time.
    pub(crate) fn materialize_release_rules(
        &mut self,
        cx: &mut Changeset,
    ) -> Result<Vec<RuleId>, EscrowError> {
        let now = cx.now();
        let mut ids = Vec::new();
        for component in Component::ALL {
            let amount = self.component_amount(component);
            if amount.is_zero() {
                continue;
            }
            let trigger = self.release_plan.trigger_for(component);
            let trigger_type = trigger.trigger_type();
            let params = trigger_parameters(component, trigger_type, &self.config);
            let rule = ReleaseRule {
                id: RuleId::new(),
                component,
                trigger_type,
                trigger_date: trigger.resolve(&self.lease),
                amount: RuleAmount::Fixed(amount),
                requires_notification: params.requires_notification,
                notification_days_before: params.notification_days_before,
                allow_objection: params.allow_objection,
                objection_period_days: params.objection_period_days,
                status: RuleStatus::Active,
                deadline_id: None,
                notification_deadline_id: None,
                pending_transaction: None,
                objection_deadline: None,
                objection_deadline_id: None,
                created_at: now,
            };
            ids.push(rule.id);
            self.release_rules.push(rule);
            self.schedule_rule(self.release_rules.len() - 1, now);
        }
        Ok(ids)
    }

    fn schedule_rule(&mut self, idx: usize, now: DateTime<Utc>) {
        let rule = &self.release_rules[idx];
        if rule.trigger_type == TriggerType::Manual {
            return;
        }
        let rule_id = rule.id;
        let (kind, action, due) = if rule.component == Component::Deposit {
            (
                DeadlineKind::ClaimWindow,
                AutoAction::StartClaimWindow { rule_id },
                rule.trigger_date
                    .map(|d| d + days(self.config.auto_release_days)),
            )
        } else {
            (
                DeadlineKind::ReleaseRule,
                AutoAction::ReleaseRule { rule_id },
                rule.trigger_date,
            )
        };
        let notice_due = match (rule.requires_notification, rule.trigger_date) {
            (true, Some(at)) => Some(at - days(rule.notification_days_before)),
            _ => None,
        };

        let deadline_id = self.schedule_deadline(kind, due, action, now);
        let notification_deadline_id = notice_due.map(|due| {
            self.schedule_deadline(
                DeadlineKind::Notify,
                Some(due),
                AutoAction::Notify { rule_id },
                now,
            )
        });
        let rule = &mut self.release_rules[idx];
        rule.deadline_id = Some(deadline_id);
        rule.notification_deadline_id = notification_deadline_id;
    }

    fn unschedule_rule(&mut self, idx: usize) {
        let rule = &self.release_rules[idx];
        let ids = [rule.deadline_id, rule.notification_deadline_id];
        for id in ids.into_iter().flatten() {
            self.cancel_deadline(id);
        }
    }

    /// Hand the deposit over to the claim window.
    pub(crate) fn retire_deposit_rule(&mut self) {
        let Some(idx) = self
            .release_rules
            .iter()
            .position(|r| r.component == Component::Deposit && r.status == RuleStatus::Active)
        else {
            return;
        };
        self.unschedule_rule(idx);
        self.release_rules[idx].status = RuleStatus::Completed;
    }

    // ── Manual updates ──────────────────────────────────────────────────

    pub(crate) fn update_release_rule(
        &mut self,
        party: &PartyId,
        rule_id: RuleId,
        update: RuleUpdate,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::UpdateReleaseRule)?;
        self.require_party(Operation::UpdateReleaseRule, party)?;
        let now = cx.now();
        let idx = self.rule_index(rule_id)?;
        if update.is_empty() {
            return Err(ValidationError::MissingField("release rule update").into());
        }

        let rule = &self.release_rules[idx];
        if rule.status != RuleStatus::Active || rule.pending_transaction.is_some() {
            return Err(EscrowError::conflict(
                self.id,
                format!("{rule_id} is no longer schedulable"),
            ));
        }
        if let Some(deadline) = rule.deadline_id.and_then(|id| self.deadline(id)) {
            if !deadline.is_active() || deadline.claimed_by.is_some() {
                return Err(EscrowError::conflict(
                    self.id,
                    format!("{rule_id} is already firing"),
                ));
            }
            if let Some(due) = deadline.due_at.filter(|due| *due <= now) {
                return Err(EscrowError::WindowClosed {
                    escrow_id: self.id,
                    window: "release rule deadline",
                    closed_at: due,
                });
            }
        }
        if let Some(date) = update.trigger_date {
            if rule.trigger_type == TriggerType::Manual {
                return Err(EscrowError::conflict(
                    self.id,
                    format!("{rule_id} is manual and has no trigger date"),
                ));
            }
            if date <= now {
                return Err(EscrowError::conflict(
                    self.id,
                    format!("trigger date {date} is not in the future"),
                ));
            }
        }
        if let Some(amount) = update.amount {
            if rule.component == Component::Deposit {
                return Err(EscrowError::conflict(
                    self.id,
                    "the deposit amount is settled through claims",
                ));
            }
            let component = self.component_amount(rule.component);
            match amount {
                RuleAmount::Fixed(a) if a.is_zero() => {
                    return Err(ValidationError::ZeroAmount("rule amount").into())
                }
                RuleAmount::Fixed(a) if a > component => {
                    return Err(EscrowError::LimitExceeded {
                        escrow_id: self.id,
                        limit: LimitKind::ComponentAmount,
                        requested: a.minor_units(),
                        available: component.minor_units(),
                    })
                }
                RuleAmount::Percentage(bp) if bp.get() == 0 => {
                    return Err(ValidationError::ZeroAmount("rule percentage").into())
                }
                _ => {}
            }
        }
        if let Some(n) = update.notification_days_before {
            if n > MAX_NOTICE_DAYS {
                return Err(ValidationError::InvalidWindow {
                    field: "notification_days_before",
                    value: n,
                    reason: "above maximum",
                }
                .into());
            }
        }

        self.unschedule_rule(idx);
        let rule = &mut self.release_rules[idx];
        if let Some(date) = update.trigger_date {
            rule.trigger_date = Some(date);
        }
        if let Some(amount) = update.amount {
            rule.amount = amount;
        }
        if let Some(flag) = update.requires_notification {
            rule.requires_notification = flag;
        }
        if let Some(n) = update.notification_days_before {
            rule.notification_days_before = n;
        }
        let (trigger_date, amount) = (rule.trigger_date, rule.amount);
        self.schedule_rule(idx, now);

        self.audit(
            cx,
            AuditEvent::ReleaseRuleUpdated {
                rule_id,
                trigger_date,
                amount,
            },
        );
        Ok(())
    }

    // ── Firing ──────────────────────────────────────────────────────────

    /// Fire a non-deposit rule: pay out, or open its objection window.
    pub(crate) fn fire_release_rule(
        &mut self,
        rule_id: RuleId,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::ExecuteRelease)?;
        let now = cx.now();
        let idx = self.rule_index(rule_id)?;
        let rule = &self.release_rules[idx];
        if rule.status != RuleStatus::Active
            || rule.component == Component::Deposit
            || rule.pending_transaction.is_some()
        {
            return Err(EscrowError::conflict(
                self.id,
                format!("{rule_id} cannot fire"),
            ));
        }
        let amount = self.rule_amount(rule);
        let (allow_objection, objection_days) = (rule.allow_objection, rule.objection_period_days);

        if amount.is_zero() {
            self.release_rules[idx].status = RuleStatus::Completed;
            self.audit(
                cx,
                AuditEvent::ReleaseExecuted {
                    rule_id,
                    transaction_id: None,
                    amount,
                },
            );
            return Ok(());
        }

        let outflow = Outflow {
            transaction_type: TransactionType::Release,
            amount,
            beneficiary: self.landlord_id.clone(),
            rule_id: Some(rule_id),
            claim_id: None,
        };
        if allow_objection {
            let transaction_id = self.post_outflow(outflow, TransactionStatus::Pending, cx)?;
            let ends = now + days(objection_days);
            let deadline_id = self.schedule_deadline(
                DeadlineKind::ObjectionWindow,
                Some(ends),
                AutoAction::CompleteRelease {
                    rule_id,
                    transaction_id,
                },
                now,
            );
            let rule = &mut self.release_rules[idx];
            rule.pending_transaction = Some(transaction_id);
            rule.objection_deadline = Some(ends);
            rule.objection_deadline_id = Some(deadline_id);
            self.notify(
                cx,
                vec![self.tenant_id.clone()],
                NotificationKind::ReleaseScheduled,
                format!("{amount} will be released to the landlord unless you object by {ends}"),
            );
            self.audit(
                cx,
                AuditEvent::ReleaseScheduled {
                    rule_id,
                    transaction_id,
                    amount,
                    objection_deadline: ends,
                },
            );
        } else {
            let transaction_id = self.post_outflow(outflow, TransactionStatus::Completed, cx)?;
            self.release_rules[idx].status = RuleStatus::Completed;
            self.notify(
                cx,
                self.both_parties(),
                NotificationKind::FundsReleased,
                format!("{amount} released to the landlord"),
            );
            self.audit(
                cx,
                AuditEvent::ReleaseExecuted {
                    rule_id,
                    transaction_id: Some(transaction_id),
                    amount,
                },
            );
        }
        Ok(())
    }

    /// Complete a release whose objection window passed in silence.
    pub(crate) fn complete_release(
        &mut self,
        rule_id: RuleId,
        transaction_id: TransactionId,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::ExecuteRelease)?;
        let idx = self.rule_index(rule_id)?;
        let rule = &self.release_rules[idx];
        if rule.status != RuleStatus::Active || rule.pending_transaction != Some(transaction_id) {
            return Err(EscrowError::conflict(
                self.id,
                format!("{rule_id} no longer awaits {transaction_id}"),
            ));
        }
        let amount = self.complete_transaction(transaction_id, cx)?;
        let rule = &mut self.release_rules[idx];
        rule.status = RuleStatus::Completed;
        rule.pending_transaction = None;
        self.notify(
            cx,
            self.both_parties(),
            NotificationKind::FundsReleased,
            format!("{amount} released to the landlord"),
        );
        self.audit(
            cx,
            AuditEvent::ReleaseExecuted {
                rule_id,
                transaction_id: Some(transaction_id),
                amount,
            },
        );
        Ok(())
    }

    /// Tenant objection inside the objection window.
    pub(crate) fn object_to_release(
        &mut self,
        party: &PartyId,
        rule_id: RuleId,
        reason: String,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::ObjectToRelease)?;
        if self.require_party(Operation::ObjectToRelease, party)? != PartyRole::Tenant {
            return Err(EscrowError::NotEligible {
                escrow_id: self.id,
                operation: Operation::ObjectToRelease,
                actor: party.to_string(),
                reason: "only the tenant may object to a release".to_string(),
            });
        }
        let reason = validate_text("objection reason", reason)?;
        let now = cx.now();
        let idx = self.rule_index(rule_id)?;
        let rule = &self.release_rules[idx];
        let (Some(transaction_id), Some(ends)) = (rule.pending_transaction, rule.objection_deadline)
        else {
            return Err(EscrowError::conflict(
                self.id,
                format!("{rule_id} has no release awaiting objection"),
            ));
        };
        if rule.status != RuleStatus::Active {
            return Err(EscrowError::conflict(self.id, format!("{rule_id} is not active")));
        }
        if now >= ends {
            return Err(EscrowError::WindowClosed {
                escrow_id: self.id,
                window: "objection window",
                closed_at: ends,
            });
        }
        let objection_deadline_id = rule.objection_deadline_id;

        self.fail_transaction(transaction_id, now)?;
        if let Some(id) = objection_deadline_id {
            self.cancel_deadline(id);
        }
        let rule = &mut self.release_rules[idx];
        rule.status = RuleStatus::Cancelled;
        rule.pending_transaction = None;
        let component = rule.component;
        self.notify(
            cx,
            vec![self.landlord_id.clone()],
            NotificationKind::ReleaseScheduled,
            format!("the tenant objected to the {component} release"),
        );
        self.audit(
            cx,
            AuditEvent::ReleaseObjected {
                rule_id,
                transaction_id,
                reason,
            },
        );
        Ok(())
    }

    /// Advance notice of a scheduled release.
    pub(crate) fn notify_upcoming_release(
        &mut self,
        rule_id: RuleId,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        let idx = self.rule_index(rule_id)?;
        let rule = &self.release_rules[idx];
        if rule.status != RuleStatus::Active {
            return Err(EscrowError::conflict(self.id, format!("{rule_id} is not active")));
        }
        let message = match rule.trigger_date {
            Some(at) => format!("the {} release is scheduled for {at}", rule.component),
            None => format!("the {} release is upcoming", rule.component),
        };
        self.notify(cx, self.both_parties(), NotificationKind::ReleaseUpcoming, message);
        self.audit(cx, AuditEvent::ReleaseNotified { rule_id });
        Ok(())
    }

    // ── Manual releases ─────────────────────────────────────────────────

    pub(crate) fn trigger_manual_release(
        &mut self,
        party: &PartyId,
        rule_id: RuleId,
        cx: &mut Changeset,
    ) -> Result<ApprovalId, EscrowError> {
        self.require(Operation::TriggerManualRelease)?;
        let role = self.require_party(Operation::TriggerManualRelease, party)?;
        let now = cx.now();
        let idx = self.rule_index(rule_id)?;
        let rule = &self.release_rules[idx];
        if rule.status != RuleStatus::Active
            || rule.trigger_type != TriggerType::Manual
            || rule.component == Component::Deposit
            || rule.pending_transaction.is_some()
        {
            return Err(EscrowError::conflict(
                self.id,
                format!("{rule_id} is not an idle manual release rule"),
            ));
        }
        let amount = self.rule_amount(rule);
        if amount.is_zero() {
            return Err(ValidationError::ZeroAmount("release amount").into());
        }

        let transaction_id = self.post_outflow(
            Outflow {
                transaction_type: TransactionType::Release,
                amount,
                beneficiary: self.landlord_id.clone(),
                rule_id: Some(rule_id),
                claim_id: None,
            },
            TransactionStatus::Pending,
            cx,
        )?;
        let approval_id = ApprovalId::new();
        let deadline = now + days(self.config.response_window_days);
        let deadline_id = self.schedule_deadline(
            DeadlineKind::ApprovalExpiry,
            Some(deadline),
            AutoAction::ExpireApproval { approval_id },
            now,
        );
        let approver = self.party(role.other()).clone();
        self.approvals.push(Approval {
            id: approval_id,
            rule_id,
            transaction_id,
            requested_by: party.clone(),
            approver: approver.clone(),
            status: ApprovalStatus::Pending,
            deadline,
            deadline_id,
            requested_at: now,
            resolved_at: None,
        });
        self.release_rules[idx].pending_transaction = Some(transaction_id);

        self.notify(
            cx,
            vec![approver],
            NotificationKind::ApprovalRequested,
            format!("approve the release of {amount} by {deadline}"),
        );
        self.audit(
            cx,
            AuditEvent::ManualReleaseRequested {
                rule_id,
                approval_id,
                transaction_id,
                amount,
                deadline,
            },
        );
        Ok(approval_id)
    }

    pub(crate) fn respond_to_approval(
        &mut self,
        party: &PartyId,
        approval_id: ApprovalId,
        approve: bool,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::RespondToApproval)?;
        self.require_party(Operation::RespondToApproval, party)?;
        let now = cx.now();
        let aidx = self
            .approvals
            .iter()
            .position(|a| a.id == approval_id)
            .ok_or_else(|| EscrowError::not_found("approval", approval_id))?;
        let approval = &self.approvals[aidx];
        if approval.status != ApprovalStatus::Pending {
            return Err(EscrowError::conflict(
                self.id,
                format!("{approval_id} is already {:?}", approval.status),
            ));
        }
        if approval.approver != *party {
            return Err(EscrowError::NotEligible {
                escrow_id: self.id,
                operation: Operation::RespondToApproval,
                actor: party.to_string(),
                reason: format!("{approval_id} awaits {}", approval.approver),
            });
        }
        if now >= approval.deadline {
            return Err(EscrowError::WindowClosed {
                escrow_id: self.id,
                window: "approval window",
                closed_at: approval.deadline,
            });
        }
        let (rule_id, transaction_id, deadline_id) =
            (approval.rule_id, approval.transaction_id, approval.deadline_id);
        let requester = approval.requested_by.clone();
        let ridx = self.rule_index(rule_id)?;

        let status = if approve {
            self.complete_transaction(transaction_id, cx)?;
            self.release_rules[ridx].status = RuleStatus::Completed;
            ApprovalStatus::Approved
        } else {
            self.fail_transaction(transaction_id, now)?;
            ApprovalStatus::Rejected
        };
        self.release_rules[ridx].pending_transaction = None;
        let approval = &mut self.approvals[aidx];
        approval.status = status;
        approval.resolved_at = Some(now);
        self.cancel_deadline(deadline_id);

        self.notify(
            cx,
            vec![requester],
            NotificationKind::ApprovalResolved,
            format!("{approval_id} was {status:?}"),
        );
        self.audit(
            cx,
            AuditEvent::ApprovalResponded {
                approval_id,
                approved: approve,
            },
        );
        Ok(())
    }

    /// Silent expiry of an approval request. Runs from the sweeper.
    pub(crate) fn expire_approval(
        &mut self,
        approval_id: ApprovalId,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        let now = cx.now();
        let aidx = self
            .approvals
            .iter()
            .position(|a| a.id == approval_id)
            .ok_or_else(|| EscrowError::not_found("approval", approval_id))?;
        let approval = &self.approvals[aidx];
        if approval.status != ApprovalStatus::Pending {
            return Err(EscrowError::conflict(
                self.id,
                format!("{approval_id} is already {:?}", approval.status),
            ));
        }
        let (rule_id, transaction_id) = (approval.rule_id, approval.transaction_id);
        let requester = approval.requested_by.clone();

        self.fail_transaction(transaction_id, now)?;
        let ridx = self.rule_index(rule_id)?;
        self.release_rules[ridx].pending_transaction = None;
        let approval = &mut self.approvals[aidx];
        approval.status = ApprovalStatus::Expired;
        approval.resolved_at = Some(now);

        self.notify(
            cx,
            vec![requester],
            NotificationKind::ApprovalResolved,
            format!("{approval_id} expired without an answer"),
        );
        self.audit(cx, AuditEvent::ApprovalExpired { approval_id });
        Ok(())
    }
}
