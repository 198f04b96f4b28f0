//! # Escrow Aggregate
//!
//! [`Escrow`] owns everything that is locked together: contract snapshots,
//! release rules, transactions, approvals, claims, deadlines and disputes.
//! Its lifecycle methods take a [`Changeset`] and mutate `self` in place; the
//! engine runs them against a private copy and commits the copy only if the
//! stored version is unchanged.
//!
//! Methods here cover drafting, signing, funding, move-out and closure. The
//! claim protocol lives in [`crate::claim`], rule scheduling in
//! [`crate::release`], dispute handling in [`crate::dispute`] and the money
//! ledger in [`crate::transaction`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentvault_core::{
    days, sha256_digest, Amount, CanonicalBytes, ContentDigest, EscrowId, PartyId,
    ValidationError,
};

use crate::audit::AuditEvent;
use crate::changeset::Changeset;
use crate::claim::Claim;
use crate::collaborators::{Notification, NotificationKind};
use crate::deadline::{AutoAction, Deadline, DeadlineKind};
use crate::dispute::Dispute;
use crate::error::EscrowError;
use crate::release::{ReleasePlan, ReleaseRule, RuleStatus};
use crate::status::{EscrowStatus, Operation};
use crate::transaction::{Approval, Transaction, TransactionStatus};

const MAX_PROPERTY_REF_LEN: usize = 500;
pub(crate) const MAX_TEXT_LEN: usize = 2_000;

// ---------------------------------------------------------------------------
// Parties and actors
// ---------------------------------------------------------------------------

/// The two sides of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyRole {
    /// Owns the property and receives deductions and rent.
    Landlord,
    /// Pays the deposit and receives the remainder.
    Tenant,
}

impl PartyRole {
    /// The other side.
    pub fn other(&self) -> PartyRole {
        match self {
            Self::Landlord => Self::Tenant,
            Self::Tenant => Self::Landlord,
        }
    }
}

/// Who performed an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "party", rename_all = "snake_case")]
pub enum Actor {
    /// A landlord or tenant.
    Party(PartyId),
    /// The engine itself: sweeper actions and external arbitration.
    System,
}

impl Actor {
    /// The acting party, if any.
    pub fn party(&self) -> Option<&PartyId> {
        match self {
            Self::Party(p) => Some(p),
            Self::System => None,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Party(p) => write!(f, "party {p}"),
            Self::System => f.write_str("system"),
        }
    }
}

/// The role recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRole {
    /// The landlord acted.
    Landlord,
    /// The tenant acted.
    Tenant,
    /// The engine acted.
    System,
}

impl From<PartyRole> for ActorRole {
    fn from(role: PartyRole) -> Self {
        match role {
            PartyRole::Landlord => Self::Landlord,
            PartyRole::Tenant => Self::Tenant,
        }
    }
}

// ---------------------------------------------------------------------------
// Terms
// ---------------------------------------------------------------------------

/// The four held components. `total` is always their checked sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonetaryBreakdown {
    /// Security deposit, governed by the claim protocol.
    pub deposit: Amount,
    /// First month's rent.
    pub first_month: Amount,
    /// Rent paid in advance.
    pub prepaid: Amount,
    /// Utilities held for the landlord.
    pub utilities: Amount,
}

impl MonetaryBreakdown {
    /// Sum of all components.
    pub fn total(&self) -> Result<Amount, ValidationError> {
        Amount::checked_sum(
            [self.deposit, self.first_month, self.prepaid, self.utilities],
            "total amount",
        )
    }
}

/// Per-escrow windows. Frozen once the escrow leaves DRAFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Days after move-out during which claims may be raised.
    pub claim_window_days: u32,
    /// Days a party has to respond to a claim or approval request.
    pub response_window_days: u32,
    /// Days after the deposit trigger before the claim window opens itself.
    pub auto_release_days: u32,
    /// Counter-offers allowed per claim before it is forced into dispute.
    pub settlement_rounds: u32,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            claim_window_days: 14,
            response_window_days: 7,
            auto_release_days: 0,
            settlement_rounds: 3,
        }
    }
}

impl EscrowConfig {
    /// Check every window against its permitted range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("claim_window_days", self.claim_window_days, 1, 365)?;
        check_range("response_window_days", self.response_window_days, 1, 90)?;
        check_range("auto_release_days", self.auto_release_days, 0, 365)?;
        check_range("settlement_rounds", self.settlement_rounds, 0, 20)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), ValidationError> {
    if value < min {
        return Err(ValidationError::InvalidWindow {
            field,
            value,
            reason: "below minimum",
        });
    }
    if value > max {
        return Err(ValidationError::InvalidWindow {
            field,
            value,
            reason: "above maximum",
        });
    }
    Ok(())
}

/// Lease dates. The end date may be unknown at drafting time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTerms {
    /// Move-in.
    pub start_date: DateTime<Utc>,
    /// Lease end, if fixed.
    pub end_date: Option<DateTime<Utc>>,
}

impl LeaseTerms {
    /// The end date, when known, must fall after the start.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.end_date {
            Some(end) if end <= self.start_date => Err(ValidationError::InvalidLeaseDates {
                start: self.start_date.to_rfc3339(),
                end: end.to_rfc3339(),
            }),
            _ => Ok(()),
        }
    }
}

/// Input to `create_escrow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEscrow {
    /// The party creating the draft; must be the landlord or the tenant.
    pub created_by: PartyId,
    /// Landlord reference.
    pub landlord_id: PartyId,
    /// Tenant reference.
    pub tenant_id: PartyId,
    /// Held amounts.
    pub amounts: MonetaryBreakdown,
    /// Opaque property reference.
    pub property_ref: String,
    /// Windows; `None` takes the engine default.
    #[serde(default)]
    pub config: Option<EscrowConfig>,
    /// Lease dates.
    pub lease: LeaseTerms,
    /// Trigger per component.
    #[serde(default)]
    pub release_plan: ReleasePlan,
}

/// A partial replacement of draft terms. Absent fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermsAmendment {
    /// New amounts.
    #[serde(default)]
    pub amounts: Option<MonetaryBreakdown>,
    /// New windows.
    #[serde(default)]
    pub config: Option<EscrowConfig>,
    /// New lease dates.
    #[serde(default)]
    pub lease: Option<LeaseTerms>,
    /// New release plan.
    #[serde(default)]
    pub release_plan: Option<ReleasePlan>,
    /// New property reference.
    #[serde(default)]
    pub property_ref: Option<String>,
}

impl TermsAmendment {
    fn is_empty(&self) -> bool {
        self.amounts.is_none()
            && self.config.is_none()
            && self.lease.is_none()
            && self.release_plan.is_none()
            && self.property_ref.is_none()
    }
}

/// The signed content of one contract version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTerms {
    /// Version these terms belong to.
    pub terms_version: u32,
    /// Landlord reference.
    pub landlord_id: PartyId,
    /// Tenant reference.
    pub tenant_id: PartyId,
    /// Property reference.
    pub property_ref: String,
    /// Held amounts.
    pub amounts: MonetaryBreakdown,
    /// Checked sum of `amounts`.
    pub total_amount: Amount,
    /// Windows.
    pub config: EscrowConfig,
    /// Lease dates.
    pub lease: LeaseTerms,
    /// Trigger per component.
    pub release_plan: ReleasePlan,
}

/// Immutable terms of one contract version plus its signatures.
///
/// The terms and their hash never change. Each signature slot is written at
/// most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSnapshot {
    /// Contract version.
    pub terms_version: u32,
    /// The terms.
    pub terms: ContractTerms,
    /// SHA-256 over the canonical JSON of `terms`.
    pub content_hash: ContentDigest,
    /// When the landlord signed.
    pub landlord_signed_at: Option<DateTime<Utc>>,
    /// When the tenant signed.
    pub tenant_signed_at: Option<DateTime<Utc>>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

impl ContractSnapshot {
    fn new(terms: ContractTerms, now: DateTime<Utc>) -> Result<Self, EscrowError> {
        let canonical =
            CanonicalBytes::new(&terms).map_err(|e| EscrowError::Digest(e.to_string()))?;
        Ok(Self {
            terms_version: terms.terms_version,
            content_hash: sha256_digest(&canonical),
            terms,
            landlord_signed_at: None,
            tenant_signed_at: None,
            created_at: now,
        })
    }

    /// When `role` signed, if it has.
    pub fn signed_at(&self, role: PartyRole) -> Option<DateTime<Utc>> {
        match role {
            PartyRole::Landlord => self.landlord_signed_at,
            PartyRole::Tenant => self.tenant_signed_at,
        }
    }

    fn sign(&mut self, role: PartyRole, at: DateTime<Utc>) {
        let slot = match role {
            PartyRole::Landlord => &mut self.landlord_signed_at,
            PartyRole::Tenant => &mut self.tenant_signed_at,
        };
        slot.get_or_insert(at);
    }

    /// Both parties signed this version.
    pub fn is_fully_signed(&self) -> bool {
        self.landlord_signed_at.is_some() && self.tenant_signed_at.is_some()
    }
}

/// Transition timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    /// Draft created.
    pub created_at: Option<DateTime<Utc>>,
    /// Both parties signed.
    pub agreed_at: Option<DateTime<Utc>>,
    /// Deposit received.
    pub funded_at: Option<DateTime<Utc>>,
    /// Held; always equal to `funded_at`.
    pub activated_at: Option<DateTime<Utc>>,
    /// Move-out recorded.
    pub move_out_date: Option<DateTime<Utc>>,
    /// Claim window opened.
    pub release_pending_at: Option<DateTime<Utc>>,
    /// Dispute opened.
    pub disputed_at: Option<DateTime<Utc>>,
    /// Neutral assessment requested.
    pub escalated_at: Option<DateTime<Utc>>,
    /// Deposit settled.
    pub released_at: Option<DateTime<Utc>>,
    /// Lifecycle complete.
    pub closed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Escrow
// ---------------------------------------------------------------------------

/// The aggregate root and unit of optimistic locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    /// Identity.
    pub id: EscrowId,
    /// Landlord reference.
    pub landlord_id: PartyId,
    /// Tenant reference.
    pub tenant_id: PartyId,
    /// Opaque property reference.
    pub property_ref: String,
    /// Held amounts.
    pub amounts: MonetaryBreakdown,
    /// Always `amounts.total()`.
    pub total_amount: Amount,
    /// Lifecycle status.
    pub status: EscrowStatus,
    /// Incremented on every committed mutation.
    pub version: u64,
    /// Windows.
    pub config: EscrowConfig,
    /// Lease dates.
    pub lease: LeaseTerms,
    /// Trigger per component.
    pub release_plan: ReleasePlan,
    /// Current contract version; amendments increment it.
    pub terms_version: u32,
    /// Transition timestamps.
    pub timeline: Timeline,
    /// When the claim window closes, once move-out is recorded.
    pub claim_window_ends: Option<DateTime<Utc>>,
    /// One snapshot per contract version that received a signature.
    pub snapshots: Vec<ContractSnapshot>,
    /// Materialized at funding.
    pub release_rules: Vec<ReleaseRule>,
    /// Ledger movements.
    pub transactions: Vec<Transaction>,
    /// Counterparty sign-offs for manual releases.
    pub approvals: Vec<Approval>,
    /// Claims raised during the claim window.
    pub claims: Vec<Claim>,
    /// Scheduled automatic actions.
    pub deadlines: Vec<Deadline>,
    /// Escalation records.
    pub disputes: Vec<Dispute>,
}

impl Escrow {
    /// Build a draft from validated input and record its creation.
    pub(crate) fn create(
        new: NewEscrow,
        config: EscrowConfig,
        cx: &mut Changeset,
    ) -> Result<Self, EscrowError> {
        if new.landlord_id == new.tenant_id {
            return Err(ValidationError::SameParty(new.landlord_id.to_string()).into());
        }
        let property_ref = validate_property_ref(&new.property_ref)?;
        config.validate()?;
        new.lease.validate()?;
        let total_amount = new.amounts.total()?;
        if total_amount.is_zero() {
            return Err(ValidationError::ZeroAmount("total amount").into());
        }

        let escrow = Self {
            id: EscrowId::new(),
            landlord_id: new.landlord_id,
            tenant_id: new.tenant_id,
            property_ref,
            amounts: new.amounts,
            total_amount,
            status: EscrowStatus::Draft,
            version: 1,
            config,
            lease: new.lease,
            release_plan: new.release_plan,
            terms_version: 1,
            timeline: Timeline {
                created_at: Some(cx.now()),
                ..Timeline::default()
            },
            claim_window_ends: None,
            snapshots: Vec::new(),
            release_rules: Vec::new(),
            transactions: Vec::new(),
            approvals: Vec::new(),
            claims: Vec::new(),
            deadlines: Vec::new(),
            disputes: Vec::new(),
        };

        if escrow.role_of(&new.created_by).is_none() {
            return Err(EscrowError::NotEligible {
                escrow_id: escrow.id,
                operation: Operation::AmendTerms,
                actor: new.created_by.to_string(),
                reason: "only the landlord or the tenant may create the escrow".to_string(),
            });
        }
        escrow.audit(
            cx,
            AuditEvent::EscrowCreated {
                total_amount,
                terms_version: escrow.terms_version,
            },
        );
        Ok(escrow)
    }

    // ── Party helpers ───────────────────────────────────────────────────

    /// The role `party` plays, if it is a party to this escrow.
    pub fn role_of(&self, party: &PartyId) -> Option<PartyRole> {
        if *party == self.landlord_id {
            Some(PartyRole::Landlord)
        } else if *party == self.tenant_id {
            Some(PartyRole::Tenant)
        } else {
            None
        }
    }

    /// The party playing `role`.
    pub fn party(&self, role: PartyRole) -> &PartyId {
        match role {
            PartyRole::Landlord => &self.landlord_id,
            PartyRole::Tenant => &self.tenant_id,
        }
    }

    /// The audit role for `actor`.
    pub fn actor_role(&self, actor: &Actor) -> ActorRole {
        match actor {
            Actor::System => ActorRole::System,
            Actor::Party(p) => self.role_of(p).map_or(ActorRole::System, ActorRole::from),
        }
    }

    pub(crate) fn both_parties(&self) -> Vec<PartyId> {
        vec![self.landlord_id.clone(), self.tenant_id.clone()]
    }

    pub(crate) fn audit(&self, cx: &mut Changeset, event: AuditEvent) {
        let role = self.actor_role(cx.actor());
        cx.record(role, event);
    }

    pub(crate) fn notify(
        &self,
        cx: &mut Changeset,
        recipients: Vec<PartyId>,
        kind: NotificationKind,
        message: impl Into<String>,
    ) {
        cx.notify(Notification {
            escrow_id: self.id,
            recipients,
            kind,
            message: message.into(),
        });
    }

    // ── Guards ──────────────────────────────────────────────────────────

    /// Reject `operation` unless the current status permits it.
    pub(crate) fn require(&self, operation: Operation) -> Result<(), EscrowError> {
        if operation.permitted_in().contains(&self.status) {
            Ok(())
        } else {
            Err(EscrowError::InvalidTransition {
                escrow_id: self.id,
                operation,
                current: self.status,
                required: operation.permitted_in().to_vec(),
            })
        }
    }

    /// Reject anyone who is not the landlord or the tenant.
    pub(crate) fn require_party(
        &self,
        operation: Operation,
        party: &PartyId,
    ) -> Result<PartyRole, EscrowError> {
        self.role_of(party).ok_or_else(|| EscrowError::NotEligible {
            escrow_id: self.id,
            operation,
            actor: party.to_string(),
            reason: "not a party to this escrow".to_string(),
        })
    }

    /// Reject a party actor that is not on this escrow. SYSTEM passes.
    pub(crate) fn require_actor(
        &self,
        operation: Operation,
        actor: &Actor,
    ) -> Result<(), EscrowError> {
        match actor {
            Actor::Party(p) => self.require_party(operation, p).map(|_| ()),
            Actor::System => Ok(()),
        }
    }

    /// Move to `to` through the transition table.
    pub(crate) fn transition(
        &mut self,
        operation: Operation,
        to: EscrowStatus,
    ) -> Result<(), EscrowError> {
        if !self.status.can_transition_to(to) {
            return Err(EscrowError::InvalidTransition {
                escrow_id: self.id,
                operation,
                current: self.status,
                required: EscrowStatus::ALL
                    .into_iter()
                    .filter(|s| s.can_transition_to(to))
                    .collect(),
            });
        }
        tracing::debug!(escrow_id = %self.id, from = %self.status, to = %to, "status transition");
        self.status = to;
        Ok(())
    }

    // ── Drafting ────────────────────────────────────────────────────────

    fn contract_terms(&self) -> ContractTerms {
        ContractTerms {
            terms_version: self.terms_version,
            landlord_id: self.landlord_id.clone(),
            tenant_id: self.tenant_id.clone(),
            property_ref: self.property_ref.clone(),
            amounts: self.amounts,
            total_amount: self.total_amount,
            config: self.config,
            lease: self.lease,
            release_plan: self.release_plan.clone(),
        }
    }

    /// The snapshot of the current contract version, if anyone signed it.
    pub fn current_snapshot(&self) -> Option<&ContractSnapshot> {
        self.snapshots
            .iter()
            .find(|s| s.terms_version == self.terms_version)
    }

    /// Sign the current contract version. Re-signing is a no-op.
    pub(crate) fn approve(&mut self, party: &PartyId, cx: &mut Changeset) -> Result<(), EscrowError> {
        self.require(Operation::Approve)?;
        let role = self.require_party(Operation::Approve, party)?;
        let now = cx.now();

        let idx = match self
            .snapshots
            .iter()
            .position(|s| s.terms_version == self.terms_version)
        {
            Some(idx) => idx,
            None => {
                let snapshot = ContractSnapshot::new(self.contract_terms(), now)?;
                self.snapshots.push(snapshot);
                self.snapshots.len() - 1
            }
        };
        if self.snapshots[idx].signed_at(role).is_some() {
            return Ok(());
        }
        self.snapshots[idx].sign(role, now);
        let agreed = self.snapshots[idx].is_fully_signed();
        let snapshot_digest = self.snapshots[idx].content_hash.to_string();

        if agreed {
            self.transition(Operation::Approve, EscrowStatus::Agreed)?;
            self.timeline.agreed_at = Some(now);
            self.notify(
                cx,
                self.both_parties(),
                NotificationKind::ContractAgreed,
                format!("contract version {} signed by both parties", self.terms_version),
            );
        }
        self.audit(
            cx,
            AuditEvent::ContractSigned {
                terms_version: self.terms_version,
                snapshot_digest,
                agreed,
            },
        );
        Ok(())
    }

    /// Replace draft terms and start a new contract version.
    pub(crate) fn amend_terms(
        &mut self,
        party: &PartyId,
        amendment: TermsAmendment,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::AmendTerms)?;
        self.require_party(Operation::AmendTerms, party)?;
        if amendment.is_empty() {
            return Err(ValidationError::MissingField("terms amendment").into());
        }

        if let Some(property_ref) = &amendment.property_ref {
            self.property_ref = validate_property_ref(property_ref)?;
        }
        if let Some(config) = amendment.config {
            config.validate()?;
            self.config = config;
        }
        if let Some(lease) = amendment.lease {
            lease.validate()?;
            self.lease = lease;
        }
        if let Some(plan) = amendment.release_plan {
            self.release_plan = plan;
        }
        if let Some(amounts) = amendment.amounts {
            let total = amounts.total()?;
            if total.is_zero() {
                return Err(ValidationError::ZeroAmount("total amount").into());
            }
            self.amounts = amounts;
            self.total_amount = total;
        }
        self.terms_version += 1;

        self.audit(
            cx,
            AuditEvent::TermsAmended {
                terms_version: self.terms_version,
                total_amount: self.total_amount,
            },
        );
        Ok(())
    }

    /// Whether a delete by `party` is allowed.
    pub(crate) fn check_deletable(&self, party: &PartyId) -> Result<(), EscrowError> {
        self.require(Operation::DeleteDraft)?;
        self.require_party(Operation::DeleteDraft, party)?;
        if let Some(tx) = self
            .transactions
            .iter()
            .find(|t| t.status == TransactionStatus::Completed)
        {
            return Err(EscrowError::conflict(
                self.id,
                format!("{} is completed; drafts with completed transactions cannot be deleted", tx.id),
            ));
        }
        Ok(())
    }

    // ── Funding ─────────────────────────────────────────────────────────

    /// Deposit the total, activate and materialize release rules.
    pub(crate) fn fund(
        &mut self,
        party: &PartyId,
        payment_reference: &str,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        if self.status != EscrowStatus::Agreed {
            return Err(EscrowError::NotEligible {
                escrow_id: self.id,
                operation: Operation::Fund,
                actor: party.to_string(),
                reason: format!("escrow is {}; funding requires AGREED", self.status),
            });
        }
        if self.require_party(Operation::Fund, party)? != PartyRole::Tenant {
            return Err(EscrowError::NotEligible {
                escrow_id: self.id,
                operation: Operation::Fund,
                actor: party.to_string(),
                reason: "only the tenant may fund".to_string(),
            });
        }
        let payment_reference = payment_reference.trim();
        if payment_reference.is_empty() {
            return Err(ValidationError::EmptyField("payment reference").into());
        }

        let now = cx.now();
        let transaction_id = self.record_deposit(self.total_amount, payment_reference, cx);
        self.transition(Operation::Fund, EscrowStatus::Active)?;
        self.timeline.funded_at = Some(now);
        self.timeline.activated_at = Some(now);
        let rules = self.materialize_release_rules(cx)?;

        self.audit(
            cx,
            AuditEvent::Funded {
                transaction_id,
                amount: self.total_amount,
                payment_reference: payment_reference.to_string(),
                rules,
            },
        );
        Ok(())
    }

    // ── Move-out ────────────────────────────────────────────────────────

    /// Record move-out and open the claim window. Callable by either party
    /// or by the sweeper through the deposit rule.
    pub(crate) fn request_release(
        &mut self,
        reason: Option<String>,
        cx: &mut Changeset,
    ) -> Result<(), EscrowError> {
        self.require(Operation::RequestRelease)?;
        self.require_actor(Operation::RequestRelease, cx.actor())?;
        let reason = reason.map(|r| validate_text("reason", r)).transpose()?;

        let now = cx.now();
        let ends = now + days(self.config.claim_window_days);
        self.transition(Operation::RequestRelease, EscrowStatus::ReleasePending)?;
        self.timeline.move_out_date = Some(now);
        self.timeline.release_pending_at = Some(now);
        self.claim_window_ends = Some(ends);
        self.retire_deposit_rule();

        let deadline_id = self.schedule_deadline(
            DeadlineKind::ClaimWindow,
            Some(ends),
            AutoAction::AutoRelease {
                amount: self.amounts.deposit,
            },
            now,
        );
        self.notify(
            cx,
            self.both_parties(),
            NotificationKind::ReleaseRequested,
            format!("move-out recorded; claims may be raised until {ends}"),
        );
        self.audit(
            cx,
            AuditEvent::ReleaseRequested {
                reason,
                move_out_date: now,
                claim_window_ends: ends,
                deadline_id,
            },
        );
        Ok(())
    }

    // ── Closure ─────────────────────────────────────────────────────────

    /// Close a settled escrow once no release rule is pending.
    pub(crate) fn close(&mut self, party: &PartyId, cx: &mut Changeset) -> Result<(), EscrowError> {
        self.require(Operation::Close)?;
        self.require_party(Operation::Close, party)?;
        if let Some(rule) = self
            .release_rules
            .iter()
            .find(|r| r.status == RuleStatus::Active)
        {
            return Err(EscrowError::conflict(
                self.id,
                format!("{} ({}) is still active", rule.id, rule.component),
            ));
        }

        let refunded_residual = self.refund_residual(cx)?;
        self.cancel_open_deadlines();
        self.transition(Operation::Close, EscrowStatus::Closed)?;
        self.timeline.closed_at = Some(cx.now());
        self.audit(cx, AuditEvent::Closed { refunded_residual });
        Ok(())
    }

    // ── Invariants ──────────────────────────────────────────────────────

    /// Check the money invariants. Returns a description of the first
    /// violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.amounts.total() {
            Ok(total) if total == self.total_amount => {}
            Ok(total) => {
                return Err(format!(
                    "total_amount {} != component sum {}",
                    self.total_amount, total
                ))
            }
            Err(e) => return Err(e.to_string()),
        }
        let statement = self.statement();
        let outflows = statement
            .releases
            .saturating_add(statement.refunds)
            .saturating_add(statement.deductions);
        if outflows > statement.deposits {
            return Err(format!(
                "completed outflows {} exceed completed deposits {}",
                outflows, statement.deposits
            ));
        }
        let committed = self.committed_claim_amount(None);
        if committed > self.amounts.deposit {
            return Err(format!(
                "committed claims {} exceed deposit {}",
                committed, self.amounts.deposit
            ));
        }
        Ok(())
    }
}

fn validate_property_ref(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("property reference"));
    }
    if trimmed.chars().count() > MAX_PROPERTY_REF_LEN {
        return Err(ValidationError::TooLong {
            field: "property reference",
            max: MAX_PROPERTY_REF_LEN,
        });
    }
    Ok(trimmed.to_string())
}

/// Trim free text and enforce the shared length limit.
pub(crate) fn validate_text(field: &'static str, raw: String) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    if trimmed.chars().count() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_TEXT_LEN,
        });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[test]
    fn create_rejects_same_party() {
        let mut new = new_escrow();
        new.tenant_id = landlord();
        let mut cx = cx_for(&landlord(), t0());
        let err = Escrow::create(new, EscrowConfig::default(), &mut cx).unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Validation(ValidationError::SameParty(_))
        ));
    }

    #[test]
    fn create_rejects_stranger_as_creator() {
        let mut new = new_escrow();
        new.created_by = stranger();
        let mut cx = cx_for(&stranger(), t0());
        let err = Escrow::create(new, EscrowConfig::default(), &mut cx).unwrap_err();
        assert!(matches!(err, EscrowError::NotEligible { .. }));
    }

    #[test]
    fn create_computes_total_and_records_event() {
        let mut cx = cx_for(&landlord(), t0());
        let escrow = Escrow::create(new_escrow(), EscrowConfig::default(), &mut cx).unwrap();
        assert_eq!(escrow.status, EscrowStatus::Draft);
        assert_eq!(escrow.total_amount, Amount::new(10_000 + 2_000 + 1_000 + 500));
        assert_eq!(cx.events().len(), 1);
        assert_eq!(cx.events()[0].performed_by_role, ActorRole::Landlord);
        escrow.check_invariants().unwrap();
    }

    #[test]
    fn invalid_config_rejected() {
        let config = EscrowConfig {
            claim_window_days: 0,
            ..EscrowConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidWindow {
                field: "claim_window_days",
                ..
            })
        ));
    }

    #[test]
    fn lease_end_before_start_rejected() {
        let lease = LeaseTerms {
            start_date: t0(),
            end_date: Some(t0() - days(1)),
        };
        assert!(matches!(
            lease.validate(),
            Err(ValidationError::InvalidLeaseDates { .. })
        ));
    }

    #[test]
    fn approve_is_idempotent_per_party() {
        let mut escrow = draft();
        let mut cx = cx_for(&landlord(), t0());
        escrow.approve(&landlord(), &mut cx).unwrap();
        assert_eq!(cx.events().len(), 1);
        let after_first = escrow.clone();

        let mut again = cx_for(&landlord(), t0() + days(1));
        escrow.approve(&landlord(), &mut again).unwrap();
        assert!(again.is_empty());
        assert_eq!(escrow, after_first);
        assert_eq!(escrow.status, EscrowStatus::Draft);
    }

    #[test]
    fn both_signatures_agree() {
        let mut escrow = draft();
        escrow
            .approve(&landlord(), &mut cx_for(&landlord(), t0()))
            .unwrap();
        escrow
            .approve(&tenant(), &mut cx_for(&tenant(), t0()))
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Agreed);
        assert_eq!(escrow.timeline.agreed_at, Some(t0()));
        let snapshot = escrow.current_snapshot().unwrap();
        assert!(snapshot.is_fully_signed());
        assert_eq!(snapshot.terms.total_amount, escrow.total_amount);
    }

    #[test]
    fn amendment_invalidates_earlier_signature() {
        let mut escrow = draft();
        escrow
            .approve(&landlord(), &mut cx_for(&landlord(), t0()))
            .unwrap();
        let amendment = TermsAmendment {
            amounts: Some(MonetaryBreakdown {
                deposit: Amount::new(12_000),
                ..escrow.amounts
            }),
            ..TermsAmendment::default()
        };
        escrow
            .amend_terms(&tenant(), amendment, &mut cx_for(&tenant(), t0()))
            .unwrap();
        assert_eq!(escrow.terms_version, 2);
        assert_eq!(escrow.total_amount, Amount::new(15_500));

        escrow
            .approve(&tenant(), &mut cx_for(&tenant(), t0()))
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Draft);
        assert_eq!(escrow.snapshots.len(), 2);
        assert_ne!(
            escrow.snapshots[0].content_hash,
            escrow.snapshots[1].content_hash
        );
    }

    #[test]
    fn empty_amendment_rejected() {
        let mut escrow = draft();
        let err = escrow
            .amend_terms(&tenant(), TermsAmendment::default(), &mut cx_for(&tenant(), t0()))
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Validation(ValidationError::MissingField(_))
        ));
    }

    #[test]
    fn fund_requires_tenant_and_agreed() {
        let mut escrow = draft();
        let err = escrow
            .fund(&tenant(), "pay-1", &mut cx_for(&tenant(), t0()))
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotEligible { .. }));

        let mut escrow = agreed();
        let err = escrow
            .fund(&landlord(), "pay-1", &mut cx_for(&landlord(), t0()))
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotEligible { .. }));
        assert_eq!(escrow.status, EscrowStatus::Agreed);
    }

    #[test]
    fn fund_deposits_total_and_activates() {
        let escrow = active();
        assert_eq!(escrow.status, EscrowStatus::Active);
        assert_eq!(escrow.timeline.funded_at, escrow.timeline.activated_at);
        assert_eq!(escrow.statement().deposits, escrow.total_amount);
        assert_eq!(escrow.release_rules.len(), 4);
        escrow.check_invariants().unwrap();
    }

    #[test]
    fn request_release_opens_claim_window() {
        let mut escrow = active();
        escrow
            .request_release(Some("moving out".into()), &mut cx_for(&tenant(), t0()))
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::ReleasePending);
        assert_eq!(escrow.claim_window_ends, Some(t0() + days(14)));
        let window = escrow
            .deadlines
            .iter()
            .find(|d| d.kind == DeadlineKind::ClaimWindow && d.is_active())
            .unwrap();
        assert_eq!(
            window.action,
            AutoAction::AutoRelease {
                amount: Amount::new(10_000)
            }
        );
    }

    #[test]
    fn stranger_cannot_request_release() {
        let mut escrow = active();
        let err = escrow
            .request_release(None, &mut cx_for(&stranger(), t0()))
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotEligible { .. }));
    }

    #[test]
    fn delete_blocked_by_completed_transaction() {
        let mut escrow = draft();
        escrow.record_deposit(Amount::new(1), "stray", &mut cx_for(&tenant(), t0()));
        let err = escrow.check_deletable(&tenant()).unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));
        assert!(draft().check_deletable(&tenant()).is_ok());
    }
}
