//! # Escrow Lifecycle Orchestrator
//!
//! [`EscrowEngine`] is the only component that mutates stored escrows.
//! Every operation runs through one optimistic-concurrency loop:
//!
//! 1. Load the escrow and remember its version.
//! 2. Apply the domain method to a copy, collecting audit events and side
//!    effects in a fresh changeset.
//! 3. Commit the copy at `version + 1` together with its audit entries,
//!    provided the stored version is unchanged.
//! 4. On a version conflict, back off and start over from step 1. After
//!    `max_attempts` conflicts, return `ConcurrentModification`.
//! 5. Only after a successful commit, hand payments and notifications to
//!    the collaborators. Their failures are logged and never roll back
//!    the commit.
//!
//! An attempt that records nothing (an idempotent re-approval, a deadline
//! already claimed by another sweeper) skips the commit entirely.
//!
//! ## Sweeping
//!
//! A due deadline is processed in two commits. The first claims it for this
//! sweeper; a competing sweeper loses the version race, reloads, and finds
//! it already claimed. The second runs the bound action on a scratch copy
//! and marks the deadline COMPLETED whether or not the action succeeded.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use rentvault_core::{
    ApprovalId, ClaimId, Clock, DeadlineId, EscrowId, PartyId, RuleId, SweeperId,
};

use crate::audit::{verify_chain, AuditError, AuditEvent, AuditLogEntry};
use crate::changeset::{Changeset, SideEffect};
use crate::claim::{Claim, ClaimReply, ClaimRequest, SettlementSummary};
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::deadline::{DueDeadline, ProcessedDeadline};
use crate::dispute::DisputeResolution;
use crate::error::EscrowError;
use crate::escrow::{Actor, Escrow, NewEscrow, TermsAmendment};
use crate::release::{ReleaseRule, RuleUpdate};
use crate::status::Operation;
use crate::store::{EscrowStore, InMemoryEscrowStore, StoreError};
use crate::transaction::{Approval, Statement};

/// The escrow lifecycle engine.
#[derive(Debug, Clone)]
pub struct EscrowEngine {
    store: Arc<dyn EscrowStore>,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    config: EngineConfig,
    sweeper_id: SweeperId,
}

impl EscrowEngine {
    /// Create an engine over `store`.
    pub fn new(
        store: Arc<dyn EscrowStore>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            collaborators,
            config,
            sweeper_id: SweeperId::new(),
        }
    }

    /// An engine over a fresh in-memory store with default collaborators.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Arc::new(InMemoryEscrowStore::new()),
            clock,
            Collaborators::default(),
            EngineConfig::default(),
        )
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn EscrowStore> {
        &self.store
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The current time as the engine sees it.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The identity this engine sweeps under.
    pub fn sweeper_id(&self) -> SweeperId {
        self.sweeper_id
    }

    // ── Core loop ───────────────────────────────────────────────────────

    fn load(&self, escrow_id: EscrowId) -> Result<Escrow, EscrowError> {
        self.store.load(escrow_id).map_err(store_error)
    }

    /// Run `op` under optimistic concurrency. Returns its result and the
    /// escrow as committed (or as loaded, if nothing changed).
    fn transact<R>(
        &self,
        escrow_id: EscrowId,
        actor: Actor,
        mut op: impl FnMut(&mut Escrow, &mut Changeset) -> Result<R, EscrowError>,
    ) -> Result<(R, Escrow), EscrowError> {
        let retry = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(escrow_id)?;
            let mut escrow = current.clone();
            let mut cx = Changeset::new(self.clock.now(), actor.clone());
            let result = op(&mut escrow, &mut cx)?;
            if cx.is_empty() {
                return Ok((result, current));
            }

            escrow.version = current.version + 1;
            let actions: Vec<&'static str> =
                cx.events().iter().map(|d| d.event.action_name()).collect();
            let (events, effects) = cx.into_parts();
            match self.store.commit(current.version, escrow.clone(), events) {
                Ok(()) => {
                    tracing::info!(
                        escrow_id = %escrow_id,
                        version = escrow.version,
                        status = %escrow.status,
                        actor = %actor,
                        actions = ?actions,
                        "escrow committed"
                    );
                    self.dispatch(escrow_id, effects);
                    return Ok((result, escrow));
                }
                Err(StoreError::VersionConflict { actual, .. }) if attempt < retry.max_attempts => {
                    let backoff = retry.backoff_for(attempt);
                    tracing::debug!(
                        escrow_id = %escrow_id,
                        attempt,
                        expected = current.version,
                        actual,
                        backoff_ms = backoff.as_millis() as u64,
                        "version conflict, retrying"
                    );
                    std::thread::sleep(backoff);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::warn!(escrow_id = %escrow_id, attempts = attempt, "retries exhausted");
                    return Err(EscrowError::ConcurrentModification {
                        escrow_id,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(store_error(e)),
            }
        }
    }

    fn dispatch(&self, escrow_id: EscrowId, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::Payment(tx) => {
                    if let Err(e) = self.collaborators.payments.execute(&escrow_id, &tx) {
                        tracing::warn!(
                            escrow_id = %escrow_id,
                            transaction_id = %tx.id,
                            error = %e,
                            "payment gateway failed; ledger entry stands"
                        );
                    }
                }
                SideEffect::Notify(n) => {
                    if let Err(e) = self.collaborators.notifier.notify(&n) {
                        tracing::warn!(
                            escrow_id = %escrow_id,
                            kind = ?n.kind,
                            error = %e,
                            "notification failed"
                        );
                    }
                }
            }
        }
    }

    fn party_op<R>(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        op: impl FnMut(&mut Escrow, &mut Changeset) -> Result<R, EscrowError>,
    ) -> Result<(R, Escrow), EscrowError> {
        self.transact(escrow_id, Actor::Party(party.clone()), op)
    }

    // ── Drafting ────────────────────────────────────────────────────────

    /// Create a DRAFT escrow.
    pub fn create_escrow(&self, new: NewEscrow) -> Result<Escrow, EscrowError> {
        for party in [&new.landlord_id, &new.tenant_id] {
            if !self.collaborators.directory.is_known(party) {
                return Err(EscrowError::not_found("party", party));
            }
        }
        let config = new.config.unwrap_or(self.config.escrow_defaults);
        let mut cx = Changeset::new(self.clock.now(), Actor::Party(new.created_by.clone()));
        let escrow = Escrow::create(new, config, &mut cx)?;
        let (events, effects) = cx.into_parts();
        self.store
            .insert(escrow.clone(), events)
            .map_err(store_error)?;
        tracing::info!(escrow_id = %escrow.id, total = %escrow.total_amount, "escrow created");
        self.dispatch(escrow.id, effects);
        Ok(escrow)
    }

    /// Load an escrow.
    pub fn get_escrow(&self, escrow_id: EscrowId) -> Result<Escrow, EscrowError> {
        self.load(escrow_id)
    }

    /// Sign the current contract version.
    pub fn approve(&self, escrow_id: EscrowId, party: &PartyId) -> Result<Escrow, EscrowError> {
        self.party_op(escrow_id, party, |e, cx| e.approve(party, cx))
            .map(|(_, e)| e)
    }

    /// Replace draft terms, invalidating collected signatures.
    pub fn amend_terms(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        amendment: TermsAmendment,
    ) -> Result<Escrow, EscrowError> {
        self.party_op(escrow_id, party, |e, cx| {
            e.amend_terms(party, amendment.clone(), cx)
        })
        .map(|(_, e)| e)
    }

    /// Delete an unfunded draft. Its audit trail is kept.
    pub fn delete_draft(&self, escrow_id: EscrowId, party: &PartyId) -> Result<(), EscrowError> {
        let retry = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let escrow = self.load(escrow_id)?;
            escrow.check_deletable(party)?;
            let mut cx = Changeset::new(self.clock.now(), Actor::Party(party.clone()));
            escrow.audit(&mut cx, AuditEvent::DraftDeleted);
            let (events, _) = cx.into_parts();
            match self.store.remove(escrow_id, escrow.version, events) {
                Ok(()) => {
                    tracing::info!(escrow_id = %escrow_id, party = %party, "draft deleted");
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) if attempt < retry.max_attempts => {
                    tracing::debug!(escrow_id = %escrow_id, attempt, "version conflict, retrying");
                    std::thread::sleep(retry.backoff_for(attempt));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(EscrowError::ConcurrentModification {
                        escrow_id,
                        attempts: attempt,
                    })
                }
                Err(e) => return Err(store_error(e)),
            }
        }
    }

    // ── Funding and release ─────────────────────────────────────────────

    /// Tenant deposit: AGREED → ACTIVE.
    pub fn fund(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        payment_reference: &str,
    ) -> Result<Escrow, EscrowError> {
        self.party_op(escrow_id, party, |e, cx| e.fund(party, payment_reference, cx))
            .map(|(_, e)| e)
    }

    /// Record move-out and open the claim window.
    pub fn request_release(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        reason: Option<String>,
    ) -> Result<Escrow, EscrowError> {
        self.party_op(escrow_id, party, |e, cx| e.request_release(reason.clone(), cx))
            .map(|(_, e)| e)
    }

    /// Change a scheduled release rule while ACTIVE.
    pub fn update_release_rule(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        rule_id: RuleId,
        update: RuleUpdate,
    ) -> Result<ReleaseRule, EscrowError> {
        let (_, escrow) = self.party_op(escrow_id, party, |e, cx| {
            e.update_release_rule(party, rule_id, update.clone(), cx)
        })?;
        escrow
            .release_rule(rule_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found("release rule", rule_id))
    }

    /// Tenant objection to a release in its objection window.
    pub fn object_to_release(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        rule_id: RuleId,
        reason: String,
    ) -> Result<Escrow, EscrowError> {
        self.party_op(escrow_id, party, |e, cx| {
            e.object_to_release(party, rule_id, reason.clone(), cx)
        })
        .map(|(_, e)| e)
    }

    /// Ask the counterparty to approve a MANUAL release.
    pub fn trigger_manual_release(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        rule_id: RuleId,
    ) -> Result<Approval, EscrowError> {
        let (approval_id, escrow) = self.party_op(escrow_id, party, |e, cx| {
            e.trigger_manual_release(party, rule_id, cx)
        })?;
        escrow
            .approval(approval_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found("approval", approval_id))
    }

    /// Approve or reject a pending manual release.
    pub fn respond_to_approval(
        &self,
        escrow_id: EscrowId,
        party: &PartyId,
        approval_id: ApprovalId,
        approve: bool,
    ) -> Result<Escrow, EscrowError> {
        self.party_op(escrow_id, party, |e, cx| {
            e.respond_to_approval(party, approval_id, approve, cx)
        })
        .map(|(_, e)| e)
    }

    // ── Claims and settlement ───────────────────────────────────────────

    /// Raise a claim inside the claim window.
    pub fn raise_claim(
        &self,
        escrow_id: EscrowId,
        claimant: &PartyId,
        request: ClaimRequest,
    ) -> Result<Claim, EscrowError> {
        let (claim_id, escrow) = self.party_op(escrow_id, claimant, |e, cx| {
            e.raise_claim(claimant, request.clone(), cx)
        })?;
        claim_of(&escrow, claim_id)
    }

    /// Accept, reject or counter a claim.
    pub fn respond_to_claim(
        &self,
        escrow_id: EscrowId,
        responder: &PartyId,
        claim_id: ClaimId,
        reply: ClaimReply,
    ) -> Result<Claim, EscrowError> {
        let (_, escrow) = self.party_op(escrow_id, responder, |e, cx| {
            e.respond_to_claim(responder, claim_id, reply.clone(), cx)
        })?;
        claim_of(&escrow, claim_id)
    }

    /// Settle now. Fails with `Conflict` unless settlement is ready.
    pub fn settle(&self, escrow_id: EscrowId, actor: Actor) -> Result<SettlementSummary, EscrowError> {
        self.transact(escrow_id, actor, |e, cx| {
            e.require(Operation::Settle)?;
            e.require_actor(Operation::Settle, cx.actor())?;
            e.settle(cx)
        })
        .map(|(summary, _)| summary)
    }

    /// DISPUTED → ESCALATED.
    pub fn escalate(
        &self,
        escrow_id: EscrowId,
        actor: Actor,
        assessment_reference: Option<String>,
    ) -> Result<Escrow, EscrowError> {
        self.transact(escrow_id, actor, |e, cx| {
            e.escalate(assessment_reference.clone(), cx)
        })
        .map(|(_, e)| e)
    }

    /// Apply an external arbitration outcome and close.
    pub fn resolve_dispute(
        &self,
        escrow_id: EscrowId,
        resolution: DisputeResolution,
    ) -> Result<Escrow, EscrowError> {
        self.transact(escrow_id, Actor::System, |e, cx| {
            e.resolve_dispute(resolution.clone(), cx)
        })
        .map(|(_, e)| e)
    }

    /// Close a settled escrow, refunding any residual to the tenant.
    pub fn close(&self, escrow_id: EscrowId, party: &PartyId) -> Result<Escrow, EscrowError> {
        self.party_op(escrow_id, party, |e, cx| e.close(party, cx))
            .map(|(_, e)| e)
    }

    // ── Deadlines ───────────────────────────────────────────────────────

    /// One sweep pass under this engine's sweeper identity.
    pub fn run_deadline_sweep(&self) -> Vec<ProcessedDeadline> {
        self.sweep_as(self.sweeper_id)
    }

    /// One sweep pass under `sweeper`. Failures on one deadline never stop
    /// the pass.
    pub fn sweep_as(&self, sweeper: SweeperId) -> Vec<ProcessedDeadline> {
        let now = self.clock.now();
        let due = self.store.due_deadlines(now, self.config.sweep_batch_limit);
        if due.is_empty() {
            return Vec::new();
        }
        tracing::info!(sweeper = %sweeper, due = due.len(), "sweep pass");

        let mut processed = Vec::with_capacity(due.len());
        for item in due {
            match self.process_deadline(&item, sweeper) {
                Ok(Some(p)) => {
                    tracing::info!(
                        escrow_id = %p.escrow_id,
                        deadline_id = %p.deadline_id,
                        action = p.action,
                        outcome = %p.outcome,
                        "deadline processed"
                    );
                    processed.push(p);
                }
                Ok(None) => {
                    tracing::debug!(
                        escrow_id = %item.escrow_id,
                        deadline_id = %item.deadline_id,
                        "deadline claimed elsewhere"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        escrow_id = %item.escrow_id,
                        deadline_id = %item.deadline_id,
                        error = %e,
                        "deadline processing failed"
                    );
                }
            }
        }
        processed
    }

    fn process_deadline(
        &self,
        item: &DueDeadline,
        sweeper: SweeperId,
    ) -> Result<Option<ProcessedDeadline>, EscrowError> {
        let (claimed, _) = self.transact(item.escrow_id, Actor::System, |e, cx| {
            Ok(e.claim_deadline(item.deadline_id, sweeper, cx))
        })?;
        if !claimed {
            return Ok(None);
        }
        let error = match self.transact(item.escrow_id, Actor::System, |e, cx| {
            Ok(e.execute_deadline(item.deadline_id, sweeper, cx))
        }) {
            Ok((processed, _)) => return Ok(processed),
            Err(error) => error,
        };
        tracing::warn!(
            escrow_id = %item.escrow_id,
            deadline_id = %item.deadline_id,
            error = %error,
            "deadline execute commit failed, recording failure"
        );
        let recorded = self.transact(item.escrow_id, Actor::System, |e, cx| {
            Ok(e.record_deadline_failure(item.deadline_id, sweeper, error.clone(), cx))
        });
        match recorded {
            Ok((processed, _)) => Ok(processed),
            Err(record_error) => {
                self.transact(item.escrow_id, Actor::System, |e, cx| {
                    Ok(e.release_deadline_claim(item.deadline_id, sweeper, cx))
                })?;
                Err(record_error)
            }
        }
    }

    /// Re-arm a failed deadline (or release a stuck claim), optionally
    /// moving its due time.
    pub fn reactivate_deadline(
        &self,
        escrow_id: EscrowId,
        deadline_id: DeadlineId,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Escrow, EscrowError> {
        self.transact(escrow_id, Actor::System, |e, cx| {
            e.reactivate_deadline(deadline_id, due_at, cx)
        })
        .map(|(_, e)| e)
    }

    // ── Projections ─────────────────────────────────────────────────────

    /// The escrow's audit trail, oldest first. Survives draft deletion.
    pub fn get_audit_trail(&self, escrow_id: EscrowId) -> Vec<AuditLogEntry> {
        self.store.audit_trail(escrow_id)
    }

    /// Recompute the escrow's audit hash chain. Returns the entry count.
    pub fn verify_audit_trail(&self, escrow_id: EscrowId) -> Result<usize, AuditError> {
        verify_chain(escrow_id, &self.store.audit_trail(escrow_id))
    }

    /// Ledger summary.
    pub fn get_statement(&self, escrow_id: EscrowId) -> Result<Statement, EscrowError> {
        Ok(self.load(escrow_id)?.statement())
    }
}

fn claim_of(escrow: &Escrow, claim_id: ClaimId) -> Result<Claim, EscrowError> {
    escrow
        .claim(claim_id)
        .cloned()
        .ok_or_else(|| EscrowError::not_found("claim", claim_id))
}

fn store_error(e: StoreError) -> EscrowError {
    match e {
        StoreError::NotFound(id) => EscrowError::not_found("escrow", id),
        other => EscrowError::Store(other.to_string()),
    }
}
