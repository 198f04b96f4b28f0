//! Per-attempt accumulator of audit events and post-commit side effects.
//!
//! Domain methods on [`Escrow`](crate::escrow::Escrow) never call
//! collaborators directly. They record what happened here; the engine
//! persists the audit drafts in the same commit as the escrow and dispatches
//! the effects only once that commit succeeds. A retried attempt starts from
//! a fresh changeset, so nothing leaks from a lost race.

use chrono::{DateTime, Utc};

use crate::audit::{AuditDraft, AuditEvent};
use crate::collaborators::Notification;
use crate::escrow::{Actor, ActorRole};
use crate::transaction::Transaction;

/// Work to perform after a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SideEffect {
    Notify(Notification),
    Payment(Transaction),
}

#[derive(Debug)]
pub(crate) struct Changeset {
    now: DateTime<Utc>,
    actor: Actor,
    events: Vec<AuditDraft>,
    effects: Vec<SideEffect>,
    touched: bool,
}

impl Changeset {
    pub(crate) fn new(now: DateTime<Utc>, actor: Actor) -> Self {
        Self {
            now,
            actor,
            events: Vec::new(),
            effects: Vec::new(),
            touched: false,
        }
    }

    /// An empty changeset with the same time and actor.
    pub(crate) fn fork(&self) -> Self {
        Self::new(self.now, self.actor.clone())
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn actor(&self) -> &Actor {
        &self.actor
    }

    pub(crate) fn record(&mut self, role: ActorRole, event: AuditEvent) {
        self.events.push(AuditDraft {
            performed_by: self.actor.party().cloned(),
            performed_by_role: role,
            event,
            recorded_at: self.now,
        });
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.effects.push(SideEffect::Notify(notification));
    }

    pub(crate) fn pay(&mut self, transaction: Transaction) {
        self.effects.push(SideEffect::Payment(transaction));
    }

    /// Mark a bookkeeping mutation that carries no audit event.
    pub(crate) fn touch(&mut self) {
        self.touched = true;
    }

    /// Append everything recorded in `other`.
    pub(crate) fn absorb(&mut self, other: Changeset) {
        self.events.extend(other.events);
        self.effects.extend(other.effects);
        self.touched |= other.touched;
    }

    /// Whether the attempt changed nothing and needs no commit.
    pub(crate) fn is_empty(&self) -> bool {
        !self.touched && self.events.is_empty()
    }

    pub(crate) fn events(&self) -> &[AuditDraft] {
        &self.events
    }

    pub(crate) fn into_parts(self) -> (Vec<AuditDraft>, Vec<SideEffect>) {
        (self.events, self.effects)
    }
}
