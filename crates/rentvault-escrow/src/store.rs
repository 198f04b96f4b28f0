//! # Escrow Record Store
//!
//! The persistence seam. The engine owns an `Arc<dyn EscrowStore>` and
//! never touches storage any other way.
//!
//! Every write is a compare-and-swap on [`Escrow::version`]: the caller
//! passes the version it loaded, and the write fails with
//! [`StoreError::VersionConflict`] if anyone committed in between. Audit
//! drafts are chained in the same critical section, so the ledger order
//! is the commit order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

use rentvault_core::EscrowId;

use crate::audit::{AuditDraft, AuditLedger, AuditLogEntry};
use crate::deadline::DueDeadline;
use crate::escrow::Escrow;

/// Storage failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Someone else committed first.
    #[error("version conflict on {escrow_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The escrow.
        escrow_id: EscrowId,
        /// The version the writer loaded.
        expected: u64,
        /// The stored version.
        actual: u64,
    },
    /// Insert of an existing id.
    #[error("escrow {0} already exists")]
    AlreadyExists(EscrowId),
    /// No such escrow.
    #[error("escrow {0} not found")]
    NotFound(EscrowId),
    /// The audit chain could not be extended.
    #[error("audit append failed: {0}")]
    Audit(String),
}

/// Persistence for escrow aggregates and their audit trails.
pub trait EscrowStore: Send + Sync + std::fmt::Debug {
    /// Load the current aggregate.
    fn load(&self, id: EscrowId) -> Result<Escrow, StoreError>;

    /// Store a new aggregate with its first audit entries.
    fn insert(&self, escrow: Escrow, audit: Vec<AuditDraft>) -> Result<(), StoreError>;

    /// Replace the aggregate if the stored version is still
    /// `expected_version`. `escrow.version` is the new version.
    fn commit(
        &self,
        expected_version: u64,
        escrow: Escrow,
        audit: Vec<AuditDraft>,
    ) -> Result<(), StoreError>;

    /// Delete the aggregate if the stored version is still
    /// `expected_version`. The audit trail is kept.
    fn remove(
        &self,
        id: EscrowId,
        expected_version: u64,
        audit: Vec<AuditDraft>,
    ) -> Result<(), StoreError>;

    /// Claimable deadlines across all escrows, oldest first, at most `limit`.
    fn due_deadlines(&self, now: DateTime<Utc>, limit: usize) -> Vec<DueDeadline>;

    /// The audit trail of an escrow, including a deleted one.
    fn audit_trail(&self, id: EscrowId) -> Vec<AuditLogEntry>;

    /// Ids of all stored escrows.
    fn escrow_ids(&self) -> Vec<EscrowId>;
}

#[derive(Debug, Default)]
struct Inner {
    escrows: HashMap<EscrowId, Escrow>,
    ledger: AuditLedger,
}

impl Inner {
    fn append(
        &mut self,
        id: EscrowId,
        version: u64,
        audit: Vec<AuditDraft>,
    ) -> Result<(), StoreError> {
        if audit.is_empty() {
            return Ok(());
        }
        self.ledger
            .append(id, version, audit)
            .map(|_| ())
            .map_err(|e| StoreError::Audit(e.to_string()))
    }

    fn check_version(&self, id: EscrowId, expected: u64) -> Result<(), StoreError> {
        let current = self.escrows.get(&id).ok_or(StoreError::NotFound(id))?;
        if current.version != expected {
            return Err(StoreError::VersionConflict {
                escrow_id: id,
                expected,
                actual: current.version,
            });
        }
        Ok(())
    }
}

/// In-process store behind a single `parking_lot::RwLock`.
///
/// Escrows and the audit ledger share the lock so a commit and its entries
/// land together.
#[derive(Debug, Default)]
pub struct InMemoryEscrowStore {
    inner: RwLock<Inner>,
}

impl InMemoryEscrowStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored escrows.
    pub fn len(&self) -> usize {
        self.inner.read().escrows.len()
    }

    /// Whether no escrow is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EscrowStore for InMemoryEscrowStore {
    fn load(&self, id: EscrowId) -> Result<Escrow, StoreError> {
        self.inner
            .read()
            .escrows
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn insert(&self, escrow: Escrow, audit: Vec<AuditDraft>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.escrows.contains_key(&escrow.id) {
            return Err(StoreError::AlreadyExists(escrow.id));
        }
        inner.append(escrow.id, escrow.version, audit)?;
        inner.escrows.insert(escrow.id, escrow);
        Ok(())
    }

    fn commit(
        &self,
        expected_version: u64,
        escrow: Escrow,
        audit: Vec<AuditDraft>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_version(escrow.id, expected_version)?;
        inner.append(escrow.id, escrow.version, audit)?;
        inner.escrows.insert(escrow.id, escrow);
        Ok(())
    }

    fn remove(
        &self,
        id: EscrowId,
        expected_version: u64,
        audit: Vec<AuditDraft>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_version(id, expected_version)?;
        inner.append(id, expected_version + 1, audit)?;
        inner.escrows.remove(&id);
        Ok(())
    }

    fn due_deadlines(&self, now: DateTime<Utc>, limit: usize) -> Vec<DueDeadline> {
        let inner = self.inner.read();
        let mut due: Vec<DueDeadline> = inner
            .escrows
            .values()
            .flat_map(|escrow| {
                escrow.due_deadlines(now).filter_map(move |d| {
                    d.due_at.map(|due_at| DueDeadline {
                        escrow_id: escrow.id,
                        deadline_id: d.id,
                        due_at,
                    })
                })
            })
            .collect();
        due.sort_by(|a, b| {
            a.due_at
                .cmp(&b.due_at)
                .then_with(|| a.escrow_id.cmp(&b.escrow_id))
        });
        due.truncate(limit);
        due
    }

    fn audit_trail(&self, id: EscrowId) -> Vec<AuditLogEntry> {
        self.inner.read().ledger.entries_for(id)
    }

    fn escrow_ids(&self) -> Vec<EscrowId> {
        let mut ids: Vec<_> = self.inner.read().escrows.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::escrow::ActorRole;
    use crate::testing::*;
    use rentvault_core::days;

    fn drafts(event: AuditEvent) -> Vec<AuditDraft> {
        vec![AuditDraft {
            performed_by: None,
            performed_by_role: ActorRole::System,
            event,
            recorded_at: t0(),
        }]
    }

    #[test]
    fn insert_then_load() {
        let store = InMemoryEscrowStore::new();
        let escrow = draft();
        store.insert(escrow.clone(), Vec::new()).unwrap();
        assert_eq!(store.load(escrow.id).unwrap(), escrow);
        assert_eq!(
            store.insert(escrow.clone(), Vec::new()),
            Err(StoreError::AlreadyExists(escrow.id))
        );
    }

    #[test]
    fn stale_commit_rejected() {
        let store = InMemoryEscrowStore::new();
        let escrow = draft();
        store.insert(escrow.clone(), Vec::new()).unwrap();

        let mut first = escrow.clone();
        first.version += 1;
        store.commit(1, first, Vec::new()).unwrap();

        let mut second = escrow.clone();
        second.version += 1;
        let err = store.commit(1, second, Vec::new()).unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                escrow_id: escrow.id,
                expected: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn rejected_commit_appends_nothing() {
        let store = InMemoryEscrowStore::new();
        let escrow = draft();
        store
            .insert(escrow.clone(), drafts(AuditEvent::DraftDeleted))
            .unwrap();
        let _ = store.commit(7, escrow.clone(), drafts(AuditEvent::DraftDeleted));
        assert_eq!(store.audit_trail(escrow.id).len(), 1);
    }

    #[test]
    fn remove_keeps_audit_trail() {
        let store = InMemoryEscrowStore::new();
        let escrow = draft();
        store.insert(escrow.clone(), Vec::new()).unwrap();
        store
            .remove(escrow.id, 1, drafts(AuditEvent::DraftDeleted))
            .unwrap();
        assert_eq!(store.load(escrow.id), Err(StoreError::NotFound(escrow.id)));
        let trail = store.audit_trail(escrow.id);
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].escrow_version, 2);
    }

    #[test]
    fn due_deadlines_ordered_and_limited() {
        let store = InMemoryEscrowStore::new();
        let a = release_pending();
        let b = release_pending();
        store.insert(a, Vec::new()).unwrap();
        store.insert(b, Vec::new()).unwrap();

        assert!(store
            .due_deadlines(t0() - days(1), 10)
            .is_empty());
        let all = store.due_deadlines(t0() + days(30), 100);
        assert!(all.len() >= 2);
        assert!(all.windows(2).all(|w| w[0].due_at <= w[1].due_at));
        assert_eq!(store.due_deadlines(t0() + days(30), 1).len(), 1);
    }
}
