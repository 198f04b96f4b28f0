//! # Audit Ledger
//!
//! Append-only, per-escrow hash chain of every state-changing action.
//!
//! ## Security Invariant
//!
//! Every entry is digested via `CanonicalBytes` + `sha256_digest` over its
//! full body, including the previous entry's digest. Rewriting, dropping or
//! reordering any entry breaks every later link, which
//! [`AuditLedger::verify_chain`] detects.
//!
//! Entries are never updated or deleted, including when a draft escrow is
//! deleted: the trail outlives the aggregate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rentvault_core::{
    sha256_digest, Amount, ApprovalId, CanonicalBytes, CanonicalizationError, ClaimId,
    ContentDigest, DeadlineId, DisputeId, EscrowId, PartyId, RuleId, TransactionId,
};

use crate::claim::{ClaimStatus, ClaimType, ResponseAction};
use crate::dispute::DisputeOrigin;
use crate::escrow::ActorRole;
use crate::release::RuleAmount;
use crate::status::EscrowStatus;

/// Version of the [`AuditEvent`] payload schema.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// Structured payload, one variant per action kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum AuditEvent {
    EscrowCreated {
        total_amount: Amount,
        terms_version: u32,
    },
    TermsAmended {
        terms_version: u32,
        total_amount: Amount,
    },
    ContractSigned {
        terms_version: u32,
        snapshot_digest: String,
        agreed: bool,
    },
    DraftDeleted,
    Funded {
        transaction_id: TransactionId,
        amount: Amount,
        payment_reference: String,
        rules: Vec<RuleId>,
    },
    ReleaseRequested {
        reason: Option<String>,
        move_out_date: DateTime<Utc>,
        claim_window_ends: DateTime<Utc>,
        deadline_id: DeadlineId,
    },
    ReleaseRuleUpdated {
        rule_id: RuleId,
        trigger_date: Option<DateTime<Utc>>,
        amount: RuleAmount,
    },
    ReleaseNotified {
        rule_id: RuleId,
    },
    ReleaseScheduled {
        rule_id: RuleId,
        transaction_id: TransactionId,
        amount: Amount,
        objection_deadline: DateTime<Utc>,
    },
    ReleaseExecuted {
        rule_id: RuleId,
        transaction_id: Option<TransactionId>,
        amount: Amount,
    },
    ReleaseObjected {
        rule_id: RuleId,
        transaction_id: TransactionId,
        reason: String,
    },
    ManualReleaseRequested {
        rule_id: RuleId,
        approval_id: ApprovalId,
        transaction_id: TransactionId,
        amount: Amount,
        deadline: DateTime<Utc>,
    },
    ApprovalResponded {
        approval_id: ApprovalId,
        approved: bool,
    },
    ApprovalExpired {
        approval_id: ApprovalId,
    },
    ClaimRaised {
        claim_id: ClaimId,
        claim_type: ClaimType,
        amount: Amount,
        response_deadline: DateTime<Utc>,
    },
    ClaimResponded {
        claim_id: ClaimId,
        action: ResponseAction,
        amount: Option<Amount>,
        round: u32,
        status: ClaimStatus,
    },
    ClaimExpired {
        claim_id: ClaimId,
    },
    SettlementDeferred {
        open_claims: usize,
    },
    Settled {
        released: Amount,
        refunded: Amount,
        deducted: Amount,
        status: EscrowStatus,
        transactions: Vec<TransactionId>,
    },
    DisputeOpened {
        dispute_id: DisputeId,
        origin: DisputeOrigin,
    },
    Escalated {
        dispute_id: DisputeId,
        assessment_reference: Option<String>,
    },
    DisputeResolved {
        dispute_id: DisputeId,
        deducted: Amount,
        released: Amount,
        refunded_residual: Amount,
    },
    Closed {
        refunded_residual: Amount,
    },
    DeadlineFailed {
        deadline_id: DeadlineId,
        action: String,
        error: String,
    },
    DeadlineReactivated {
        deadline_id: DeadlineId,
        due_at: Option<DateTime<Utc>>,
    },
}

impl AuditEvent {
    /// The action name recorded on the entry.
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::EscrowCreated { .. } => "ESCROW_CREATED",
            Self::TermsAmended { .. } => "TERMS_AMENDED",
            Self::ContractSigned { .. } => "CONTRACT_SIGNED",
            Self::DraftDeleted => "DRAFT_DELETED",
            Self::Funded { .. } => "FUNDED",
            Self::ReleaseRequested { .. } => "RELEASE_REQUESTED",
            Self::ReleaseRuleUpdated { .. } => "RELEASE_RULE_UPDATED",
            Self::ReleaseNotified { .. } => "RELEASE_NOTIFIED",
            Self::ReleaseScheduled { .. } => "RELEASE_SCHEDULED",
            Self::ReleaseExecuted { .. } => "RELEASE_EXECUTED",
            Self::ReleaseObjected { .. } => "RELEASE_OBJECTED",
            Self::ManualReleaseRequested { .. } => "MANUAL_RELEASE_REQUESTED",
            Self::ApprovalResponded { .. } => "APPROVAL_RESPONDED",
            Self::ApprovalExpired { .. } => "APPROVAL_EXPIRED",
            Self::ClaimRaised { .. } => "CLAIM_RAISED",
            Self::ClaimResponded { .. } => "CLAIM_RESPONDED",
            Self::ClaimExpired { .. } => "CLAIM_EXPIRED",
            Self::SettlementDeferred { .. } => "SETTLEMENT_DEFERRED",
            Self::Settled { .. } => "SETTLED",
            Self::DisputeOpened { .. } => "DISPUTE_OPENED",
            Self::Escalated { .. } => "ESCALATED",
            Self::DisputeResolved { .. } => "DISPUTE_RESOLVED",
            Self::Closed { .. } => "CLOSED",
            Self::DeadlineFailed { .. } => "DEADLINE_FAILED",
            Self::DeadlineReactivated { .. } => "DEADLINE_REACTIVATED",
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// An event recorded during an attempt, not yet chained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditDraft {
    /// Acting party; `None` for SYSTEM.
    pub performed_by: Option<PartyId>,
    /// Role of the actor.
    pub performed_by_role: ActorRole,
    /// Payload.
    pub event: AuditEvent,
    /// Time of the action.
    pub recorded_at: DateTime<Utc>,
}

/// Versioned details payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDetails {
    /// Payload schema version.
    pub schema_version: u32,
    /// The event.
    pub event: AuditEvent,
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Position in this escrow's chain, from 0.
    pub sequence: u64,
    /// Owning escrow.
    pub escrow_id: EscrowId,
    /// Action name, e.g. `CLAIM_RAISED`.
    pub action: String,
    /// Acting party; `None` for SYSTEM.
    pub performed_by: Option<PartyId>,
    /// LANDLORD, TENANT or SYSTEM.
    pub performed_by_role: ActorRole,
    /// Structured payload.
    pub details: AuditDetails,
    /// Escrow version committed with this entry.
    pub escrow_version: u64,
    /// Time of the action.
    pub recorded_at: DateTime<Utc>,
    /// Digest of the previous entry.
    pub prev_digest: Option<ContentDigest>,
    /// Digest of this entry's body.
    pub digest: ContentDigest,
}

/// The digested portion of an entry.
#[derive(Serialize)]
struct EntryBody<'a> {
    sequence: u64,
    escrow_id: &'a EscrowId,
    action: &'a str,
    performed_by: &'a Option<PartyId>,
    performed_by_role: ActorRole,
    details: &'a AuditDetails,
    escrow_version: u64,
    recorded_at: &'a DateTime<Utc>,
    prev_digest: &'a Option<ContentDigest>,
}

impl AuditLogEntry {
    /// Recompute the digest from the entry body.
    pub fn compute_digest(&self) -> Result<ContentDigest, CanonicalizationError> {
        let body = EntryBody {
            sequence: self.sequence,
            escrow_id: &self.escrow_id,
            action: &self.action,
            performed_by: &self.performed_by,
            performed_by_role: self.performed_by_role,
            details: &self.details,
            escrow_version: self.escrow_version,
            recorded_at: &self.recorded_at,
            prev_digest: &self.prev_digest,
        };
        Ok(sha256_digest(&CanonicalBytes::new(&body)?))
    }
}

/// A broken or unreadable chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// An entry's digest does not match its body.
    #[error("audit entry {sequence} of {escrow_id}: digest mismatch")]
    DigestMismatch {
        /// The escrow.
        escrow_id: EscrowId,
        /// The entry.
        sequence: u64,
    },
    /// An entry does not link to its predecessor.
    #[error("audit entry {sequence} of {escrow_id}: broken link to previous entry")]
    BrokenLink {
        /// The escrow.
        escrow_id: EscrowId,
        /// The entry.
        sequence: u64,
    },
    /// Sequence numbers are not contiguous.
    #[error("audit trail of {escrow_id}: expected sequence {expected}, found {found}")]
    SequenceGap {
        /// The escrow.
        escrow_id: EscrowId,
        /// The expected sequence.
        expected: u64,
        /// The sequence found.
        found: u64,
    },
    /// Digest input could not be canonicalized.
    #[error("audit canonicalization failed: {0}")]
    Canonicalization(String),
}

// ---------------------------------------------------------------------------
// AuditLedger
// ---------------------------------------------------------------------------

/// Per-escrow hash chains.
///
/// Not synchronised; the store appends under the same lock that commits
/// the escrow, so entry order matches commit order.
#[derive(Debug, Default)]
pub struct AuditLedger {
    chains: HashMap<EscrowId, Vec<AuditLogEntry>>,
}

impl AuditLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain `drafts` onto the escrow's trail.
    ///
    /// All drafts are digested before any is appended, so a
    /// canonicalization failure leaves the chain untouched.
    pub fn append(
        &mut self,
        escrow_id: EscrowId,
        escrow_version: u64,
        drafts: Vec<AuditDraft>,
    ) -> Result<Vec<AuditLogEntry>, CanonicalizationError> {
        let chain = self.chains.entry(escrow_id).or_default();
        let mut prev = chain.last().map(|e| e.digest.clone());
        let mut sequence = chain.len() as u64;
        let mut built = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let mut entry = AuditLogEntry {
                sequence,
                escrow_id,
                action: draft.event.action_name().to_string(),
                performed_by: draft.performed_by,
                performed_by_role: draft.performed_by_role,
                details: AuditDetails {
                    schema_version: AUDIT_SCHEMA_VERSION,
                    event: draft.event,
                },
                escrow_version,
                recorded_at: draft.recorded_at,
                prev_digest: prev.clone(),
                digest: placeholder_digest(),
            };
            entry.digest = entry.compute_digest()?;
            prev = Some(entry.digest.clone());
            sequence += 1;
            built.push(entry);
        }
        chain.extend(built.iter().cloned());
        Ok(built)
    }

    /// The escrow's trail, oldest first.
    pub fn entries_for(&self, escrow_id: EscrowId) -> Vec<AuditLogEntry> {
        self.chains.get(&escrow_id).cloned().unwrap_or_default()
    }

    /// Total entries across all escrows.
    pub fn len(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    /// Whether no entry was ever appended.
    pub fn is_empty(&self) -> bool {
        self.chains.values().all(Vec::is_empty)
    }

    #[cfg(test)]
    pub(crate) fn chain_mut(&mut self, escrow_id: EscrowId) -> Option<&mut Vec<AuditLogEntry>> {
        self.chains.get_mut(&escrow_id)
    }
}

/// Verify a trail's sequence, links and digests. Returns the entry count.
pub fn verify_chain(escrow_id: EscrowId, entries: &[AuditLogEntry]) -> Result<usize, AuditError> {
    let mut prev: Option<&ContentDigest> = None;
    for (i, entry) in entries.iter().enumerate() {
        let expected = i as u64;
        if entry.sequence != expected {
            return Err(AuditError::SequenceGap {
                escrow_id,
                expected,
                found: entry.sequence,
            });
        }
        if entry.prev_digest.as_ref() != prev {
            return Err(AuditError::BrokenLink {
                escrow_id,
                sequence: entry.sequence,
            });
        }
        let digest = entry
            .compute_digest()
            .map_err(|e| AuditError::Canonicalization(e.to_string()))?;
        if digest != entry.digest {
            return Err(AuditError::DigestMismatch {
                escrow_id,
                sequence: entry.sequence,
            });
        }
        prev = Some(&entry.digest);
    }
    Ok(entries.len())
}

fn placeholder_digest() -> ContentDigest {
    ContentDigest {
        algorithm: rentvault_core::DigestAlgorithm::Sha256,
        bytes: [0; 32],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn draft(event: AuditEvent) -> AuditDraft {
        AuditDraft {
            performed_by: Some(landlord()),
            performed_by_role: ActorRole::Landlord,
            event,
            recorded_at: t0(),
        }
    }

    fn sample_chain() -> (AuditLedger, EscrowId) {
        let mut ledger = AuditLedger::new();
        let id = EscrowId::new();
        ledger
            .append(
                id,
                1,
                vec![draft(AuditEvent::EscrowCreated {
                    total_amount: Amount::new(13_500),
                    terms_version: 1,
                })],
            )
            .unwrap();
        ledger
            .append(
                id,
                2,
                vec![
                    draft(AuditEvent::ContractSigned {
                        terms_version: 1,
                        snapshot_digest: "sha256:00".into(),
                        agreed: false,
                    }),
                    draft(AuditEvent::ClaimExpired {
                        claim_id: ClaimId::new(),
                    }),
                ],
            )
            .unwrap();
        (ledger, id)
    }

    #[test]
    fn chain_links_entries() {
        let (ledger, id) = sample_chain();
        let entries = ledger.entries_for(id);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].prev_digest.is_none());
        assert_eq!(entries[1].prev_digest.as_ref(), Some(&entries[0].digest));
        assert_eq!(entries[2].escrow_version, 2);
        assert_eq!(entries[1].action, "CONTRACT_SIGNED");
        assert_eq!(verify_chain(id, &entries), Ok(3));
    }

    #[test]
    fn chains_are_per_escrow() {
        let (mut ledger, id) = sample_chain();
        let other = EscrowId::new();
        ledger
            .append(other, 1, vec![draft(AuditEvent::DraftDeleted)])
            .unwrap();
        assert_eq!(ledger.entries_for(other)[0].sequence, 0);
        assert_eq!(ledger.entries_for(id).len(), 3);
        assert_eq!(ledger.len(), 4);
    }

    #[test]
    fn tampered_details_detected() {
        let (mut ledger, id) = sample_chain();
        let chain = ledger.chain_mut(id).unwrap();
        chain[1].details.event = AuditEvent::ContractSigned {
            terms_version: 1,
            snapshot_digest: "sha256:00".into(),
            agreed: true,
        };
        let err = verify_chain(id, &ledger.entries_for(id)).unwrap_err();
        assert_eq!(err, AuditError::DigestMismatch { escrow_id: id, sequence: 1 });
    }

    #[test]
    fn dropped_entry_detected() {
        let (mut ledger, id) = sample_chain();
        ledger.chain_mut(id).unwrap().remove(1);
        let err = verify_chain(id, &ledger.entries_for(id)).unwrap_err();
        assert!(matches!(err, AuditError::SequenceGap { expected: 1, found: 2, .. }));
    }

    #[test]
    fn details_carry_schema_version_and_kind() {
        let (ledger, id) = sample_chain();
        let json = serde_json::to_value(&ledger.entries_for(id)[0]).unwrap();
        assert_eq!(json["details"]["schema_version"], AUDIT_SCHEMA_VERSION);
        assert_eq!(json["details"]["event"]["kind"], "escrow_created");
        assert_eq!(json["performed_by_role"], "LANDLORD");
    }
}
