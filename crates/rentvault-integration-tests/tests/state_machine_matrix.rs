//! # Escrow State Machine Matrix
//!
//! Exhaustive (status × status) transition table and (status × operation)
//! precondition tests. Every externally invocable operation is attempted
//! against an escrow in every status; operations outside their permitted
//! statuses must be rejected without changing the escrow.

mod common;

use common::*;

use rentvault_core::{Amount, ApprovalId, ClaimId, EscrowId, RuleId};
use rentvault_escrow::{
    Actor, ClaimRequest, ClaimType, DisputeResolution, EscrowError, EscrowStatus, Operation,
    RuleUpdate, TermsAmendment,
};

// =========================================================================
// Transition table: 9 statuses, 81 pairs
// =========================================================================

#[test]
fn escrow_transition_matrix_exhaustive() {
    use EscrowStatus::*;

    let expected_valid: Vec<(EscrowStatus, EscrowStatus)> = vec![
        (Draft, Agreed),
        (Agreed, Active),
        (Active, ReleasePending),
        (ReleasePending, Released),
        (ReleasePending, PartiallyReleased),
        (ReleasePending, Disputed),
        (Released, Closed),
        (PartiallyReleased, Closed),
        (Disputed, Escalated),
        (Disputed, Closed),
        (Escalated, Closed),
    ];

    for from in EscrowStatus::ALL {
        for to in EscrowStatus::ALL {
            let actual = from.can_transition_to(to);
            let expected = expected_valid.contains(&(from, to));
            assert_eq!(
                actual, expected,
                "Escrow transition {from:?} → {to:?}: expected valid={expected}, got valid={actual}"
            );
        }
    }
}

#[test]
fn escrow_terminal_states() {
    assert!(EscrowStatus::Closed.is_terminal());
    for status in EscrowStatus::ALL {
        if status != EscrowStatus::Closed {
            assert!(!status.is_terminal(), "{status:?} should not be terminal");
        }
    }
}

#[test]
fn escrow_status_round_trip_via_name() {
    for status in EscrowStatus::ALL {
        assert_eq!(EscrowStatus::from_name(status.as_str()), Some(status));
    }
    assert_eq!(EscrowStatus::from_name("FUNDED"), None);
}

// =========================================================================
// Operation preconditions: 9 statuses × 15 operations
// =========================================================================

/// Identifiers to pass to operations that take one: a real record when
/// the escrow has it, otherwise a fresh id.
struct Refs {
    rule: RuleId,
    claim: ClaimId,
    approval: ApprovalId,
}

fn refs(h: &Harness, id: EscrowId) -> Refs {
    let escrow = h.engine.get_escrow(id).unwrap();
    Refs {
        rule: escrow
            .release_rules
            .first()
            .map(|r| r.id)
            .unwrap_or_default(),
        claim: escrow.claims.first().map(|c| c.id).unwrap_or_default(),
        approval: escrow.approvals.first().map(|a| a.id).unwrap_or_default(),
    }
}

/// Invoke `op` as the party most likely to be allowed to call it.
fn invoke(h: &Harness, id: EscrowId, op: Operation) -> Result<(), EscrowError> {
    let r = refs(h, id);
    let e = &h.engine;
    match op {
        Operation::Approve => e.approve(id, &landlord()).map(drop),
        Operation::AmendTerms => e
            .amend_terms(
                id,
                &landlord(),
                TermsAmendment {
                    property_ref: Some("12 Harbour Lane, Flat 4".to_string()),
                    ..TermsAmendment::default()
                },
            )
            .map(drop),
        Operation::Fund => e.fund(id, &tenant(), "PAY-MATRIX").map(drop),
        Operation::RequestRelease => e.request_release(id, &tenant(), None).map(drop),
        Operation::RaiseClaim => e
            .raise_claim(
                id,
                &landlord(),
                ClaimRequest {
                    claim_type: ClaimType::Deduction,
                    amount: Amount::new(100),
                    description: "matrix".to_string(),
                },
            )
            .map(drop),
        Operation::RespondToClaim => e.respond_to_claim(id, &tenant(), r.claim, accept()).map(drop),
        Operation::Settle => e.settle(id, Actor::System).map(drop),
        Operation::Escalate => e.escalate(id, Actor::Party(tenant()), None).map(drop),
        Operation::ResolveDispute => e
            .resolve_dispute(
                id,
                DisputeResolution {
                    deduction_to_landlord: Amount::ZERO,
                    summary: "matrix".to_string(),
                    decided_by: "arbiter".to_string(),
                },
            )
            .map(drop),
        Operation::Close => e.close(id, &landlord()).map(drop),
        Operation::DeleteDraft => e.delete_draft(id, &landlord()),
        Operation::UpdateReleaseRule => e
            .update_release_rule(
                id,
                &landlord(),
                r.rule,
                RuleUpdate {
                    notification_days_before: Some(2),
                    ..RuleUpdate::default()
                },
            )
            .map(drop),
        Operation::ObjectToRelease => e
            .object_to_release(id, &tenant(), r.rule, "matrix".to_string())
            .map(drop),
        Operation::TriggerManualRelease => e
            .trigger_manual_release(id, &landlord(), r.rule)
            .map(drop),
        Operation::RespondToApproval => e
            .respond_to_approval(id, &tenant(), r.approval, true)
            .map(drop),
        Operation::ExecuteRelease => unreachable!("driven by the sweeper only"),
    }
}

fn external_operations() -> impl Iterator<Item = Operation> {
    Operation::ALL
        .into_iter()
        .filter(|op| *op != Operation::ExecuteRelease)
}

#[test]
fn operations_rejected_outside_permitted_statuses() {
    for status in EscrowStatus::ALL {
        for op in external_operations() {
            if op.permitted_in().contains(&status) {
                continue;
            }
            let h = Harness::new();
            let id = h.escrow_in(status);
            let before = h.engine.get_escrow(id).unwrap();
            let trail_before = h.engine.get_audit_trail(id).len();

            let err = invoke(&h, id, op).expect_err(&format!("{op} must fail in {status}"));
            if op == Operation::Fund {
                assert!(
                    matches!(err, EscrowError::NotEligible { .. }),
                    "fund in {status}: expected NotEligible, got {err:?}"
                );
            } else {
                match &err {
                    EscrowError::InvalidTransition {
                        operation,
                        current,
                        required,
                        ..
                    } => {
                        assert_eq!(*operation, op);
                        assert_eq!(*current, status);
                        assert_eq!(required.as_slice(), op.permitted_in());
                    }
                    other => panic!("{op} in {status}: expected InvalidTransition, got {other:?}"),
                }
            }

            let after = h.engine.get_escrow(id).unwrap();
            assert_eq!(after.version, before.version, "{op} in {status} committed");
            assert_eq!(h.engine.get_audit_trail(id).len(), trail_before);
        }
    }
}

#[test]
fn operations_pass_status_check_in_permitted_statuses() {
    for status in EscrowStatus::ALL {
        for op in external_operations() {
            if !op.permitted_in().contains(&status) {
                continue;
            }
            let h = Harness::new();
            let id = h.escrow_in(status);
            if let Err(err) = invoke(&h, id, op) {
                assert!(
                    !err.is_status_rejection(),
                    "{op} in {status} rejected on status: {err}"
                );
            }
        }
    }
}

#[test]
fn every_non_terminal_status_permits_some_operation() {
    for status in EscrowStatus::ALL {
        let permitted = Operation::ALL
            .into_iter()
            .filter(|op| op.permitted_in().contains(&status))
            .count();
        assert_eq!(
            permitted == 0,
            status.is_terminal(),
            "{status:?} permits {permitted} operations"
        );
    }
}
