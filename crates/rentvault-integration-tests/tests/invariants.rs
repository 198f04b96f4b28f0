//! Property tests for the money invariants that must hold after every
//! committed operation.

mod common;

use proptest::prelude::*;

use common::*;

use rentvault_core::Amount;
use rentvault_escrow::{
    ClaimRequest, ClaimType, EscrowError, EscrowStatus, LimitKind, MonetaryBreakdown, NewEscrow,
};

fn breakdown() -> impl Strategy<Value = MonetaryBreakdown> {
    (1u64..50_000, 0u64..10_000, 0u64..10_000, 0u64..5_000).prop_map(
        |(deposit, first_month, prepaid, utilities)| MonetaryBreakdown {
            deposit: Amount::new(deposit),
            first_month: Amount::new(first_month),
            prepaid: Amount::new(prepaid),
            utilities: Amount::new(utilities),
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn total_is_component_sum(amounts in breakdown()) {
        let h = Harness::new();
        let id = h.active(NewEscrow { amounts, ..deposit_only(1) });
        let escrow = h.engine.get_escrow(id).unwrap();
        let sum = amounts.deposit.minor_units()
            + amounts.first_month.minor_units()
            + amounts.prepaid.minor_units()
            + amounts.utilities.minor_units();
        prop_assert_eq!(escrow.total_amount, Amount::new(sum));
        prop_assert_eq!(escrow.statement().deposits, Amount::new(sum));
        prop_assert!(escrow.check_invariants().is_ok());
    }

    #[test]
    fn cumulative_claims_bounded_by_deposit(
        deposit in 1_000u64..20_000,
        claims in proptest::collection::vec(1u64..8_000, 1..6),
    ) {
        let h = Harness::new();
        let id = h.release_pending(deposit_only(deposit));
        let mut committed = 0u64;
        for amount in claims {
            let result = h.engine.raise_claim(
                id,
                &landlord(),
                ClaimRequest {
                    claim_type: ClaimType::Deduction,
                    amount: Amount::new(amount),
                    description: "wear beyond fair use".to_string(),
                },
            );
            match result {
                Ok(_) => {
                    committed += amount;
                    prop_assert!(committed <= deposit);
                }
                Err(EscrowError::LimitExceeded { limit, requested, available, .. }) => {
                    prop_assert_eq!(limit, LimitKind::ClaimAmount);
                    prop_assert_eq!(requested, amount);
                    prop_assert_eq!(available, deposit - committed);
                    prop_assert!(committed + amount > deposit);
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }
        let escrow = h.engine.get_escrow(id).unwrap();
        prop_assert_eq!(escrow.committed_claim_amount(None), Amount::new(committed));
        prop_assert!(escrow.check_invariants().is_ok());
    }

    #[test]
    fn accepted_claim_splits_deposit_exactly(deposit in 1u64..50_000, share in 1u64..=100) {
        let amount = (deposit * share / 100).max(1);
        let h = Harness::new();
        let id = h.release_pending(deposit_only(deposit));
        let claim = h.raise(id, ClaimType::Deduction, amount);
        h.engine.respond_to_claim(id, &tenant(), claim.id, accept()).unwrap();

        let escrow = h.engine.get_escrow(id).unwrap();
        let s = escrow.statement();
        prop_assert_eq!(s.deductions, Amount::new(amount));
        prop_assert_eq!(s.releases.saturating_add(s.deductions), s.deposits);
        prop_assert_eq!(s.balance, Amount::ZERO);
        prop_assert_eq!(escrow.status, EscrowStatus::PartiallyReleased);
        prop_assert!(escrow.check_invariants().is_ok());
    }

    #[test]
    fn repeated_approval_is_idempotent(repeats in 1usize..5) {
        let h = Harness::new();
        let id = h.create(deposit_only(5_000));
        let first = h.engine.approve(id, &landlord()).unwrap();
        let trail = h.engine.get_audit_trail(id).len();
        for _ in 0..repeats {
            let again = h.engine.approve(id, &landlord()).unwrap();
            prop_assert_eq!(again.version, first.version);
            prop_assert_eq!(again.status, EscrowStatus::Draft);
        }
        prop_assert_eq!(h.engine.get_audit_trail(id).len(), trail);

        let agreed = h.engine.approve(id, &tenant()).unwrap();
        prop_assert_eq!(agreed.status, EscrowStatus::Agreed);
    }
}
