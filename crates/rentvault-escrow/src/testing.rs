//! Shared fixtures for unit tests.

use chrono::{DateTime, TimeZone, Utc};

use rentvault_core::{days, Amount, DeadlineId, PartyId};

use crate::changeset::Changeset;
use crate::claim::{ClaimRequest, ClaimType};
use crate::deadline::{AutoAction, DeadlineKind};
use crate::escrow::{Actor, Escrow, EscrowConfig, LeaseTerms, MonetaryBreakdown, NewEscrow};
use crate::release::ReleasePlan;

pub(crate) fn landlord() -> PartyId {
    PartyId::new("landlord-1").unwrap()
}

pub(crate) fn tenant() -> PartyId {
    PartyId::new("tenant-1").unwrap()
}

pub(crate) fn stranger() -> PartyId {
    PartyId::new("stranger-9").unwrap()
}

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub(crate) fn new_escrow() -> NewEscrow {
    NewEscrow {
        created_by: landlord(),
        landlord_id: landlord(),
        tenant_id: tenant(),
        amounts: MonetaryBreakdown {
            deposit: Amount::new(10_000),
            first_month: Amount::new(2_000),
            prepaid: Amount::new(1_000),
            utilities: Amount::new(500),
        },
        property_ref: "12 Harbour Lane, Flat 3".to_string(),
        config: Some(EscrowConfig::default()),
        lease: LeaseTerms {
            start_date: t0(),
            end_date: Some(t0() + days(365)),
        },
        release_plan: ReleasePlan::default(),
    }
}

pub(crate) fn cx_for(party: &PartyId, now: DateTime<Utc>) -> Changeset {
    Changeset::new(now, Actor::Party(party.clone()))
}

pub(crate) fn cx_system(now: DateTime<Utc>) -> Changeset {
    Changeset::new(now, Actor::System)
}

pub(crate) fn draft() -> Escrow {
    let new = new_escrow();
    let config = new.config.unwrap_or_default();
    Escrow::create(new, config, &mut cx_for(&landlord(), t0())).unwrap()
}

fn agreed_from(new: NewEscrow) -> Escrow {
    let config = new.config.unwrap_or_default();
    let mut escrow = Escrow::create(new, config, &mut cx_for(&landlord(), t0())).unwrap();
    escrow
        .approve(&landlord(), &mut cx_for(&landlord(), t0()))
        .unwrap();
    escrow.approve(&tenant(), &mut cx_for(&tenant(), t0())).unwrap();
    escrow
}

pub(crate) fn agreed() -> Escrow {
    agreed_from(new_escrow())
}

/// Funded at `t0()`.
pub(crate) fn active_from(new: NewEscrow) -> Escrow {
    let mut escrow = agreed_from(new);
    escrow
        .fund(&tenant(), "PAY-0001", &mut cx_for(&tenant(), t0()))
        .unwrap();
    escrow
}

pub(crate) fn active() -> Escrow {
    active_from(new_escrow())
}

/// Move-out requested by the tenant at `t0()`.
pub(crate) fn release_pending() -> Escrow {
    let mut escrow = active();
    escrow
        .request_release(None, &mut cx_for(&tenant(), t0()))
        .unwrap();
    escrow
}

/// Landlord raised a DISPUTE claim at `t0()`.
pub(crate) fn disputed() -> Escrow {
    let mut escrow = release_pending();
    escrow
        .raise_claim(
            &landlord(),
            ClaimRequest {
                claim_type: ClaimType::Dispute,
                amount: Amount::ZERO,
                description: "damage beyond normal wear".to_string(),
            },
            &mut cx_for(&landlord(), t0()),
        )
        .unwrap();
    escrow
}

/// The active auto-release deadline of an escrow in RELEASE_PENDING.
pub(crate) fn claim_window_deadline(escrow: &Escrow) -> DeadlineId {
    escrow
        .deadlines
        .iter()
        .find(|d| {
            d.is_active()
                && d.kind == DeadlineKind::ClaimWindow
                && matches!(d.action, AutoAction::AutoRelease { .. })
        })
        .map(|d| d.id)
        .unwrap()
}
