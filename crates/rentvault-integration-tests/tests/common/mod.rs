//! Shared fixtures: parties, a harness with recording collaborators, and
//! helpers that drive an escrow into each lifecycle status through the
//! public engine API.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use rentvault_core::{days, Amount, EscrowId, ManualClock, PartyId};
use rentvault_escrow::{
    Actor, Claim, ClaimReply, ClaimRequest, ClaimType, Collaborators, EngineConfig, EscrowConfig,
    EscrowEngine, EscrowStatus, InMemoryEscrowStore, LeaseTerms, MonetaryBreakdown, NewEscrow,
    RecordingGateway, RecordingNotifier, ReleasePlan, ResponseAction,
};

pub fn landlord() -> PartyId {
    PartyId::new("landlord-1").unwrap()
}

pub fn tenant() -> PartyId {
    PartyId::new("tenant-1").unwrap()
}

pub fn stranger() -> PartyId {
    PartyId::new("stranger-9").unwrap()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// Deposit only, no lease end: no scheduled releases interfere.
pub fn deposit_only(deposit: u64) -> NewEscrow {
    NewEscrow {
        created_by: landlord(),
        landlord_id: landlord(),
        tenant_id: tenant(),
        amounts: MonetaryBreakdown {
            deposit: Amount::new(deposit),
            ..MonetaryBreakdown::default()
        },
        property_ref: "12 Harbour Lane, Flat 3".to_string(),
        config: Some(EscrowConfig {
            claim_window_days: 14,
            ..EscrowConfig::default()
        }),
        lease: LeaseTerms {
            start_date: t0(),
            end_date: None,
        },
        release_plan: ReleasePlan::default(),
    }
}

/// All four components with a one-year lease and the default plan.
pub fn full_tenancy() -> NewEscrow {
    NewEscrow {
        amounts: MonetaryBreakdown {
            deposit: Amount::new(10_000),
            first_month: Amount::new(2_000),
            prepaid: Amount::new(1_000),
            utilities: Amount::new(500),
        },
        lease: LeaseTerms {
            start_date: t0(),
            end_date: Some(t0() + days(365)),
        },
        ..deposit_only(10_000)
    }
}

pub struct Harness {
    pub engine: Arc<EscrowEngine>,
    pub clock: ManualClock,
    pub payments: Arc<RecordingGateway>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = ManualClock::new(t0());
        let payments = Arc::new(RecordingGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let collaborators = Collaborators::default()
            .with_payments(payments.clone())
            .with_notifier(notifier.clone());
        let engine = Arc::new(EscrowEngine::new(
            Arc::new(InMemoryEscrowStore::new()),
            Arc::new(clock.clone()),
            collaborators,
            config,
        ));
        Self {
            engine,
            clock,
            payments,
            notifier,
        }
    }

    pub fn create(&self, new: NewEscrow) -> EscrowId {
        self.engine.create_escrow(new).unwrap().id
    }

    pub fn agreed(&self, new: NewEscrow) -> EscrowId {
        let id = self.create(new);
        self.engine.approve(id, &landlord()).unwrap();
        self.engine.approve(id, &tenant()).unwrap();
        id
    }

    pub fn active(&self, new: NewEscrow) -> EscrowId {
        let id = self.agreed(new);
        self.engine.fund(id, &tenant(), "PAY-0001").unwrap();
        id
    }

    pub fn release_pending(&self, new: NewEscrow) -> EscrowId {
        let id = self.active(new);
        self.engine.request_release(id, &tenant(), None).unwrap();
        id
    }

    pub fn raise(&self, id: EscrowId, claim_type: ClaimType, amount: u64) -> Claim {
        self.engine
            .raise_claim(
                id,
                &landlord(),
                ClaimRequest {
                    claim_type,
                    amount: Amount::new(amount),
                    description: format!("{claim_type:?} claim"),
                },
            )
            .unwrap()
    }

    pub fn status(&self, id: EscrowId) -> EscrowStatus {
        self.engine.get_escrow(id).unwrap().status
    }

    /// A deposit-only escrow driven into `status` through the public API.
    pub fn escrow_in(&self, status: EscrowStatus) -> EscrowId {
        let new = deposit_only(10_000);
        let id = match status {
            EscrowStatus::Draft => self.create(new),
            EscrowStatus::Agreed => self.agreed(new),
            EscrowStatus::Active => self.active(new),
            EscrowStatus::ReleasePending => self.release_pending(new),
            EscrowStatus::Released | EscrowStatus::Closed => {
                let id = self.release_pending(new);
                self.clock.advance(days(14));
                self.engine.run_deadline_sweep();
                if status == EscrowStatus::Closed {
                    self.engine.close(id, &landlord()).unwrap();
                }
                id
            }
            EscrowStatus::PartiallyReleased => {
                let id = self.release_pending(new);
                let claim = self.raise(id, ClaimType::Deduction, 2_000);
                self.engine
                    .respond_to_claim(id, &tenant(), claim.id, accept())
                    .unwrap();
                id
            }
            EscrowStatus::Disputed | EscrowStatus::Escalated => {
                let id = self.release_pending(new);
                self.raise(id, ClaimType::Dispute, 0);
                if status == EscrowStatus::Escalated {
                    self.engine
                        .escalate(id, Actor::Party(tenant()), None)
                        .unwrap();
                }
                id
            }
        };
        assert_eq!(self.status(id), status, "fixture did not reach {status}");
        id
    }
}

pub fn accept() -> ClaimReply {
    ClaimReply {
        action: ResponseAction::Accept,
        amount: None,
        comment: None,
    }
}
