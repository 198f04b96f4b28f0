//! # Simulate Subcommand
//!
//! Runs a scenario script against a fresh in-memory engine whose clock only
//! moves when the script says `advance`. Prints each step's outcome, the
//! verified audit trail and the final statement.
//!
//! Exit code is 0 when every step met its expectation and the audit chain
//! verified, 1 otherwise.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use serde::Serialize;

use rentvault_core::{days, ApprovalId, ClaimId, EscrowId, ManualClock, RuleId};
use rentvault_escrow::{
    Actor, AuditLogEntry, ClaimReply, ClaimRequest, Collaborators, Component, DisputeResolution,
    EngineConfig, EscrowEngine, EscrowStatus, InMemoryEscrowStore, Statement,
};

use crate::script::{load_script, Script, ScriptStep, Step};

/// Arguments for `rentvault simulate`.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Scenario script (`.yaml`, `.yml` or `.json`).
    pub script: PathBuf,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

/// Execute the simulate subcommand.
pub fn run_simulate(args: &SimulateArgs) -> Result<u8> {
    let script = load_script(&args.script)?;
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let report = simulate(&script, config)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(if report.passed() { 0 } else { 1 })
}

/// Run a whole script and build its report.
pub fn simulate(script: &Script, config: EngineConfig) -> Result<SimulationReport> {
    let mut sim = Simulation::start(script, config)?;
    let steps = sim.run_steps(&script.steps);
    Ok(sim.report(steps))
}

// -----------------------------------------------------------------------
// Simulation
// -----------------------------------------------------------------------

/// A running scenario: one escrow on a manually driven clock.
#[derive(Debug)]
pub struct Simulation {
    engine: Arc<EscrowEngine>,
    clock: ManualClock,
    escrow_id: EscrowId,
    claims: BTreeMap<String, ClaimId>,
    approvals: BTreeMap<String, ApprovalId>,
}

impl Simulation {
    /// Create the script's escrow at its start time.
    pub fn start(script: &Script, config: EngineConfig) -> Result<Self> {
        let clock = ManualClock::new(script.start);
        let engine = Arc::new(EscrowEngine::new(
            Arc::new(InMemoryEscrowStore::new()),
            Arc::new(clock.clone()),
            Collaborators::default(),
            config,
        ));
        let escrow = engine
            .create_escrow(script.escrow.clone())
            .context("failed to create escrow")?;
        tracing::info!(escrow_id = %escrow.id, start = %script.start, "simulation started");
        Ok(Self {
            engine,
            clock,
            escrow_id: escrow.id,
            claims: BTreeMap::new(),
            approvals: BTreeMap::new(),
        })
    }

    /// The engine under simulation.
    pub fn engine(&self) -> &Arc<EscrowEngine> {
        &self.engine
    }

    /// The simulated clock.
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// The scripted escrow.
    pub fn escrow_id(&self) -> EscrowId {
        self.escrow_id
    }

    /// Run steps in order. A failing step does not stop the run.
    pub fn run_steps(&mut self, steps: &[ScriptStep]) -> Vec<StepReport> {
        steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let at = self.engine.now();
                let result = self.apply(&s.step);
                let report = StepReport::new(i + 1, s, at, result);
                if !report.passed {
                    tracing::warn!(step = report.index, op = report.op, outcome = %report.outcome, "step did not meet expectation");
                }
                report
            })
            .collect()
    }

    /// Apply one step, returning a one-line summary.
    pub fn apply(&mut self, step: &Step) -> Result<String> {
        let id = self.escrow_id;
        let engine = self.engine.clone();
        match step {
            Step::Approve { party } => {
                let e = engine.approve(id, party)?;
                Ok(format!("status {}", e.status))
            }
            Step::AmendTerms { party, amendment } => {
                let e = engine.amend_terms(id, party, amendment.clone())?;
                Ok(format!("terms version {}", e.terms_version))
            }
            Step::DeleteDraft { party } => {
                engine.delete_draft(id, party)?;
                Ok("draft deleted".to_string())
            }
            Step::Fund { party, reference } => {
                let e = engine.fund(id, party, reference)?;
                Ok(format!("status {}, {} held", e.status, e.total_amount))
            }
            Step::RequestRelease { party, reason } => {
                let e = engine.request_release(id, party, reason.clone())?;
                Ok(match e.claim_window_ends {
                    Some(ends) => format!("status {}, claim window ends {ends}", e.status),
                    None => format!("status {}", e.status),
                })
            }
            Step::UpdateReleaseRule {
                party,
                component,
                update,
            } => {
                let rule_id = self.rule_id(*component)?;
                let rule = engine.update_release_rule(id, party, rule_id, update.clone())?;
                Ok(match rule.trigger_date {
                    Some(due) => format!("{component} rule due {due}"),
                    None => format!("{component} rule updated"),
                })
            }
            Step::ObjectToRelease {
                party,
                component,
                reason,
            } => {
                let rule_id = self.rule_id(*component)?;
                engine.object_to_release(id, party, rule_id, reason.clone())?;
                Ok(format!("{component} release objected"))
            }
            Step::TriggerManualRelease {
                party,
                component,
                label,
            } => {
                let rule_id = self.rule_id(*component)?;
                let approval = engine.trigger_manual_release(id, party, rule_id)?;
                self.approvals.insert(label.clone(), approval.id);
                Ok(format!(
                    "approval {label} awaiting {} until {}",
                    approval.approver, approval.deadline
                ))
            }
            Step::RespondToApproval {
                party,
                approval,
                approve,
            } => {
                let approval_id = *self
                    .approvals
                    .get(approval)
                    .with_context(|| format!("unknown approval label: {approval}"))?;
                let e = engine.respond_to_approval(id, party, approval_id, *approve)?;
                Ok(format!(
                    "approval {approval} {}, balance {}",
                    if *approve { "approved" } else { "rejected" },
                    e.statement().balance
                ))
            }
            Step::RaiseClaim {
                party,
                label,
                claim_type,
                amount,
                description,
            } => {
                if self.claims.contains_key(label) {
                    bail!("claim label already used: {label}");
                }
                let claim = engine.raise_claim(
                    id,
                    party,
                    ClaimRequest {
                        claim_type: *claim_type,
                        amount: *amount,
                        description: description.clone(),
                    },
                )?;
                self.claims.insert(label.clone(), claim.id);
                Ok(format!("claim {label} {} for {}", claim.status, claim.amount))
            }
            Step::RespondToClaim {
                party,
                claim,
                action,
                amount,
                comment,
            } => {
                let claim_id = *self
                    .claims
                    .get(claim)
                    .with_context(|| format!("unknown claim label: {claim}"))?;
                let updated = engine.respond_to_claim(
                    id,
                    party,
                    claim_id,
                    ClaimReply {
                        action: *action,
                        amount: *amount,
                        comment: comment.clone(),
                    },
                )?;
                Ok(format!(
                    "claim {claim} {} at {}",
                    updated.status, updated.current_amount
                ))
            }
            Step::Settle { party } => {
                let summary = engine.settle(id, actor(party))?;
                Ok(format!(
                    "status {}: released {}, refunded {}, deducted {}",
                    summary.status,
                    summary.released_to_tenant,
                    summary.refunded_to_tenant,
                    summary.deducted_to_landlord
                ))
            }
            Step::Escalate { party, reference } => {
                let e = engine.escalate(id, actor(party), reference.clone())?;
                Ok(format!("status {}", e.status))
            }
            Step::ResolveDispute {
                deduction,
                summary,
                decided_by,
            } => {
                let e = engine.resolve_dispute(
                    id,
                    DisputeResolution {
                        deduction_to_landlord: *deduction,
                        summary: summary.clone(),
                        decided_by: decided_by.clone(),
                    },
                )?;
                Ok(format!("status {}", e.status))
            }
            Step::Close { party } => {
                let e = engine.close(id, party)?;
                Ok(format!("status {}", e.status))
            }
            Step::Advance { days: d, hours } => {
                self.clock
                    .advance(days(*d) + Duration::hours(i64::from(*hours)));
                Ok(format!("now {}", self.clock_now()))
            }
            Step::Sweep => {
                let processed = engine.run_deadline_sweep();
                if processed.is_empty() {
                    return Ok("no deadlines due".to_string());
                }
                let fired: Vec<String> = processed
                    .iter()
                    .map(|p| format!("{} {} {}", p.kind, p.action, p.outcome))
                    .collect();
                Ok(fired.join("; "))
            }
            Step::ExpectStatus { status } => {
                let e = engine.get_escrow(id)?;
                if e.status != *status {
                    bail!("expected status {status}, found {}", e.status);
                }
                Ok(format!("status is {status}"))
            }
            Step::ExpectBalance { amount } => {
                let balance = engine.get_statement(id)?.balance;
                if balance != *amount {
                    bail!("expected balance {amount}, found {balance}");
                }
                Ok(format!("balance is {amount}"))
            }
        }
    }

    fn clock_now(&self) -> DateTime<Utc> {
        self.engine.now()
    }

    fn rule_id(&self, component: Component) -> Result<RuleId> {
        let escrow = self.engine.get_escrow(self.escrow_id)?;
        escrow
            .release_rules
            .iter()
            .find(|r| r.component == component)
            .map(|r| r.id)
            .with_context(|| format!("no release rule for {component}"))
    }

    /// Final state, audit trail and chain verification.
    pub fn report(&self, steps: Vec<StepReport>) -> SimulationReport {
        let escrow = self.engine.get_escrow(self.escrow_id).ok();
        let (verified_entries, chain_error) = match self.engine.verify_audit_trail(self.escrow_id)
        {
            Ok(n) => (Some(n), None),
            Err(e) => (None, Some(e.to_string())),
        };
        SimulationReport {
            escrow_id: self.escrow_id,
            final_status: escrow.as_ref().map(|e| e.status),
            statement: escrow.as_ref().map(|e| e.statement()),
            steps,
            audit_trail: self.engine.get_audit_trail(self.escrow_id),
            verified_entries,
            chain_error,
        }
    }
}

fn actor(party: &Option<rentvault_core::PartyId>) -> Actor {
    match party {
        Some(p) => Actor::Party(p.clone()),
        None => Actor::System,
    }
}

// -----------------------------------------------------------------------
// Reports
// -----------------------------------------------------------------------

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based position in the script.
    pub index: usize,
    /// The step's `op`.
    pub op: &'static str,
    /// Simulated time when the step ran.
    pub at: DateTime<Utc>,
    /// Whether the step itself succeeded.
    pub ok: bool,
    /// Summary on success, error text on failure.
    pub outcome: String,
    /// Whether the outcome matched `expect_error`.
    pub passed: bool,
}

impl StepReport {
    fn new(index: usize, step: &ScriptStep, at: DateTime<Utc>, result: Result<String>) -> Self {
        let (ok, outcome) = match result {
            Ok(summary) => (true, summary),
            Err(e) => (false, format!("{e:#}")),
        };
        let passed = match &step.expect_error {
            None => ok,
            Some(expected) => !ok && outcome.contains(expected.as_str()),
        };
        Self {
            index,
            op: step.step.op(),
            at,
            ok,
            outcome,
            passed,
        }
    }
}

/// Everything `simulate` prints.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// The scripted escrow.
    pub escrow_id: EscrowId,
    /// `None` once the draft was deleted.
    pub final_status: Option<EscrowStatus>,
    /// Per-step outcomes.
    pub steps: Vec<StepReport>,
    /// Ledger summary, while the escrow exists.
    pub statement: Option<Statement>,
    /// Oldest first.
    pub audit_trail: Vec<AuditLogEntry>,
    /// Entry count when the hash chain verified.
    pub verified_entries: Option<usize>,
    /// Why the hash chain did not verify.
    pub chain_error: Option<String>,
}

impl SimulationReport {
    /// All steps met expectations and the audit chain verified.
    pub fn passed(&self) -> bool {
        self.chain_error.is_none() && self.steps.iter().all(|s| s.passed)
    }
}

fn print_report(report: &SimulationReport) {
    println!("Escrow: {}", report.escrow_id);
    for step in &report.steps {
        let mark = if step.passed { "ok" } else { "FAIL" };
        println!(
            "  [{mark:>4}] #{:<3} {:<24} {}",
            step.index, step.op, step.outcome
        );
    }

    println!("Audit trail ({} entries):", report.audit_trail.len());
    for entry in &report.audit_trail {
        let by = entry
            .performed_by
            .as_ref()
            .map(|p| p.as_str())
            .unwrap_or("SYSTEM");
        let digest = entry.digest.to_hex();
        println!(
            "  {:>3}  {}  {:<26} {:<12} {}",
            entry.sequence,
            entry.recorded_at.format("%Y-%m-%d %H:%M"),
            entry.action,
            by,
            &digest[..12.min(digest.len())]
        );
    }
    match (&report.verified_entries, &report.chain_error) {
        (Some(n), _) => println!("  chain verified ({n} entries)"),
        (None, Some(e)) => println!("  chain BROKEN: {e}"),
        (None, None) => {}
    }

    match (&report.final_status, &report.statement) {
        (Some(status), Some(s)) => {
            println!("Status: {status}");
            println!("Statement:");
            println!("  deposits    {}", s.deposits);
            println!("  releases    {}", s.releases);
            println!("  refunds     {}", s.refunds);
            println!("  deductions  {}", s.deductions);
            println!("  pending     {}", s.pending);
            println!("  balance     {}", s.balance);
        }
        _ => println!("Status: deleted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(steps: &str) -> Script {
        let yaml = format!(
            r#"
start: 2026-01-01T00:00:00Z
escrow:
  created_by: landlord-1
  landlord_id: landlord-1
  tenant_id: tenant-1
  property_ref: 12 Harbour Lane, Flat 3
  amounts: {{ deposit: 10000, first_month: 0, prepaid: 0, utilities: 0 }}
  lease: {{ start_date: 2026-01-01T00:00:00Z, end_date: null }}
steps:
{steps}
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    const SIGN_AND_FUND: &str = r#"
  - op: approve
    party: landlord-1
  - op: approve
    party: tenant-1
  - op: fund
    party: tenant-1
  - op: expect_status
    status: ACTIVE
"#;

    #[test]
    fn silent_claim_window_releases_deposit() {
        let steps = format!(
            "{SIGN_AND_FUND}{}",
            r#"
  - op: request_release
    party: tenant-1
  - op: advance
    days: 13
  - op: sweep
  - op: expect_status
    status: RELEASE_PENDING
  - op: advance
    days: 1
  - op: sweep
  - op: expect_status
    status: RELEASED
  - op: expect_balance
    amount: 0
  - op: close
    party: landlord-1
  - op: expect_status
    status: CLOSED
"#
        );
        let report = simulate(&script(&steps), EngineConfig::default()).unwrap();
        assert!(report.passed(), "{report:#?}");
        assert_eq!(report.final_status, Some(EscrowStatus::Closed));
        let s = report.statement.unwrap();
        assert_eq!(s.deposits.minor_units(), 10_000);
        assert_eq!(s.releases.minor_units(), 10_000);
        assert_eq!(report.verified_entries, Some(report.audit_trail.len()));
        assert!(report.audit_trail.iter().any(|e| e.action == "SETTLED"));
    }

    #[test]
    fn accepted_claim_deducts_and_partially_releases() {
        let steps = format!(
            "{SIGN_AND_FUND}{}",
            r#"
  - op: request_release
    party: tenant-1
  - op: raise_claim
    party: landlord-1
    label: paint
    claim_type: DEDUCTION
    amount: 3000
    description: repainting the hallway
  - op: respond_to_claim
    party: landlord-1
    claim: paint
    action: ACCEPT
    expect_error: own
  - op: respond_to_claim
    party: tenant-1
    claim: paint
    action: ACCEPT
  - op: expect_status
    status: PARTIALLY_RELEASED
"#
        );
        let report = simulate(&script(&steps), EngineConfig::default()).unwrap();
        assert!(report.passed(), "{report:#?}");
        let s = report.statement.unwrap();
        assert_eq!(s.deductions.minor_units(), 3_000);
        assert_eq!(s.balance.minor_units(), 0);
    }

    #[test]
    fn unmet_expectation_fails_report() {
        let steps = r#"
  - op: fund
    party: tenant-1
  - op: respond_to_claim
    party: tenant-1
    claim: nope
    action: REJECT
    expect_error: unknown claim label
"#;
        let report = simulate(&script(steps), EngineConfig::default()).unwrap();
        assert!(!report.passed());
        assert!(!report.steps[0].ok);
        assert!(!report.steps[0].passed);
        assert!(report.steps[1].passed);
        assert_eq!(report.final_status, Some(EscrowStatus::Draft));
    }

    #[test]
    fn deleted_draft_keeps_audit_trail() {
        let steps = r#"
  - op: delete_draft
    party: tenant-1
"#;
        let report = simulate(&script(steps), EngineConfig::default()).unwrap();
        assert!(report.passed(), "{report:#?}");
        assert_eq!(report.final_status, None);
        assert!(report.statement.is_none());
        assert_eq!(report.audit_trail.len(), 2);
        assert_eq!(report.verified_entries, Some(2));
    }

    #[test]
    fn script_file_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yaml");
        let mut body = serde_yaml::to_string(&serde_json::json!({
            "escrow": {
                "created_by": "landlord-1",
                "landlord_id": "landlord-1",
                "tenant_id": "tenant-1",
                "property_ref": "Flat 9",
                "amounts": {"deposit": 800, "first_month": 0, "prepaid": 0, "utilities": 0},
                "lease": {"start_date": "2026-01-01T00:00:00Z", "end_date": null}
            }
        }))
        .unwrap();
        body.push_str("steps:\n");
        body.push_str(SIGN_AND_FUND);
        std::fs::write(&path, body).unwrap();

        let code = run_simulate(&SimulateArgs {
            script: path,
            json: true,
        })
        .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn bundled_move_out_scenario_passes() {
        let script: Script =
            serde_yaml::from_str(include_str!("../scenarios/move-out.yaml")).unwrap();
        let report = simulate(&script, EngineConfig::default()).unwrap();
        assert!(report.passed(), "{report:#?}");
        let s = report.statement.unwrap();
        assert_eq!(s.deductions.minor_units(), 1_000);
        assert_eq!(s.balance.minor_units(), 0);
    }

    #[test]
    fn invalid_escrow_is_an_error() {
        let mut s = script("");
        s.escrow.tenant_id = s.escrow.landlord_id.clone();
        assert!(simulate(&s, EngineConfig::default()).is_err());
    }
}
