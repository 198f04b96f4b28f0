//! # Scenario Scripts
//!
//! A script describes one escrow and an ordered list of steps to run
//! against it. Scripts are YAML or JSON; the format is chosen by file
//! extension (`.json` is JSON, anything else is YAML).
//!
//! ```yaml
//! start: 2026-01-01T00:00:00Z
//! escrow:
//!   created_by: landlord-1
//!   landlord_id: landlord-1
//!   tenant_id: tenant-1
//!   property_ref: 12 Harbour Lane
//!   amounts: { deposit: 10000, first_month: 0, prepaid: 0, utilities: 0 }
//!   lease: { start_date: 2026-01-01T00:00:00Z, end_date: null }
//! steps:
//!   - op: approve
//!     party: landlord-1
//!   - op: raise_claim
//!     party: landlord-1
//!     label: paint
//!     claim_type: DEDUCTION
//!     amount: 300
//!     description: repainting
//!     expect_error: not permitted
//! ```
//!
//! Claims and approvals get random identifiers at runtime, so scripts name
//! them with a `label` when they are created and refer to the label later.
//! Release rules are referred to by component.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use rentvault_core::{Amount, PartyId};
use rentvault_escrow::{
    ClaimType, Component, EscrowStatus, NewEscrow, ResponseAction, RuleUpdate, TermsAmendment,
};

/// A parsed scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Simulated time at which the escrow is created.
    #[serde(default = "default_start")]
    pub start: DateTime<Utc>,
    /// The escrow to create.
    pub escrow: NewEscrow,
    /// Steps, run in order.
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

fn default_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// One step plus its expectation.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptStep {
    /// What to do.
    #[serde(flatten)]
    pub step: Step,
    /// When set, the step must fail with an error containing this text.
    #[serde(default)]
    pub expect_error: Option<String>,
}

/// A scripted action.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Sign the current contract version.
    Approve { party: PartyId },
    /// Replace draft terms.
    AmendTerms {
        party: PartyId,
        amendment: TermsAmendment,
    },
    /// Delete the draft.
    DeleteDraft { party: PartyId },
    /// Tenant deposit.
    Fund {
        party: PartyId,
        #[serde(default = "default_reference")]
        reference: String,
    },
    /// Move-out.
    RequestRelease {
        party: PartyId,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Change a scheduled release rule.
    UpdateReleaseRule {
        party: PartyId,
        component: Component,
        update: RuleUpdate,
    },
    /// Object inside a release's objection window.
    ObjectToRelease {
        party: PartyId,
        component: Component,
        reason: String,
    },
    /// Ask the counterparty to approve a manual release.
    TriggerManualRelease {
        party: PartyId,
        component: Component,
        label: String,
    },
    /// Answer a pending approval.
    RespondToApproval {
        party: PartyId,
        approval: String,
        approve: bool,
    },
    /// Raise a claim.
    RaiseClaim {
        party: PartyId,
        label: String,
        claim_type: ClaimType,
        amount: Amount,
        description: String,
    },
    /// Accept, reject or counter a claim.
    RespondToClaim {
        party: PartyId,
        claim: String,
        action: ResponseAction,
        #[serde(default)]
        amount: Option<Amount>,
        #[serde(default)]
        comment: Option<String>,
    },
    /// Explicit settlement; SYSTEM when no party is given.
    Settle {
        #[serde(default)]
        party: Option<PartyId>,
    },
    /// DISPUTED to ESCALATED; SYSTEM when no party is given.
    Escalate {
        #[serde(default)]
        party: Option<PartyId>,
        #[serde(default)]
        reference: Option<String>,
    },
    /// Apply an arbitration outcome.
    ResolveDispute {
        deduction: Amount,
        summary: String,
        decided_by: String,
    },
    /// Close a released escrow.
    Close { party: PartyId },
    /// Move the simulated clock forward.
    Advance {
        #[serde(default)]
        days: u32,
        #[serde(default)]
        hours: u32,
    },
    /// One deadline sweep pass.
    Sweep,
    /// Assert the escrow's status.
    ExpectStatus { status: EscrowStatus },
    /// Assert the held balance.
    ExpectBalance { amount: Amount },
}

fn default_reference() -> String {
    "SIM-PAYMENT".to_string()
}

impl Step {
    /// The step's `op` tag.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::AmendTerms { .. } => "amend_terms",
            Self::DeleteDraft { .. } => "delete_draft",
            Self::Fund { .. } => "fund",
            Self::RequestRelease { .. } => "request_release",
            Self::UpdateReleaseRule { .. } => "update_release_rule",
            Self::ObjectToRelease { .. } => "object_to_release",
            Self::TriggerManualRelease { .. } => "trigger_manual_release",
            Self::RespondToApproval { .. } => "respond_to_approval",
            Self::RaiseClaim { .. } => "raise_claim",
            Self::RespondToClaim { .. } => "respond_to_claim",
            Self::Settle { .. } => "settle",
            Self::Escalate { .. } => "escalate",
            Self::ResolveDispute { .. } => "resolve_dispute",
            Self::Close { .. } => "close",
            Self::Advance { .. } => "advance",
            Self::Sweep => "sweep",
            Self::ExpectStatus { .. } => "expect_status",
            Self::ExpectBalance { .. } => "expect_balance",
        }
    }
}

/// Read and parse a script file.
pub fn load_script(path: &Path) -> Result<Script> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script: {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("invalid JSON in {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid YAML in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
start: 2026-03-01T00:00:00Z
escrow:
  created_by: landlord-1
  landlord_id: landlord-1
  tenant_id: tenant-1
  property_ref: 4 Mill Road
  amounts: { deposit: 10000, first_month: 0, prepaid: 0, utilities: 0 }
  lease: { start_date: 2026-03-01T00:00:00Z, end_date: null }
steps:
  - op: approve
    party: landlord-1
  - op: advance
    days: 3
  - op: sweep
  - op: fund
    party: landlord-1
    expect_error: may not
  - op: expect_status
    status: DRAFT
"#;

    #[test]
    fn yaml_script_parses() {
        let script: Script = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(script.start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(script.escrow.amounts.deposit, Amount::new(10_000));
        let ops: Vec<_> = script.steps.iter().map(|s| s.step.op()).collect();
        assert_eq!(ops, ["approve", "advance", "sweep", "fund", "expect_status"]);
        assert_eq!(script.steps[3].expect_error.as_deref(), Some("may not"));
        match &script.steps[1].step {
            Step::Advance { days, hours } => assert_eq!((*days, *hours), (3, 0)),
            other => panic!("unexpected step {other:?}"),
        }
        match &script.steps[3].step {
            Step::Fund { reference, .. } => assert_eq!(reference, "SIM-PAYMENT"),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn json_extension_selects_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.json");
        std::fs::write(
            &path,
            r#"{
                "escrow": {
                    "created_by": "tenant-1",
                    "landlord_id": "landlord-1",
                    "tenant_id": "tenant-1",
                    "property_ref": "Flat 2",
                    "amounts": {"deposit": 500, "first_month": 0, "prepaid": 0, "utilities": 0},
                    "lease": {"start_date": "2026-01-01T00:00:00Z", "end_date": null}
                },
                "steps": [{"op": "sweep"}]
            }"#,
        )
        .unwrap();
        let script = load_script(&path).unwrap();
        assert_eq!(script.start, default_start());
        assert_eq!(script.steps.len(), 1);
        assert!(matches!(script.steps[0].step, Step::Sweep));
    }

    #[test]
    fn empty_party_rejected_at_parse_time() {
        let bad = YAML.replace("party: landlord-1\n  - op: advance", "party: \"  \"\n  - op: advance");
        assert!(serde_yaml::from_str::<Script>(&bad).is_err());
    }

    #[test]
    fn unknown_op_rejected() {
        let bad = YAML.replace("op: sweep", "op: teleport");
        assert!(serde_yaml::from_str::<Script>(&bad).is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_script(Path::new("/nonexistent/scenario.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/scenario.yaml"));
    }
}
