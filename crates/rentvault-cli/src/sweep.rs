//! # Sweep Subcommand
//!
//! Brings a scenario to its scripted state, moves the clock forward and
//! lets one or more periodic sweepers run against the shared engine for a
//! fixed wall-clock duration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;

use rentvault_core::days;
use rentvault_escrow::{EngineConfig, EscrowEngine, SweepStats, Sweeper};

use crate::script::load_script;
use crate::simulate::Simulation;

/// Arguments for `rentvault sweep`.
#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Scenario script to run before sweeping.
    pub script: PathBuf,

    /// Days to advance the simulated clock once the script has run.
    #[arg(long, default_value_t = 0)]
    pub advance_days: u32,

    /// Number of concurrent sweepers.
    #[arg(long, default_value_t = 1)]
    pub sweepers: usize,

    /// Milliseconds between passes.
    #[arg(long, default_value_t = 50)]
    pub interval_ms: u64,

    /// Milliseconds to keep sweeping.
    #[arg(long, default_value_t = 500)]
    pub duration_ms: u64,
}

/// Execute the sweep subcommand.
pub fn run_sweep(args: &SweepArgs) -> Result<u8> {
    if args.interval_ms == 0 {
        bail!("--interval-ms must be positive");
    }
    let script = load_script(&args.script)?;
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let mut sim = Simulation::start(&script, config)?;
    for step in sim.run_steps(&script.steps) {
        if !step.passed {
            bail!(
                "step #{} ({}) did not meet its expectation: {}",
                step.index,
                step.op,
                step.outcome
            );
        }
    }
    sim.clock().advance(days(args.advance_days));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let stats = runtime.block_on(sweep_for(
        sim.engine().clone(),
        args.sweepers.max(1),
        Duration::from_millis(args.interval_ms),
        Duration::from_millis(args.duration_ms),
    ))?;

    for (i, s) in stats.iter().enumerate() {
        println!(
            "sweeper {}: {} passes, {} processed, {} failed",
            i + 1,
            s.passes,
            s.processed,
            s.failed
        );
    }
    let escrow = sim.engine().get_escrow(sim.escrow_id())?;
    println!("Status: {}", escrow.status);
    println!("Balance: {}", escrow.statement().balance);
    Ok(0)
}

/// Run `sweepers` periodic sweepers for `run_for`, then stop them all.
pub async fn sweep_for(
    engine: Arc<EscrowEngine>,
    sweepers: usize,
    period: Duration,
    run_for: Duration,
) -> Result<Vec<SweepStats>> {
    let mut handles = Vec::with_capacity(sweepers);
    for _ in 0..sweepers {
        handles.push(Sweeper::new(engine.clone()).spawn(period)?);
    }
    tokio::time::sleep(run_for).await;
    let mut stats = Vec::with_capacity(handles.len());
    for handle in handles {
        stats.push(handle.stop().await?);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentvault_escrow::EscrowStatus;

    use crate::script::Script;

    const SCRIPT: &str = r#"
escrow:
  created_by: tenant-1
  landlord_id: landlord-1
  tenant_id: tenant-1
  property_ref: 7 Quay Street
  amounts: { deposit: 6000, first_month: 0, prepaid: 0, utilities: 0 }
  lease: { start_date: 2026-01-01T00:00:00Z, end_date: null }
steps:
  - op: approve
    party: landlord-1
  - op: approve
    party: tenant-1
  - op: fund
    party: tenant-1
  - op: request_release
    party: landlord-1
"#;

    #[test]
    fn competing_sweepers_release_once() {
        let script: Script = serde_yaml::from_str(SCRIPT).unwrap();
        let mut sim = Simulation::start(&script, EngineConfig::default()).unwrap();
        assert!(sim.run_steps(&script.steps).iter().all(|s| s.passed));
        sim.clock().advance(days(15));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let stats = runtime
            .block_on(sweep_for(
                sim.engine().clone(),
                3,
                Duration::from_millis(5),
                Duration::from_millis(120),
            ))
            .unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.iter().map(|s| s.processed).sum::<usize>(), 1);

        let escrow = sim.engine().get_escrow(sim.escrow_id()).unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        let settled = sim
            .engine()
            .get_audit_trail(sim.escrow_id())
            .iter()
            .filter(|e| e.action == "SETTLED")
            .count();
        assert_eq!(settled, 1);
    }

    #[test]
    fn failing_script_step_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, SCRIPT.replace("op: fund\n    party: tenant-1", "op: fund\n    party: landlord-1")).unwrap();
        let err = run_sweep(&SweepArgs {
            script: path,
            advance_days: 0,
            sweepers: 1,
            interval_ms: 5,
            duration_ms: 10,
        })
        .unwrap_err();
        assert!(err.to_string().contains("did not meet its expectation"));
    }

    #[test]
    fn zero_interval_rejected() {
        let err = run_sweep(&SweepArgs {
            script: PathBuf::from("unused.yaml"),
            advance_days: 0,
            sweepers: 1,
            interval_ms: 0,
            duration_ms: 10,
        })
        .unwrap_err();
        assert!(err.to_string().contains("interval"));
    }
}
