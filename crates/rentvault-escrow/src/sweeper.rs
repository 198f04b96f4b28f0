//! # Deadline Sweeper
//!
//! A [`Sweeper`] is a named sweep identity over a shared engine. A single
//! pass ([`Sweeper::run_once`]) is what an external scheduler calls;
//! [`Sweeper::spawn`] runs passes on a Tokio interval until the returned
//! handle is stopped.
//!
//! Any number of sweepers may run against the same store. The claim commit
//! in [`EscrowEngine::sweep_as`] guarantees each deadline fires once.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use rentvault_core::SweeperId;

use crate::deadline::{DeadlineOutcome, ProcessedDeadline};
use crate::orchestrator::EscrowEngine;

/// Totals over the lifetime of a spawned sweeper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Completed passes.
    pub passes: u64,
    /// Deadlines processed.
    pub processed: usize,
    /// Deadlines whose action failed.
    pub failed: usize,
}

/// Sweeper lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SweeperError {
    /// `spawn` was called outside a Tokio runtime.
    #[error("no async runtime available for the sweeper")]
    NoRuntime,
    /// The sweeper task panicked or was aborted.
    #[error("sweeper task ended abnormally: {0}")]
    Join(String),
}

/// A sweep identity bound to an engine.
#[derive(Debug, Clone)]
pub struct Sweeper {
    engine: Arc<EscrowEngine>,
    id: SweeperId,
}

impl Sweeper {
    /// A sweeper with a fresh identity.
    pub fn new(engine: Arc<EscrowEngine>) -> Self {
        Self {
            engine,
            id: SweeperId::new(),
        }
    }

    /// This sweeper's identity.
    pub fn id(&self) -> SweeperId {
        self.id
    }

    /// One pass over all due deadlines.
    pub fn run_once(&self) -> Vec<ProcessedDeadline> {
        self.engine.sweep_as(self.id)
    }

    /// Run a pass every `period` on the current Tokio runtime. The first
    /// pass starts immediately.
    pub fn spawn(self, period: Duration) -> Result<SweeperHandle, SweeperError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SweeperError::NoRuntime)?;
        let (stop, mut stopped) = oneshot::channel::<()>();
        let sweeper_id = self.id;
        let task = runtime.spawn(async move {
            let mut stats = SweepStats::default();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(sweeper = %sweeper_id, period_ms = period.as_millis() as u64, "sweeper started");
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let pass = self.clone();
                        match tokio::task::spawn_blocking(move || pass.run_once()).await {
                            Ok(processed) => {
                                stats.passes += 1;
                                stats.processed += processed.len();
                                stats.failed += processed
                                    .iter()
                                    .filter(|p| matches!(p.outcome, DeadlineOutcome::Failed(_)))
                                    .count();
                            }
                            Err(e) => {
                                tracing::warn!(sweeper = %sweeper_id, error = %e, "sweep pass aborted");
                            }
                        }
                    }
                }
            }
            tracing::info!(sweeper = %sweeper_id, passes = stats.passes, "sweeper stopped");
            stats
        });
        Ok(SweeperHandle { stop, task })
    }
}

/// Control handle for a spawned sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<SweepStats>,
}

impl SweeperHandle {
    /// Stop after the pass in progress, if any, and return the totals.
    pub async fn stop(self) -> Result<SweepStats, SweeperError> {
        // A send error means the task already ended; the join reports why.
        let _ = self.stop.send(());
        self.task
            .await
            .map_err(|e| SweeperError::Join(e.to_string()))
    }
}
