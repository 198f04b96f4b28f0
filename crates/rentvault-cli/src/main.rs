//! # rentvault CLI entry point
//!
//! Parses command-line arguments and dispatches to subcommand handlers.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rentvault_cli::simulate::{run_simulate, SimulateArgs};
use rentvault_cli::sweep::{run_sweep, SweepArgs};
use rentvault_cli::transitions::{run_transitions, TransitionsArgs};

/// rentvault: rental-deposit escrow lifecycle engine.
///
/// Runs scripted escrow scenarios against an in-memory engine with a
/// simulated clock.
#[derive(Parser, Debug)]
#[command(name = "rentvault", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario script and print its audit trail and statement.
    Simulate(SimulateArgs),

    /// Print the escrow status transition table.
    Transitions(TransitionsArgs),

    /// Run a scenario, then drive periodic deadline sweepers over it.
    Sweep(SweepArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::debug!("rentvault CLI starting");

    let result = match cli.command {
        Commands::Simulate(args) => run_simulate(&args),
        Commands::Transitions(args) => run_transitions(&args),
        Commands::Sweep(args) => run_sweep(&args),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
