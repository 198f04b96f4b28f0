//! # rentvault-cli: Escrow Scenario Runner
//!
//! Provides the `rentvault` command-line interface over the in-memory
//! escrow engine.
//!
//! ## Subcommands
//!
//! - `rentvault simulate`: run a scenario script on a simulated clock and
//!   print step outcomes, the verified audit trail and the statement.
//! - `rentvault transitions`: print the lifecycle transition table.
//! - `rentvault sweep`: run a scenario, then drive periodic sweepers.
//!
//! ```bash
//! rentvault simulate scenarios/move-out.yaml
//! rentvault -v sweep scenarios/move-out.yaml --advance-days 14 --sweepers 3
//! ```
//!
//! Handlers parse arguments and print; lifecycle rules live in
//! `rentvault-escrow`.

pub mod script;
pub mod simulate;
pub mod sweep;
pub mod transitions;
