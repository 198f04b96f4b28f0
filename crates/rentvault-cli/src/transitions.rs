//! # Transitions Subcommand
//!
//! Prints the escrow lifecycle: the status transition table and which
//! operations each status permits.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use rentvault_escrow::{EscrowStatus, Operation};

/// Arguments for `rentvault transitions`.
#[derive(Args, Debug)]
pub struct TransitionsArgs {
    /// Print as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StatusRow {
    status: EscrowStatus,
    terminal: bool,
    next: Vec<EscrowStatus>,
    operations: Vec<Operation>,
}

fn rows() -> Vec<StatusRow> {
    EscrowStatus::ALL
        .into_iter()
        .map(|status| StatusRow {
            status,
            terminal: status.is_terminal(),
            next: status.valid_transitions().to_vec(),
            operations: Operation::ALL
                .into_iter()
                .filter(|op| op.permitted_in().contains(&status))
                .collect(),
        })
        .collect()
}

/// Execute the transitions subcommand.
pub fn run_transitions(args: &TransitionsArgs) -> Result<u8> {
    let rows = rows();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    for row in &rows {
        let next: Vec<&str> = row.next.iter().map(|s| s.as_str()).collect();
        println!(
            "{:<20} -> {}",
            row.status.as_str(),
            if row.terminal {
                "(terminal)".to_string()
            } else {
                next.join(", ")
            }
        );
        let ops: Vec<&str> = row.operations.iter().map(|o| o.as_str()).collect();
        println!("{:<20}    ops: {}", "", ops.join(", "));
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_status_listed_once() {
        let rows = rows();
        assert_eq!(rows.len(), EscrowStatus::ALL.len());
        assert!(rows.iter().filter(|r| r.terminal).all(|r| r.next.is_empty()));
    }

    #[test]
    fn draft_permits_drafting_operations_only() {
        let draft = rows()
            .into_iter()
            .find(|r| r.status == EscrowStatus::Draft)
            .unwrap();
        assert_eq!(
            draft.operations,
            vec![Operation::Approve, Operation::AmendTerms, Operation::DeleteDraft]
        );
    }

    #[test]
    fn closed_permits_nothing() {
        let closed = rows()
            .into_iter()
            .find(|r| r.status == EscrowStatus::Closed)
            .unwrap();
        assert!(closed.operations.is_empty());
    }

    #[test]
    fn json_output_succeeds() {
        assert_eq!(run_transitions(&TransitionsArgs { json: true }).unwrap(), 0);
    }
}
