//! # Error Hierarchy
//!
//! Validation and canonicalization errors for domain primitives, built with
//! `thiserror`. Each variant carries the rejected input so a caller can
//! report it without re-deriving context.

use thiserror::Error;

/// Errors during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// Float values are not permitted in canonical representations.
    /// Amounts are integers in minor units.
    #[error("float values are not permitted in canonical representations; use integer minor units: {0}")]
    FloatRejected(f64),

    /// JSON serialization failed during canonicalization.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Validation errors for domain primitive newtypes and escrow terms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Party reference is empty or whitespace.
    #[error("party id must be non-empty")]
    EmptyPartyId,

    /// A required text field is empty or whitespace.
    #[error("{0} must be non-empty")]
    EmptyField(&'static str),

    /// A required value was not supplied.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// Landlord and tenant resolve to the same party.
    #[error("landlord and tenant must be different parties (both \"{0}\")")]
    SameParty(String),

    /// Checked amount arithmetic overflowed `u64`.
    #[error("amount overflow while computing {0}")]
    AmountOverflow(&'static str),

    /// A percentage expressed in basis points exceeds 100%.
    #[error("percentage {0} bp exceeds 10000 bp (100%)")]
    InvalidPercentage(u32),

    /// A configured window is outside its permitted range.
    #[error("invalid {field}: {value} ({reason})")]
    InvalidWindow {
        /// The configuration field.
        field: &'static str,
        /// The rejected value.
        value: u32,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Lease end does not fall after lease start.
    #[error("lease end {end} must be after lease start {start}")]
    InvalidLeaseDates {
        /// Lease start (RFC 3339).
        start: String,
        /// Lease end (RFC 3339).
        end: String,
    },

    /// A monetary amount that must be positive was zero.
    #[error("{0} must be greater than zero")]
    ZeroAmount(&'static str),

    /// A free-text field exceeded its length limit.
    #[error("{field} exceeds {max} characters")]
    TooLong {
        /// The offending field.
        field: &'static str,
        /// Maximum permitted length.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_rejected_display() {
        let err = CanonicalizationError::FloatRejected(3.5);
        let msg = format!("{err}");
        assert!(msg.contains("float values are not permitted"));
        assert!(msg.contains("3.5"));
    }

    #[test]
    fn invalid_window_display() {
        let err = ValidationError::InvalidWindow {
            field: "claim_window_days",
            value: 0,
            reason: "must be at least 1 day",
        };
        let msg = format!("{err}");
        assert!(msg.contains("claim_window_days"));
        assert!(msg.contains("at least 1 day"));
    }

    #[test]
    fn same_party_display() {
        let err = ValidationError::SameParty("alice".to_string());
        assert!(format!("{err}").contains("alice"));
    }

    #[test]
    fn invalid_percentage_display() {
        assert!(format!("{}", ValidationError::InvalidPercentage(12_000)).contains("12000"));
    }
}
