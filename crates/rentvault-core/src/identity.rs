//! # Identity Newtypes
//!
//! Every record owned by an escrow has its own identifier type. Party
//! references are the exception: they are opaque strings issued by the
//! external party directory, validated only for non-emptiness.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Declares a UUID-backed identifier with a display prefix.
macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_identifier!(
    /// Identifier of an escrow aggregate.
    EscrowId,
    "escrow"
);
uuid_identifier!(
    /// Identifier of a claim raised during the release-pending window.
    ClaimId,
    "claim"
);
uuid_identifier!(
    /// Identifier of a release rule.
    RuleId,
    "rule"
);
uuid_identifier!(
    /// Identifier of a scheduled deadline.
    DeadlineId,
    "deadline"
);
uuid_identifier!(
    /// Identifier of a ledger transaction.
    TransactionId,
    "tx"
);
uuid_identifier!(
    /// Identifier of a counterparty approval request.
    ApprovalId,
    "approval"
);
uuid_identifier!(
    /// Identifier of a dispute escalation record.
    DisputeId,
    "dispute"
);
uuid_identifier!(
    /// Identifier of a sweeper instance, used to claim deadlines.
    SweeperId,
    "sweeper"
);

/// An opaque reference to a landlord or tenant held by the party directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    /// Create a party reference. Surrounding whitespace is trimmed.
    pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyPartyId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The party reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PartyId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for PartyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_identifiers_are_unique() {
        assert_ne!(EscrowId::new(), EscrowId::new());
        assert_ne!(ClaimId::default(), ClaimId::default());
    }

    #[test]
    fn display_uses_prefix() {
        let id = DeadlineId::new();
        assert!(format!("{id}").starts_with("deadline:"));
        assert!(format!("{}", EscrowId::new()).starts_with("escrow:"));
    }

    #[test]
    fn from_uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        assert_eq!(*RuleId::from_uuid(uuid).as_uuid(), uuid);
    }

    #[test]
    fn identifiers_serialize_transparently() {
        let uuid = Uuid::new_v4();
        let json = serde_json::to_string(&TransactionId::from_uuid(uuid)).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
    }

    #[test]
    fn party_id_trims_and_rejects_empty() {
        assert_eq!(PartyId::new("  landlord-1 ").unwrap().as_str(), "landlord-1");
        assert_eq!(PartyId::new("   "), Err(ValidationError::EmptyPartyId));
    }

    #[test]
    fn party_id_deserialize_validates() {
        let ok: PartyId = serde_json::from_str("\"tenant-7\"").unwrap();
        assert_eq!(ok.as_str(), "tenant-7");
        assert!(serde_json::from_str::<PartyId>("\"\"").is_err());
    }
}
