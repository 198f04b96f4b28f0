#![deny(missing_docs)]

//! # rentvault-core: Foundational Types for Deposit Escrow
//!
//! Every other crate in the workspace depends on this one. It has no
//! internal crate dependencies.
//!
//! ## Design Principles
//!
//! 1. **Newtype identifiers.** A [`ClaimId`] cannot be passed where a
//!    [`DeadlineId`] is expected. Party references are opaque strings owned
//!    by an external directory; record identifiers are UUIDs.
//!
//! 2. **Integer money.** [`Amount`] is a count of minor currency units.
//!    Arithmetic is checked; overflow is a [`ValidationError`], never a wrap.
//!
//! 3. **Injected time.** All temporal logic reads the time from a [`Clock`].
//!    Tests drive a [`ManualClock`] instead of sleeping.
//!
//! 4. **[`CanonicalBytes`] is the sole path to digest computation.** Contract
//!    snapshot hashes and audit chain digests both flow through it.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod identity;
pub mod money;
pub mod temporal;

pub use canonical::CanonicalBytes;
pub use digest::{sha256_digest, ContentDigest, DigestAlgorithm};
pub use error::{CanonicalizationError, ValidationError};
pub use identity::{
    ApprovalId, ClaimId, DeadlineId, DisputeId, EscrowId, PartyId, RuleId, SweeperId,
    TransactionId,
};
pub use money::{Amount, BasisPoints};
pub use temporal::{days, Clock, ManualClock, SystemClock};
