//! # Money
//!
//! [`Amount`] counts integer minor currency units (cents, pence). Escrow
//! balances never go negative, so the representation is unsigned and all
//! arithmetic is checked.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A non-negative monetary amount in minor currency units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero minor units.
    pub const ZERO: Amount = Amount(0);

    /// Wrap a count of minor units.
    pub const fn new(minor_units: u64) -> Self {
        Self(minor_units)
    }

    /// The count of minor units.
    pub const fn minor_units(&self) -> u64 {
        self.0
    }

    /// Whether this amount is zero.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition; `what` names the computation for the error.
    pub fn checked_add(self, rhs: Amount, what: &'static str) -> Result<Amount, ValidationError> {
        self.0
            .checked_add(rhs.0)
            .map(Amount)
            .ok_or(ValidationError::AmountOverflow(what))
    }

    /// Addition clamped at `u64::MAX`, for read-only projections.
    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    /// Checked subtraction; `None` if `rhs > self`.
    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// Sum an iterator of amounts with overflow checking.
    pub fn checked_sum<I>(iter: I, what: &'static str) -> Result<Amount, ValidationError>
    where
        I: IntoIterator<Item = Amount>,
    {
        iter.into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a, what))
    }

    /// Apply a percentage, rounding down to the nearest minor unit.
    pub fn percentage(self, bp: BasisPoints) -> Amount {
        let scaled = u128::from(self.0) * u128::from(bp.get()) / 10_000;
        // bp <= 10_000 so the result never exceeds self.
        Amount(scaled as u64)
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// A percentage expressed in basis points (1 bp = 0.01%), at most 10000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BasisPoints(u32);

impl BasisPoints {
    /// 100%.
    pub const FULL: BasisPoints = BasisPoints(10_000);

    /// Create a validated basis-point value.
    pub fn new(bp: u32) -> Result<Self, ValidationError> {
        if bp > 10_000 {
            return Err(ValidationError::InvalidPercentage(bp));
        }
        Ok(Self(bp))
    }

    /// The raw basis-point value.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl<'de> Deserialize<'de> for BasisPoints {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = u32::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_add_overflow_is_error() {
        let max = Amount::new(u64::MAX);
        assert_eq!(
            max.checked_add(Amount::new(1), "total"),
            Err(ValidationError::AmountOverflow("total"))
        );
    }

    #[test]
    fn checked_sum_adds_components() {
        let total = Amount::checked_sum(
            [Amount::new(10_000), Amount::new(2_500), Amount::ZERO],
            "total",
        )
        .unwrap();
        assert_eq!(total, Amount::new(12_500));
    }

    #[test]
    fn saturating_sub_clamps() {
        assert_eq!(Amount::new(5).saturating_sub(Amount::new(9)), Amount::ZERO);
        assert_eq!(Amount::new(5).checked_sub(Amount::new(9)), None);
    }

    #[test]
    fn percentage_rounds_down() {
        let bp = BasisPoints::new(3_333).unwrap();
        assert_eq!(Amount::new(100).percentage(bp), Amount::new(33));
        assert_eq!(Amount::new(999).percentage(BasisPoints::FULL), Amount::new(999));
    }

    #[test]
    fn basis_points_bounded() {
        assert!(BasisPoints::new(10_000).is_ok());
        assert_eq!(
            BasisPoints::new(10_001),
            Err(ValidationError::InvalidPercentage(10_001))
        );
        assert!(serde_json::from_str::<BasisPoints>("20000").is_err());
    }

    #[test]
    fn amount_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Amount::new(10_000)).unwrap(), "10000");
    }
}
