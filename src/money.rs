//! Monetary rounding rules and boundary validation.
//!
//! Two granularities coexist in this domain: the revenue split between
//! worker and salon rounds to whole currency units, while the guarantee,
//! top-up and final shares round to 2 decimal places. Both behaviors are
//! kept exactly as the settlement contract defines them, including the small
//! residue between the two granularities.

use serde::{Deserialize, Serialize};

use crate::error::ShiftError;

/// Round to 2 decimal places (guarantee, top-up, final shares, hours).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round to the nearest whole currency unit (the base revenue split).
pub fn round_unit(value: f64) -> f64 {
    value.round()
}

/// Clamp a raw monetary input to a usable non-negative amount.
///
/// Used inside the pure calculators, which are total functions: NaN,
/// infinities and negatives all become 0 so the settlement math stays
/// reproducible for audit.
pub fn sanitize_amount(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// A non-negative monetary amount validated at the request boundary.
///
/// Unlike [`sanitize_amount`], this constructor fails fast: submitted
/// per-client amounts are rejected before any state change instead of being
/// silently coerced deep inside the calculators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct NonNegativeAmount(f64);

impl NonNegativeAmount {
    pub fn new(value: f64) -> Result<Self, ShiftError> {
        if value.is_finite() && value >= 0.0 {
            Ok(Self(value))
        } else {
            Err(ShiftError::NegativeAmount { amount: value })
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for NonNegativeAmount {
    type Error = ShiftError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonNegativeAmount> for f64 {
    fn from(amount: NonNegativeAmount) -> f64 {
        amount.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================
