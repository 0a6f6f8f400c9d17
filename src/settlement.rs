//! Pure settlement math for shift close and live projections.
//!
//! Every function here is total and side-effect free: invalid numeric inputs
//! coerce to safe defaults so the same inputs always reproduce the same
//! settlement, bit for bit. Consumables revenue is never split — it flows
//! 100% to the salon. The guarantee top-up transfers money from the salon
//! share to the worker share; it never creates or destroys revenue.

use serde::{Deserialize, Serialize};

use crate::money::{round2, round_unit, sanitize_amount};

/// Fallback split applied when a worker's configured percentages are
/// unusable (non-finite, negative, or summing to zero).
pub const DEFAULT_PERCENT_MASTER: f64 = 60.0;
pub const DEFAULT_PERCENT_SALON: f64 = 40.0;

// ---------------------------------------------------------------------------
// Percentage normalization
// ---------------------------------------------------------------------------

/// A (master, salon) percentage pair scaled to sum to exactly 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSplit {
    pub master: f64,
    pub salon: f64,
}

/// Normalize a raw percentage pair so it sums to 100.
///
/// Invalid sides fall back to their defaults individually; a pair summing to
/// zero falls back to the default 60/40 split entirely. Never fails.
pub fn normalize_percentages(percent_master: f64, percent_salon: f64) -> NormalizedSplit {
    let mut master = if percent_master.is_finite() && percent_master >= 0.0 {
        percent_master
    } else {
        DEFAULT_PERCENT_MASTER
    };
    let mut salon = if percent_salon.is_finite() && percent_salon >= 0.0 {
        percent_salon
    } else {
        DEFAULT_PERCENT_SALON
    };

    let mut sum = master + salon;
    if sum == 0.0 {
        master = DEFAULT_PERCENT_MASTER;
        salon = DEFAULT_PERCENT_SALON;
        sum = 100.0;
    }

    NormalizedSplit {
        master: master / sum * 100.0,
        salon: salon / sum * 100.0,
    }
}

// ---------------------------------------------------------------------------
// Base share split
// ---------------------------------------------------------------------------

/// The undiscounted worker/salon split, before any guarantee adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseShares {
    pub master: f64,
    pub salon: f64,
}

/// Split service revenue by raw (unnormalized) percentages.
pub fn base_shares(
    total_amount: f64,
    total_consumables: f64,
    percent_master: f64,
    percent_salon: f64,
) -> BaseShares {
    let split = normalize_percentages(percent_master, percent_salon);
    base_shares_normalized(total_amount, total_consumables, split)
}

/// Split service revenue by an already-normalized pair.
///
/// The resolver calls this directly so each settlement normalizes exactly
/// once and reuses the same pair for both the reported percentages and the
/// share computation.
///
/// Both sides of the service split round to whole currency units
/// independently, so master + salon − consumables reproduces the total only
/// up to ±1 unit. Both sides must stay independently auditable integers;
/// neither is re-derived from the other.
pub fn base_shares_normalized(
    total_amount: f64,
    total_consumables: f64,
    split: NormalizedSplit,
) -> BaseShares {
    let total = sanitize_amount(total_amount);
    let consumables = sanitize_amount(total_consumables);

    BaseShares {
        master: round_unit(total * split.master / 100.0),
        salon: round_unit(total * split.salon / 100.0) + consumables,
    }
}

// ---------------------------------------------------------------------------
// Guarantee and top-up
// ---------------------------------------------------------------------------

/// Minimum pay owed for the shift: hours × hourly rate, at 2 decimals.
///
/// Returns 0 when either side is absent, non-positive or non-finite — a
/// missing hourly rate means no guarantee applies.
pub fn guaranteed_amount(hours_worked: Option<f64>, hourly_rate: Option<f64>) -> f64 {
    let (Some(hours), Some(rate)) = (hours_worked, hourly_rate) else {
        return 0.0;
    };
    if !hours.is_finite() || hours <= 0.0 || !rate.is_finite() || rate <= 0.0 {
        return 0.0;
    }
    round2(hours * rate)
}

/// The gap the salon must absorb so the worker's payout meets the guarantee.
/// Zero when revenue-based earnings already cover the minimum.
pub fn topup_amount(guaranteed: f64, base_master_share: f64) -> f64 {
    if guaranteed > base_master_share {
        round2(guaranteed - base_master_share)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Full settlement resolver
// ---------------------------------------------------------------------------

/// Inputs gathered by the lifecycle controller at close time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementInputs {
    pub total_amount: f64,
    pub total_consumables: f64,
    pub percent_master: f64,
    pub percent_salon: f64,
    pub hours_worked: Option<f64>,
    pub hourly_rate: Option<f64>,
}

/// The complete settlement for one shift.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftFinances {
    pub total_amount: f64,
    pub total_consumables: f64,
    pub base_master_share: f64,
    pub base_salon_share: f64,
    pub guaranteed_amount: f64,
    pub topup_amount: f64,
    pub final_master_share: f64,
    pub final_salon_share: f64,
    pub normalized_percent_master: f64,
    pub normalized_percent_salon: f64,
}

/// Compose the full settlement for one shift.
pub fn resolve_shift_finances(inputs: &SettlementInputs) -> ShiftFinances {
    let split = normalize_percentages(inputs.percent_master, inputs.percent_salon);
    let base = base_shares_normalized(inputs.total_amount, inputs.total_consumables, split);
    let guaranteed = guaranteed_amount(inputs.hours_worked, inputs.hourly_rate);
    let topup = topup_amount(guaranteed, base.master);

    ShiftFinances {
        total_amount: sanitize_amount(inputs.total_amount),
        total_consumables: sanitize_amount(inputs.total_consumables),
        base_master_share: base.master,
        base_salon_share: base.salon,
        guaranteed_amount: guaranteed,
        topup_amount: topup,
        final_master_share: round2(guaranteed.max(base.master)),
        final_salon_share: round2((base.salon - topup).max(0.0)),
        normalized_percent_master: split.master,
        normalized_percent_salon: split.salon,
    }
}

// ---------------------------------------------------------------------------
// Display resolver (open shifts only)
// ---------------------------------------------------------------------------

/// Live projection of what would be owed right now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayShares {
    pub master_share: f64,
    pub salon_share: f64,
    pub guaranteed_amount: f64,
    pub topup_amount: f64,
}

/// Project shares for display without mutating stored state.
///
/// Applies the guarantee/top-up logic against a live guaranteed amount only
/// while the shift is open. A closed shift's stored shares are the source of
/// truth and are never recomputed from possibly-stale percentages, so the
/// not-open path passes the base shares through unchanged.
pub fn resolve_display_shares(
    base_master_share: f64,
    base_salon_share: f64,
    guaranteed: Option<f64>,
    is_open: bool,
) -> DisplayShares {
    match guaranteed {
        Some(guaranteed) if is_open => {
            let topup = topup_amount(guaranteed, base_master_share);
            DisplayShares {
                master_share: round2(guaranteed.max(base_master_share)),
                salon_share: round2((base_salon_share - topup).max(0.0)),
                guaranteed_amount: guaranteed,
                topup_amount: topup,
            }
        }
        _ => DisplayShares {
            master_share: round2(base_master_share),
            salon_share: round2(base_salon_share),
            guaranteed_amount: guaranteed.unwrap_or(0.0),
            topup_amount: 0.0,
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================
