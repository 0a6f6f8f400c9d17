//! Error types for the settlement engine.
//!
//! Every rejected transition carries a machine-readable kind and code plus a
//! human message, so callers can tell "you're on a day off" apart from
//! "shift already closed" and "system error, try again". The pure settlement
//! calculators never fail; only lifecycle transitions and persistence do.

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

pub type ShiftResult<T> = Result<T, ShiftError>;

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("no working hours configured for {date}: day off")]
    DayOff { date: NaiveDate },
    #[error("unknown worker: {staff_id}")]
    UnknownWorker { staff_id: String },
    #[error("shift not found: {shift_id}")]
    NotFound { shift_id: String },
    #[error("no open shift for worker {staff_id} on {date}")]
    NoOpenShift { staff_id: String, date: NaiveDate },
    #[error("negative amount submitted: {amount}")]
    NegativeAmount { amount: f64 },
    #[error("worker {staff_id} does not belong to business {business_id}")]
    Forbidden {
        staff_id: String,
        business_id: String,
    },
    #[error("shift {shift_id} is already open")]
    AlreadyOpen { shift_id: String },
    #[error("shift {shift_id} cannot transition from status '{status}'")]
    InvalidState { shift_id: String, status: String },
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers to pick a response strategy:
/// validation and authorization failures are final, state conflicts depend
/// on call-site policy, internal errors may be retried at the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    StateConflict,
    Internal,
}

/// Structured payload handed to external callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ShiftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DayOff { .. }
            | Self::UnknownWorker { .. }
            | Self::NotFound { .. }
            | Self::NoOpenShift { .. }
            | Self::NegativeAmount { .. } => ErrorKind::Validation,
            Self::Forbidden { .. } => ErrorKind::Authorization,
            Self::AlreadyOpen { .. } | Self::InvalidState { .. } => ErrorKind::StateConflict,
            Self::Db(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::DayOff { .. } => "day_off",
            Self::UnknownWorker { .. } => "unknown_worker",
            Self::NotFound { .. } => "not_found",
            Self::NoOpenShift { .. } => "no_open_shift",
            Self::NegativeAmount { .. } => "negative_amount",
            Self::Forbidden { .. } => "forbidden",
            Self::AlreadyOpen { .. } => "already_open",
            Self::InvalidState { .. } => "invalid_state",
            Self::Db(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
