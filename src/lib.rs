//! Staff shift settlement engine.
//!
//! Tracks a worker's daily shift lifecycle (open → accumulate → close, with
//! late-arrival detection and reopen) and computes the money owed to the
//! worker and the salon at close, including the hourly minimum-guarantee
//! top-up. Booking CRUD, notifications and payout execution live elsewhere
//! in the platform; this crate owns the shift state machine, the settlement
//! math, and the concurrency-safe persistence of both.
//!
//! Entry points live in [`shifts`]; the pure calculators in [`settlement`]
//! are usable standalone (previews, audits, reconciliation checks).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod db;
pub mod error;
pub mod money;
pub mod schedule;
pub mod settlement;
pub mod shifts;
mod transition;

pub use error::{ErrorKind, ShiftError, ShiftResult};

/// Initialize structured logging for the engine (console layer only — the
/// embedding process owns file appenders). Subsequent calls are no-ops.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,salon_settlement=debug"));

    let console_layer = fmt::layer().with_target(true);
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
}
