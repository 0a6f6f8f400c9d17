//! Concurrency-safe shift transition primitive.
//!
//! Every open/close/reopen state change for `staff_shifts` goes through this
//! module. Each entry point wraps its read-check-write in a single
//! `BEGIN IMMEDIATE` transaction, so the check ("is there an open shift for
//! this worker/day") and the write commit or roll back as one unit. The
//! `UNIQUE (staff_id, shift_date)` constraint backs the insert path, not a
//! prior SELECT, which gives:
//!
//! - at most one shift row per (worker, day): a concurrent or retried open
//!   lands on the existing row, and an already-open row is returned
//!   untouched — the first successful open wins, `opened_at` is never
//!   overwritten by a duplicate request
//! - exactly-once close: the closing write is conditional on
//!   `status = 'open'`, so of two concurrent closes one performs the write
//!   and the other observes the already-closed row with the stored
//!   settlement, never a recomputed one
//!
//! Business-rule validation (day off, amount signs, ownership) happens in
//! the lifecycle controller before these are invoked. This module is the
//! trusted internal capability that reads and writes shift rows unscoped by
//! any caller-level row visibility.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{ShiftError, ShiftResult};
use crate::money::round2;
use crate::settlement::ShiftFinances;
use crate::shifts::{Shift, ShiftItemInput, ShiftStatus};

/// Column list every shift SELECT uses, so row mapping stays in one shape
/// regardless of the physical column order left behind by migrations.
pub(crate) const SHIFT_COLUMNS: &str = "id, staff_id, business_id, branch_id, shift_date, status, \
     opened_at, closed_at, expected_start, late_minutes, \
     total_amount, consumables_amount, base_master_share, base_salon_share, \
     master_share, salon_share, hours_worked, hourly_rate, \
     guaranteed_amount, topup_amount, created_at, updated_at";

// ---------------------------------------------------------------------------
// Open / reopen
// ---------------------------------------------------------------------------

/// Payload for the open transition, assembled by the lifecycle controller.
pub(crate) struct NewShift<'a> {
    pub staff_id: &'a str,
    pub business_id: &'a str,
    pub branch_id: &'a str,
    pub shift_date: NaiveDate,
    pub opened_at: DateTime<Utc>,
    pub expected_start: Option<DateTime<Utc>>,
    pub late_minutes: i64,
}

#[derive(Debug)]
pub(crate) enum OpenOutcome {
    /// No row existed for the day; one was created.
    Created(Shift),
    /// A closed row existed; it was flipped back to open in place,
    /// preserving item history and first-open fields.
    Reopened(Shift),
    /// An open row already existed; returned untouched.
    AlreadyOpen(Shift),
}

/// Atomically create or revive the day's shift row.
pub(crate) fn open_or_reopen(conn: &Connection, new: &NewShift) -> ShiftResult<OpenOutcome> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> ShiftResult<OpenOutcome> {
        let now_s = new.opened_at.to_rfc3339();
        let date_s = new.shift_date.format("%Y-%m-%d").to_string();

        let inserted = conn.execute(
            "INSERT INTO staff_shifts (
                id, staff_id, business_id, branch_id, shift_date, status,
                opened_at, expected_start, late_minutes, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?8, ?6, ?6)
            ON CONFLICT(staff_id, shift_date) DO NOTHING",
            params![
                Uuid::new_v4().to_string(),
                new.staff_id,
                new.business_id,
                new.branch_id,
                date_s,
                now_s,
                new.expected_start.map(|t| t.to_rfc3339()),
                new.late_minutes,
            ],
        )?;

        if inserted == 1 {
            let row = get_by_day(conn, new.staff_id, new.shift_date)?
                .ok_or_else(|| ShiftError::Internal("shift row missing after insert".into()))?;
            return Ok(OpenOutcome::Created(row));
        }

        // Conflict: a row for this worker/day already exists.
        let existing = get_by_day(conn, new.staff_id, new.shift_date)?
            .ok_or_else(|| ShiftError::Internal("conflicting shift row not readable".into()))?;

        match existing.status {
            ShiftStatus::Open => Ok(OpenOutcome::AlreadyOpen(existing)),
            ShiftStatus::Closed => {
                reopen_row(conn, &existing.id, new.opened_at)?;
                let row = get_by_day(conn, new.staff_id, new.shift_date)?
                    .ok_or_else(|| ShiftError::Internal("shift row missing after reopen".into()))?;
                Ok(OpenOutcome::Reopened(row))
            }
        }
    })();

    finish_txn(conn, result)
}

#[derive(Debug)]
pub(crate) enum ReopenOutcome {
    Reopened(Shift),
    /// The row exists but is not closed; returned for error reporting.
    NotClosed(Shift),
    NotFound,
}

/// Atomically revive a closed shift by id (the explicit correction path).
pub(crate) fn reopen_closed(
    conn: &Connection,
    shift_id: &str,
    now: DateTime<Utc>,
) -> ShiftResult<ReopenOutcome> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> ShiftResult<ReopenOutcome> {
        let Some(existing) = get_by_id(conn, shift_id)? else {
            return Ok(ReopenOutcome::NotFound);
        };
        match existing.status {
            ShiftStatus::Open => Ok(ReopenOutcome::NotClosed(existing)),
            ShiftStatus::Closed => {
                reopen_row(conn, shift_id, now)?;
                let row = get_by_id(conn, shift_id)?
                    .ok_or_else(|| ShiftError::Internal("shift row missing after reopen".into()))?;
                Ok(ReopenOutcome::Reopened(row))
            }
        }
    })();

    finish_txn(conn, result)
}

/// Flip a closed row back to open. Item history, `opened_at` and the
/// lateness fields from the first open all stand; the settlement columns
/// stop being authoritative and are cleared.
fn reopen_row(conn: &Connection, shift_id: &str, now: DateTime<Utc>) -> ShiftResult<()> {
    conn.execute(
        "UPDATE staff_shifts SET
            status = 'open', closed_at = NULL,
            total_amount = 0, consumables_amount = 0,
            base_master_share = 0, base_salon_share = 0,
            master_share = 0, salon_share = 0,
            hours_worked = 0, hourly_rate = NULL,
            guaranteed_amount = 0, topup_amount = 0,
            updated_at = ?1
         WHERE id = ?2 AND status = 'closed'",
        params![now.to_rfc3339(), shift_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Close
// ---------------------------------------------------------------------------

/// Payload for the close transition. Amounts are already validated
/// non-negative by the controller.
pub(crate) struct ClosePayload<'a> {
    pub staff_id: &'a str,
    pub shift_date: NaiveDate,
    pub closed_at: DateTime<Utc>,
    pub hours_override: Option<f64>,
    pub hourly_rate: Option<f64>,
    pub items: &'a [ShiftItemInput],
}

#[derive(Debug)]
pub(crate) enum CloseOutcome {
    /// This call performed the closing write.
    Closed(Shift),
    /// The shift was already closed; the stored settlement is returned
    /// unchanged (no submitted items are appended in this case).
    AlreadyClosed(Shift),
    /// No row exists for the worker/day.
    NotFound,
}

/// Atomically close the day's open shift.
///
/// Within one transaction: re-checks the open state, appends the submitted
/// items, aggregates the day's totals, invokes the injected pure settlement
/// computation, and issues the closing write conditional on
/// `status = 'open'`.
pub(crate) fn close_open<F>(
    conn: &Connection,
    payload: &ClosePayload,
    settle: F,
) -> ShiftResult<CloseOutcome>
where
    F: FnOnce(&Shift, f64, f64, f64) -> ShiftFinances,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> ShiftResult<CloseOutcome> {
        let Some(row) = get_by_day(conn, payload.staff_id, payload.shift_date)? else {
            return Ok(CloseOutcome::NotFound);
        };
        if row.status == ShiftStatus::Closed {
            return Ok(CloseOutcome::AlreadyClosed(row));
        }

        let now_s = payload.closed_at.to_rfc3339();
        for item in payload.items {
            conn.execute(
                "INSERT INTO shift_items (
                    id, shift_id, client_name, service_amount, consumables_amount, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    row.id,
                    item.client_name,
                    item.service_amount,
                    item.consumables_amount,
                    now_s,
                ],
            )?;
        }

        let (total_amount, consumables_amount) = aggregate_items(conn, &row.id)?;
        let hours_worked = payload
            .hours_override
            .unwrap_or_else(|| hours_between(row.opened_at, payload.closed_at));

        let finances = settle(&row, total_amount, consumables_amount, hours_worked);

        let changed = conn.execute(
            "UPDATE staff_shifts SET
                status = 'closed', closed_at = ?1,
                total_amount = ?2, consumables_amount = ?3,
                base_master_share = ?4, base_salon_share = ?5,
                master_share = ?6, salon_share = ?7,
                hours_worked = ?8, hourly_rate = ?9,
                guaranteed_amount = ?10, topup_amount = ?11,
                updated_at = ?1
             WHERE id = ?12 AND status = 'open'",
            params![
                now_s,
                finances.total_amount,
                finances.total_consumables,
                finances.base_master_share,
                finances.base_salon_share,
                finances.final_master_share,
                finances.final_salon_share,
                hours_worked,
                payload.hourly_rate,
                finances.guaranteed_amount,
                finances.topup_amount,
                row.id,
            ],
        )?;

        // Unreachable while the IMMEDIATE lock from the status check is
        // held; the write stays conditional on the open state regardless.
        if changed == 0 {
            let row = get_by_id(conn, &row.id)?
                .ok_or_else(|| ShiftError::Internal("shift row vanished during close".into()))?;
            return Ok(CloseOutcome::AlreadyClosed(row));
        }

        let row = get_by_id(conn, &row.id)?
            .ok_or_else(|| ShiftError::Internal("shift row missing after close".into()))?;
        Ok(CloseOutcome::Closed(row))
    })();

    finish_txn(conn, result)
}

// ---------------------------------------------------------------------------
// Row access helpers (shared with the lifecycle controller)
// ---------------------------------------------------------------------------

pub(crate) fn get_by_day(
    conn: &Connection,
    staff_id: &str,
    shift_date: NaiveDate,
) -> Result<Option<Shift>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SHIFT_COLUMNS} FROM staff_shifts WHERE staff_id = ?1 AND shift_date = ?2"),
        params![staff_id, shift_date.format("%Y-%m-%d").to_string()],
        shift_from_row,
    )
    .optional()
}

pub(crate) fn get_by_id(
    conn: &Connection,
    shift_id: &str,
) -> Result<Option<Shift>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SHIFT_COLUMNS} FROM staff_shifts WHERE id = ?1"),
        params![shift_id],
        shift_from_row,
    )
    .optional()
}

/// Sum the day's recorded service and consumables revenue.
pub(crate) fn aggregate_items(
    conn: &Connection,
    shift_id: &str,
) -> Result<(f64, f64), rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(SUM(service_amount), 0), COALESCE(SUM(consumables_amount), 0)
         FROM shift_items WHERE shift_id = ?1",
        params![shift_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

/// Elapsed hours between open and close, at 2 decimals, never negative.
pub(crate) fn hours_between(opened_at: DateTime<Utc>, closed_at: DateTime<Utc>) -> f64 {
    let seconds = (closed_at - opened_at).num_seconds().max(0);
    round2(seconds as f64 / 3600.0)
}

/// Map a `SHIFT_COLUMNS` row into the typed model.
pub(crate) fn shift_from_row(row: &rusqlite::Row) -> Result<Shift, rusqlite::Error> {
    Ok(Shift {
        id: row.get(0)?,
        staff_id: row.get(1)?,
        business_id: row.get(2)?,
        branch_id: row.get(3)?,
        shift_date: parse_date(row, 4)?,
        status: parse_status(row, 5)?,
        opened_at: parse_timestamp(row, 6)?,
        closed_at: parse_timestamp_opt(row, 7)?,
        expected_start: parse_timestamp_opt(row, 8)?,
        late_minutes: row.get(9)?,
        total_amount: row.get(10)?,
        consumables_amount: row.get(11)?,
        base_master_share: row.get(12)?,
        base_salon_share: row.get(13)?,
        master_share: row.get(14)?,
        salon_share: row.get(15)?,
        hours_worked: row.get(16)?,
        hourly_rate: row.get(17)?,
        guaranteed_amount: row.get(18)?,
        topup_amount: row.get(19)?,
        created_at: parse_timestamp(row, 20)?,
        updated_at: parse_timestamp(row, 21)?,
    })
}

fn column_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_date(row: &rusqlite::Row, idx: usize) -> Result<NaiveDate, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| column_error(idx, e))
}

fn parse_status(row: &rusqlite::Row, idx: usize) -> Result<ShiftStatus, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    match raw.as_str() {
        "open" => Ok(ShiftStatus::Open),
        "closed" => Ok(ShiftStatus::Closed),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown shift status '{other}'").into(),
        )),
    }
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(idx, e))
}

fn parse_timestamp_opt(
    row: &rusqlite::Row,
    idx: usize,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| column_error(idx, e))
    })
    .transpose()
}

/// Commit on success, roll back on error, preserving the original result.
fn finish_txn<T>(conn: &Connection, result: ShiftResult<T>) -> ShiftResult<T> {
    match result {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
