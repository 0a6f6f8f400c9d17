//! Schedule context and worker configuration reads.
//!
//! The engine does not author schedule rules. It reads a worker's expected
//! working intervals for a date (date-specific override first, weekly rows
//! as fallback), approved time off, and the finance configuration, then
//! derives the expected start time and lateness for a shift open.
//!
//! Interval times are local wall-clock `HH:MM` strings; the open request
//! carries the branch's UTC offset so lateness is computed against the same
//! clock the worker was scheduled on.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Worker finance configuration
// ---------------------------------------------------------------------------

/// Percent split and guarantee rate, written by the admin side.
/// A NULL hourly rate means no guarantee applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinanceConfig {
    pub staff_id: String,
    pub business_id: String,
    pub percent_master: f64,
    pub percent_salon: f64,
    pub hourly_rate: Option<f64>,
}

pub fn finance_config(
    conn: &Connection,
    staff_id: &str,
) -> Result<Option<FinanceConfig>, rusqlite::Error> {
    conn.query_row(
        "SELECT staff_id, business_id, percent_master, percent_salon, hourly_rate
         FROM staff_finance_config WHERE staff_id = ?1",
        params![staff_id],
        |row| {
            Ok(FinanceConfig {
                staff_id: row.get(0)?,
                business_id: row.get(1)?,
                percent_master: row.get(2)?,
                percent_salon: row.get(3)?,
                hourly_rate: row.get(4)?,
            })
        },
    )
    .optional()
}

// ---------------------------------------------------------------------------
// Time off
// ---------------------------------------------------------------------------

/// Whether an approved absence range covers the date.
pub fn is_on_time_off(
    conn: &Connection,
    staff_id: &str,
    date: NaiveDate,
) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM time_off
            WHERE staff_id = ?1 AND status = 'approved'
              AND ?2 BETWEEN start_date AND end_date
         )",
        params![staff_id, date.format("%Y-%m-%d").to_string()],
        |row| row.get(0),
    )
}

// ---------------------------------------------------------------------------
// Working intervals
// ---------------------------------------------------------------------------

/// One working interval within a day, local wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkInterval {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Working intervals for a worker on a date.
///
/// Any override row for the date shadows the weekly schedule entirely; an
/// override row with a NULL start is an explicit day-off marker and yields
/// no interval. An empty result means day off. Malformed time strings are
/// skipped with a warning rather than failing the whole lookup.
pub fn working_intervals(
    conn: &Connection,
    staff_id: &str,
    date: NaiveDate,
) -> Result<Vec<WorkInterval>, rusqlite::Error> {
    let date_s = date.format("%Y-%m-%d").to_string();

    let mut stmt = conn.prepare(
        "SELECT start_time, end_time FROM schedule_overrides
         WHERE staff_id = ?1 AND date = ?2",
    )?;
    let override_rows: Vec<(Option<String>, Option<String>)> = stmt
        .query_map(params![staff_id, date_s], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<_, _>>()?;

    if !override_rows.is_empty() {
        let mut intervals = Vec::new();
        for (start, end) in &override_rows {
            let (Some(start), Some(end)) = (start.as_deref(), end.as_deref()) else {
                // day-off marker
                continue;
            };
            if let Some(interval) = parse_interval(staff_id, start, end) {
                intervals.push(interval);
            }
        }
        intervals.sort_by_key(|i| i.start);
        return Ok(intervals);
    }

    let weekday = date.weekday().num_days_from_monday();
    let mut stmt = conn.prepare(
        "SELECT start_time, end_time FROM work_schedules
         WHERE staff_id = ?1 AND weekday = ?2",
    )?;
    let weekly_rows: Vec<(String, String)> = stmt
        .query_map(params![staff_id, weekday], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut intervals: Vec<WorkInterval> = weekly_rows
        .iter()
        .filter_map(|(start, end)| parse_interval(staff_id, start, end))
        .collect();
    intervals.sort_by_key(|i| i.start);
    Ok(intervals)
}

fn parse_interval(staff_id: &str, start: &str, end: &str) -> Option<WorkInterval> {
    let parsed_start = NaiveTime::parse_from_str(start, "%H:%M");
    let parsed_end = NaiveTime::parse_from_str(end, "%H:%M");
    match (parsed_start, parsed_end) {
        (Ok(start), Ok(end)) if start < end => Some(WorkInterval { start, end }),
        _ => {
            warn!(staff_id = %staff_id, start = %start, end = %end, "skipping malformed schedule interval");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Expected start and lateness
// ---------------------------------------------------------------------------

/// Earliest interval start anchored to the shift date, converted to UTC
/// through the branch's fixed offset.
pub fn expected_start(
    intervals: &[WorkInterval],
    date: NaiveDate,
    utc_offset_minutes: i32,
) -> Option<DateTime<Utc>> {
    let earliest = intervals.iter().map(|i| i.start).min()?;
    let local = date.and_time(earliest);
    Some(Utc.from_utc_datetime(&(local - Duration::minutes(utc_offset_minutes as i64))))
}

/// Minutes between scheduled start and actual open, rounded to the nearest
/// minute. Zero when on time or when no expected start exists.
pub fn late_minutes(now: DateTime<Utc>, expected_start: Option<DateTime<Utc>>) -> i64 {
    let Some(expected) = expected_start else {
        return 0;
    };
    if now <= expected {
        return 0;
    }
    let seconds = (now - expected).num_seconds();
    ((seconds as f64) / 60.0).round() as i64
}

// ===========================================================================
// Tests
// ===========================================================================
