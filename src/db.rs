//! Local SQLite database layer for the settlement engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the managed
//! connection state shared by the lifecycle controller and the transition
//! primitive. Scheduling and finance-config tables are written by the admin
//! side of the platform; this crate only reads them.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ShiftError, ShiftResult};

/// Managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/settlement.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> ShiftResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| ShiftError::Internal(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("settlement.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| ShiftError::Internal(format!("database open after retry: {e}")))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> ShiftResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> ShiftResult<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: shift rows and their service items.
fn migrate_v1(conn: &Connection) -> ShiftResult<()> {
    conn.execute_batch(
        "
        -- staff_shifts (one row per worker and calendar day)
        CREATE TABLE IF NOT EXISTS staff_shifts (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            business_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            shift_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            expected_start TEXT,
            late_minutes INTEGER NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            consumables_amount REAL NOT NULL DEFAULT 0,
            master_share REAL NOT NULL DEFAULT 0,
            salon_share REAL NOT NULL DEFAULT 0,
            hours_worked REAL NOT NULL DEFAULT 0,
            hourly_rate REAL,
            guaranteed_amount REAL NOT NULL DEFAULT 0,
            topup_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- The at-most-one-shift-per-day key. Open/close transitions rely on
        -- this constraint, not on a prior SELECT.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_staff_shifts_staff_date
            ON staff_shifts(staff_id, shift_date);

        -- shift_items (append-only service entries recorded against a shift)
        CREATE TABLE IF NOT EXISTS shift_items (
            id TEXT PRIMARY KEY,
            shift_id TEXT NOT NULL,
            client_name TEXT,
            service_amount REAL NOT NULL DEFAULT 0,
            consumables_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(shift_id) REFERENCES staff_shifts(id) ON DELETE CASCADE
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: worker configuration read by the engine (written elsewhere).
fn migrate_v2(conn: &Connection) -> ShiftResult<()> {
    conn.execute_batch(
        "
        -- staff_finance_config (percent split and hourly guarantee rate)
        CREATE TABLE IF NOT EXISTS staff_finance_config (
            staff_id TEXT PRIMARY KEY,
            business_id TEXT NOT NULL,
            percent_master REAL NOT NULL DEFAULT 60,
            percent_salon REAL NOT NULL DEFAULT 40,
            hourly_rate REAL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- work_schedules (weekly working intervals, weekday 0 = Monday)
        CREATE TABLE IF NOT EXISTS work_schedules (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            staff_id TEXT NOT NULL,
            weekday INTEGER NOT NULL CHECK (weekday BETWEEN 0 AND 6),
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_work_schedules_staff
            ON work_schedules(staff_id, weekday);

        -- schedule_overrides (date-specific intervals; NULL start marks an
        -- explicit day off; any row for a date shadows the weekly rows)
        CREATE TABLE IF NOT EXISTS schedule_overrides (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            staff_id TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT,
            end_time TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_schedule_overrides_staff_date
            ON schedule_overrides(staff_id, date);

        -- time_off (absence ranges, only 'approved' blocks a shift open)
        CREATE TABLE IF NOT EXISTS time_off (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            staff_id TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'approved', 'rejected'))
        );
        CREATE INDEX IF NOT EXISTS idx_time_off_staff
            ON time_off(staff_id, start_date, end_date);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    Ok(())
}

/// Migration v3: persist the pre-guarantee split alongside the final one so
/// closed shifts stay auditable without recomputation.
fn migrate_v3(conn: &Connection) -> ShiftResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE staff_shifts ADD COLUMN base_master_share REAL NOT NULL DEFAULT 0;
        ALTER TABLE staff_shifts ADD COLUMN base_salon_share REAL NOT NULL DEFAULT 0;

        CREATE INDEX IF NOT EXISTS idx_shift_items_shift ON shift_items(shift_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_bootstrap_from_empty() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("migrations");

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        // Rerunning is a no-op
        run_migrations(&conn).expect("idempotent migrations");
    }

    #[test]
    fn shift_day_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO staff_shifts (id, staff_id, business_id, branch_id, shift_date,
                opened_at, created_at, updated_at)
             VALUES ('s1', 'w1', 'b1', 'br1', '2026-08-07',
                datetime('now'), datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO staff_shifts (id, staff_id, business_id, branch_id, shift_date,
                opened_at, created_at, updated_at)
             VALUES ('s2', 'w1', 'b1', 'br1', '2026-08-07',
                datetime('now'), datetime('now'), datetime('now'))",
            [],
        );
        assert!(dup.is_err(), "second row for the same worker/day must fail");
    }
}
