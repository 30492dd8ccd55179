use eventsink_core::{format_rfc3339, now_utc};
use rusqlite::{params, Connection};

use crate::error::StoreError;

const EVENTS_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
  job_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL DEFAULT '',
  state TEXT
);

CREATE TABLE IF NOT EXISTS test_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id INTEGER NOT NULL,
  run_id INTEGER NOT NULL,
  test_name TEXT NOT NULL,
  test_attempt INTEGER NOT NULL CHECK (test_attempt >= 0),
  test_step_label TEXT NOT NULL,
  event_name TEXT NOT NULL,
  target_id TEXT,
  payload TEXT,
  emit_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS framework_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id INTEGER NOT NULL,
  event_name TEXT NOT NULL,
  payload TEXT,
  emit_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_test_events_job_run ON test_events(job_id, run_id, event_id);
CREATE INDEX IF NOT EXISTS idx_test_events_emit_time ON test_events(emit_time);
CREATE INDEX IF NOT EXISTS idx_framework_events_job ON framework_events(job_id, event_id);
CREATE INDEX IF NOT EXISTS idx_framework_events_emit_time ON framework_events(emit_time);

CREATE TRIGGER IF NOT EXISTS trg_test_events_no_update
BEFORE UPDATE ON test_events
BEGIN
  SELECT RAISE(FAIL, 'test_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_test_events_no_delete
BEFORE DELETE ON test_events
BEGIN
  SELECT RAISE(FAIL, 'test_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_framework_events_no_update
BEFORE UPDATE ON framework_events
BEGIN
  SELECT RAISE(FAIL, 'framework_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_framework_events_no_delete
BEFORE DELETE ON framework_events
BEGIN
  SELECT RAISE(FAIL, 'framework_events is append-only');
END;
";

pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA_V1)
        .map_err(StoreError::database("failed to apply events schema"))?;

    // A host-owned jobs table may lack the columns written here.
    ensure_column(conn, "jobs", "name", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "jobs", "state", "TEXT")?;

    let now = format_rfc3339(now_utc()).map_err(|err| StoreError::Config(err.to_string()))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![EVENTS_SCHEMA_VERSION, now],
    )
    .map_err(StoreError::database("failed to record events migration"))?;

    Ok(())
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    sql_type: &str,
) -> Result<(), StoreError> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"), [])
        .map_err(StoreError::database("failed to add missing column"))?;
    Ok(())
}

pub(crate) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, StoreError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(StoreError::database("failed to inspect table info"))?;

    let mut rows = stmt
        .query([])
        .map_err(StoreError::database("failed to inspect table info"))?;
    while let Some(row) = rows
        .next()
        .map_err(StoreError::database("failed to inspect table info"))?
    {
        let name: String = row
            .get(1)
            .map_err(StoreError::database("failed to inspect table info"))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
