#![allow(clippy::missing_errors_doc)]

//! `SQLite`-backed event persistence buffer.
//!
//! Test events and framework events are staged in two independent
//! [`EventBuffer`]s and written in batches once a buffer reaches its flush
//! size. Every read force-flushes its category first, so a reader always
//! observes writes that returned before the read began.
//!
//! Locking: each buffer has its own lock; all statements (inserts, updates,
//! selects) are serialized through one connection lock. The connection lock is
//! only ever taken while holding at most one buffer lock, never the reverse.

pub mod buffer;
mod config;
mod error;
pub mod query;
mod rows;
mod schema;
mod telemetry;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use eventsink_core::{
    EventCategory, FrameworkEvent, FrameworkEventQueryCriteria, JobId, JobState,
    JobStateResolver, TestEvent, TestEventQueryCriteria,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, instrument, warn};

pub use buffer::EventBuffer;
pub use config::{
    StoreConfig, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_FRAMEWORK_EVENTS_FLUSH_SIZE,
    DEFAULT_TEST_EVENTS_FLUSH_SIZE,
};
pub use error::{EmptyCriteriaError, StatementKind, StoreError};
pub use query::{
    assemble, compile_event_criteria, compile_framework_event_criteria,
    compile_test_event_criteria, CompiledCriteria, SqlValue,
};
pub use telemetry::FlushTelemetrySnapshot;

use query::{ORDER_BY_EVENT_ID, SELECT_FRAMEWORK_EVENTS, SELECT_TEST_EVENTS};
use rows::{INSERT_FRAMEWORK_EVENT, INSERT_TEST_EVENT, UPDATE_JOB_STATE};
use telemetry::FlushTelemetry;

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
    test_events: EventBuffer<TestEvent>,
    framework_events: EventBuffer<FrameworkEvent>,
    job_states: Box<dyn JobStateResolver>,
    telemetry: FlushTelemetry,
}

/// Events accepted by the store but not yet flushed.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PendingEvents {
    pub test_events: usize,
    pub framework_events: usize,
}

impl SqliteEventStore {
    /// Open or create a `SQLite` events database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or opening the
    /// database or applying pragmas fails.
    pub fn open(
        path: &Path,
        config: StoreConfig,
        job_states: impl JobStateResolver + 'static,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let conn = Connection::open(path)
            .map_err(StoreError::database("failed to open sqlite database"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(StoreError::database("failed to configure sqlite pragmas"))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(StoreError::database("failed to configure sqlite busy timeout"))?;

        debug!(path = %path.display(), "opened events database");
        Self::new(conn, config, job_states)
    }

    /// Wraps an already configured connection.
    pub fn new(
        conn: Connection,
        config: StoreConfig,
        job_states: impl JobStateResolver + 'static,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            conn: Mutex::new(conn),
            test_events: EventBuffer::new(
                EventCategory::TestEvents,
                config.test_events_flush_size,
            )?,
            framework_events: EventBuffer::new(
                EventCategory::FrameworkEvents,
                config.framework_events_flush_size,
            )?,
            job_states: Box::new(job_states),
            telemetry: FlushTelemetry::default(),
        })
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        schema::migrate(&conn)
    }

    /// Buffers a test event, flushing the test event batch when it is full.
    ///
    /// # Errors
    /// - [`StoreError::Rejected`] when the event cannot be bound to the insert
    ///   statement (an id above `i64::MAX`, an `emit_time` outside the
    ///   nanosecond range). Nothing is buffered.
    /// - [`StoreError::Flush`] if the triggered flush fails. The event stays
    ///   buffered, and part of the batch may already be durable.
    #[instrument(level = "trace", skip_all, fields(job_id = %event.header.job_id))]
    pub fn store_test_event(&self, event: TestEvent) -> Result<(), StoreError> {
        rows::test_event_params(&event)
            .and_then(|values| rows::ensure_bindable(&values))
            .map_err(rejected(
                EventCategory::TestEvents,
                StatementKind::InsertTestEvent,
            ))?;
        self.test_events
            .append(event, |batch| self.flush_test_batch(batch))
    }

    /// Buffers a framework event, flushing the framework event batch when it
    /// is full. Job states derived from the batch are applied by that flush.
    #[instrument(level = "trace", skip_all, fields(job_id = %event.job_id))]
    pub fn store_framework_event(&self, event: FrameworkEvent) -> Result<(), StoreError> {
        rows::framework_event_params(&event)
            .and_then(|values| rows::ensure_bindable(&values))
            .map_err(rejected(
                EventCategory::FrameworkEvents,
                StatementKind::InsertFrameworkEvent,
            ))?;
        self.framework_events
            .append(event, |batch| self.flush_framework_batch(batch))
    }

    /// Retrieves test events matching `criteria`, after flushing pending test
    /// events.
    ///
    /// # Errors
    /// - [`StoreError::Flush`] when the pending batch cannot be written.
    /// - [`StoreError::Assembly`] when no criteria field is set.
    /// - [`StoreError::Query`] / [`StoreError::Scan`] when the select fails or
    ///   a row cannot be decoded; no partial results are returned.
    #[instrument(skip_all, fields(category = "test_events"))]
    pub fn get_test_events(
        &self,
        criteria: &TestEventQueryCriteria,
    ) -> Result<Vec<TestEvent>, StoreError> {
        self.flush_test_events()?;

        let conn = self.lock_conn()?;
        let compiled = compile_test_event_criteria(Some(criteria));
        let mut query = assemble(SELECT_TEST_EVENTS, compiled.clauses()).map_err(|source| {
            StoreError::Assembly {
                category: EventCategory::TestEvents,
                source,
            }
        })?;
        query.push_str(ORDER_BY_EVENT_ID);

        select(
            &conn,
            EventCategory::TestEvents,
            StatementKind::SelectTestEvents,
            &query,
            compiled.params(),
            rows::test_event_from_row,
        )
    }

    /// Retrieves framework events matching `criteria`, after flushing pending
    /// framework events.
    #[instrument(skip_all, fields(category = "framework_events"))]
    pub fn get_framework_events(
        &self,
        criteria: &FrameworkEventQueryCriteria,
    ) -> Result<Vec<FrameworkEvent>, StoreError> {
        self.flush_framework_events()?;

        let conn = self.lock_conn()?;
        let compiled = compile_framework_event_criteria(Some(criteria));
        let mut query = assemble(SELECT_FRAMEWORK_EVENTS, compiled.clauses()).map_err(|source| {
            StoreError::Assembly {
                category: EventCategory::FrameworkEvents,
                source,
            }
        })?;
        query.push_str(ORDER_BY_EVENT_ID);

        select(
            &conn,
            EventCategory::FrameworkEvents,
            StatementKind::SelectFrameworkEvents,
            &query,
            compiled.params(),
            rows::framework_event_from_row,
        )
    }

    /// Flushes both buffers, test events first.
    pub fn flush_all(&self) -> Result<(), StoreError> {
        self.flush_test_events()?;
        self.flush_framework_events()
    }

    /// Ensures a `jobs` row exists for `job_id`. Returns `true` when a row was
    /// inserted.
    pub fn register_job(&self, job_id: JobId, name: &str) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO jobs(job_id, name) VALUES (?1, ?2)",
                params![SqlValue::Unsigned(job_id.0), name],
            )
            .map_err(StoreError::database("failed to register job"))?;
        Ok(inserted == 1)
    }

    /// Current derived state of `job_id`, after flushing pending framework
    /// events. `None` when the job is unknown or has no state yet.
    pub fn job_state(&self, job_id: JobId) -> Result<Option<JobState>, StoreError> {
        self.flush_framework_events()?;

        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE job_id = ?1",
                params![SqlValue::Unsigned(job_id.0)],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(StoreError::database("failed to read job state"))?
            .flatten();

        raw.map(|value| match JobState::parse(&value) {
            Some(state) => Ok(state),
            None => Err(StoreError::UnknownJobState { job_id, value }),
        })
        .transpose()
    }

    pub fn pending(&self) -> Result<PendingEvents, StoreError> {
        Ok(PendingEvents {
            test_events: self.test_events.len()?,
            framework_events: self.framework_events.len()?,
        })
    }

    #[must_use]
    pub fn telemetry(&self) -> FlushTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    fn flush_test_events(&self) -> Result<(), StoreError> {
        self.test_events
            .force_flush(|batch| self.flush_test_batch(batch))
    }

    fn flush_framework_events(&self) -> Result<(), StoreError> {
        self.framework_events
            .force_flush(|batch| self.flush_framework_batch(batch))
    }

    fn flush_test_batch(&self, batch: &[TestEvent]) -> Result<(), StoreError> {
        self.persist_test_events(batch)
            .inspect_err(|_| self.telemetry.record_failure())
    }

    fn flush_framework_batch(&self, batch: &[FrameworkEvent]) -> Result<(), StoreError> {
        self.persist_framework_events(batch)
            .inspect_err(|_| self.telemetry.record_failure())
    }

    /// One insert per event, in order. The first failure stops the batch and
    /// leaves the rows inserted so far in place.
    fn persist_test_events(&self, batch: &[TestEvent]) -> Result<(), StoreError> {
        let category = EventCategory::TestEvents;
        let conn = self.lock_conn()?;
        self.telemetry.record_flush(category);
        debug!(%category, batch = batch.len(), "flushing batch");

        let on_insert = persist_error(category, StatementKind::InsertTestEvent);
        let mut stmt = conn.prepare_cached(INSERT_TEST_EVENT).map_err(&on_insert)?;
        for event in batch {
            let values = rows::test_event_params(event).map_err(&on_insert)?;
            stmt.execute(params_from_iter(values.iter()))
                .map_err(&on_insert)?;
            self.telemetry.record_persisted(category);
        }
        Ok(())
    }

    /// Inserts framework events, then applies the last derived state of each
    /// job touched by the batch. Inserts and updates are not atomic.
    fn persist_framework_events(&self, batch: &[FrameworkEvent]) -> Result<(), StoreError> {
        let category = EventCategory::FrameworkEvents;
        let conn = self.lock_conn()?;
        self.telemetry.record_flush(category);
        debug!(%category, batch = batch.len(), "flushing batch");

        let on_insert = persist_error(category, StatementKind::InsertFrameworkEvent);
        let mut job_state_updates: BTreeMap<JobId, JobState> = BTreeMap::new();
        {
            let mut stmt = conn
                .prepare_cached(INSERT_FRAMEWORK_EVENT)
                .map_err(&on_insert)?;
            for event in batch {
                let values = rows::framework_event_params(event).map_err(&on_insert)?;
                stmt.execute(params_from_iter(values.iter()))
                    .map_err(&on_insert)?;
                self.telemetry.record_persisted(category);

                if let Some(state) = self.job_states.job_state(&event.event_name) {
                    job_state_updates.insert(event.job_id, state);
                }
            }
        }

        let on_update = persist_error(category, StatementKind::UpdateJobState);
        for (job_id, state) in &job_state_updates {
            let updated = conn
                .execute(
                    UPDATE_JOB_STATE,
                    params![state.as_str(), SqlValue::Unsigned(job_id.0)],
                )
                .map_err(&on_update)?;
            self.telemetry.record_job_state_update();
            if updated == 0 {
                debug!(%job_id, %state, "no jobs row to receive derived state");
            }
        }
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned {
            resource: "sqlite connection",
        })
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn persist_error(
    category: EventCategory,
    statement: StatementKind,
) -> impl Fn(rusqlite::Error) -> StoreError {
    move |source| StoreError::Persist {
        category,
        statement,
        source,
    }
}

fn rejected(
    category: EventCategory,
    statement: StatementKind,
) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |source| StoreError::Rejected {
        category,
        statement,
        source,
    }
}

/// Runs a select and maps every row; any decode failure discards the rows
/// read so far.
fn select<T, F>(
    conn: &Connection,
    category: EventCategory,
    statement: StatementKind,
    query: &str,
    values: &[SqlValue],
    mut map_row: F,
) -> Result<Vec<T>, StoreError>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    debug!(%category, query, params = ?values, "executing select");
    let on_query = |source| StoreError::Query {
        category,
        statement,
        source,
    };

    let mut stmt = conn.prepare(query).map_err(on_query)?;
    let results = {
        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(on_query)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().map_err(on_query)? {
            results.push(map_row(row).map_err(|source| StoreError::Scan { category, source })?);
        }
        results
    };

    if let Err(err) = stmt.finalize() {
        warn!(%category, error = %err, "could not finalize select statement");
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::too_many_lines
    )]

    use super::*;
    use eventsink_core::{
        parse_rfc3339_utc, EventQueryCriteria, JobStateTable, RunId, TestEventData,
        TestEventHeader,
    };
    use proptest::prelude::*;
    use serde_json::json;
    use time::OffsetDateTime;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must(parse_rfc3339_utc(value))
    }

    fn fixture_store_with(
        test_flush_size: usize,
        framework_flush_size: usize,
        job_states: JobStateTable,
    ) -> SqliteEventStore {
        let conn = must(Connection::open_in_memory());
        let store = must(SqliteEventStore::new(
            conn,
            StoreConfig::with_flush_sizes(test_flush_size, framework_flush_size),
            job_states,
        ));
        must(store.migrate());
        store
    }

    fn fixture_store(test_flush_size: usize, framework_flush_size: usize) -> SqliteEventStore {
        fixture_store_with(
            test_flush_size,
            framework_flush_size,
            JobStateTable::lifecycle(),
        )
    }

    fn fixture_test_event(job_id: u64, event_name: &str) -> TestEvent {
        TestEvent::new(
            TestEventHeader {
                job_id: JobId(job_id),
                run_id: RunId(1),
                test_name: "boot".to_string(),
                test_attempt: 0,
                test_step_label: "flash".to_string(),
            },
            TestEventData {
                event_name: event_name.to_string(),
                target_id: None,
                payload: None,
            },
            must_utc("2026-02-07T12:00:00Z"),
        )
    }

    fn count_rows(store: &SqliteEventStore, table: &str) -> i64 {
        let conn = store.connection();
        must(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        }))
    }

    fn stored_state(store: &SqliteEventStore, job_id: u64) -> Option<String> {
        let conn = store.connection();
        must(conn.query_row(
            "SELECT state FROM jobs WHERE job_id = ?1",
            params![job_id as i64],
            |row| row.get(0),
        ))
    }

    #[test]
    fn migrate_is_idempotent_and_event_tables_are_append_only() {
        let store = fixture_store(1, 1);
        must(store.migrate());
        must(store.store_test_event(fixture_test_event(1, "TargetIn")));
        must(store.store_framework_event(FrameworkEvent::new(
            JobId(1),
            "Tick",
            must_utc("2026-02-07T12:00:00Z"),
        )));

        let conn = store.connection();
        let mutated = conn.execute("UPDATE test_events SET event_name = 'mutated'", []);
        assert!(mutated.is_err());
        let deleted = conn.execute("DELETE FROM framework_events", []);
        assert!(deleted.is_err());
        assert!(must(schema::table_has_column(&conn, "jobs", "state")));
    }

    #[test]
    fn migrate_adds_state_column_to_existing_jobs_table() {
        let conn = must(Connection::open_in_memory());
        must(conn.execute_batch("CREATE TABLE jobs (job_id INTEGER PRIMARY KEY, name TEXT NOT NULL DEFAULT '');"));
        let store = must(SqliteEventStore::new(
            conn,
            StoreConfig::default(),
            JobStateTable::lifecycle(),
        ));
        must(store.migrate());
        assert!(must(schema::table_has_column(
            &store.connection(),
            "jobs",
            "state"
        )));
    }

    #[test]
    fn migrate_adds_name_column_so_jobs_can_be_registered() {
        let conn = must(Connection::open_in_memory());
        must(conn.execute_batch("CREATE TABLE jobs (job_id INTEGER PRIMARY KEY);"));
        let store = must(SqliteEventStore::new(
            conn,
            StoreConfig::default(),
            JobStateTable::lifecycle(),
        ));
        must(store.migrate());

        assert!(must(store.register_job(JobId(3), "host-owned")));
        let conn = store.connection();
        assert!(must(schema::table_has_column(&conn, "jobs", "name")));
        assert!(must(schema::table_has_column(&conn, "jobs", "state")));
    }

    #[test]
    fn invalid_flush_sizes_are_rejected_at_construction() {
        let conn = must(Connection::open_in_memory());
        let result = SqliteEventStore::new(
            conn,
            StoreConfig::with_flush_sizes(0, 4),
            JobStateTable::lifecycle(),
        );
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn stored_test_event_round_trips_with_store_assigned_id() {
        let store = fixture_store(10, 10);
        let mut event = fixture_test_event(42, "TargetIn");
        event.header.test_attempt = 3;
        event.data.target_id = Some("host-17".to_string());
        event.data.payload = Some(json!({"stage": "flash", "ok": true}));
        event.emit_time = must_utc("2026-02-07T12:00:00.123456789Z");
        must(store.store_test_event(event.clone()));

        let events = must(store.get_test_events(&TestEventQueryCriteria::for_job(JobId(42))));
        assert_eq!(events.len(), 1);

        let mut fetched = events[0].clone();
        assert!(fetched.event_id.is_some());
        fetched.event_id = None;
        assert_eq!(fetched, event);
    }

    #[test]
    fn absent_target_and_payload_come_back_as_none() {
        let store = fixture_store(1, 1);
        must(store.store_test_event(fixture_test_event(5, "TargetOut")));
        must(store.store_framework_event(FrameworkEvent::new(
            JobId(5),
            "Heartbeat",
            must_utc("2026-02-07T12:00:00Z"),
        )));

        let events = must(store.get_test_events(&TestEventQueryCriteria::for_job(JobId(5))));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.target_id, None);
        assert_eq!(events[0].data.payload, None);

        let framework =
            must(store.get_framework_events(&FrameworkEventQueryCriteria::for_job(JobId(5))));
        assert_eq!(framework.len(), 1);
        assert_eq!(framework[0].payload, None);
    }

    #[test]
    fn reads_see_events_below_the_flush_threshold() {
        let store = fixture_store(100, 100);
        must(store.store_test_event(fixture_test_event(8, "TargetIn")));
        assert_eq!(must(store.pending()).test_events, 1);
        assert_eq!(count_rows(&store, "test_events"), 0);

        let events = must(store.get_test_events(&TestEventQueryCriteria::for_job(JobId(8))));
        assert_eq!(events.len(), 1);
        assert_eq!(must(store.pending()), PendingEvents::default());
    }

    #[test]
    fn test_event_criteria_narrow_by_run_name_and_step() {
        let store = fixture_store(4, 4);
        let mut other_run = fixture_test_event(1, "TargetIn");
        other_run.header.run_id = RunId(2);
        let mut other_step = fixture_test_event(1, "TargetIn");
        other_step.header.test_step_label = "reboot".to_string();
        let mut other_test = fixture_test_event(1, "TargetOut");
        other_test.header.test_name = "shutdown".to_string();

        for event in [
            fixture_test_event(1, "TargetIn"),
            other_run,
            other_step,
            other_test,
        ] {
            must(store.store_test_event(event));
        }

        let criteria = TestEventQueryCriteria::for_job(JobId(1))
            .with_run_id(RunId(1))
            .with_test_name("boot")
            .with_test_step_label("flash");
        let events = must(store.get_test_events(&criteria));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].header.run_id, RunId(1));
        assert_eq!(events[0].header.test_step_label, "flash");

        let by_name: TestEventQueryCriteria = EventQueryCriteria::default()
            .with_event_names(["TargetOut"])
            .into();
        let events = must(store.get_test_events(&by_name));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].header.test_name, "shutdown");
    }

    #[test]
    fn emitted_time_bounds_are_both_applied() {
        let store = fixture_store(1, 1);
        for (offset, at) in [
            (1, "2026-02-07T12:00:00Z"),
            (2, "2026-02-07T12:30:00Z"),
            (3, "2026-02-07T13:00:00Z"),
            (4, "2026-02-07T14:00:00Z"),
        ] {
            must(store.store_framework_event(
                FrameworkEvent::new(JobId(1), "Tick", must_utc(at)).with_payload(json!(offset)),
            ));
        }

        let criteria: FrameworkEventQueryCriteria = EventQueryCriteria::default()
            .emitted_after(must_utc("2026-02-07T12:15:00Z"))
            .emitted_before(must_utc("2026-02-07T13:00:00Z"))
            .into();
        let events = must(store.get_framework_events(&criteria));
        let payloads: Vec<_> = events.iter().filter_map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(2), json!(3)]);
    }

    #[test]
    fn rows_come_back_in_insertion_order() {
        let store = fixture_store(3, 3);
        for name in ["a", "b", "c", "d", "e"] {
            must(store.store_test_event(fixture_test_event(6, name)));
        }
        let events = must(store.get_test_events(&TestEventQueryCriteria::for_job(JobId(6))));
        let names: Vec<_> = events.iter().map(|e| e.data.event_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        let ids: Vec<_> = events.iter().filter_map(|e| e.event_id).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn empty_criteria_are_rejected_after_flushing() {
        let store = fixture_store(10, 10);
        must(store.store_test_event(fixture_test_event(1, "TargetIn")));

        let result = store.get_test_events(&TestEventQueryCriteria::default());
        match result {
            Err(StoreError::Assembly { category, source }) => {
                assert_eq!(category, EventCategory::TestEvents);
                assert_eq!(source, EmptyCriteriaError);
            }
            other => panic!("expected assembly error, got {other:?}"),
        }
        assert_eq!(count_rows(&store, "test_events"), 1);

        let result = store.get_framework_events(&FrameworkEventQueryCriteria::default());
        assert!(matches!(
            result,
            Err(StoreError::Assembly {
                category: EventCategory::FrameworkEvents,
                ..
            })
        ));
    }

    #[test]
    fn framework_batch_applies_last_state_per_job() {
        let table = JobStateTable::default()
            .with("A", JobState::Started)
            .with("B", JobState::Completed);
        let store = fixture_store_with(10, 4, table);
        assert!(must(store.register_job(JobId(1), "first")));
        assert!(must(store.register_job(JobId(2), "second")));
        assert!(!must(store.register_job(JobId(2), "second")));

        let at = must_utc("2026-02-07T12:00:00Z");
        for (job_id, name) in [(1, "A"), (1, "B"), (2, "A"), (2, "Unmapped")] {
            must(store.store_framework_event(FrameworkEvent::new(JobId(job_id), name, at)));
        }

        assert_eq!(store.telemetry().framework_event_flushes_total, 1);
        assert_eq!(store.telemetry().job_state_updates_total, 2);
        assert_eq!(stored_state(&store, 1).as_deref(), Some("completed"));
        assert_eq!(stored_state(&store, 2).as_deref(), Some("started"));
        assert_eq!(must(store.job_state(JobId(1))), Some(JobState::Completed));
        assert_eq!(must(store.job_state(JobId(3))), None);
    }

    #[test]
    fn job_state_reads_flush_pending_framework_events() {
        let store = fixture_store(10, 10);
        must(store.register_job(JobId(9), "pending"));
        must(store.store_framework_event(FrameworkEvent::new(
            JobId(9),
            JobState::Paused.lifecycle_event_name(),
            must_utc("2026-02-07T12:00:00Z"),
        )));
        assert_eq!(stored_state(&store, 9), None);

        assert_eq!(must(store.job_state(JobId(9))), Some(JobState::Paused));
        assert_eq!(must(store.pending()).framework_events, 0);
    }

    #[test]
    fn partial_insert_failure_keeps_batch_and_durable_prefix() {
        let store = fixture_store(3, 3);
        must(store.connection().execute_batch(
            "CREATE TRIGGER trg_reject_poison
             BEFORE INSERT ON test_events
             WHEN NEW.event_name = 'poison'
             BEGIN
               SELECT RAISE(FAIL, 'poisoned event');
             END;",
        ));

        must(store.store_test_event(fixture_test_event(1, "first")));
        must(store.store_test_event(fixture_test_event(1, "poison")));
        let err = match store.store_test_event(fixture_test_event(1, "third")) {
            Err(err) => err,
            Ok(()) => panic!("expected the flush to fail"),
        };

        assert!(matches!(err, StoreError::Flush { .. }));
        assert!(matches!(
            err.root(),
            StoreError::Persist {
                category: EventCategory::TestEvents,
                statement: StatementKind::InsertTestEvent,
                ..
            }
        ));
        assert_eq!(count_rows(&store, "test_events"), 1);
        assert_eq!(must(store.pending()).test_events, 3);
        assert_eq!(store.telemetry().flush_failures_total, 1);
        assert_eq!(store.telemetry().test_events_persisted_total, 1);
    }

    #[test]
    fn reads_fail_closed_when_the_flush_fails() {
        let store = fixture_store(10, 10);
        must(store.connection().execute_batch("DROP TABLE framework_events;"));
        must(store.store_framework_event(FrameworkEvent::new(
            JobId(1),
            "Tick",
            must_utc("2026-02-07T12:00:00Z"),
        )));

        let result = store.get_framework_events(&FrameworkEventQueryCriteria::for_job(JobId(1)));
        match result {
            Err(StoreError::Flush { category, source }) => {
                assert_eq!(category, EventCategory::FrameworkEvents);
                assert!(matches!(*source, StoreError::Persist { .. }));
            }
            other => panic!("expected flush error, got {other:?}"),
        }
        assert_eq!(must(store.pending()).framework_events, 1);
        assert!(store.flush_all().is_err());
    }

    #[test]
    fn undecodable_rows_abort_the_read() {
        let store = fixture_store(1, 1);
        must(store.store_framework_event(FrameworkEvent::new(
            JobId(3),
            "Good",
            must_utc("2026-02-07T12:00:00Z"),
        )));
        must(store.connection().execute(
            "INSERT INTO framework_events (job_id, event_name, payload, emit_time) VALUES (3, 'Bad', 'not json', 0)",
            [],
        ));

        let result = store.get_framework_events(&FrameworkEventQueryCriteria::for_job(JobId(3)));
        assert!(matches!(
            result,
            Err(StoreError::Scan {
                category: EventCategory::FrameworkEvents,
                ..
            })
        ));
    }

    #[test]
    fn oversized_job_ids_are_rejected_before_buffering() {
        let store = fixture_store(1, 1);
        let result = store.store_test_event(fixture_test_event(u64::MAX, "TargetIn"));
        let err = match result {
            Err(err) => err,
            Ok(()) => panic!("expected bind failure"),
        };
        assert!(matches!(
            err,
            StoreError::Rejected {
                statement: StatementKind::InsertTestEvent,
                ..
            }
        ));
        assert_eq!(err.category(), Some(EventCategory::TestEvents));
        assert_eq!(must(store.pending()), PendingEvents::default());
        assert_eq!(store.telemetry().test_event_flushes_total, 0);
    }

    #[test]
    fn out_of_range_emit_time_is_rejected_and_buffer_stays_usable() {
        let store = fixture_store(3, 3);
        must(store.store_test_event(fixture_test_event(1, "good")));

        let mut far_future = fixture_test_event(1, "far_future");
        far_future.emit_time = must_utc("2300-01-01T00:00:00Z");
        match store.store_test_event(far_future) {
            Err(StoreError::Rejected {
                category,
                statement,
                ..
            }) => {
                assert_eq!(category, EventCategory::TestEvents);
                assert_eq!(statement, StatementKind::InsertTestEvent);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(must(store.pending()).test_events, 1);

        for name in ["later0", "later1", "later2"] {
            must(store.store_test_event(fixture_test_event(1, name)));
        }
        assert_eq!(store.telemetry().test_events_persisted_total, 3);
        assert_eq!(store.telemetry().flush_failures_total, 0);
        assert_eq!(must(store.pending()).test_events, 1);

        let events = must(store.get_test_events(&TestEventQueryCriteria::for_job(JobId(1))));
        let names: Vec<_> = events.iter().map(|e| e.data.event_name.as_str()).collect();
        assert_eq!(names, vec!["good", "later0", "later1", "later2"]);

        let ancient = FrameworkEvent::new(JobId(1), "Tick", must_utc("1600-01-01T00:00:00Z"));
        assert!(matches!(
            store.store_framework_event(ancient),
            Err(StoreError::Rejected {
                category: EventCategory::FrameworkEvents,
                statement: StatementKind::InsertFrameworkEvent,
                ..
            })
        ));
        assert_eq!(must(store.pending()).framework_events, 0);
    }

    #[test]
    fn failed_job_state_update_keeps_inserts_and_batch() {
        let store = fixture_store(10, 2);
        must(store.register_job(JobId(1), "nightly"));
        must(store.connection().execute_batch(
            "CREATE TRIGGER trg_reject_job_update
             BEFORE UPDATE ON jobs
             BEGIN
               SELECT RAISE(FAIL, 'jobs are read-only');
             END;",
        ));

        let at = must_utc("2026-02-07T12:00:00Z");
        must(store.store_framework_event(FrameworkEvent::new(
            JobId(1),
            JobState::Started.lifecycle_event_name(),
            at,
        )));
        let err = match store.store_framework_event(FrameworkEvent::new(JobId(1), "Tick", at)) {
            Err(err) => err,
            Ok(()) => panic!("expected the job state update to fail"),
        };

        assert!(matches!(err, StoreError::Flush { .. }));
        assert!(matches!(
            err.root(),
            StoreError::Persist {
                category: EventCategory::FrameworkEvents,
                statement: StatementKind::UpdateJobState,
                ..
            }
        ));
        assert_eq!(count_rows(&store, "framework_events"), 2);
        assert_eq!(must(store.pending()).framework_events, 2);
        assert_eq!(stored_state(&store, 1), None);
        assert_eq!(store.telemetry().job_state_updates_total, 0);
        assert_eq!(store.telemetry().flush_failures_total, 1);
    }

    #[test]
    fn unknown_stored_job_state_is_reported() {
        let store = fixture_store(1, 1);
        must(store.connection().execute(
            "INSERT INTO jobs(job_id, name, state) VALUES (5, 'legacy', 'exploded')",
            [],
        ));

        match store.job_state(JobId(5)) {
            Err(StoreError::UnknownJobState { job_id, value }) => {
                assert_eq!(job_id, JobId(5));
                assert_eq!(value, "exploded");
            }
            other => panic!("expected unknown job state, got {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_flush_batches_follow_the_threshold(count in 0usize..40, flush_size in 1usize..8) {
            let store = fixture_store(flush_size, 1);
            for index in 0..count {
                must(store.store_test_event(fixture_test_event(1, &format!("e{index}"))));
            }

            let before_read = store.telemetry();
            prop_assert_eq!(before_read.test_event_flushes_total, (count / flush_size) as u64);
            prop_assert_eq!(must(store.pending()).test_events, count % flush_size);

            let events = must(store.get_test_events(&TestEventQueryCriteria::for_job(JobId(1))));
            prop_assert_eq!(events.len(), count);
            prop_assert_eq!(
                store.telemetry().test_event_flushes_total,
                count.div_ceil(flush_size) as u64
            );
            prop_assert_eq!(store.telemetry().test_events_persisted_total, count as u64);
        }
    }
}
