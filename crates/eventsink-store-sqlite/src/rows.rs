//! Fixed parameter lists for inserts and row decoding for selects.

use eventsink_core::{
    FrameworkEvent, JobId, RunId, TestEvent, TestEventData, TestEventHeader,
};
use rusqlite::types::Type;
use rusqlite::{Row, ToSql};
use serde_json::Value;
use time::OffsetDateTime;

use crate::query::SqlValue;

pub(crate) const INSERT_TEST_EVENT: &str = "insert into test_events (job_id, run_id, test_name, test_attempt, test_step_label, event_name, target_id, payload, emit_time) values (?, ?, ?, ?, ?, ?, ?, ?, ?)";
pub(crate) const INSERT_FRAMEWORK_EVENT: &str =
    "insert into framework_events (job_id, event_name, payload, emit_time) values (?, ?, ?, ?)";
pub(crate) const UPDATE_JOB_STATE: &str = "update jobs set state = ? where job_id = ?";

/// Bound values for [`INSERT_TEST_EVENT`], in column order.
pub(crate) fn test_event_params(event: &TestEvent) -> rusqlite::Result<[SqlValue; 9]> {
    Ok([
        SqlValue::Unsigned(event.header.job_id.0),
        SqlValue::Unsigned(event.header.run_id.0),
        SqlValue::Text(event.header.test_name.clone()),
        SqlValue::Integer(i64::from(event.header.test_attempt)),
        SqlValue::Text(event.header.test_step_label.clone()),
        SqlValue::Text(event.data.event_name.clone()),
        SqlValue::NullableText(event.data.target_id.clone()),
        SqlValue::NullableText(payload_text(event.data.payload.as_ref())?),
        SqlValue::Timestamp(event.emit_time),
    ])
}

/// Bound values for [`INSERT_FRAMEWORK_EVENT`], in column order.
pub(crate) fn framework_event_params(event: &FrameworkEvent) -> rusqlite::Result<[SqlValue; 4]> {
    Ok([
        SqlValue::Unsigned(event.job_id.0),
        SqlValue::Text(event.event_name.clone()),
        SqlValue::NullableText(payload_text(event.payload.as_ref())?),
        SqlValue::Timestamp(event.emit_time),
    ])
}

/// Converts every value the way the insert would, without touching the
/// database.
pub(crate) fn ensure_bindable(values: &[SqlValue]) -> rusqlite::Result<()> {
    values.iter().try_for_each(|value| value.to_sql().map(|_| ()))
}

pub(crate) fn test_event_from_row(row: &Row<'_>) -> rusqlite::Result<TestEvent> {
    Ok(TestEvent {
        event_id: Some(row.get(0)?),
        header: TestEventHeader {
            job_id: JobId(column_u64(row, 1)?),
            run_id: RunId(column_u64(row, 2)?),
            test_name: row.get(3)?,
            test_attempt: column_u32(row, 4)?,
            test_step_label: row.get(5)?,
        },
        data: TestEventData {
            event_name: row.get(6)?,
            target_id: row.get(7)?,
            payload: column_payload(row, 8)?,
        },
        emit_time: column_timestamp(row, 9)?,
    })
}

pub(crate) fn framework_event_from_row(row: &Row<'_>) -> rusqlite::Result<FrameworkEvent> {
    Ok(FrameworkEvent {
        event_id: Some(row.get(0)?),
        job_id: JobId(column_u64(row, 1)?),
        event_name: row.get(2)?,
        payload: column_payload(row, 3)?,
        emit_time: column_timestamp(row, 4)?,
    })
}

fn payload_text(payload: Option<&Value>) -> rusqlite::Result<Option<String>> {
    payload
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

fn column_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|_| invalid_column(idx, Type::Integer, format!("negative id: {raw}")))
}

fn column_u32(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw)
        .map_err(|_| invalid_column(idx, Type::Integer, format!("out of range: {raw}")))
}

fn column_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let nanos: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(|err| {
        invalid_column(idx, Type::Integer, format!("invalid emit_time {nanos}: {err}"))
    })
}

/// NULL decodes to `None`; anything else must be valid JSON.
fn column_payload(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|err| invalid_column(idx, Type::Text, format!("invalid payload JSON: {err}")))
    })
    .transpose()
}

fn invalid_column(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}
