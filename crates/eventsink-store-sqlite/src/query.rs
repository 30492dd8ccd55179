//! Parameterized read queries built from optional criteria fields.
//!
//! Criteria values are never spliced into SQL text: every predicate carries
//! `?` placeholders and the matching [`SqlValue`]s are bound in order.

use eventsink_core::{EventQueryCriteria, FrameworkEventQueryCriteria, TestEventQueryCriteria};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use time::OffsetDateTime;

use crate::error::EmptyCriteriaError;

pub(crate) const SELECT_TEST_EVENTS: &str = "select event_id, job_id, run_id, test_name, test_attempt, test_step_label, event_name, target_id, payload, emit_time from test_events";
pub(crate) const SELECT_FRAMEWORK_EVENTS: &str =
    "select event_id, job_id, event_name, payload, emit_time from framework_events";
/// Appended after the assembled predicate so rows come back in insertion order.
pub(crate) const ORDER_BY_EVENT_ID: &str = " order by event_id";

/// A value bound to a positional placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(i64),
    /// Bound as an SQLite integer; values above `i64::MAX` fail to bind.
    Unsigned(u64),
    Text(String),
    NullableText(Option<String>),
    /// Bound as unix nanoseconds.
    Timestamp(OffsetDateTime),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Integer(value) => Ok(ToSqlOutput::Owned(Value::Integer(*value))),
            Self::Unsigned(value) => i64::try_from(*value)
                .map(|value| ToSqlOutput::Owned(Value::Integer(value)))
                .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err))),
            Self::Text(value) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes()))),
            Self::NullableText(Some(value)) => {
                Ok(ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())))
            }
            Self::NullableText(None) => Ok(ToSqlOutput::Owned(Value::Null)),
            Self::Timestamp(value) => timestamp_to_nanos(*value)
                .map(|nanos| ToSqlOutput::Owned(Value::Integer(nanos)))
                .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err))),
        }
    }
}

pub(crate) fn timestamp_to_nanos(value: OffsetDateTime) -> Result<i64, std::num::TryFromIntError> {
    i64::try_from(value.unix_timestamp_nanos())
}

/// Ordered predicate fragments with their ordered bound values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledCriteria {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl CompiledCriteria {
    #[must_use]
    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }

    #[must_use]
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    fn push(&mut self, clause: impl Into<String>, value: SqlValue) {
        self.clauses.push(clause.into());
        self.params.push(value);
    }

    fn push_many(&mut self, clause: String, values: impl IntoIterator<Item = SqlValue>) {
        self.clauses.push(clause);
        self.params.extend(values);
    }
}

/// Compiles the filters shared by both event categories.
#[must_use]
pub fn compile_event_criteria(criteria: Option<&EventQueryCriteria>) -> CompiledCriteria {
    let mut compiled = CompiledCriteria::default();
    let Some(criteria) = criteria else {
        return compiled;
    };

    if let Some(job_id) = criteria.effective_job_id() {
        compiled.push("job_id = ?", SqlValue::Unsigned(job_id.0));
    }

    match criteria.event_names.as_slice() {
        [] => {}
        [name] => compiled.push("event_name = ?", SqlValue::Text(name.clone())),
        names => compiled.push_many(
            format!("event_name in ({})", placeholders(names.len())),
            names.iter().cloned().map(SqlValue::Text),
        ),
    }

    if let Some(start) = criteria.emitted_start_time {
        compiled.push("emit_time >= ?", SqlValue::Timestamp(start));
    }
    if let Some(end) = criteria.emitted_end_time {
        compiled.push("emit_time <= ?", SqlValue::Timestamp(end));
    }

    compiled
}

#[must_use]
pub fn compile_test_event_criteria(criteria: Option<&TestEventQueryCriteria>) -> CompiledCriteria {
    let mut compiled = compile_event_criteria(criteria.map(|criteria| &criteria.event));
    let Some(criteria) = criteria else {
        return compiled;
    };

    if let Some(run_id) = criteria.effective_run_id() {
        compiled.push("run_id = ?", SqlValue::Unsigned(run_id.0));
    }
    if let Some(test_name) = criteria.effective_test_name() {
        compiled.push("test_name = ?", SqlValue::Text(test_name.to_string()));
    }
    if let Some(label) = criteria.effective_test_step_label() {
        compiled.push("test_step_label = ?", SqlValue::Text(label.to_string()));
    }

    compiled
}

#[must_use]
pub fn compile_framework_event_criteria(
    criteria: Option<&FrameworkEventQueryCriteria>,
) -> CompiledCriteria {
    compile_event_criteria(criteria.map(|criteria| &criteria.event))
}

/// Joins `base` with the predicate fragments using `where` / `and`.
///
/// # Errors
/// Returns [`EmptyCriteriaError`] when `clauses` is empty; unfiltered reads
/// are not supported.
pub fn assemble(base: &str, clauses: &[String]) -> Result<String, EmptyCriteriaError> {
    let Some((first, rest)) = clauses.split_first() else {
        return Err(EmptyCriteriaError);
    };

    let mut query = String::from(base);
    query.push_str(" where ");
    query.push_str(first);
    for clause in rest {
        query.push_str(" and ");
        query.push_str(clause);
    }
    Ok(query)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
