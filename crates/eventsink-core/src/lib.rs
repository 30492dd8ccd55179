//! Domain model shared by the event buffer, its stores, and the command line.
//!
//! Two event categories flow through the system:
//! - [`TestEvent`]s, emitted by test steps while a job runs.
//! - [`FrameworkEvent`]s, emitted by the framework around a job's lifecycle.
//!
//! Reads are described by criteria objects ([`TestEventQueryCriteria`],
//! [`FrameworkEventQueryCriteria`]) whose unset fields never constrain a query.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EventError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// A zero id is the "unset" value in query criteria.
    #[must_use]
    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    #[must_use]
    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    TestEvents,
    FrameworkEvents,
}

impl EventCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestEvents => "test_events",
            Self::FrameworkEvents => "framework_events",
        }
    }
}

impl Display for EventCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestEventHeader {
    pub job_id: JobId,
    pub run_id: RunId,
    pub test_name: String,
    pub test_attempt: u32,
    pub test_step_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestEventData {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestEvent {
    /// Assigned by the store; always `None` for events that were never read back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    pub header: TestEventHeader,
    pub data: TestEventData,
    #[serde(with = "time::serde::rfc3339")]
    pub emit_time: OffsetDateTime,
}

impl TestEvent {
    #[must_use]
    pub fn new(header: TestEventHeader, data: TestEventData, emit_time: OffsetDateTime) -> Self {
        Self {
            event_id: None,
            header,
            data,
            emit_time,
        }
    }

    /// Checks producer-supplied fields before the event enters a buffer.
    ///
    /// # Errors
    /// Returns [`EventError::Validation`] when the event name or test name is
    /// blank.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.data.event_name.trim().is_empty() {
            return Err(EventError::Validation(
                "test event name MUST be non-empty".to_string(),
            ));
        }
        if self.header.test_name.trim().is_empty() {
            return Err(EventError::Validation(
                "test name MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameworkEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    pub job_id: JobId,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub emit_time: OffsetDateTime,
}

impl FrameworkEvent {
    #[must_use]
    pub fn new(job_id: JobId, event_name: impl Into<String>, emit_time: OffsetDateTime) -> Self {
        Self {
            event_id: None,
            job_id,
            event_name: event_name.into(),
            payload: None,
            emit_time,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// # Errors
    /// Returns [`EventError::Validation`] when the event name is blank.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_name.trim().is_empty() {
            return Err(EventError::Validation(
                "framework event name MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Filter fields shared by both event categories.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventQueryCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_names: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub emitted_start_time: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub emitted_end_time: Option<OffsetDateTime>,
}

impl EventQueryCriteria {
    #[must_use]
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    #[must_use]
    pub fn with_event_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_names = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn emitted_after(mut self, start: OffsetDateTime) -> Self {
        self.emitted_start_time = Some(start);
        self
    }

    #[must_use]
    pub fn emitted_before(mut self, end: OffsetDateTime) -> Self {
        self.emitted_end_time = Some(end);
        self
    }

    /// Job id filter, ignoring the zero "unset" value.
    #[must_use]
    pub fn effective_job_id(&self) -> Option<JobId> {
        self.job_id.filter(|job_id| !job_id.is_unset())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.effective_job_id().is_none()
            && self.event_names.is_empty()
            && self.emitted_start_time.is_none()
            && self.emitted_end_time.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestEventQueryCriteria {
    #[serde(flatten)]
    pub event: EventQueryCriteria,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_step_label: Option<String>,
}

impl TestEventQueryCriteria {
    #[must_use]
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            event: EventQueryCriteria::default().with_job_id(job_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    #[must_use]
    pub fn with_test_name(mut self, test_name: impl Into<String>) -> Self {
        self.test_name = Some(test_name.into());
        self
    }

    #[must_use]
    pub fn with_test_step_label(mut self, label: impl Into<String>) -> Self {
        self.test_step_label = Some(label.into());
        self
    }

    #[must_use]
    pub fn effective_run_id(&self) -> Option<RunId> {
        self.run_id.filter(|run_id| !run_id.is_unset())
    }

    #[must_use]
    pub fn effective_test_name(&self) -> Option<&str> {
        self.test_name.as_deref().filter(|name| !name.is_empty())
    }

    #[must_use]
    pub fn effective_test_step_label(&self) -> Option<&str> {
        self.test_step_label
            .as_deref()
            .filter(|label| !label.is_empty())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event.is_empty()
            && self.effective_run_id().is_none()
            && self.effective_test_name().is_none()
            && self.effective_test_step_label().is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameworkEventQueryCriteria {
    #[serde(flatten)]
    pub event: EventQueryCriteria,
}

impl FrameworkEventQueryCriteria {
    #[must_use]
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            event: EventQueryCriteria::default().with_job_id(job_id),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event.is_empty()
    }
}

impl From<EventQueryCriteria> for FrameworkEventQueryCriteria {
    fn from(event: EventQueryCriteria) -> Self {
        Self { event }
    }
}

impl From<EventQueryCriteria> for TestEventQueryCriteria {
    fn from(event: EventQueryCriteria) -> Self {
        Self {
            event,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Started,
    Completed,
    Failed,
    Paused,
    PauseFailed,
    Cancelling,
    Cancelled,
    CancellationFailed,
}

impl JobState {
    pub const ALL: [Self; 8] = [
        Self::Started,
        Self::Completed,
        Self::Failed,
        Self::Paused,
        Self::PauseFailed,
        Self::Cancelling,
        Self::Cancelled,
        Self::CancellationFailed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::PauseFailed => "pause_failed",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::CancellationFailed => "cancellation_failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            "pause_failed" => Some(Self::PauseFailed),
            "cancelling" => Some(Self::Cancelling),
            "cancelled" => Some(Self::Cancelled),
            "cancellation_failed" => Some(Self::CancellationFailed),
            _ => None,
        }
    }

    /// Name of the framework event that moves a job into this state.
    #[must_use]
    pub fn lifecycle_event_name(self) -> &'static str {
        match self {
            Self::Started => "JobStateStarted",
            Self::Completed => "JobStateCompleted",
            Self::Failed => "JobStateFailed",
            Self::Paused => "JobStatePaused",
            Self::PauseFailed => "JobStatePauseFailed",
            Self::Cancelling => "JobStateCancelling",
            Self::Cancelled => "JobStateCancelled",
            Self::CancellationFailed => "JobStateCancellationFailed",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a framework event name to the job state it implies, if any.
pub trait JobStateResolver: Send + Sync {
    fn job_state(&self, event_name: &str) -> Option<JobState>;
}

impl<F> JobStateResolver for F
where
    F: Fn(&str) -> Option<JobState> + Send + Sync,
{
    fn job_state(&self, event_name: &str) -> Option<JobState> {
        self(event_name)
    }
}

/// Event-name to job-state lookup table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct JobStateTable(BTreeMap<String, JobState>);

impl JobStateTable {
    /// The standard job lifecycle vocabulary (`JobStateStarted`, ...).
    #[must_use]
    pub fn lifecycle() -> Self {
        Self(
            JobState::ALL
                .into_iter()
                .map(|state| (state.lifecycle_event_name().to_string(), state))
                .collect(),
        )
    }

    #[must_use]
    pub fn with(mut self, event_name: impl Into<String>, state: JobState) -> Self {
        self.0.insert(event_name.into(), state);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl JobStateResolver for JobStateTable {
    fn job_state(&self, event_name: &str) -> Option<JobState> {
        self.0.get(event_name).copied()
    }
}

impl FromIterator<(String, JobState)> for JobStateTable {
    fn from_iter<T: IntoIterator<Item = (String, JobState)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EventError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EventError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EventError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EventError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EventError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EventError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EventError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_test_event() -> TestEvent {
        TestEvent::new(
            TestEventHeader {
                job_id: JobId(7),
                run_id: RunId(1),
                test_name: "boot".to_string(),
                test_attempt: 0,
                test_step_label: "flash".to_string(),
            },
            TestEventData {
                event_name: "TargetIn".to_string(),
                target_id: Some("host-01".to_string()),
                payload: Some(json!({"attempt": 1})),
            },
            must_utc("2026-02-07T12:00:00Z"),
        )
    }

    #[test]
    fn job_state_names_round_trip() {
        for state in JobState::ALL {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("running"), None);
    }

    #[test]
    fn lifecycle_table_resolves_standard_event_names() {
        let table = JobStateTable::lifecycle();
        assert_eq!(table.len(), JobState::ALL.len());
        assert_eq!(table.job_state("JobStateStarted"), Some(JobState::Started));
        assert_eq!(
            table.job_state("JobStateCancellationFailed"),
            Some(JobState::CancellationFailed)
        );
        assert_eq!(table.job_state("TargetAcquired"), None);
    }

    #[test]
    fn closures_act_as_resolvers() {
        let resolver = |name: &str| (name == "go").then_some(JobState::Started);
        assert_eq!(resolver.job_state("go"), Some(JobState::Started));
        assert_eq!(resolver.job_state("stop"), None);
    }

    #[test]
    fn job_state_table_deserializes_from_plain_map() {
        let table: JobStateTable = must_ok(serde_json::from_value(json!({
            "A": "started",
            "B": "completed"
        })));
        assert_eq!(table.job_state("A"), Some(JobState::Started));
        assert_eq!(table.job_state("B"), Some(JobState::Completed));
    }

    #[test]
    fn zero_ids_and_blank_names_leave_criteria_empty() {
        let criteria = TestEventQueryCriteria {
            event: EventQueryCriteria::default().with_job_id(JobId(0)),
            run_id: Some(RunId(0)),
            test_name: Some(String::new()),
            test_step_label: Some(String::new()),
        };
        assert!(criteria.is_empty());
        assert!(!TestEventQueryCriteria::for_job(JobId(3)).is_empty());
        assert!(!TestEventQueryCriteria::default()
            .with_test_step_label("flash")
            .is_empty());
    }

    #[test]
    fn criteria_deserialize_from_flat_json() {
        let criteria: TestEventQueryCriteria = must_ok(serde_json::from_value(json!({
            "job_id": 4,
            "event_names": ["a", "b"],
            "emitted_end_time": "2026-02-07T12:00:00Z",
            "test_name": "boot"
        })));
        assert_eq!(criteria.event.job_id, Some(JobId(4)));
        assert_eq!(criteria.event.event_names, vec!["a", "b"]);
        assert_eq!(criteria.event.emitted_start_time, None);
        assert_eq!(
            criteria.event.emitted_end_time,
            Some(must_utc("2026-02-07T12:00:00Z"))
        );
        assert_eq!(criteria.effective_test_name(), Some("boot"));
        assert_eq!(criteria.effective_run_id(), None);
    }

    #[test]
    fn test_event_json_omits_absent_optionals() {
        let mut event = fixture_test_event();
        event.data.target_id = None;
        event.data.payload = None;

        let value = must_ok(serde_json::to_value(&event));
        assert!(value.get("event_id").is_none());
        assert!(value["data"].get("target_id").is_none());
        assert!(value["data"].get("payload").is_none());
        assert_eq!(value["emit_time"], json!("2026-02-07T12:00:00Z"));

        let parsed: TestEvent = must_ok(serde_json::from_value(value));
        assert_eq!(parsed, event);
    }

    #[test]
    fn validation_rejects_blank_names() {
        let mut event = fixture_test_event();
        assert!(event.validate().is_ok());
        event.data.event_name = "  ".to_string();
        assert!(matches!(event.validate(), Err(EventError::Validation(_))));

        let framework = FrameworkEvent::new(JobId(1), "", now_utc());
        assert!(framework.validate().is_err());
    }

    #[test]
    fn rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let parsed = must_utc("2026-02-07T12:00:00.250Z");
        let formatted = must_ok(format_rfc3339(parsed));
        assert_eq!(must_utc(&formatted), parsed);
    }
}
