use std::fmt::{Display, Formatter};

use eventsink_core::{EventCategory, JobId};

/// Statements issued against the store, used to tag failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StatementKind {
    InsertTestEvent,
    InsertFrameworkEvent,
    UpdateJobState,
    SelectTestEvents,
    SelectFrameworkEvents,
}

impl StatementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsertTestEvent => "insert_test_event",
            Self::InsertFrameworkEvent => "insert_framework_event",
            Self::UpdateJobState => "update_job_state",
            Self::SelectTestEvents => "select_test_events",
            Self::SelectFrameworkEvents => "select_framework_events",
        }
    }
}

impl Display for StatementKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by the assembler when no predicate fragments were supplied.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("no select clauses available, the query should specify at least one clause")]
pub struct EmptyCriteriaError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not assemble query for {category}: {source}")]
    Assembly {
        category: EventCategory,
        #[source]
        source: EmptyCriteriaError,
    },

    #[error("could not store {category} in database ({statement}): {source}")]
    Persist {
        category: EventCategory,
        statement: StatementKind,
        #[source]
        source: rusqlite::Error,
    },

    /// The event could never be bound to its insert statement, so it was not
    /// buffered.
    #[error("rejected {category} event before buffering ({statement}): {source}")]
    Rejected {
        category: EventCategory,
        statement: StatementKind,
        #[source]
        source: rusqlite::Error,
    },

    #[error("could not execute {statement} for {category}: {source}")]
    Query {
        category: EventCategory,
        statement: StatementKind,
        #[source]
        source: rusqlite::Error,
    },

    #[error("could not read {category} results from database: {source}")]
    Scan {
        category: EventCategory,
        #[source]
        source: rusqlite::Error,
    },

    #[error("could not flush buffered {category}: {source}")]
    Flush {
        category: EventCategory,
        #[source]
        source: Box<StoreError>,
    },

    #[error("job {job_id} has unknown stored state {value:?}")]
    UnknownJobState { job_id: JobId, value: String },

    #[error("{resource} lock poisoned")]
    LockPoisoned { resource: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

impl StoreError {
    /// The event category the failure belongs to, when there is one.
    #[must_use]
    pub fn category(&self) -> Option<EventCategory> {
        match self {
            Self::Assembly { category, .. }
            | Self::Persist { category, .. }
            | Self::Rejected { category, .. }
            | Self::Query { category, .. }
            | Self::Scan { category, .. }
            | Self::Flush { category, .. } => Some(*category),
            Self::UnknownJobState { .. }
            | Self::LockPoisoned { .. }
            | Self::Config(_)
            | Self::Database { .. } => None,
        }
    }

    /// Follows `Flush` wrappers down to the failure that caused them.
    #[must_use]
    pub fn root(&self) -> &StoreError {
        match self {
            Self::Flush { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn database(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Database { context, source }
    }
}
