use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const DEFAULT_TEST_EVENTS_FLUSH_SIZE: usize = 64;
pub const DEFAULT_FRAMEWORK_EVENTS_FLUSH_SIZE: usize = 16;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Buffering and connection settings for [`crate::SqliteEventStore`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Buffered test events that trigger a flush.
    pub test_events_flush_size: usize,
    /// Buffered framework events that trigger a flush.
    pub framework_events_flush_size: usize,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            test_events_flush_size: DEFAULT_TEST_EVENTS_FLUSH_SIZE,
            framework_events_flush_size: DEFAULT_FRAMEWORK_EVENTS_FLUSH_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_flush_sizes(test_events: usize, framework_events: usize) -> Self {
        Self {
            test_events_flush_size: test_events,
            framework_events_flush_size: framework_events,
            ..Self::default()
        }
    }

    /// # Errors
    /// Returns [`StoreError::Config`] when either flush size is zero.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.test_events_flush_size == 0 {
            return Err(StoreError::Config(
                "test_events_flush_size MUST be >= 1".to_string(),
            ));
        }
        if self.framework_events_flush_size == 0 {
            return Err(StoreError::Config(
                "framework_events_flush_size MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
