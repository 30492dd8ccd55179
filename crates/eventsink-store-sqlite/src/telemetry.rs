use std::sync::atomic::{AtomicU64, Ordering};

use eventsink_core::EventCategory;
use serde::Serialize;

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
pub(crate) struct FlushTelemetry {
    test_event_flushes_total: AtomicU64,
    framework_event_flushes_total: AtomicU64,
    test_events_persisted_total: AtomicU64,
    framework_events_persisted_total: AtomicU64,
    job_state_updates_total: AtomicU64,
    flush_failures_total: AtomicU64,
}

/// Point-in-time copy of the store's flush counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct FlushTelemetrySnapshot {
    /// Non-empty batches handed to the persist engine.
    pub test_event_flushes_total: u64,
    pub framework_event_flushes_total: u64,
    /// Rows inserted, including the durable prefix of failed batches.
    pub test_events_persisted_total: u64,
    pub framework_events_persisted_total: u64,
    pub job_state_updates_total: u64,
    pub flush_failures_total: u64,
}

impl FlushTelemetry {
    pub(crate) fn record_flush(&self, category: EventCategory) {
        match category {
            EventCategory::TestEvents => &self.test_event_flushes_total,
            EventCategory::FrameworkEvents => &self.framework_event_flushes_total,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self, category: EventCategory) {
        match category {
            EventCategory::TestEvents => &self.test_events_persisted_total,
            EventCategory::FrameworkEvents => &self.framework_events_persisted_total,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_job_state_update(&self) {
        self.job_state_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.flush_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> FlushTelemetrySnapshot {
        FlushTelemetrySnapshot {
            test_event_flushes_total: self.test_event_flushes_total.load(Ordering::Relaxed),
            framework_event_flushes_total: self
                .framework_event_flushes_total
                .load(Ordering::Relaxed),
            test_events_persisted_total: self.test_events_persisted_total.load(Ordering::Relaxed),
            framework_events_persisted_total: self
                .framework_events_persisted_total
                .load(Ordering::Relaxed),
            job_state_updates_total: self.job_state_updates_total.load(Ordering::Relaxed),
            flush_failures_total: self.flush_failures_total.load(Ordering::Relaxed),
        }
    }
}
