//! In-memory staging area for one event category.

use std::sync::{Mutex, MutexGuard};

use eventsink_core::EventCategory;
use tracing::warn;

use crate::error::StoreError;

/// Ordered batch of not-yet-persisted events guarded by its own lock.
///
/// The buffer only knows when to flush; how to persist a batch is supplied by
/// the caller as a closure, which runs with the buffer lock held. A batch is
/// cleared only after the closure reports success.
#[derive(Debug)]
pub struct EventBuffer<T> {
    category: EventCategory,
    flush_size: usize,
    items: Mutex<Vec<T>>,
}

impl<T> EventBuffer<T> {
    /// # Errors
    /// Returns [`StoreError::Config`] when `flush_size` is zero.
    pub fn new(category: EventCategory, flush_size: usize) -> Result<Self, StoreError> {
        if flush_size == 0 {
            return Err(StoreError::Config(format!(
                "{category} flush size MUST be >= 1"
            )));
        }
        Ok(Self {
            category,
            flush_size,
            items: Mutex::new(Vec::with_capacity(flush_size)),
        })
    }

    /// Number of events currently waiting for a flush.
    ///
    /// # Errors
    /// Returns [`StoreError::LockPoisoned`] if a previous holder panicked.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    /// # Errors
    /// Returns [`StoreError::LockPoisoned`] if a previous holder panicked.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    /// Appends `event`, flushing through `flush` once the batch reaches the
    /// configured size.
    ///
    /// # Errors
    /// Returns [`StoreError::Flush`] when the triggered flush fails; the batch,
    /// including `event`, stays buffered.
    pub fn append<F>(&self, event: T, flush: F) -> Result<(), StoreError>
    where
        F: FnOnce(&[T]) -> Result<(), StoreError>,
    {
        let mut items = self.lock()?;
        items.push(event);
        if items.len() >= self.flush_size {
            self.flush_locked(&mut items, flush)?;
        }
        Ok(())
    }

    /// Flushes whatever is buffered regardless of the threshold.
    ///
    /// # Errors
    /// Returns [`StoreError::Flush`] when `flush` fails; the batch stays
    /// buffered.
    pub fn force_flush<F>(&self, flush: F) -> Result<(), StoreError>
    where
        F: FnOnce(&[T]) -> Result<(), StoreError>,
    {
        let mut items = self.lock()?;
        self.flush_locked(&mut items, flush)
    }

    fn flush_locked<F>(&self, items: &mut Vec<T>, flush: F) -> Result<(), StoreError>
    where
        F: FnOnce(&[T]) -> Result<(), StoreError>,
    {
        if items.is_empty() {
            return Ok(());
        }

        if let Err(source) = flush(items.as_slice()) {
            warn!(
                category = %self.category,
                pending = items.len(),
                error = %source,
                "flush failed, keeping batch buffered"
            );
            return Err(StoreError::Flush {
                category: self.category,
                source: Box::new(source),
            });
        }

        items.clear();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<T>>, StoreError> {
        self.items.lock().map_err(|_| StoreError::LockPoisoned {
            resource: match self.category {
                EventCategory::TestEvents => "test event buffer",
                EventCategory::FrameworkEvents => "framework event buffer",
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T, StoreError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn failing(_: &[u32]) -> Result<(), StoreError> {
        Err(StoreError::Config("store offline".to_string()))
    }

    #[test]
    fn zero_flush_size_is_rejected() {
        let result = EventBuffer::<u32>::new(EventCategory::TestEvents, 0);
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn append_flushes_in_fifo_batches_at_threshold() {
        let buffer = must(EventBuffer::new(EventCategory::TestEvents, 3));
        let mut batches: Vec<Vec<u32>> = Vec::new();

        for value in 1..=7 {
            must(buffer.append(value, |batch| {
                batches.push(batch.to_vec());
                Ok(())
            }));
        }

        assert_eq!(batches, vec![vec![1, 2, 3], vec![4, 5, 6]]);
        assert_eq!(must(buffer.len()), 1);

        must(buffer.force_flush(|batch| {
            batches.push(batch.to_vec());
            Ok(())
        }));
        assert_eq!(batches.last(), Some(&vec![7]));
        assert!(must(buffer.is_empty()));
    }

    #[test]
    fn force_flush_of_empty_buffer_skips_the_callback() {
        let buffer = must(EventBuffer::<u32>::new(EventCategory::FrameworkEvents, 2));
        let mut called = false;
        must(buffer.force_flush(|_| {
            called = true;
            Ok(())
        }));
        assert!(!called);
    }

    #[test]
    fn failed_flush_keeps_the_batch() {
        let buffer = must(EventBuffer::new(EventCategory::FrameworkEvents, 2));
        must(buffer.append(1, failing));

        let err = buffer.append(2, failing);
        match err {
            Err(StoreError::Flush { category, source }) => {
                assert_eq!(category, EventCategory::FrameworkEvents);
                assert!(matches!(*source, StoreError::Config(_)));
            }
            other => panic!("expected flush error, got {other:?}"),
        }
        assert_eq!(must(buffer.len()), 2);

        assert!(buffer.force_flush(failing).is_err());
        assert_eq!(must(buffer.len()), 2);

        let mut flushed = Vec::new();
        must(buffer.force_flush(|batch| {
            flushed.extend_from_slice(batch);
            Ok(())
        }));
        assert_eq!(flushed, vec![1, 2]);
        assert!(must(buffer.is_empty()));
    }
}
