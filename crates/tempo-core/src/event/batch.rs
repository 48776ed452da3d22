//! Bounded batches of events.
//!
//! An [`EventBatch`] is the unit of work handed between pipeline stages. It
//! has a fixed capacity set by the [`BatchPool`](super::BatchPool) that
//! produced it; appending to a full batch fails and hands the event back so
//! the caller can flush and continue with a fresh batch.
//!
//! Batches move between stages as [`SharedBatch`] (an `Arc`). On a linear
//! pipeline the refcount stays at one; multicast fan-out clones the `Arc`
//! once per branch and the last branch to finish releases the buffer.

use std::fmt;
use std::sync::Arc;

use super::StreamEvent;

/// A batch shared between stages (refcounted for multicast fan-out).
pub type SharedBatch<P> = Arc<EventBatch<P>>;

/// Error returned by [`EventBatch::push`] when the batch is at capacity.
pub struct BatchFull<P> {
    /// The event that could not be appended.
    pub event: StreamEvent<P>,
}

impl<P> BatchFull<P> {
    /// Consumes the error and returns the rejected event.
    #[must_use]
    pub fn into_inner(self) -> StreamEvent<P> {
        self.event
    }
}

impl<P> fmt::Debug for BatchFull<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFull")
            .field("sync_time", &self.event.sync_time())
            .finish_non_exhaustive()
    }
}

impl<P> fmt::Display for BatchFull<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch is full")
    }
}

impl<P> std::error::Error for BatchFull<P> {}

/// An ordered, bounded sequence of events sharing one allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch<P> {
    events: Vec<StreamEvent<P>>,
    capacity: usize,
}

impl<P> EventBatch<P> {
    /// Creates an empty batch holding at most `capacity` events.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Wraps a recycled buffer. The buffer is cleared first.
    pub(crate) fn from_buffer(mut events: Vec<StreamEvent<P>>, capacity: usize) -> Self {
        events.clear();
        Self {
            events,
            capacity: capacity.max(1),
        }
    }

    /// Builds a batch from events, sized to fit them exactly.
    #[must_use]
    pub fn from_events(events: Vec<StreamEvent<P>>) -> Self {
        let capacity = events.len().max(1);
        Self { events, capacity }
    }

    /// Appends an event in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`BatchFull`] carrying the event back when the batch is full.
    pub fn push(&mut self, event: StreamEvent<P>) -> Result<(), BatchFull<P>> {
        if self.is_full() {
            return Err(BatchFull { event });
        }
        self.events.push(event);
        Ok(())
    }

    /// Number of events in the batch.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the batch holds no events.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns true if no further event can be appended.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    /// Maximum number of events.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates events in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, StreamEvent<P>> {
        self.events.iter()
    }

    /// Returns the events as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[StreamEvent<P>] {
        &self.events
    }

    /// Removes every event, keeping the allocation.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Consumes the batch, returning the underlying buffer.
    #[must_use]
    pub fn into_events(self) -> Vec<StreamEvent<P>> {
        self.events
    }

    /// Number of data (non-punctuation) events.
    #[must_use]
    pub fn data_count(&self) -> usize {
        self.events.iter().filter(|e| e.is_data()).count()
    }

    /// The highest punctuation in the batch, if any.
    #[must_use]
    pub fn last_punctuation(&self) -> Option<i64> {
        self.events
            .iter()
            .rev()
            .find(|e| e.is_punctuation())
            .map(StreamEvent::sync_time)
    }
}

impl<'a, P> IntoIterator for &'a EventBatch<P> {
    type Item = &'a StreamEvent<P>;
    type IntoIter = std::slice::Iter<'a, StreamEvent<P>>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl<P> IntoIterator for EventBatch<P> {
    type Item = StreamEvent<P>;
    type IntoIter = std::vec::IntoIter<StreamEvent<P>>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}
