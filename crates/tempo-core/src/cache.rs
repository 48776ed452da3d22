//! # Cache
//!
//! Materializes a stream so it can be replayed any number of times.
//!
//! [`Cache`] is a pass-through operator: events flow on unchanged while the
//! data events are recorded into a [`CachedStream`]. An optional limit caps
//! the number of events recorded; `0` means unlimited.
//!
//! In edge-free mode the cache coalesces each End with its recorded Start
//! into a single `Interval`. An End whose Start was never recorded (it
//! arrived before the cache, or past the limit) still yields the interval
//! its two timestamps describe.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::event::{EventBatch, EventKind, Payload, StreamEvent};
use crate::operator::{
    decode_state, encode_state, Operator, OperatorError, OperatorState, OutputBuffer,
};
use crate::pipeline::Observer;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheState<P> {
    events: Vec<StreamEvent<P>>,
    /// Positions of recorded Starts, by `sync_time`.
    open: Vec<(i64, Vec<usize>)>,
    truncated: bool,
}

/// Materialized events shared between a [`Cache`] and its readers.
pub struct CachedStream<P> {
    inner: Arc<Mutex<Vec<StreamEvent<P>>>>,
    truncated: Arc<Mutex<bool>>,
}

impl<P> Clone for CachedStream<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            truncated: Arc::clone(&self.truncated),
        }
    }
}

impl<P: Payload> CachedStream<P> {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            truncated: Arc::new(Mutex::new(false)),
        }
    }

    /// Recorded events in `sync_time` order.
    #[must_use]
    pub fn events(&self) -> Vec<StreamEvent<P>> {
        let mut events = self.inner.lock().clone();
        events.sort_by_key(StreamEvent::sync_time);
        events
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Returns `true` if the limit stopped recording.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        *self.truncated.lock()
    }

    /// Pushes the recorded events into `observer` in `sync_time` order,
    /// `batch_size` events per batch, then completes it.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by `observer`.
    pub fn replay(&self, observer: &mut dyn Observer<P>, batch_size: usize) -> crate::Result<()> {
        let batch_size = batch_size.max(1);
        let events = self.events();
        tracing::debug!(events = events.len(), batch_size, "replaying cache");
        for chunk in events.chunks(batch_size) {
            observer.on_batch(Arc::new(EventBatch::from_events(chunk.to_vec())))?;
        }
        observer.on_completed()
    }
}

impl<P> fmt::Debug for CachedStream<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStream")
            .field("events", &self.inner.lock().len())
            .finish_non_exhaustive()
    }
}

/// Pass-through operator recording its input into a [`CachedStream`].
pub struct Cache<P> {
    limit: usize,
    coalesce_edges: bool,
    open: BTreeMap<i64, SmallVec<[usize; 2]>>,
    stream: CachedStream<P>,
}

impl<P: Payload> Cache<P> {
    /// Creates a cache and the stream it records into.
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum recorded events, `0` for unlimited
    /// * `coalesce_edges` - Record Start/End pairs as single intervals
    #[must_use]
    pub fn new(limit: usize, coalesce_edges: bool) -> (Self, CachedStream<P>) {
        let stream = CachedStream::new();
        (
            Self {
                limit,
                coalesce_edges,
                open: BTreeMap::new(),
                stream: stream.clone(),
            },
            stream,
        )
    }

    fn has_room(&self, recorded: usize) -> bool {
        self.limit == 0 || recorded < self.limit
    }

    fn record(&mut self, event: &StreamEvent<P>) {
        let mut events = self.stream.inner.lock();
        if self.coalesce_edges && event.is_end() {
            if let Some(payload) = event.payload() {
                let start = event.other_time();
                let position = self.open.get_mut(&start).and_then(|positions| {
                    let idx = positions
                        .iter()
                        .position(|&i| events[i].payload() == Some(payload))?;
                    Some(positions.remove(idx))
                });
                if self.open.get(&start).is_some_and(SmallVec::is_empty) {
                    self.open.remove(&start);
                }
                if let Some(i) = position {
                    let pending = events[i].clone();
                    events[i] = pending.retimed(EventKind::Interval, start, event.sync_time());
                    return;
                }
                if self.has_room(events.len()) {
                    events.push(event.clone().retimed(
                        EventKind::Interval,
                        start,
                        event.sync_time(),
                    ));
                    return;
                }
            }
        }
        if !self.has_room(events.len()) {
            let mut truncated = self.stream.truncated.lock();
            if !*truncated {
                tracing::warn!(limit = self.limit, "cache limit reached, recording stopped");
                *truncated = true;
            }
            return;
        }
        if self.coalesce_edges && event.is_start() {
            self.open
                .entry(event.sync_time())
                .or_default()
                .push(events.len());
        }
        events.push(event.clone());
    }
}

impl<P> fmt::Debug for Cache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("limit", &self.limit)
            .field("coalesce_edges", &self.coalesce_edges)
            .finish_non_exhaustive()
    }
}

impl<P: Payload> Operator<P, P> for Cache<P> {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn process(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<P>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            if event.is_data() {
                self.record(event);
            }
            output.push(event.clone());
        }
        Ok(())
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        let state = CacheState {
            events: self.stream.inner.lock().clone(),
            open: self
                .open
                .iter()
                .map(|(start, positions)| (*start, positions.to_vec()))
                .collect(),
            truncated: self.stream.is_truncated(),
        };
        encode_state(self.name(), &state)
    }

    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError> {
        let state: CacheState<P> = decode_state(self.name(), &state)?;
        for event in &state.events {
            event.validate()?;
        }
        if state
            .open
            .iter()
            .flat_map(|(_, positions)| positions)
            .any(|&i| i >= state.events.len())
        {
            return Err(OperatorError::SerializationFailed(
                "cache: open edge points past the recorded events".to_string(),
            ));
        }
        *self.stream.inner.lock() = state.events;
        *self.stream.truncated.lock() = state.truncated;
        self.open = state
            .open
            .into_iter()
            .map(|(start, positions)| (start, SmallVec::from_vec(positions)))
            .collect();
        Ok(())
    }
}
