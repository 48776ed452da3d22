//! # Ingress
//!
//! Turns an arbitrary push-based source into a policy-compliant, ordered,
//! batched stream.
//!
//! For every data event the ingress, in order:
//!
//! 1. inserts any punctuation the [`PunctuationPolicy`] generates
//! 2. applies the [`DisorderPolicy`] if the event is earlier than the last
//!    punctuation
//! 3. matches End edges against the open Starts, rewriting each End to
//!    reference the time its Start was actually emitted at
//! 4. holds the event in a reorder buffer keyed by `sync_time`
//!
//! An End that arrives before its Start waits for it. It is declared
//! unmatched only once a punctuation reaches the End's own time, since no
//! Start can then arrive in order.
//!
//! A punctuation releases every buffered event at or before it, in time
//! order, followed by the punctuation itself. Downstream therefore sees
//! non-decreasing `sync_time` between punctuations and no data below the
//! last punctuation.
//!
//! ## Adjusted edges
//!
//! When Adjust moves a Start forward to the punctuation, its End keeps
//! pairing with it: the End is re-pointed at the moved Start. If that
//! collapses the lifetime (the End is at or before the moved Start), the End
//! is placed one time unit after the Start.
//!
//! ## Threading
//!
//! Producers on any thread push through an [`IngressHandle`], which
//! serializes them behind a mutex before any ordering logic runs. The whole
//! downstream pipeline runs synchronously inside the push.

mod policy;

pub use policy::{
    DisorderPolicy, EdgeMatching, FlushPolicy, IngressConfig, OnCompletedPolicy,
    PunctuationPolicy,
};

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::checkpoint::CheckpointTarget;
use crate::event::{
    BatchPool, EventBatch, EventKind, InvalidEventError, Payload, StreamEvent, INFINITY,
};
use crate::operator::{decode_state, encode_state, OperatorError, OperatorState};
use crate::pipeline::BoxedObserver;
use crate::watermark::{PunctuationTracker, WatermarkSlot};

/// A data event arrived earlier than the last punctuation under
/// [`DisorderPolicy::Throw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event at {sync_time} arrived after punctuation {punctuation}")]
pub struct DisorderError {
    /// Time of the late event.
    pub sync_time: i64,
    /// Last punctuation emitted before it.
    pub punctuation: i64,
}

/// Ingress errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngressError {
    /// Late event under the Throw policy.
    #[error(transparent)]
    Disorder(#[from] DisorderError),

    /// Malformed event, or an unmatched End under strict matching.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] InvalidEventError),

    /// Input after completion.
    #[error("ingress `{0}` already completed")]
    Completed(String),

    /// Input after a fatal error.
    #[error("ingress `{0}` terminated by an earlier error")]
    Terminated(String),

    /// Invalid policy parameters.
    #[error("invalid ingress configuration: {0}")]
    InvalidConfig(String),
}

/// Ingress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressStats {
    /// Data events accepted, adjusted ones included.
    pub accepted: u64,
    /// Late events moved forward.
    pub adjusted: u64,
    /// Late events discarded, including intervals emptied by adjustment.
    pub dropped: u64,
    /// Unmatched Ends discarded under [`EdgeMatching::Repair`].
    pub repaired: u64,
    /// Punctuations generated by the punctuation policy.
    pub punctuations_generated: u64,
    /// Batches pushed downstream.
    pub batches_flushed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Lifecycle {
    Open,
    Completed,
    Failed,
}

/// A Start waiting for its End.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenEdge<P> {
    payload: P,
    /// Time the Start was emitted at, or `None` if it was dropped.
    emitted: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct IngressSnapshot<P> {
    lifecycle: Lifecycle,
    punctuation: i64,
    reorder: Vec<StreamEvent<P>>,
    edges: Vec<(i64, OpenEdge<P>)>,
    pending_ends: Vec<StreamEvent<P>>,
    unflushed: Vec<StreamEvent<P>>,
    since_punctuation: u64,
    max_sync_time: i64,
    stats: IngressStats,
}

/// Policy-driven entry point of a pipeline.
pub struct Ingress<P> {
    name: String,
    config: IngressConfig,
    pool: Arc<BatchPool<P>>,
    next: BoxedObserver<P>,
    current: EventBatch<P>,
    tracker: PunctuationTracker,
    /// Accepted events not yet released, by `sync_time`.
    reorder: BTreeMap<i64, Vec<StreamEvent<P>>>,
    /// Open Starts by their original `sync_time`.
    edges: BTreeMap<i64, SmallVec<[OpenEdge<P>; 2]>>,
    /// Ends that arrived before their Start.
    pending_ends: Vec<StreamEvent<P>>,
    since_punctuation: u64,
    max_sync_time: i64,
    watermark: Option<WatermarkSlot>,
    lifecycle: Lifecycle,
    stats: IngressStats,
}

impl<P: Payload> Ingress<P> {
    /// Creates an ingress feeding `next`.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::InvalidConfig`] if the policies are invalid.
    pub fn new(
        name: impl Into<String>,
        config: IngressConfig,
        pool: Arc<BatchPool<P>>,
        next: BoxedObserver<P>,
    ) -> Result<Self, IngressError> {
        config.validate()?;
        let current = pool.checkout();
        Ok(Self {
            name: name.into(),
            config,
            pool,
            next,
            current,
            tracker: PunctuationTracker::new(),
            reorder: BTreeMap::new(),
            edges: BTreeMap::new(),
            pending_ends: Vec::new(),
            since_punctuation: 0,
            max_sync_time: i64::MIN,
            watermark: None,
            lifecycle: Lifecycle::Open,
            stats: IngressStats::default(),
        })
    }

    /// Publishes emitted punctuations into `slot`.
    #[must_use]
    pub fn with_watermark(mut self, slot: WatermarkSlot) -> Self {
        self.watermark = Some(slot);
        self
    }

    /// Pushes one event.
    ///
    /// # Errors
    ///
    /// Returns an [`IngressError`] for disorder under Throw, invalid or
    /// unmatched events, and input after completion, or any error raised
    /// downstream. Every error terminates the ingress.
    pub fn push(&mut self, event: StreamEvent<P>) -> crate::Result<()> {
        self.ensure_open()?;
        let result = self.accept(event);
        if result.is_err() {
            self.lifecycle = Lifecycle::Failed;
        }
        result
    }

    /// Pushes the batch under assembly downstream, even if not full.
    ///
    /// Events still waiting in the reorder buffer are not affected.
    ///
    /// # Errors
    ///
    /// Returns any error raised downstream.
    pub fn flush(&mut self) -> crate::Result<()> {
        self.forward_current()
    }

    /// Completes the source.
    ///
    /// Completing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::Terminated`] after a fatal error, or any error
    /// raised downstream.
    pub fn complete(&mut self) -> crate::Result<()> {
        match self.lifecycle {
            Lifecycle::Completed => return Ok(()),
            Lifecycle::Failed => return Err(IngressError::Terminated(self.name.clone()).into()),
            Lifecycle::Open => {}
        }
        self.lifecycle = Lifecycle::Completed;
        debug!(ingress = %self.name, policy = ?self.config.on_completed, "source completed");
        match self.config.on_completed {
            OnCompletedPolicy::EndOfStream => {
                self.emit_punctuation(INFINITY)?;
            }
            OnCompletedPolicy::None => self.release(INFINITY)?,
        }
        self.forward_current()?;
        self.next.on_completed()
    }

    /// Ingress name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last emitted punctuation, if any.
    #[must_use]
    pub fn watermark(&self) -> Option<i64> {
        self.tracker.is_set().then_some(self.tracker.current())
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> IngressStats {
        self.stats
    }

    /// Events held in the reorder buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.reorder.values().map(Vec::len).sum()
    }

    /// Starts still waiting for their End.
    #[must_use]
    pub fn open_edges(&self) -> usize {
        self.edges.values().map(SmallVec::len).sum()
    }

    /// Ends still waiting for their Start.
    #[must_use]
    pub fn pending_ends(&self) -> usize {
        self.pending_ends.len()
    }

    /// Returns `true` once the source completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.lifecycle == Lifecycle::Completed
    }

    fn ensure_open(&self) -> Result<(), IngressError> {
        match self.lifecycle {
            Lifecycle::Open => Ok(()),
            Lifecycle::Completed => Err(IngressError::Completed(self.name.clone())),
            Lifecycle::Failed => Err(IngressError::Terminated(self.name.clone())),
        }
    }

    fn accept(&mut self, event: StreamEvent<P>) -> crate::Result<()> {
        event.validate().map_err(IngressError::from)?;
        if event.is_punctuation() {
            if !self.emit_punctuation(event.sync_time())? {
                trace!(
                    ingress = %self.name,
                    punctuation = event.sync_time(),
                    "regressing punctuation ignored"
                );
            }
            return Ok(());
        }

        self.generate_before(event.sync_time())?;
        let late = self.tracker.is_late(event.sync_time());
        if late {
            match self.config.disorder {
                DisorderPolicy::Throw => {
                    return Err(IngressError::from(DisorderError {
                        sync_time: event.sync_time(),
                        punctuation: self.tracker.current(),
                    })
                    .into());
                }
                DisorderPolicy::Drop => {
                    trace!(ingress = %self.name, sync_time = event.sync_time(), "late event dropped");
                    self.forget(&event);
                    self.stats.dropped += 1;
                    return Ok(());
                }
                DisorderPolicy::Adjust => {}
            }
        }

        let Some(event) = self.correct(event)? else {
            if late {
                self.stats.dropped += 1;
            }
            return Ok(());
        };
        if late {
            self.stats.adjusted += 1;
        }
        self.enqueue(event);

        if let PunctuationPolicy::Count { events } = self.config.punctuation {
            if self.since_punctuation >= events && self.emit_punctuation(self.max_sync_time)? {
                self.stats.punctuations_generated += 1;
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, event: StreamEvent<P>) {
        self.max_sync_time = self.max_sync_time.max(event.sync_time());
        self.reorder.entry(event.sync_time()).or_default().push(event);
        self.stats.accepted += 1;
        self.since_punctuation += 1;
    }

    /// Snaps the event to the last punctuation and resolves its edge.
    ///
    /// Returns `None` if the event does not survive.
    fn correct(&mut self, event: StreamEvent<P>) -> crate::Result<Option<StreamEvent<P>>> {
        let floor = self.tracker.current();
        match event.kind() {
            EventKind::Start => {
                let original = event.sync_time();
                let Some(payload) = event.payload().cloned() else {
                    return Ok(None);
                };
                let emitted = original.max(floor);
                if let Some(end) = self.take_pending_end(original, &payload) {
                    trace!(ingress = %self.name, start = original, "waiting end paired");
                    self.enqueue(Self::pair_end(end, emitted, floor));
                } else {
                    self.edges.entry(original).or_default().push(OpenEdge {
                        payload,
                        emitted: Some(emitted),
                    });
                }
                Ok(event.snapped_to(floor))
            }
            EventKind::Interval => Ok(event.snapped_to(floor)),
            EventKind::End => self.close_edge(event, floor),
            EventKind::Punctuation => Ok(None),
        }
    }

    fn take_edge(&mut self, start: i64, payload: &P) -> Option<OpenEdge<P>> {
        let open = self.edges.get_mut(&start)?;
        let index = open.iter().position(|edge| &edge.payload == payload)?;
        let edge = open.remove(index);
        if open.is_empty() {
            self.edges.remove(&start);
        }
        Some(edge)
    }

    fn take_pending_end(&mut self, start: i64, payload: &P) -> Option<StreamEvent<P>> {
        let index = self
            .pending_ends
            .iter()
            .position(|end| end.other_time() == start && end.payload() == Some(payload))?;
        Some(self.pending_ends.remove(index))
    }

    /// Pairs an End with the time its Start was emitted at.
    ///
    /// The End's `other_time` is re-pointed at the emitted Start rather than
    /// left at the Start's original time, so downstream operators pair it
    /// with the Start they actually saw. An End that would no longer follow
    /// its Start is placed one time unit after it.
    fn pair_end(event: StreamEvent<P>, start: i64, floor: i64) -> StreamEvent<P> {
        let end = event
            .sync_time()
            .max(floor)
            .max(start.saturating_add(1));
        event.retimed(EventKind::End, end, start)
    }

    /// Matches an End against the open Starts.
    ///
    /// An End with no open Start waits for it unless it is already late; see
    /// [`pair_end`](Self::pair_end) for how a matched End is retimed.
    fn close_edge(
        &mut self,
        event: StreamEvent<P>,
        floor: i64,
    ) -> crate::Result<Option<StreamEvent<P>>> {
        let Some(payload) = event.payload() else {
            return Ok(None);
        };
        match self.take_edge(event.other_time(), payload) {
            Some(OpenEdge {
                emitted: Some(start),
                ..
            }) => Ok(Some(Self::pair_end(event, start, floor))),
            Some(OpenEdge { emitted: None, .. }) => {
                trace!(ingress = %self.name, "end of a dropped start discarded");
                Ok(None)
            }
            None if self.tracker.is_late(event.sync_time()) => {
                self.unmatched(&event)?;
                Ok(None)
            }
            None => {
                trace!(
                    ingress = %self.name,
                    sync_time = event.sync_time(),
                    start = event.other_time(),
                    "end waiting for its start"
                );
                self.pending_ends.push(event);
                Ok(None)
            }
        }
    }

    fn unmatched(&mut self, event: &StreamEvent<P>) -> crate::Result<()> {
        match self.config.edge_matching {
            EdgeMatching::Strict => Err(IngressError::from(InvalidEventError::UnmatchedEnd {
                sync_time: event.sync_time(),
                other_time: event.other_time(),
            })
            .into()),
            EdgeMatching::Repair => {
                warn!(
                    ingress = %self.name,
                    sync_time = event.sync_time(),
                    start = event.other_time(),
                    "unmatched end dropped"
                );
                self.stats.repaired += 1;
                Ok(())
            }
        }
    }

    /// Declares Ends at or before `time` unmatched.
    fn expire_pending_ends(&mut self, time: i64) -> crate::Result<()> {
        if self.pending_ends.is_empty() {
            return Ok(());
        }
        let (expired, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.pending_ends)
            .into_iter()
            .partition(|end| end.sync_time() <= time);
        self.pending_ends = waiting;
        for end in &expired {
            self.unmatched(end)?;
        }
        Ok(())
    }

    /// Edge bookkeeping for an event discarded by the Drop policy.
    fn forget(&mut self, event: &StreamEvent<P>) {
        let Some(payload) = event.payload() else {
            return;
        };
        match event.kind() {
            EventKind::Start => {
                if self.take_pending_end(event.sync_time(), payload).is_some() {
                    trace!(ingress = %self.name, "waiting end of a dropped start discarded");
                    return;
                }
                self.edges
                    .entry(event.sync_time())
                    .or_default()
                    .push(OpenEdge {
                        payload: payload.clone(),
                        emitted: None,
                    });
            }
            EventKind::End => {
                self.take_edge(event.other_time(), payload);
            }
            EventKind::Interval | EventKind::Punctuation => {}
        }
    }

    fn generate_before(&mut self, sync_time: i64) -> crate::Result<()> {
        let PunctuationPolicy::Time { period } = self.config.punctuation else {
            return Ok(());
        };
        let due = !self.tracker.is_set()
            || sync_time >= self.tracker.current().saturating_add(period);
        if due {
            let boundary = sync_time - sync_time.rem_euclid(period);
            if self.emit_punctuation(boundary)? {
                self.stats.punctuations_generated += 1;
            }
        }
        Ok(())
    }

    /// Releases buffered events up to `time`, then the punctuation.
    ///
    /// Returns `false` if `time` does not advance the watermark.
    fn emit_punctuation(&mut self, time: i64) -> crate::Result<bool> {
        if !self.tracker.observe(time) {
            return Ok(false);
        }
        debug!(ingress = %self.name, punctuation = time, "punctuation");
        self.release(time)?;
        self.append(StreamEvent::punctuation(time))?;
        self.since_punctuation = 0;
        if let Some(slot) = &self.watermark {
            slot.advance(time);
        }
        if self.config.flush == FlushPolicy::OnPunctuation {
            self.forward_current()?;
        }
        Ok(true)
    }

    fn release(&mut self, time: i64) -> crate::Result<()> {
        self.expire_pending_ends(time)?;
        while let Some(entry) = self.reorder.first_entry() {
            if *entry.key() > time {
                break;
            }
            for event in entry.remove() {
                self.append(event)?;
            }
        }
        Ok(())
    }

    fn append(&mut self, event: StreamEvent<P>) -> crate::Result<()> {
        let mut event = event;
        while let Err(full) = self.current.push(event) {
            self.forward_current()?;
            event = full.into_inner();
        }
        if self.current.is_full() {
            self.forward_current()?;
        }
        Ok(())
    }

    fn forward_current(&mut self) -> crate::Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let batch = mem::replace(&mut self.current, self.pool.checkout());
        trace!(ingress = %self.name, events = batch.len(), "flushing batch");
        self.stats.batches_flushed += 1;
        self.next.on_batch(Arc::new(batch))
    }

    fn snapshot(&self) -> IngressSnapshot<P> {
        IngressSnapshot {
            lifecycle: self.lifecycle,
            punctuation: self.tracker.current(),
            reorder: self.reorder.values().flatten().cloned().collect(),
            edges: self
                .edges
                .iter()
                .flat_map(|(start, open)| open.iter().map(|edge| (*start, edge.clone())))
                .collect(),
            pending_ends: self.pending_ends.clone(),
            unflushed: self.current.iter().cloned().collect(),
            since_punctuation: self.since_punctuation,
            max_sync_time: self.max_sync_time,
            stats: self.stats,
        }
    }

    fn apply_snapshot(&mut self, snapshot: IngressSnapshot<P>) -> Result<(), OperatorError> {
        for event in snapshot
            .reorder
            .iter()
            .chain(&snapshot.pending_ends)
            .chain(&snapshot.unflushed)
        {
            event.validate()?;
        }
        self.lifecycle = snapshot.lifecycle;
        self.tracker = PunctuationTracker::new();
        self.tracker.observe(snapshot.punctuation);
        self.reorder.clear();
        for event in snapshot.reorder {
            self.reorder.entry(event.sync_time()).or_default().push(event);
        }
        self.edges.clear();
        for (start, edge) in snapshot.edges {
            self.edges.entry(start).or_default().push(edge);
        }
        self.pending_ends = snapshot.pending_ends;
        self.current = if snapshot.unflushed.is_empty() {
            self.pool.checkout()
        } else {
            EventBatch::from_events(snapshot.unflushed)
        };
        self.since_punctuation = snapshot.since_punctuation;
        self.max_sync_time = snapshot.max_sync_time;
        self.stats = snapshot.stats;
        Ok(())
    }
}

impl<P> fmt::Debug for Ingress<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingress")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("punctuation", &self.tracker.current())
            .field("lifecycle", &self.lifecycle)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<P: Payload> CheckpointTarget for Mutex<Ingress<P>> {
    fn operator_name(&self) -> &'static str {
        "ingress"
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        encode_state("ingress", &self.lock().snapshot())
    }

    fn restore(&self, state: OperatorState) -> Result<(), OperatorError> {
        let snapshot: IngressSnapshot<P> = decode_state("ingress", &state)?;
        self.lock().apply_snapshot(snapshot)
    }
}

/// Thread-safe handle producers push through.
pub struct IngressHandle<P> {
    inner: Arc<Mutex<Ingress<P>>>,
}

impl<P> Clone for IngressHandle<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Payload> IngressHandle<P> {
    /// Wraps an ingress.
    #[must_use]
    pub fn new(ingress: Ingress<P>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ingress)),
        }
    }

    /// See [`Ingress::push`].
    ///
    /// # Errors
    ///
    /// As [`Ingress::push`].
    pub fn push(&self, event: StreamEvent<P>) -> crate::Result<()> {
        self.inner.lock().push(event)
    }

    /// Pushes events in order, stopping at the first error.
    ///
    /// # Errors
    ///
    /// As [`Ingress::push`].
    pub fn push_all<I>(&self, events: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = StreamEvent<P>>,
    {
        let mut ingress = self.inner.lock();
        for event in events {
            ingress.push(event)?;
        }
        Ok(())
    }

    /// Pushes a punctuation at `time`.
    ///
    /// # Errors
    ///
    /// As [`Ingress::push`].
    pub fn punctuate(&self, time: i64) -> crate::Result<()> {
        self.push(StreamEvent::punctuation(time))
    }

    /// See [`Ingress::flush`].
    ///
    /// # Errors
    ///
    /// As [`Ingress::flush`].
    pub fn flush(&self) -> crate::Result<()> {
        self.inner.lock().flush()
    }

    /// See [`Ingress::complete`].
    ///
    /// # Errors
    ///
    /// As [`Ingress::complete`].
    pub fn complete(&self) -> crate::Result<()> {
        self.inner.lock().complete()
    }

    /// Last emitted punctuation.
    #[must_use]
    pub fn watermark(&self) -> Option<i64> {
        self.inner.lock().watermark()
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> IngressStats {
        self.inner.lock().stats()
    }

    /// Events held in the reorder buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffered()
    }

    /// Returns `true` once the source completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.lock().is_completed()
    }

    /// Checkpoint handle for the ingress state.
    #[must_use]
    pub fn checkpoint_target(&self) -> Arc<dyn CheckpointTarget> {
        Arc::clone(&self.inner) as Arc<dyn CheckpointTarget>
    }
}

impl<P> fmt::Debug for IngressHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngressHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_util::Collector;
    use crate::Error;

    fn setup(config: IngressConfig) -> (Ingress<char>, Collector<char>) {
        setup_with_capacity(config, 64)
    }

    fn setup_with_capacity(
        config: IngressConfig,
        capacity: usize,
    ) -> (Ingress<char>, Collector<char>) {
        let sink = Collector::<char>::default();
        let ingress = Ingress::new(
            "test",
            config,
            Arc::new(BatchPool::new(capacity, 4)),
            Box::new(sink.clone()),
        )
        .unwrap();
        (ingress, sink)
    }

    #[test]
    fn test_throw_rejects_late_event_and_terminates() {
        let (mut ingress, _sink) = setup(IngressConfig::default());
        ingress.push(StreamEvent::start(5, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::punctuation(10)).unwrap();

        let err = ingress.push(StreamEvent::start(7, 'b').unwrap()).unwrap_err();
        assert!(matches!(
            err,
            Error::Ingress(IngressError::Disorder(DisorderError {
                sync_time: 7,
                punctuation: 10
            }))
        ));
        assert!(matches!(
            ingress.push(StreamEvent::start(20, 'c').unwrap()),
            Err(Error::Ingress(IngressError::Terminated(_)))
        ));
    }

    #[test]
    fn test_adjust_snaps_late_events_to_punctuation() {
        let config = IngressConfig::default().with_disorder(DisorderPolicy::Adjust);
        let (mut ingress, sink) = setup(config);
        ingress.push(StreamEvent::punctuation(10)).unwrap();
        ingress.push(StreamEvent::start(4, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::interval(2, 8, 'b').unwrap()).unwrap();
        ingress.push(StreamEvent::interval(3, 12, 'c').unwrap()).unwrap();
        ingress.push(StreamEvent::end(6, 4, 'a').unwrap()).unwrap();
        ingress.complete().unwrap();

        assert_eq!(
            sink.rendered(),
            vec![
                "Punctuation(10)",
                "Start(10, 'a')",
                "Interval(10, 12, 'c')",
                "End(11, 10, 'a')",
                "Punctuation(9223372036854775807)",
            ]
        );
        let stats = ingress.stats();
        assert_eq!(stats.adjusted, 3);
        assert_eq!(stats.dropped, 1);
        assert!(*sink.completed.lock());
    }

    #[test]
    fn test_drop_discards_late_start_and_its_end() {
        let config = IngressConfig::default().with_disorder(DisorderPolicy::Drop);
        let (mut ingress, sink) = setup(config);
        ingress.push(StreamEvent::punctuation(10)).unwrap();
        ingress.push(StreamEvent::start(4, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::end(12, 4, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::start(11, 'b').unwrap()).unwrap();
        ingress.complete().unwrap();

        assert_eq!(
            sink.rendered(),
            vec![
                "Punctuation(10)",
                "Start(11, 'b')",
                "Punctuation(9223372036854775807)"
            ]
        );
        assert_eq!(ingress.stats().dropped, 1);
        assert_eq!(ingress.open_edges(), 1);
    }

    #[test]
    fn test_reorder_buffer_releases_in_time_order() {
        let (mut ingress, sink) = setup(IngressConfig::default());
        ingress.push(StreamEvent::start(3, 'c').unwrap()).unwrap();
        ingress.push(StreamEvent::start(1, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::start(2, 'b').unwrap()).unwrap();
        ingress.push(StreamEvent::start(9, 'z').unwrap()).unwrap();
        assert_eq!(ingress.buffered(), 4);
        assert!(sink.events.lock().is_empty());

        ingress.push(StreamEvent::punctuation(5)).unwrap();
        assert_eq!(
            sink.rendered(),
            vec!["Start(1, 'a')", "Start(2, 'b')", "Start(3, 'c')", "Punctuation(5)"]
        );
        assert_eq!(ingress.buffered(), 1);
    }

    #[test]
    fn test_time_punctuation_precedes_triggering_event() {
        let config = IngressConfig::default()
            .with_punctuation(PunctuationPolicy::Time { period: 10 })
            .with_on_completed(OnCompletedPolicy::None);
        let (mut ingress, sink) = setup(config);
        for (t, p) in [(3, 'a'), (7, 'b'), (12, 'c'), (25, 'd')] {
            ingress.push(StreamEvent::start(t, p).unwrap()).unwrap();
        }
        ingress.complete().unwrap();

        assert_eq!(
            sink.rendered(),
            vec![
                "Punctuation(0)",
                "Start(3, 'a')",
                "Start(7, 'b')",
                "Punctuation(10)",
                "Start(12, 'c')",
                "Punctuation(20)",
                "Start(25, 'd')",
            ]
        );
        assert_eq!(ingress.stats().punctuations_generated, 3);
    }

    #[test]
    fn test_count_punctuation_after_every_n_events() {
        let config = IngressConfig::default()
            .with_punctuation(PunctuationPolicy::Count { events: 2 })
            .with_on_completed(OnCompletedPolicy::None);
        let (mut ingress, sink) = setup(config);
        for (t, p) in [(1, 'a'), (4, 'b'), (4, 'c'), (6, 'd'), (8, 'e')] {
            ingress.push(StreamEvent::start(t, p).unwrap()).unwrap();
        }
        ingress.complete().unwrap();

        assert_eq!(
            sink.rendered(),
            vec![
                "Start(1, 'a')",
                "Start(4, 'b')",
                "Punctuation(4)",
                "Start(4, 'c')",
                "Start(6, 'd')",
                "Punctuation(6)",
                "Start(8, 'e')",
            ]
        );
    }

    #[test]
    fn test_unmatched_end_strict_and_repair() {
        let (mut strict, _sink) = setup(IngressConfig::default());
        strict.push(StreamEvent::end(5, 1, 'x').unwrap()).unwrap();
        assert_eq!(strict.pending_ends(), 1);
        assert!(matches!(
            strict.push(StreamEvent::punctuation(5)),
            Err(Error::Ingress(IngressError::InvalidEvent(
                InvalidEventError::UnmatchedEnd {
                    sync_time: 5,
                    other_time: 1
                }
            )))
        ));
        assert!(matches!(
            strict.push(StreamEvent::start(6, 'y').unwrap()),
            Err(Error::Ingress(IngressError::Terminated(_)))
        ));

        let config = IngressConfig::default().with_edge_matching(EdgeMatching::Repair);
        let (mut repair, sink) = setup(config);
        repair.push(StreamEvent::start(1, 'y').unwrap()).unwrap();
        repair.push(StreamEvent::end(5, 1, 'x').unwrap()).unwrap();
        repair.push(StreamEvent::end(6, 1, 'y').unwrap()).unwrap();
        repair.complete().unwrap();
        assert_eq!(
            sink.rendered(),
            vec![
                "Start(1, 'y')",
                "End(6, 1, 'y')",
                "Punctuation(9223372036854775807)"
            ]
        );
        assert_eq!(repair.stats().repaired, 1);
    }

    #[test]
    fn test_end_before_start_in_same_window_is_reordered() {
        for matching in [EdgeMatching::Strict, EdgeMatching::Repair] {
            let config = IngressConfig::default().with_edge_matching(matching);
            let (mut ingress, sink) = setup(config);
            ingress.push(StreamEvent::punctuation(1)).unwrap();
            ingress.push(StreamEvent::end(7, 5, 'a').unwrap()).unwrap();
            ingress.push(StreamEvent::start(5, 'a').unwrap()).unwrap();
            assert_eq!(ingress.pending_ends(), 0);
            assert_eq!(ingress.open_edges(), 0);
            ingress.complete().unwrap();

            assert_eq!(
                sink.rendered(),
                vec![
                    "Punctuation(1)",
                    "Start(5, 'a')",
                    "End(7, 5, 'a')",
                    "Punctuation(9223372036854775807)"
                ]
            );
            assert_eq!(ingress.stats().repaired, 0);
            assert_eq!(ingress.stats().accepted, 2);
        }
    }

    #[test]
    fn test_waiting_end_repaired_when_punctuation_passes_it() {
        let config = IngressConfig::default().with_edge_matching(EdgeMatching::Repair);
        let (mut ingress, sink) = setup(config);
        ingress.push(StreamEvent::end(7, 5, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::punctuation(6)).unwrap();
        assert_eq!(ingress.pending_ends(), 1);
        ingress.push(StreamEvent::punctuation(7)).unwrap();
        assert_eq!(ingress.pending_ends(), 0);
        assert_eq!(ingress.stats().repaired, 1);
        assert_eq!(sink.rendered(), vec!["Punctuation(6)", "Punctuation(7)"]);
    }

    #[test]
    fn test_drop_discards_waiting_end_of_late_start() {
        let config = IngressConfig::default().with_disorder(DisorderPolicy::Drop);
        let (mut ingress, sink) = setup(config);
        ingress.push(StreamEvent::punctuation(2)).unwrap();
        ingress.push(StreamEvent::end(9, 1, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::start(1, 'a').unwrap()).unwrap();
        ingress.complete().unwrap();

        assert_eq!(
            sink.rendered(),
            vec!["Punctuation(2)", "Punctuation(9223372036854775807)"]
        );
        assert_eq!(ingress.pending_ends(), 0);
        assert_eq!(ingress.stats().dropped, 1);
    }

    #[test]
    fn test_when_full_flushes_only_full_batches() {
        let config = IngressConfig::default()
            .with_flush(FlushPolicy::WhenFull)
            .with_on_completed(OnCompletedPolicy::None);
        let (mut ingress, sink) = setup_with_capacity(config, 2);
        ingress.push(StreamEvent::start(1, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::punctuation(1)).unwrap();
        assert_eq!(*sink.batches.lock(), 1);
        ingress.push(StreamEvent::punctuation(2)).unwrap();
        assert_eq!(*sink.batches.lock(), 1);
        ingress.flush().unwrap();
        assert_eq!(*sink.batches.lock(), 2);
        assert_eq!(sink.events.lock().len(), 3);
    }

    #[test]
    fn test_input_after_completion_rejected() {
        let (mut ingress, _sink) = setup(IngressConfig::default());
        ingress.complete().unwrap();
        ingress.complete().unwrap();
        assert!(matches!(
            ingress.push(StreamEvent::punctuation(1)),
            Err(Error::Ingress(IngressError::Completed(_)))
        ));
    }

    #[test]
    fn test_checkpoint_keeps_buffer_and_open_edges() {
        let (mut ingress, _sink) = setup(IngressConfig::default());
        ingress.push(StreamEvent::start(1, 'a').unwrap()).unwrap();
        ingress.push(StreamEvent::punctuation(2)).unwrap();
        ingress.push(StreamEvent::start(3, 'b').unwrap()).unwrap();
        ingress.push(StreamEvent::end(8, 5, 'c').unwrap()).unwrap();
        let guarded = Mutex::new(ingress);
        let state = guarded.checkpoint().unwrap();

        let (fresh, sink) = setup(IngressConfig::default());
        let restored = Mutex::new(fresh);
        restored.restore(state).unwrap();
        let mut restored = restored.into_inner();
        assert_eq!(restored.watermark(), Some(2));
        assert_eq!(restored.buffered(), 1);

        assert_eq!(restored.pending_ends(), 1);

        restored.push(StreamEvent::end(4, 1, 'a').unwrap()).unwrap();
        restored.push(StreamEvent::start(5, 'c').unwrap()).unwrap();
        restored.complete().unwrap();
        assert_eq!(
            sink.rendered(),
            vec![
                "Start(3, 'b')",
                "End(4, 1, 'a')",
                "Start(5, 'c')",
                "End(8, 5, 'c')",
                "Punctuation(9223372036854775807)"
            ]
        );
    }
}
