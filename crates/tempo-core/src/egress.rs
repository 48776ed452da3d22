//! # Egress
//!
//! The end of a pipeline: hands the output to the consumer, optionally
//! reshaping it first.
//!
//! With [`ReshapingPolicy::CoalesceEndEdges`] every Start is held until its
//! End arrives and the pair is delivered as one `Interval`. Output stays in
//! `sync_time` order, so everything behind an open Start waits with it.
//! Starts still open at completion are delivered as Starts.
//!
//! An egress either collects its output for the [`EgressHandle`] to read or
//! forwards it to a consumer observer. Either way the handle tracks the
//! output punctuation, which feeds the container's low watermark.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointTarget;
use crate::event::{EventBatch, EventKind, Payload, SharedBatch, StreamEvent};
use crate::operator::{decode_state, encode_state, OperatorError, OperatorState};
use crate::pipeline::{BoxedObserver, Observer};
use crate::watermark::{PunctuationTracker, WatermarkSlot};

/// Egress-time transformation between edge and interval representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReshapingPolicy {
    /// Deliver events as produced.
    #[default]
    None,
    /// Deliver each matched Start/End pair as a single Interval.
    CoalesceEndEdges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Held<P> {
    event: StreamEvent<P>,
    /// A Start still waiting for its End.
    open: bool,
}

enum Sink<P> {
    Collect(Vec<StreamEvent<P>>),
    Forward(BoxedObserver<P>),
}

struct EgressCore<P> {
    policy: ReshapingPolicy,
    held: VecDeque<Held<P>>,
    tracker: PunctuationTracker,
    watermark: Option<WatermarkSlot>,
    sink: Sink<P>,
    delivered: u64,
    completed: bool,
}

impl<P: Payload> EgressCore<P> {
    fn reshape(&mut self, event: &StreamEvent<P>) {
        match event.kind() {
            EventKind::Start => self.held.push_back(Held {
                event: event.clone(),
                open: true,
            }),
            EventKind::End => {
                let start = event.other_time();
                let matched = self.held.iter_mut().find(|held| {
                    held.open
                        && held.event.sync_time() == start
                        && held.event.payload() == event.payload()
                });
                if let Some(held) = matched {
                    let pending = held.event.clone();
                    held.event = pending.retimed(EventKind::Interval, start, event.sync_time());
                    held.open = false;
                } else {
                    self.held.push_back(Held {
                        event: event.clone(),
                        open: false,
                    });
                }
            }
            EventKind::Interval | EventKind::Punctuation => self.held.push_back(Held {
                event: event.clone(),
                open: false,
            }),
        }
    }

    fn releasable(&mut self, all: bool) -> Vec<StreamEvent<P>> {
        let mut ready = Vec::new();
        while let Some(front) = self.held.front() {
            if front.open && !all {
                break;
            }
            if let Some(held) = self.held.pop_front() {
                ready.push(held.event);
            }
        }
        ready
    }

    fn deliver(&mut self, events: Vec<StreamEvent<P>>) -> crate::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        for event in events.iter().filter(|e| e.is_punctuation()) {
            if self.tracker.observe(event.sync_time()) {
                if let Some(slot) = &self.watermark {
                    slot.advance(event.sync_time());
                }
            }
        }
        self.delivered += events.len() as u64;
        match &mut self.sink {
            Sink::Collect(collected) => {
                collected.extend(events);
                Ok(())
            }
            Sink::Forward(observer) => observer.on_batch(Arc::new(EventBatch::from_events(events))),
        }
    }

    fn on_batch(&mut self, batch: &EventBatch<P>) -> crate::Result<()> {
        let ready = match self.policy {
            ReshapingPolicy::None => batch.iter().cloned().collect(),
            ReshapingPolicy::CoalesceEndEdges => {
                for event in batch {
                    self.reshape(event);
                }
                self.releasable(false)
            }
        };
        self.deliver(ready)
    }

    fn on_completed(&mut self) -> crate::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        let rest = self.releasable(true);
        self.deliver(rest)?;
        match &mut self.sink {
            Sink::Collect(_) => Ok(()),
            Sink::Forward(observer) => observer.on_completed(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EgressSnapshot<P> {
    held: Vec<Held<P>>,
    punctuation: i64,
    delivered: u64,
}

impl<P: Payload> CheckpointTarget for Mutex<EgressCore<P>> {
    fn operator_name(&self) -> &'static str {
        "egress"
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        let core = self.lock();
        encode_state(
            "egress",
            &EgressSnapshot {
                held: core.held.iter().cloned().collect(),
                punctuation: core.tracker.current(),
                delivered: core.delivered,
            },
        )
    }

    fn restore(&self, state: OperatorState) -> Result<(), OperatorError> {
        let snapshot: EgressSnapshot<P> = decode_state("egress", &state)?;
        for held in &snapshot.held {
            held.event.validate()?;
        }
        let mut core = self.lock();
        core.held = snapshot.held.into();
        core.tracker = PunctuationTracker::new();
        core.tracker.observe(snapshot.punctuation);
        core.delivered = snapshot.delivered;
        Ok(())
    }
}

/// Terminal observer of a pipeline.
pub struct Egress<P> {
    core: Arc<Mutex<EgressCore<P>>>,
}

impl<P: Payload> Egress<P> {
    fn with_sink(policy: ReshapingPolicy, sink: Sink<P>) -> (Self, EgressHandle<P>) {
        let core = Arc::new(Mutex::new(EgressCore {
            policy,
            held: VecDeque::new(),
            tracker: PunctuationTracker::new(),
            watermark: None,
            sink,
            delivered: 0,
            completed: false,
        }));
        let handle = EgressHandle {
            core: Arc::clone(&core),
        };
        (Self { core }, handle)
    }

    /// An egress that collects its output for the handle to read.
    #[must_use]
    pub fn collect(policy: ReshapingPolicy) -> (Self, EgressHandle<P>) {
        Self::with_sink(policy, Sink::Collect(Vec::new()))
    }

    /// An egress that forwards its output to `observer`.
    #[must_use]
    pub fn forward(policy: ReshapingPolicy, observer: BoxedObserver<P>) -> (Self, EgressHandle<P>) {
        Self::with_sink(policy, Sink::Forward(observer))
    }

    /// Publishes the output punctuation into `slot`.
    #[must_use]
    pub fn with_watermark(self, slot: WatermarkSlot) -> Self {
        self.core.lock().watermark = Some(slot);
        self
    }
}

impl<P: Payload> Observer<P> for Egress<P> {
    fn on_batch(&mut self, batch: SharedBatch<P>) -> crate::Result<()> {
        self.core.lock().on_batch(&batch)
    }

    fn on_completed(&mut self) -> crate::Result<()> {
        self.core.lock().on_completed()
    }
}

/// Consumer-side view of an [`Egress`].
pub struct EgressHandle<P> {
    core: Arc<Mutex<EgressCore<P>>>,
}

impl<P> Clone for EgressHandle<P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<P: Payload> EgressHandle<P> {
    /// Collected events so far, punctuations included.
    ///
    /// Always empty for a forwarding egress.
    #[must_use]
    pub fn events(&self) -> Vec<StreamEvent<P>> {
        match &self.core.lock().sink {
            Sink::Collect(events) => events.clone(),
            Sink::Forward(_) => Vec::new(),
        }
    }

    /// Collected data events so far.
    #[must_use]
    pub fn data_events(&self) -> Vec<StreamEvent<P>> {
        self.events().into_iter().filter(StreamEvent::is_data).collect()
    }

    /// Takes the collected events, leaving the buffer empty.
    pub fn take_events(&self) -> Vec<StreamEvent<P>> {
        match &mut self.core.lock().sink {
            Sink::Collect(events) => mem::take(events),
            Sink::Forward(_) => Vec::new(),
        }
    }

    /// Events delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.core.lock().delivered
    }

    /// Starts held back waiting for their End.
    #[must_use]
    pub fn held(&self) -> usize {
        self.core.lock().held.len()
    }

    /// Last output punctuation.
    #[must_use]
    pub fn watermark(&self) -> Option<i64> {
        let core = self.core.lock();
        core.tracker.is_set().then_some(core.tracker.current())
    }

    /// Returns `true` once the pipeline completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.core.lock().completed
    }

    /// Checkpoint handle for the held events.
    #[must_use]
    pub fn checkpoint_target(&self) -> Arc<dyn CheckpointTarget> {
        Arc::clone(&self.core) as Arc<dyn CheckpointTarget>
    }
}

impl<P> fmt::Debug for EgressHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("EgressHandle")
            .field("policy", &core.policy)
            .field("delivered", &core.delivered)
            .field("completed", &core.completed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_util::Collector;

    fn push<P: Payload>(egress: &mut Egress<P>, events: Vec<StreamEvent<P>>) {
        egress
            .on_batch(Arc::new(EventBatch::from_events(events)))
            .unwrap();
    }

    fn rendered<P: Payload>(events: &[StreamEvent<P>]) -> Vec<String> {
        events.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_no_reshaping_passes_edges_through() {
        let (mut egress, handle) = Egress::collect(ReshapingPolicy::None);
        push(
            &mut egress,
            vec![
                StreamEvent::start(1, 'a').unwrap(),
                StreamEvent::end(2, 1, 'a').unwrap(),
                StreamEvent::punctuation(3),
            ],
        );
        assert_eq!(handle.events().len(), 3);
        assert_eq!(handle.data_events().len(), 2);
        assert_eq!(handle.watermark(), Some(3));
    }

    #[test]
    fn test_coalesce_holds_start_until_end() {
        let (mut egress, handle) = Egress::collect(ReshapingPolicy::CoalesceEndEdges);
        push(
            &mut egress,
            vec![
                StreamEvent::start(1, 'a').unwrap(),
                StreamEvent::interval(2, 4, 'b').unwrap(),
                StreamEvent::punctuation(3),
            ],
        );
        assert!(handle.events().is_empty());
        assert_eq!(handle.held(), 3);

        push(&mut egress, vec![StreamEvent::end(5, 1, 'a').unwrap()]);
        assert_eq!(
            rendered(&handle.take_events()),
            vec!["Interval(1, 5, 'a')", "Interval(2, 4, 'b')", "Punctuation(3)"]
        );
        assert_eq!(handle.held(), 0);
    }

    #[test]
    fn test_open_starts_released_on_completion() {
        let (mut egress, handle) = Egress::collect(ReshapingPolicy::CoalesceEndEdges);
        push(&mut egress, vec![StreamEvent::start(1, 9_u8).unwrap()]);
        egress.on_completed().unwrap();
        assert_eq!(rendered(&handle.events()), vec!["Start(1, 9)"]);
        assert!(handle.is_completed());
    }

    #[test]
    fn test_forwarding_egress_publishes_watermark() {
        let sink = Collector::<i64>::default();
        let slot = WatermarkSlot::new();
        let (egress, handle) = Egress::forward(ReshapingPolicy::None, Box::new(sink.clone()));
        let mut egress = egress.with_watermark(slot.clone());
        push(
            &mut egress,
            vec![StreamEvent::start(1, 5).unwrap(), StreamEvent::punctuation(4)],
        );
        egress.on_completed().unwrap();

        assert_eq!(sink.events.lock().len(), 2);
        assert!(*sink.completed.lock());
        assert!(handle.events().is_empty());
        assert_eq!(slot.get(), Some(4));
        assert_eq!(handle.delivered(), 2);
    }

    #[test]
    fn test_checkpoint_keeps_held_starts() {
        let (mut egress, handle) = Egress::collect(ReshapingPolicy::CoalesceEndEdges);
        push(&mut egress, vec![StreamEvent::start(1, 'a').unwrap()]);
        let state = handle.checkpoint_target().checkpoint().unwrap();

        let (mut fresh, fresh_handle) = Egress::<char>::collect(ReshapingPolicy::CoalesceEndEdges);
        fresh_handle.checkpoint_target().restore(state).unwrap();
        push(&mut fresh, vec![StreamEvent::end(2, 1, 'a').unwrap()]);
        assert_eq!(rendered(&fresh_handle.events()), vec!["Interval(1, 2, 'a')"]);
    }
}
