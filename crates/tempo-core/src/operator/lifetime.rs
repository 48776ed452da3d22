//! Lifetime-transform operators.
//!
//! - [`ClipEventDuration`] caps every lifetime at a maximum duration.
//! - [`AlterEventDuration`] replaces every lifetime with a fixed duration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    decode_state, encode_state, Operator, OperatorError, OperatorState, OutputBuffer,
};
use crate::event::{EventBatch, EventKind, Payload, StreamEvent, INFINITY};

/// Caps lifetimes at `limit` time units.
///
/// Intervals are shortened in place. A `Start` is forwarded immediately and
/// its `End` is synthesized at `start + limit` once time reaches that point;
/// a real `End` arriving earlier is forwarded instead and cancels the
/// deadline, one arriving later is dropped. Lifetimes already within the
/// limit are untouched.
#[derive(Debug)]
pub struct ClipEventDuration<P> {
    limit: i64,
    /// Open Starts keyed by the time their clipped End is due.
    deadlines: BTreeMap<i64, Vec<(i64, P)>>,
    clipped: u64,
}

#[derive(Serialize, Deserialize)]
struct ClipSnapshot<P> {
    deadlines: Vec<(i64, Vec<(i64, P)>)>,
    clipped: u64,
}

impl<P> ClipEventDuration<P> {
    /// Creates a clip operator.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if `limit` is not positive.
    pub fn new(limit: i64) -> Result<Self, OperatorError> {
        if limit <= 0 {
            return Err(OperatorError::InvalidConfig(format!(
                "clip limit must be positive, got {limit}"
            )));
        }
        Ok(Self {
            limit,
            deadlines: BTreeMap::new(),
            clipped: 0,
        })
    }

    /// Number of lifetimes shortened so far.
    #[must_use]
    pub fn clipped(&self) -> u64 {
        self.clipped
    }

    /// Number of Starts still waiting for an End or their deadline.
    #[must_use]
    pub fn open_starts(&self) -> usize {
        self.deadlines.values().map(Vec::len).sum()
    }
}

impl<P: Payload> ClipEventDuration<P> {
    /// Emits synthesized Ends for every deadline up to and including `time`
    /// (or strictly before it when `inclusive` is false).
    fn release(&mut self, time: i64, inclusive: bool, output: &mut OutputBuffer<P>) {
        while let Some(entry) = self.deadlines.first_entry() {
            let due = *entry.key();
            if due > time || (!inclusive && due == time) {
                break;
            }
            for (start, payload) in entry.remove() {
                output.push(StreamEvent::data_unchecked(EventKind::End, due, start, payload));
                self.clipped += 1;
            }
        }
    }

    fn on_data(&mut self, event: &StreamEvent<P>, output: &mut OutputBuffer<P>) {
        let Some(payload) = event.payload() else {
            return;
        };
        self.release(event.sync_time(), false, output);
        match event.kind() {
            EventKind::Interval => {
                let capped = event.sync_time().saturating_add(self.limit);
                if event.other_time() > capped {
                    self.clipped += 1;
                    output.push(event.clone().retimed(
                        EventKind::Interval,
                        event.sync_time(),
                        capped,
                    ));
                } else {
                    output.push(event.clone());
                }
            }
            EventKind::Start => {
                let due = event.sync_time().saturating_add(self.limit);
                if due < INFINITY {
                    self.deadlines
                        .entry(due)
                        .or_default()
                        .push((event.sync_time(), payload.clone()));
                }
                output.push(event.clone());
            }
            EventKind::End => {
                let due = event.other_time().saturating_add(self.limit);
                if due == INFINITY {
                    output.push(event.clone());
                    return;
                }
                let matched = self.deadlines.get_mut(&due).and_then(|open| {
                    open.iter()
                        .position(|(s, p)| *s == event.other_time() && p == payload)
                        .map(|idx| open.remove(idx))
                });
                if matched.is_some() {
                    if self.deadlines.get(&due).is_some_and(Vec::is_empty) {
                        self.deadlines.remove(&due);
                    }
                    output.push(event.clone());
                }
                // Otherwise the End was already synthesized at the deadline.
            }
            EventKind::Punctuation => {}
        }
    }
}

impl<P: Payload> Operator<P, P> for ClipEventDuration<P> {
    fn name(&self) -> &'static str {
        "clip_event_duration"
    }

    fn process(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<P>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            if event.is_punctuation() {
                self.release(event.sync_time(), true, output);
                output.push(event.clone());
            } else {
                self.on_data(event, output);
            }
        }
        Ok(())
    }

    fn on_completed(&mut self, output: &mut OutputBuffer<P>) -> Result<(), OperatorError> {
        self.release(INFINITY, true, output);
        Ok(())
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        let snapshot = ClipSnapshot {
            deadlines: self
                .deadlines
                .iter()
                .map(|(due, open)| (*due, open.clone()))
                .collect(),
            clipped: self.clipped,
        };
        encode_state(self.name(), &snapshot)
    }

    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError> {
        let snapshot: ClipSnapshot<P> = decode_state(self.name(), &state)?;
        self.deadlines = snapshot.deadlines.into_iter().collect();
        self.clipped = snapshot.clipped;
        Ok(())
    }
}

/// Gives every event a fixed lifetime of `duration` from its start.
///
/// Starts and Intervals become `Interval(s, s + duration)`; End edges are
/// dropped because the lifetime no longer depends on them.
#[derive(Debug, Clone, Copy)]
pub struct AlterEventDuration {
    duration: i64,
}

impl AlterEventDuration {
    /// Creates the operator.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if `duration` is not positive.
    pub fn new(duration: i64) -> Result<Self, OperatorError> {
        if duration <= 0 {
            return Err(OperatorError::InvalidConfig(format!(
                "event duration must be positive, got {duration}"
            )));
        }
        Ok(Self { duration })
    }

    /// The fixed lifetime.
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.duration
    }
}

impl<P: Payload> Operator<P, P> for AlterEventDuration {
    fn name(&self) -> &'static str {
        "alter_event_duration"
    }

    fn process(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<P>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            match event.kind() {
                EventKind::Start | EventKind::Interval => {
                    let start = event.sync_time();
                    output.push(event.clone().retimed(
                        EventKind::Interval,
                        start,
                        start.saturating_add(self.duration),
                    ));
                }
                EventKind::End => {}
                EventKind::Punctuation => output.push(event.clone()),
            }
        }
        Ok(())
    }
}
