//! # Punctuation-Bounded Sort Operator
//!
//! Buffers the events between two punctuations and, when the later
//! punctuation arrives, emits them ordered by a key.
//!
//! ## How It Works
//!
//! 1. Data events are buffered as they arrive
//! 2. An `End` whose `Start` is still in the buffer is folded into it,
//!    turning the pair into one `Interval`; the stale `Start` is never emitted
//! 3. On punctuation, the buffer is sorted by key (stable, so equal keys keep
//!    arrival order) and emitted, followed by the punctuation
//!
//! Within a window the output is ordered by key rather than by `sync_time`.
//! Every emitted event still lies between the two punctuations that
//! delimited its window.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{
    decode_state, encode_state, Operator, OperatorError, OperatorState, OutputBuffer,
};
use crate::event::{EventBatch, EventKind, Payload, StreamEvent, MIN_SYNC_TIME};

#[derive(Serialize, Deserialize)]
struct SortSnapshot<P> {
    buffer: Vec<StreamEvent<P>>,
    last_punctuation: i64,
    coalesced: u64,
}

/// Punctuation-bounded sort operator.
pub struct Sort<P, K> {
    key_fn: Box<dyn Fn(&P) -> K + Send + Sync>,
    /// Events of the open window, in arrival order.
    buffer: Vec<StreamEvent<P>>,
    /// Last punctuation that triggered emission.
    last_punctuation: i64,
    /// Start/End pairs folded into intervals.
    coalesced: u64,
}

impl<P, K> Sort<P, K> {
    /// Creates a sort operator over the key returned by `key_fn`.
    pub fn new<F>(key_fn: F) -> Self
    where
        F: Fn(&P) -> K + Send + Sync + 'static,
    {
        Self {
            key_fn: Box::new(key_fn),
            buffer: Vec::new(),
            last_punctuation: MIN_SYNC_TIME,
            coalesced: 0,
        }
    }

    /// Returns the current buffer size.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the buffer is empty.
    #[must_use]
    pub fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the last punctuation that triggered emission.
    #[must_use]
    pub fn last_punctuation(&self) -> i64 {
        self.last_punctuation
    }
}

impl<P: Payload, K: Ord> Sort<P, K> {
    fn buffer_event(&mut self, event: &StreamEvent<P>) {
        if event.is_end() {
            let start = event.other_time();
            let open = self.buffer.iter().rposition(|buffered| {
                buffered.is_start()
                    && buffered.sync_time() == start
                    && buffered.payload() == event.payload()
            });
            if let Some(idx) = open {
                let pending = self.buffer.remove(idx);
                self.buffer
                    .push(pending.retimed(EventKind::Interval, start, event.sync_time()));
                self.coalesced += 1;
                return;
            }
        }
        self.buffer.push(event.clone());
    }

    /// Sorts and emits the window.
    fn flush(&mut self, output: &mut OutputBuffer<P>) {
        if self.buffer.is_empty() {
            return;
        }
        let key_fn = &self.key_fn;
        let mut keyed: Vec<(Option<K>, StreamEvent<P>)> = self
            .buffer
            .drain(..)
            .map(|event| (event.payload().map(key_fn), event))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, event) in keyed {
            output.push(event);
        }
    }
}

impl<P, K> fmt::Debug for Sort<P, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sort")
            .field("buffered", &self.buffer.len())
            .field("last_punctuation", &self.last_punctuation)
            .finish_non_exhaustive()
    }
}

impl<P, K> Operator<P, P> for Sort<P, K>
where
    P: Payload,
    K: Ord + Send + 'static,
{
    fn name(&self) -> &'static str {
        "sort"
    }

    fn process(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<P>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            if event.is_punctuation() {
                self.flush(output);
                self.last_punctuation = event.sync_time();
                output.push(event.clone());
            } else {
                self.buffer_event(event);
            }
        }
        Ok(())
    }

    fn on_completed(&mut self, output: &mut OutputBuffer<P>) -> Result<(), OperatorError> {
        self.flush(output);
        Ok(())
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        encode_state(
            self.name(),
            &SortSnapshot {
                buffer: self.buffer.clone(),
                last_punctuation: self.last_punctuation,
                coalesced: self.coalesced,
            },
        )
    }

    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError> {
        let snapshot: SortSnapshot<P> = decode_state(self.name(), &state)?;
        for event in &snapshot.buffer {
            event.validate()?;
        }
        self.buffer = snapshot.buffer;
        self.last_punctuation = snapshot.last_punctuation;
        self.coalesced = snapshot.coalesced;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    #[test]
    fn test_window_emitted_in_key_order() {
        let mut op = Sort::new(|p: &i64| -p);
        let mut out = output();
        op.process(
            &batch(vec![
                StreamEvent::start(1, 3).unwrap(),
                StreamEvent::start(2, 9).unwrap(),
                StreamEvent::start(2, 5).unwrap(),
            ]),
            &mut out,
        )
        .unwrap();
        assert!(out.is_empty());
        assert_eq!(op.buffer_size(), 3);

        op.process(&batch(vec![StreamEvent::punctuation(3)]), &mut out)
            .unwrap();
        assert_eq!(
            render(&out.drain_events()),
            vec!["Start(2, 9)", "Start(2, 5)", "Start(1, 3)", "Punctuation(3)"]
        );
        assert_eq!(op.last_punctuation(), 3);
    }

    #[test]
    fn test_start_end_in_window_folds_into_interval() {
        let mut op = Sort::new(|p: &char| *p);
        let mut out = output();
        op.process(
            &batch(vec![
                StreamEvent::start(1, 'b').unwrap(),
                StreamEvent::start(1, 'a').unwrap(),
                StreamEvent::end(4, 1, 'b').unwrap(),
                StreamEvent::end(5, 0, 'z').unwrap(),
                StreamEvent::punctuation(6),
            ]),
            &mut out,
        )
        .unwrap();
        assert_eq!(
            render(&out.drain_events()),
            vec![
                "Start(1, 'a')",
                "Interval(1, 4, 'b')",
                "End(5, 0, 'z')",
                "Punctuation(6)"
            ]
        );
    }

    #[test]
    fn test_completion_flushes_partial_window() {
        let mut op = Sort::new(|p: &u8| *p);
        let mut out = output();
        op.process(&batch(vec![StreamEvent::start(7, 2_u8).unwrap()]), &mut out)
            .unwrap();
        let state = op.checkpoint().unwrap();

        let mut restored = Sort::new(|p: &u8| *p);
        restored.restore(state).unwrap();
        restored.on_completed(&mut out).unwrap();
        assert_eq!(render(&out.drain_events()), vec!["Start(7, 2)"]);
    }
}
