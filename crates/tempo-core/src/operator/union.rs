//! Union of two streams with a deterministic left-first tie-break.

use super::merge::{Merged, TwoInputMerge};
use super::{
    decode_state, encode_state, BinaryOperator, OperatorError, OperatorState, OutputBuffer,
};
use crate::event::{EventBatch, Payload, StreamEvent};

/// Merges two streams of the same payload into one time-ordered stream.
///
/// At equal `sync_time`, every event of the left input precedes every event
/// of the right input. The output punctuation is the minimum of the input
/// punctuations.
#[derive(Debug)]
pub struct Union<P> {
    merge: TwoInputMerge<P, P>,
}

impl<P: Clone> Union<P> {
    /// Creates a union operator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            merge: TwoInputMerge::new(),
        }
    }
}

impl<P: Clone> Default for Union<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> Union<P> {
    fn emit(&mut self, output: &mut OutputBuffer<P>) {
        for merged in self.merge.drain() {
            match merged {
                Merged::Left(event) | Merged::Right(event) => output.push(event),
                Merged::Punctuation(t) => output.push(StreamEvent::punctuation(t)),
            }
        }
    }
}

impl<P: Payload> BinaryOperator<P, P, P> for Union<P> {
    fn name(&self) -> &'static str {
        "union"
    }

    fn process_left(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<P>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            self.merge.push_left(event);
        }
        self.emit(output);
        Ok(())
    }

    fn process_right(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<P>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            self.merge.push_right(event);
        }
        self.emit(output);
        Ok(())
    }

    fn on_left_completed(&mut self, output: &mut OutputBuffer<P>) -> Result<(), OperatorError> {
        self.merge.complete_left();
        self.emit(output);
        Ok(())
    }

    fn on_right_completed(&mut self, output: &mut OutputBuffer<P>) -> Result<(), OperatorError> {
        self.merge.complete_right();
        self.emit(output);
        Ok(())
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        encode_state(self.name(), &self.merge)
    }

    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError> {
        self.merge = decode_state(self.name(), &state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    fn starts(range: std::ops::RangeInclusive<i64>) -> EventBatch<i64> {
        batch(range.map(|t| StreamEvent::start(t, t).unwrap()).collect())
    }

    #[test]
    fn test_disjoint_inputs_concatenate() {
        let mut union = Union::<i64>::new();
        let mut out = output();
        union.process_left(&starts(1..=4), &mut out).unwrap();
        union.process_right(&starts(5..=8), &mut out).unwrap();
        union.on_left_completed(&mut out).unwrap();
        union.on_right_completed(&mut out).unwrap();

        let times: Vec<i64> = out.drain_events().iter().map(StreamEvent::sync_time).collect();
        assert_eq!(times, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_interleaved_inputs_prefer_left_on_ties() {
        let mut union = Union::<i64>::new();
        let mut out = output();
        union
            .process_right(
                &batch(vec![
                    StreamEvent::start(2, 200).unwrap(),
                    StreamEvent::start(3, 300).unwrap(),
                ]),
                &mut out,
            )
            .unwrap();
        union
            .process_left(
                &batch(vec![
                    StreamEvent::start(2, 100).unwrap(),
                    StreamEvent::punctuation(4),
                ]),
                &mut out,
            )
            .unwrap();
        assert_eq!(
            render(&out.drain_events()),
            vec!["Start(2, 100)", "Start(2, 200)", "Start(3, 300)"]
        );
    }

    #[test]
    fn test_checkpoint_keeps_queued_events() {
        let mut union = Union::<i64>::new();
        let mut out = output();
        union.process_left(&starts(5..=5), &mut out).unwrap();
        assert!(out.is_empty());
        let state = union.checkpoint().unwrap();

        let mut restored = Union::<i64>::new();
        restored.restore(state).unwrap();
        restored.on_right_completed(&mut out).unwrap();
        assert_eq!(render(&out.drain_events()), vec!["Start(5, 5)"]);
    }
}
