//! Time-ordered merge of two inputs.
//!
//! Both inputs are individually ordered by `sync_time` but arrive in
//! independent batches. [`TwoInputMerge`] queues each side and releases an
//! event only once the other side can no longer produce anything that should
//! come before it:
//!
//! - a left event at `t` is released when the right frontier is `>= t`
//! - a right event at `t` is released when the left frontier is `> t`
//!
//! so at equal `sync_time` every left event precedes every right event.
//! A side's frontier is the larger of its last data time and its last
//! punctuation, or infinity once the side has completed.
//!
//! The merged punctuation is the minimum of the two inputs' punctuations.
//! When both inputs have completed it is the largest real punctuation seen;
//! the merge never synthesizes a punctuation at infinity.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::event::{StreamEvent, INFINITY, MIN_SYNC_TIME};

/// One step of merged output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Merged<L, R> {
    Left(StreamEvent<L>),
    Right(StreamEvent<R>),
    Punctuation(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InputSide<P> {
    queue: VecDeque<StreamEvent<P>>,
    last_sync: i64,
    punctuation: i64,
    completed: bool,
}

impl<P: Clone> InputSide<P> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            last_sync: MIN_SYNC_TIME,
            punctuation: MIN_SYNC_TIME,
            completed: false,
        }
    }

    fn push(&mut self, event: &StreamEvent<P>) {
        if event.is_punctuation() {
            self.punctuation = self.punctuation.max(event.sync_time());
        } else {
            self.last_sync = self.last_sync.max(event.sync_time());
            self.queue.push_back(event.clone());
        }
    }

    fn frontier(&self) -> i64 {
        if self.completed {
            INFINITY
        } else {
            self.last_sync.max(self.punctuation)
        }
    }

    fn effective_punctuation(&self) -> i64 {
        if self.completed {
            INFINITY
        } else {
            self.punctuation
        }
    }

    fn front_time(&self) -> Option<i64> {
        self.queue.front().map(StreamEvent::sync_time)
    }
}

/// Merge state for a two-input operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "L: Serialize, R: Serialize",
    deserialize = "L: serde::de::DeserializeOwned, R: serde::de::DeserializeOwned"
))]
pub(crate) struct TwoInputMerge<L, R> {
    left: InputSide<L>,
    right: InputSide<R>,
    emitted_punctuation: i64,
}

impl<L: Clone, R: Clone> TwoInputMerge<L, R> {
    pub(crate) fn new() -> Self {
        Self {
            left: InputSide::new(),
            right: InputSide::new(),
            emitted_punctuation: MIN_SYNC_TIME,
        }
    }

    pub(crate) fn push_left(&mut self, event: &StreamEvent<L>) {
        self.left.push(event);
    }

    pub(crate) fn push_right(&mut self, event: &StreamEvent<R>) {
        self.right.push(event);
    }

    pub(crate) fn complete_left(&mut self) {
        self.left.completed = true;
    }

    pub(crate) fn complete_right(&mut self) {
        self.right.completed = true;
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.left.completed && self.right.completed
    }

    /// Releases every event that can be ordered now, then the merged
    /// punctuation if it advanced.
    pub(crate) fn drain(&mut self) -> Vec<Merged<L, R>> {
        let mut out = Vec::new();
        loop {
            let take_left = match (self.left.front_time(), self.right.front_time()) {
                (Some(l), Some(r)) => l <= r,
                (Some(l), None) => l <= self.right.frontier(),
                (None, Some(r)) => {
                    if r < self.left.frontier() {
                        false
                    } else {
                        break;
                    }
                }
                (None, None) => break,
            };
            let next = if take_left {
                self.left.queue.pop_front().map(Merged::Left)
            } else {
                self.right.queue.pop_front().map(Merged::Right)
            };
            match next {
                Some(merged) => out.push(merged),
                None => break,
            }
        }

        let punctuation = if self.is_completed() {
            self.left.punctuation.max(self.right.punctuation)
        } else {
            self.left
                .effective_punctuation()
                .min(self.right.effective_punctuation())
        };
        if punctuation > self.emitted_punctuation {
            self.emitted_punctuation = punctuation;
            out.push(Merged::Punctuation(punctuation));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times<L, R>(merged: &[Merged<L, R>]) -> Vec<String> {
        merged
            .iter()
            .map(|m| match m {
                Merged::Left(e) => format!("L{}", e.sync_time()),
                Merged::Right(e) => format!("R{}", e.sync_time()),
                Merged::Punctuation(t) => format!("P{t}"),
            })
            .collect()
    }

    #[test]
    fn test_left_wins_ties() {
        let mut merge = TwoInputMerge::<u8, u8>::new();
        merge.push_right(&StreamEvent::start(2, 0).unwrap());
        merge.push_left(&StreamEvent::start(2, 0).unwrap());
        merge.push_left(&StreamEvent::start(3, 0).unwrap());
        assert_eq!(times(&merge.drain()), vec!["L2", "R2"]);
    }

    #[test]
    fn test_waits_for_other_side() {
        let mut merge = TwoInputMerge::<u8, u8>::new();
        merge.push_left(&StreamEvent::start(5, 0).unwrap());
        assert!(merge.drain().is_empty());

        merge.push_right(&StreamEvent::punctuation(5));
        assert_eq!(times(&merge.drain()), vec!["L5"]);

        merge.push_left(&StreamEvent::punctuation(7));
        assert_eq!(times(&merge.drain()), vec!["P5"]);
    }

    #[test]
    fn test_right_released_only_below_left_frontier() {
        let mut merge = TwoInputMerge::<u8, u8>::new();
        merge.push_right(&StreamEvent::start(4, 0).unwrap());
        merge.push_left(&StreamEvent::punctuation(4));
        assert!(times(&merge.drain()).is_empty());

        merge.push_left(&StreamEvent::punctuation(5));
        assert_eq!(times(&merge.drain()), vec!["R4"]);
    }

    #[test]
    fn test_completion_flushes_without_infinite_punctuation() {
        let mut merge = TwoInputMerge::<u8, u8>::new();
        merge.push_left(&StreamEvent::start(1, 0).unwrap());
        merge.push_left(&StreamEvent::punctuation(3));
        merge.push_right(&StreamEvent::start(2, 0).unwrap());
        merge.complete_left();
        merge.complete_right();
        assert_eq!(times(&merge.drain()), vec!["L1", "R2", "P3"]);
        assert!(merge.drain().is_empty());
    }
}
