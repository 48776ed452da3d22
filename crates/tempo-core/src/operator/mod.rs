//! # Operator Module
//!
//! Streaming operators over temporal event batches.
//!
//! ## Operator Types
//!
//! - **Stateless**: [`Where`], [`Select`], [`SelectMany`], [`SelectKey`],
//!   [`AlterEventDuration`]
//! - **Stateful**: [`GroupAggregate`], [`ClipEventDuration`], [`Sort`]
//! - **Binary**: [`Union`], [`WhereNotExists`]
//!
//! Every operator follows the same per-batch contract: it reads an input
//! [`EventBatch`], writes its results into an [`OutputBuffer`], and can
//! externalize its state as an [`OperatorState`] for checkpointing. Which
//! evaluation strategy a stateless operator uses is fixed when the pipeline
//! is built (see [`ExecutionMode`](crate::config::ExecutionMode)).

use std::mem;
use std::sync::Arc;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::event::{BatchPool, EventBatch, InvalidEventError, StreamEvent, MIN_SYNC_TIME};

pub mod aggregate;
pub mod group_aggregate;
pub mod lifetime;
pub(crate) mod merge;
pub mod sort;
pub mod stateless;
pub mod union;
pub mod where_not_exists;

pub use aggregate::{
    Aggregate, AverageAggregate, Composite2, Composite3, CountAggregate, MaxAggregate,
    MinAggregate, Numeric, SumAggregate,
};
pub use group_aggregate::{AggregateStats, GroupAggregate, Grouped};
pub use lifetime::{AlterEventDuration, ClipEventDuration};
pub use sort::Sort;
pub use stateless::{Keyed, Select, SelectKey, SelectMany, Where};
pub use union::Union;
pub use where_not_exists::WhereNotExists;

/// Error type returned by fallible user-supplied transforms.
pub type TransformError = Box<dyn std::error::Error + Send + Sync>;

/// Serialized operator state for checkpointing.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
pub struct OperatorState {
    /// Operator ID
    pub operator_id: String,
    /// Serialized state data
    pub data: Vec<u8>,
}

impl OperatorState {
    /// Creates a state blob for `operator_id`.
    #[must_use]
    pub fn new(operator_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            operator_id: operator_id.into(),
            data,
        }
    }
}

/// Errors that can occur in operators
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// A user-supplied transform failed. Fatal to the pipeline.
    #[error("transform in {operator} failed: {source}")]
    Transform {
        /// Operator whose transform failed.
        operator: &'static str,
        /// The error returned by the transform.
        #[source]
        source: TransformError,
    },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A checkpoint blob was produced by a different operator.
    #[error("state for '{found}' cannot restore operator '{expected}'")]
    StateMismatch {
        /// Operator being restored.
        expected: String,
        /// Operator recorded in the state blob.
        found: String,
    },

    /// Operator built with unusable parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operator produced or received a malformed event.
    #[error(transparent)]
    InvalidEvent(#[from] InvalidEventError),
}

/// Collects an operator's output into pool-backed batches.
///
/// Appending never fails: when the current batch fills up it is set aside
/// and a fresh one is checked out. Punctuations that would move the
/// watermark backwards are dropped here so every stream observes
/// non-decreasing punctuation times.
#[derive(Debug)]
pub struct OutputBuffer<O> {
    pool: Arc<BatchPool<O>>,
    current: Option<EventBatch<O>>,
    ready: Vec<EventBatch<O>>,
    last_punctuation: i64,
}

impl<O> OutputBuffer<O> {
    /// Creates an output buffer drawing batches from `pool`.
    #[must_use]
    pub fn new(pool: Arc<BatchPool<O>>) -> Self {
        Self {
            pool,
            current: None,
            ready: Vec::new(),
            last_punctuation: MIN_SYNC_TIME,
        }
    }

    /// Appends a data event or punctuation.
    pub fn push(&mut self, event: StreamEvent<O>) {
        if event.is_punctuation() {
            if event.sync_time() < self.last_punctuation {
                tracing::trace!(
                    time = event.sync_time(),
                    last = self.last_punctuation,
                    "dropping regressing punctuation"
                );
                return;
            }
            self.last_punctuation = event.sync_time();
        } else {
            debug_assert!(
                event.sync_time() >= self.last_punctuation,
                "data at {} behind punctuation {}",
                event.sync_time(),
                self.last_punctuation
            );
        }

        let mut event = event;
        loop {
            let batch = self.current.get_or_insert_with(|| self.pool.checkout());
            match batch.push(event) {
                Ok(()) => return,
                Err(full) => {
                    event = full.into_inner();
                    if let Some(done) = self.current.take() {
                        self.ready.push(done);
                    }
                }
            }
        }
    }

    /// Appends a punctuation at `time`.
    pub fn push_punctuation(&mut self, time: i64) {
        self.push(StreamEvent::punctuation(time));
    }

    /// The last punctuation written, or [`MIN_SYNC_TIME`].
    #[must_use]
    pub fn last_punctuation(&self) -> i64 {
        self.last_punctuation
    }

    /// Returns true if nothing is waiting to be taken.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.current.as_ref().map_or(true, EventBatch::is_empty)
    }

    /// Takes every pending batch, including a partially filled one.
    pub fn take_batches(&mut self) -> Vec<EventBatch<O>> {
        let mut batches = mem::take(&mut self.ready);
        if let Some(current) = self.current.take() {
            if current.is_empty() {
                self.pool.recycle(current);
            } else {
                batches.push(current);
            }
        }
        batches
    }

    /// Takes every pending event, flattened (useful in tests and sinks).
    pub fn drain_events(&mut self) -> Vec<StreamEvent<O>> {
        let mut events = Vec::new();
        for batch in self.take_batches() {
            events.extend(batch);
        }
        events
    }

    /// The pool backing this buffer.
    #[must_use]
    pub fn pool(&self) -> &Arc<BatchPool<O>> {
        &self.pool
    }

    /// Restores the punctuation high-water mark after a checkpoint restore.
    pub(crate) fn set_last_punctuation(&mut self, time: i64) {
        self.last_punctuation = time;
    }
}

/// Trait implemented by all single-input streaming operators.
pub trait Operator<I, O>: Send {
    /// Short, stable name used in checkpoints and errors.
    fn name(&self) -> &'static str;

    /// Captures engine configuration before the first batch.
    fn configure(&mut self, _config: &EngineConfig) {}

    /// Process one input batch.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the pipeline.
    fn process(
        &mut self,
        batch: &EventBatch<I>,
        output: &mut OutputBuffer<O>,
    ) -> Result<(), OperatorError>;

    /// Called once when the input completes.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the pipeline.
    fn on_completed(&mut self, _output: &mut OutputBuffer<O>) -> Result<(), OperatorError> {
        Ok(())
    }

    /// Whether the operator carries state worth checkpointing.
    fn is_stateful(&self) -> bool {
        false
    }

    /// Checkpoint the operator's state
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::SerializationFailed`] if the state cannot be
    /// encoded.
    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        Ok(OperatorState::new(self.name(), Vec::new()))
    }

    /// Restore from a checkpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the state belongs to another operator or cannot
    /// be decoded.
    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError> {
        check_operator_id(self.name(), &state)
    }
}

/// Trait implemented by two-input operators.
///
/// Inputs arrive independently; the operator is responsible for merging
/// them into a single time-ordered output.
pub trait BinaryOperator<L, R, O>: Send {
    /// Short, stable name used in checkpoints and errors.
    fn name(&self) -> &'static str;

    /// Captures engine configuration before the first batch.
    fn configure(&mut self, _config: &EngineConfig) {}

    /// Process a batch from the left input.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the pipeline.
    fn process_left(
        &mut self,
        batch: &EventBatch<L>,
        output: &mut OutputBuffer<O>,
    ) -> Result<(), OperatorError>;

    /// Process a batch from the right input.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the pipeline.
    fn process_right(
        &mut self,
        batch: &EventBatch<R>,
        output: &mut OutputBuffer<O>,
    ) -> Result<(), OperatorError>;

    /// Called once when the left input completes.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the pipeline.
    fn on_left_completed(&mut self, output: &mut OutputBuffer<O>) -> Result<(), OperatorError>;

    /// Called once when the right input completes.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the pipeline.
    fn on_right_completed(&mut self, output: &mut OutputBuffer<O>) -> Result<(), OperatorError>;

    /// Checkpoint the operator's state
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::SerializationFailed`] if the state cannot be
    /// encoded.
    fn checkpoint(&self) -> Result<OperatorState, OperatorError>;

    /// Restore from a checkpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the state belongs to another operator or cannot
    /// be decoded.
    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError>;
}

/// Verifies that `state` was produced by an operator named `expected`.
pub(crate) fn check_operator_id(expected: &str, state: &OperatorState) -> Result<(), OperatorError> {
    if state.operator_id == expected {
        Ok(())
    } else {
        Err(OperatorError::StateMismatch {
            expected: expected.to_string(),
            found: state.operator_id.clone(),
        })
    }
}

/// Encodes operator state as JSON.
pub(crate) fn encode_state<T: Serialize>(
    operator_id: &str,
    state: &T,
) -> Result<OperatorState, OperatorError> {
    let data = serde_json::to_vec(state)
        .map_err(|e| OperatorError::SerializationFailed(format!("{operator_id}: {e}")))?;
    Ok(OperatorState::new(operator_id, data))
}

/// Decodes operator state produced by [`encode_state`].
pub(crate) fn decode_state<T: DeserializeOwned>(
    expected: &str,
    state: &OperatorState,
) -> Result<T, OperatorError> {
    check_operator_id(expected, state)?;
    serde_json::from_slice(&state.data)
        .map_err(|e| OperatorError::SerializationFailed(format!("{expected}: {e}")))
}

/// Wraps a transform failure with the operator's name.
pub(crate) fn transform_error(operator: &'static str) -> impl FnOnce(TransformError) -> OperatorError {
    move |source| OperatorError::Transform { operator, source }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_output_buffer_rolls_over_full_batches() {
        let mut out = OutputBuffer::new(pool::<u8>(2));
        for t in 0..5 {
            out.push(StreamEvent::start(t, 0).unwrap());
        }
        let batches = out.take_batches();
        let sizes: Vec<usize> = batches.iter().map(EventBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_output_buffer_drops_regressing_punctuation() {
        let mut out = output::<u8>();
        out.push_punctuation(5);
        out.push_punctuation(3);
        out.push_punctuation(5);
        let events = out.drain_events();
        let times: Vec<i64> = events.iter().map(StreamEvent::sync_time).collect();
        assert_eq!(times, vec![5, 5]);
        assert_eq!(out.last_punctuation(), 5);
    }

    #[test]
    fn test_state_round_trip_checks_operator_id() {
        let state = encode_state("sort", &vec![1_i64, 2, 3]).unwrap();
        let decoded: Vec<i64> = decode_state("sort", &state).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);

        let err = decode_state::<Vec<i64>>("clip", &state).unwrap_err();
        assert!(matches!(err, OperatorError::StateMismatch { .. }));
    }

    #[test]
    fn test_transform_error_carries_operator_name() {
        let err = transform_error("select")("boom".into());
        assert_eq!(err.to_string(), "transform in select failed: boom");
    }
}
