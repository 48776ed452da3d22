//! # Checkpoint / Restore
//!
//! A [`Checkpoint`] is the ordered list of every stateful stage's
//! [`OperatorState`], tagged with the container's low watermark at the time
//! it was taken. Blobs are opaque: only the operator that produced one can
//! read it back.
//!
//! The record itself is archived with `rkyv`; [`Checkpoint::to_bytes`] and
//! [`Checkpoint::from_bytes`] are the only entry points for persisting it.

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::operator::{OperatorError, OperatorState};

/// Something whose state is part of a checkpoint.
///
/// Implemented by every stateful pipeline stage and by ingress.
pub trait CheckpointTarget: Send + Sync {
    /// Stable name used to validate the state on restore.
    fn operator_name(&self) -> &'static str;

    /// Externalizes the current state.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::SerializationFailed`] if the state cannot be
    /// encoded.
    fn checkpoint(&self) -> Result<OperatorState, OperatorError>;

    /// Replaces the current state.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::StateMismatch`] if `state` belongs to another
    /// operator, or a decoding error.
    fn restore(&self, state: OperatorState) -> Result<(), OperatorError>;
}

/// Errors from taking, encoding or restoring a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Restore was called before any output had a subscriber.
    #[error("cannot restore a checkpoint before any output is subscribed")]
    RestoreBeforeSubscription,

    /// The checkpoint was taken from a pipeline of another shape.
    #[error("checkpoint holds {found} operator states, pipeline has {expected}")]
    OperatorCountMismatch {
        /// Stateful stages in the pipeline.
        expected: usize,
        /// States in the checkpoint.
        found: usize,
    },

    /// A state was produced by a different operator than the one at its position.
    #[error("checkpoint state {index} belongs to `{found}`, expected `{expected}`")]
    OperatorMismatch {
        /// Position in the pipeline.
        index: usize,
        /// Operator at that position.
        expected: String,
        /// Operator that produced the state.
        found: String,
    },

    /// Archiving the record failed.
    #[error("checkpoint encoding failed: {0}")]
    Encode(String),

    /// The bytes are not a valid checkpoint.
    #[error("checkpoint decoding failed: {0}")]
    Decode(String),
}

/// A consistent snapshot of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct Checkpoint {
    /// Sequence number, incremented by every checkpoint of a container.
    pub epoch: u64,
    /// Low watermark of the container when the checkpoint was taken.
    pub watermark: Option<i64>,
    /// Value of every watermark slot, in registration order.
    pub watermarks: Vec<i64>,
    /// State of every stateful stage, in pipeline build order.
    pub operators: Vec<OperatorState>,
}

impl Checkpoint {
    /// Archives the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| CheckpointError::Encode(e.to_string()))
    }

    /// Reads a checkpoint written by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Decode`] if the bytes fail validation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, RkyvError>(&aligned)
            .map_err(|e| CheckpointError::Decode(e.to_string()))
    }

    /// Checks that the states line up with `targets`, position by position.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::OperatorCountMismatch`] or
    /// [`CheckpointError::OperatorMismatch`].
    pub(crate) fn validate_against<'a>(
        &self,
        names: impl ExactSizeIterator<Item = &'a str>,
    ) -> Result<(), CheckpointError> {
        if names.len() != self.operators.len() {
            return Err(CheckpointError::OperatorCountMismatch {
                expected: names.len(),
                found: self.operators.len(),
            });
        }
        for (index, (name, state)) in names.zip(&self.operators).enumerate() {
            if state.operator_id != name {
                return Err(CheckpointError::OperatorMismatch {
                    index,
                    expected: name.to_string(),
                    found: state.operator_id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            epoch: 3,
            watermark: Some(42),
            watermarks: vec![42, 50],
            operators: vec![
                OperatorState::new("group_aggregate", b"{\"groups\":[]}".to_vec()),
                OperatorState::new("union", Vec::new()),
            ],
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let checkpoint = sample();
        let bytes = checkpoint.to_bytes().unwrap();
        assert_eq!(Checkpoint::from_bytes(&bytes).unwrap(), checkpoint);
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(matches!(
            Checkpoint::from_bytes(&[1, 2, 3]),
            Err(CheckpointError::Decode(_))
        ));
    }

    #[test]
    fn test_validate_against_pipeline_shape() {
        let checkpoint = sample();
        assert!(checkpoint
            .validate_against(["group_aggregate", "union"].into_iter())
            .is_ok());
        assert!(matches!(
            checkpoint.validate_against(["group_aggregate"].into_iter()),
            Err(CheckpointError::OperatorCountMismatch {
                expected: 1,
                found: 2
            })
        ));
        assert!(matches!(
            checkpoint.validate_against(["sort", "union"].into_iter()),
            Err(CheckpointError::OperatorMismatch { index: 0, .. })
        ));
    }
}
