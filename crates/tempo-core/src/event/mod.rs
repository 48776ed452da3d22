//! # Event Model
//!
//! The temporal event model: every element flowing through a pipeline is a
//! [`StreamEvent`] of one of four kinds.
//!
//! | Kind          | `sync_time`              | `other_time`                     |
//! |---------------|--------------------------|----------------------------------|
//! | `Start`       | validity begins          | [`INFINITY`]                     |
//! | `End`         | validity ceases          | the paired Start's `sync_time`   |
//! | `Interval`    | validity begins          | exclusive end of validity        |
//! | `Punctuation` | watermark value          | unused                           |
//!
//! Constructors validate the per-kind invariants and fail with
//! [`InvalidEventError`]; there is no way to build a data event with an
//! empty lifetime through the public API.
//!
//! ## Example
//!
//! ```rust
//! use tempo_core::event::{StreamEvent, INFINITY};
//!
//! let start = StreamEvent::start(10, "row").unwrap();
//! assert_eq!(start.other_time(), INFINITY);
//!
//! let end = StreamEvent::end(15, 10, "row").unwrap();
//! assert!(end.is_end());
//!
//! assert!(StreamEvent::interval(5, 5, "empty").is_err());
//! ```

pub mod batch;
pub mod pool;

pub use batch::{BatchFull, EventBatch, SharedBatch};
pub use pool::{BatchPool, PoolRegistry};

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Positive infinity on the event timeline.
///
/// Used as the implicit end of a `Start` event and as the time of the final
/// punctuation that closes every open lifetime.
pub const INFINITY: i64 = i64::MAX;

/// The earliest representable sync time. Watermarks start here.
pub const MIN_SYNC_TIME: i64 = i64::MIN;

/// Bound shared by every payload type that can flow through a pipeline.
///
/// Payloads are cloned when a Start must be remembered until its End,
/// compared to pair Ends with their Starts, and serialized into checkpoints.
pub trait Payload:
    Clone + PartialEq + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Payload for T where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// The four event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Opens a lifetime whose end is not yet known.
    Start,
    /// Closes a lifetime previously opened by a `Start`.
    End,
    /// A complete lifetime `[sync_time, other_time)`.
    Interval,
    /// Watermark: no later data event has `sync_time` below this value.
    Punctuation,
}

/// Errors raised when an event violates its kind's invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEventError {
    /// An interval whose start is not strictly before its end.
    #[error("interval must satisfy sync_time < other_time (got [{sync_time}, {other_time}))")]
    EmptyInterval {
        /// Start of the interval.
        sync_time: i64,
        /// Exclusive end of the interval.
        other_time: i64,
    },

    /// An End whose paired start is not strictly before it.
    #[error("end edge at {sync_time} must follow its start at {other_time}")]
    EndNotAfterStart {
        /// Time the End occurs.
        sync_time: i64,
        /// Start time referenced by the End.
        other_time: i64,
    },

    /// A data event placed at positive infinity.
    #[error("data event sync_time must be finite")]
    SyncTimeAtInfinity,

    /// A data event without a payload (only reachable through deserialization).
    #[error("{0:?} event is missing its payload")]
    MissingPayload(EventKind),

    /// An End with no open Start to retract.
    #[error("end edge at {sync_time} has no matching start at {other_time}")]
    UnmatchedEnd {
        /// Time the End occurs.
        sync_time: i64,
        /// Start time referenced by the End.
        other_time: i64,
    },
}

/// A single event on the temporal timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize", deserialize = "P: Deserialize<'de>"))]
pub struct StreamEvent<P> {
    kind: EventKind,
    sync_time: i64,
    other_time: i64,
    payload: Option<P>,
}

impl<P> StreamEvent<P> {
    /// Creates a `Start` edge at `sync_time`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEventError::SyncTimeAtInfinity`] if `sync_time` is
    /// [`INFINITY`].
    pub fn start(sync_time: i64, payload: P) -> Result<Self, InvalidEventError> {
        if sync_time == INFINITY {
            return Err(InvalidEventError::SyncTimeAtInfinity);
        }
        Ok(Self {
            kind: EventKind::Start,
            sync_time,
            other_time: INFINITY,
            payload: Some(payload),
        })
    }

    /// Creates an `End` edge at `sync_time` closing the Start at `start_time`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEventError::EndNotAfterStart`] unless
    /// `start_time < sync_time`.
    pub fn end(sync_time: i64, start_time: i64, payload: P) -> Result<Self, InvalidEventError> {
        if start_time >= sync_time {
            return Err(InvalidEventError::EndNotAfterStart {
                sync_time,
                other_time: start_time,
            });
        }
        if sync_time == INFINITY {
            return Err(InvalidEventError::SyncTimeAtInfinity);
        }
        Ok(Self {
            kind: EventKind::End,
            sync_time,
            other_time: start_time,
            payload: Some(payload),
        })
    }

    /// Creates an `Interval` valid over `[sync_time, other_time)`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEventError::EmptyInterval`] unless
    /// `sync_time < other_time`.
    pub fn interval(sync_time: i64, other_time: i64, payload: P) -> Result<Self, InvalidEventError> {
        if sync_time >= other_time {
            return Err(InvalidEventError::EmptyInterval {
                sync_time,
                other_time,
            });
        }
        Ok(Self {
            kind: EventKind::Interval,
            sync_time,
            other_time,
            payload: Some(payload),
        })
    }

    /// Creates a punctuation (watermark) at `time`.
    #[must_use]
    pub fn punctuation(time: i64) -> Self {
        Self {
            kind: EventKind::Punctuation,
            sync_time: time,
            other_time: INFINITY,
            payload: None,
        }
    }

    /// Returns the event kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the effective time of the event.
    #[inline]
    #[must_use]
    pub fn sync_time(&self) -> i64 {
        self.sync_time
    }

    /// Returns the secondary time (see the module table).
    #[inline]
    #[must_use]
    pub fn other_time(&self) -> i64 {
        self.other_time
    }

    /// Returns the payload, `None` for punctuations.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    /// Consumes the event, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Option<P> {
        self.payload
    }

    /// Returns true for Start, End and Interval events.
    #[inline]
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.kind != EventKind::Punctuation
    }

    /// Returns true for punctuations.
    #[inline]
    #[must_use]
    pub fn is_punctuation(&self) -> bool {
        self.kind == EventKind::Punctuation
    }

    /// Returns true for Start edges.
    #[inline]
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.kind == EventKind::Start
    }

    /// Returns true for End edges.
    #[inline]
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.kind == EventKind::End
    }

    /// Returns true for intervals.
    #[inline]
    #[must_use]
    pub fn is_interval(&self) -> bool {
        self.kind == EventKind::Interval
    }

    /// Start of the lifetime this event describes.
    ///
    /// For an End this is the paired Start's time.
    #[must_use]
    pub fn lifetime_start(&self) -> i64 {
        match self.kind {
            EventKind::End => self.other_time,
            _ => self.sync_time,
        }
    }

    /// Replaces the payload, keeping kind and timing untouched.
    #[must_use]
    pub fn with_payload<Q>(&self, payload: Q) -> StreamEvent<Q> {
        StreamEvent {
            kind: self.kind,
            sync_time: self.sync_time,
            other_time: self.other_time,
            payload: if self.is_data() { Some(payload) } else { None },
        }
    }

    /// Re-types a punctuation. Returns `None` for data events.
    #[must_use]
    pub fn cast_punctuation<Q>(&self) -> Option<StreamEvent<Q>> {
        self.is_punctuation()
            .then(|| StreamEvent::punctuation(self.sync_time))
    }

    /// Checks the invariants of an event that did not come from a
    /// constructor (for example one deserialized from a checkpoint).
    ///
    /// # Errors
    ///
    /// Returns the violated invariant.
    pub fn validate(&self) -> Result<(), InvalidEventError> {
        if self.is_data() {
            if self.payload.is_none() {
                return Err(InvalidEventError::MissingPayload(self.kind));
            }
            if self.sync_time == INFINITY {
                return Err(InvalidEventError::SyncTimeAtInfinity);
            }
        }
        match self.kind {
            EventKind::Interval if self.sync_time >= self.other_time => {
                Err(InvalidEventError::EmptyInterval {
                    sync_time: self.sync_time,
                    other_time: self.other_time,
                })
            }
            EventKind::End if self.other_time >= self.sync_time => {
                Err(InvalidEventError::EndNotAfterStart {
                    sync_time: self.sync_time,
                    other_time: self.other_time,
                })
            }
            _ => Ok(()),
        }
    }

    /// Moves the event forward to `time`, used by the Adjust disorder policy.
    ///
    /// Returns `None` when an interval becomes empty. End edges keep their
    /// `other_time`.
    pub(crate) fn snapped_to(mut self, time: i64) -> Option<Self> {
        if self.sync_time >= time {
            return Some(self);
        }
        if self.kind == EventKind::Interval && self.other_time <= time {
            return None;
        }
        self.sync_time = time;
        Some(self)
    }

    /// Rewrites the time fields of a data event without validation.
    ///
    /// Callers uphold the invariant of the resulting kind.
    pub(crate) fn retimed(mut self, kind: EventKind, sync_time: i64, other_time: i64) -> Self {
        debug_assert!(kind != EventKind::Interval || sync_time < other_time);
        debug_assert!(kind != EventKind::End || other_time < sync_time);
        self.kind = kind;
        self.sync_time = sync_time;
        self.other_time = other_time;
        self
    }

    /// Builds a data event whose invariants the caller has already ensured.
    pub(crate) fn data_unchecked(
        kind: EventKind,
        sync_time: i64,
        other_time: i64,
        payload: P,
    ) -> Self {
        debug_assert!(kind != EventKind::Punctuation);
        debug_assert!(kind != EventKind::Interval || sync_time < other_time);
        debug_assert!(kind != EventKind::End || other_time < sync_time);
        Self {
            kind,
            sync_time,
            other_time,
            payload: Some(payload),
        }
    }
}

impl<P: fmt::Debug> fmt::Display for StreamEvent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.payload) {
            (EventKind::Punctuation, _) => write!(f, "Punctuation({})", self.sync_time),
            (EventKind::Start, Some(p)) => write!(f, "Start({}, {p:?})", self.sync_time),
            (EventKind::End, Some(p)) => {
                write!(f, "End({}, {}, {p:?})", self.sync_time, self.other_time)
            }
            (EventKind::Interval, Some(p)) => {
                write!(f, "Interval({}, {}, {p:?})", self.sync_time, self.other_time)
            }
            (kind, None) => write!(f, "{kind:?}({}, <missing>)", self.sync_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_defaults_other_time_to_infinity() {
        let ev = StreamEvent::start(3, 7_i64).unwrap();
        assert_eq!(ev.kind(), EventKind::Start);
        assert_eq!(ev.other_time(), INFINITY);
        assert_eq!(ev.payload(), Some(&7));
    }

    #[test]
    fn test_interval_rejects_empty_lifetime() {
        assert!(matches!(
            StreamEvent::interval(5, 5, ()),
            Err(InvalidEventError::EmptyInterval {
                sync_time: 5,
                other_time: 5
            })
        ));
        assert!(StreamEvent::interval(6, 5, ()).is_err());
        assert!(StreamEvent::interval(5, 6, ()).is_ok());
    }

    #[test]
    fn test_end_requires_earlier_start() {
        assert!(StreamEvent::end(4, 4, ()).is_err());
        assert!(StreamEvent::end(4, 9, ()).is_err());
        let end = StreamEvent::end(4, 1, ()).unwrap();
        assert_eq!(end.lifetime_start(), 1);
    }

    #[test]
    fn test_start_at_infinity_is_rejected() {
        assert_eq!(
            StreamEvent::start(INFINITY, ()),
            Err(InvalidEventError::SyncTimeAtInfinity)
        );
    }

    #[test]
    fn test_punctuation_has_no_payload() {
        let p = StreamEvent::<String>::punctuation(42);
        assert!(p.is_punctuation());
        assert!(!p.is_data());
        assert!(p.payload().is_none());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_with_payload_preserves_timing() {
        let ev = StreamEvent::interval(1, 9, 10_i64).unwrap();
        let mapped = ev.with_payload("ten");
        assert_eq!(mapped.kind(), EventKind::Interval);
        assert_eq!(mapped.sync_time(), 1);
        assert_eq!(mapped.other_time(), 9);
        assert_eq!(mapped.payload(), Some(&"ten"));
    }

    #[test]
    fn test_snapped_interval_collapses_when_end_passed() {
        let ev = StreamEvent::interval(1, 4, ()).unwrap();
        assert!(ev.clone().snapped_to(4).is_none());
        let snapped = ev.snapped_to(3).unwrap();
        assert_eq!(snapped.sync_time(), 3);
        assert_eq!(snapped.other_time(), 4);
    }

    #[test]
    fn test_snapped_end_keeps_other_time() {
        let ev = StreamEvent::end(5, 2, ()).unwrap();
        let snapped = ev.snapped_to(8).unwrap();
        assert_eq!(snapped.sync_time(), 8);
        assert_eq!(snapped.other_time(), 2);
    }

    #[test]
    fn test_validate_catches_deserialized_garbage() {
        let json = r#"{"kind":"Interval","sync_time":9,"other_time":3,"payload":1}"#;
        let ev: StreamEvent<i64> = serde_json::from_str(json).unwrap();
        assert!(matches!(
            ev.validate(),
            Err(InvalidEventError::EmptyInterval { .. })
        ));

        let json = r#"{"kind":"Start","sync_time":1,"other_time":9,"payload":null}"#;
        let ev: StreamEvent<i64> = serde_json::from_str(json).unwrap();
        assert_eq!(
            ev.validate(),
            Err(InvalidEventError::MissingPayload(EventKind::Start))
        );
    }

    #[test]
    fn test_display() {
        let ev = StreamEvent::end(2, 1, 6_u64).unwrap();
        assert_eq!(ev.to_string(), "End(2, 1, 6)");
        assert_eq!(
            StreamEvent::<u64>::punctuation(3).to_string(),
            "Punctuation(3)"
        );
    }
}
