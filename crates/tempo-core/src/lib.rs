//! # Tempo Core
//!
//! One-pass, incremental temporal query engine. Events carry a lifetime on
//! the time axis; operators consume them in batches and produce results as
//! soon as the punctuations flowing with the data allow.
//!
//! This crate provides:
//! - **Events**: Start/End edges, intervals and punctuations, grouped into
//!   pooled batches
//! - **Ingress**: disorder, punctuation, flush and completion policies
//!   applied before the first operator
//! - **Operators**: filtering and projection, grouped windowed aggregation,
//!   union and anti-join, lifetime transforms, sort and cache
//! - **Multicast**: one stream feeding several consumers with backpressure
//! - **Checkpoints**: per-operator state snapshots tagged with the low
//!   watermark
//!
//! ## Design Principles
//!
//! 1. **Push-based and synchronous** - a push returns once every stage
//!    downstream has processed the batch
//! 2. **Punctuations drive output** - stateful operators only emit what no
//!    later input can change
//! 3. **Configuration captured once** - no ambient state on the per-event
//!    path
//!
//! ## Example
//!
//! ```rust
//! use tempo_core::container::QueryContainer;
//! use tempo_core::egress::ReshapingPolicy;
//! use tempo_core::event::StreamEvent;
//! use tempo_core::ingress::{IngressConfig, PunctuationPolicy};
//! use tempo_core::operator::{CountAggregate, GroupAggregate};
//!
//! let container = QueryContainer::default();
//! let config = IngressConfig::default().with_punctuation(PunctuationPolicy::Time { period: 1 });
//! let (input, stream) = container.ingress::<i64>("clicks", config)?;
//! let counts = stream
//!     .apply(GroupAggregate::ungrouped(CountAggregate::<i64>::new()))
//!     .egress(ReshapingPolicy::None);
//!
//! for t in 0..3 {
//!     input.push(StreamEvent::start(t, t)?)?;
//! }
//! input.complete()?;
//! assert!(counts.is_completed());
//! # Ok::<(), tempo_core::Error>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod container;
pub mod egress;
pub mod event;
pub mod ingress;
pub mod multicast;
pub mod operator;
pub mod pipeline;
pub mod watermark;

// Re-export key types
pub use checkpoint::Checkpoint;
pub use config::{EngineConfig, ExecutionMode};
pub use container::{QueryContainer, Stream};
pub use event::{EventBatch, EventKind, StreamEvent, INFINITY};

/// Result type for tempo-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tempo-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// Ingress errors
    #[error("Ingress error: {0}")]
    Ingress(#[from] ingress::IngressError),

    /// Multicast errors
    #[error("Multicast error: {0}")]
    Multicast(#[from] multicast::MulticastError),

    /// Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    /// Malformed events
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] event::InvalidEventError),
}
