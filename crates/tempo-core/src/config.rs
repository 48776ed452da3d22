//! Engine configuration.
//!
//! [`EngineConfig`] is built once, handed to the
//! [`QueryContainer`](crate::container::QueryContainer) and captured by every
//! operator at pipeline-build time through
//! [`Operator::configure`](crate::operator::Operator::configure). Nothing in
//! the per-event path reads ambient state.

use serde::{Deserialize, Serialize};

/// Default number of events per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Minimum batch size.
pub const MIN_BATCH_SIZE: usize = 1;

/// Maximum batch size (prevent excessive memory usage).
pub const MAX_BATCH_SIZE: usize = 1 << 20;

/// Default number of in-flight batches a multicast buffer holds.
pub const DEFAULT_MULTICAST_CAPACITY: usize = 16;

/// Default number of idle buffers each batch pool retains.
pub const DEFAULT_POOL_MAX_FREE: usize = 64;

/// How stateless operators evaluate a batch.
///
/// Both variants produce identical output; the choice trades per-event
/// dispatch against a two-pass selection-vector evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Evaluate and emit one event at a time.
    Row,

    /// Evaluate the whole batch into a selection vector, then compact.
    #[default]
    Columnar,
}

/// Configuration for a query pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events per batch.
    pub batch_size: usize,

    /// Evaluation strategy for stateless operators.
    pub execution_mode: ExecutionMode,

    /// Batches a multicast buffer can hold before publish is rejected.
    pub multicast_capacity: usize,

    /// Idle buffers retained per batch pool.
    pub pool_max_free: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            execution_mode: ExecutionMode::Columnar,
            multicast_capacity: DEFAULT_MULTICAST_CAPACITY,
            pool_max_free: DEFAULT_POOL_MAX_FREE,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with the specified batch size.
    #[must_use]
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            ..Default::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Returns the batch size clamped to the supported range.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
    }

    /// Returns the multicast capacity, at least one slot.
    #[must_use]
    pub fn effective_multicast_capacity(&self) -> usize {
        self.multicast_capacity.max(1)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    batch_size: Option<usize>,
    execution_mode: Option<ExecutionMode>,
    multicast_capacity: Option<usize>,
    pool_max_free: Option<usize>,
}

impl EngineConfigBuilder {
    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    /// Sets the multicast capacity.
    #[must_use]
    pub fn multicast_capacity(mut self, capacity: usize) -> Self {
        self.multicast_capacity = Some(capacity);
        self
    }

    /// Sets the number of idle buffers retained per pool.
    #[must_use]
    pub fn pool_max_free(mut self, max_free: usize) -> Self {
        self.pool_max_free = Some(max_free);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> EngineConfig {
        EngineConfig {
            batch_size: self
                .batch_size
                .unwrap_or(DEFAULT_BATCH_SIZE)
                .clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            execution_mode: self.execution_mode.unwrap_or_default(),
            multicast_capacity: self
                .multicast_capacity
                .unwrap_or(DEFAULT_MULTICAST_CAPACITY)
                .max(1),
            pool_max_free: self.pool_max_free.unwrap_or(DEFAULT_POOL_MAX_FREE),
        }
    }
}
