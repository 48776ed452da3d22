//! # Pipeline Stages
//!
//! Push-based wiring between operators. Every stage is an [`Observer`] of its
//! input: an upstream stage hands it a [`SharedBatch`], the stage runs its
//! operator over the batch, forwards whatever the operator produced to the
//! next observer, and only then returns. Control flow is therefore fully
//! synchronous: when `on_batch` returns, the batch has been processed by
//! every stage downstream of the caller.
//!
//! Single-input operators run inside an [`OperatorStage`]. Two-input
//! operators run inside a [`BinaryStage`], which exposes one observer per
//! input over a shared core; the stage completes once both inputs have.
//!
//! Operators are held behind `Arc<Mutex<..>>` so the
//! [`QueryContainer`](crate::container::QueryContainer) can reach them for
//! checkpoint and restore while the pipeline is wired.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::checkpoint::CheckpointTarget;
use crate::event::{BatchPool, SharedBatch};
use crate::operator::{BinaryOperator, Operator, OperatorError, OperatorState, OutputBuffer};
use crate::watermark::WatermarkSlot;

/// Receives batches pushed by an upstream stage.
pub trait Observer<P>: Send {
    /// Processes one batch.
    ///
    /// # Errors
    ///
    /// Any error is fatal: the pipeline stops and the error reaches the
    /// producer that pushed the batch.
    fn on_batch(&mut self, batch: SharedBatch<P>) -> crate::Result<()>;

    /// Called once after the last batch.
    ///
    /// # Errors
    ///
    /// Same as [`on_batch`](Self::on_batch).
    fn on_completed(&mut self) -> crate::Result<()>;
}

/// An owned, type-erased observer.
pub type BoxedObserver<P> = Box<dyn Observer<P>>;

/// A single-input operator shared between its stage and the container.
pub type SharedOperator<I, O> = Arc<Mutex<Box<dyn Operator<I, O>>>>;

/// Pushes the operator's pending output downstream.
fn forward<O>(
    output: &mut OutputBuffer<O>,
    next: &mut dyn Observer<O>,
    watermark: Option<&WatermarkSlot>,
) -> crate::Result<()> {
    for batch in output.take_batches() {
        if let (Some(slot), Some(p)) = (watermark, batch.last_punctuation()) {
            slot.advance(p);
        }
        next.on_batch(Arc::new(batch))?;
    }
    Ok(())
}

/// Raises the output's punctuation floor to the stage's published watermark.
///
/// After a restore the slot holds the last punctuation the stage emitted
/// before the checkpoint, while a rebuilt output buffer starts from scratch.
fn resume_punctuation<O>(output: &mut OutputBuffer<O>, watermark: Option<&WatermarkSlot>) {
    if let Some(time) = watermark.and_then(WatermarkSlot::get) {
        if time > output.last_punctuation() {
            output.set_last_punctuation(time);
        }
    }
}

/// Runs a single-input operator and feeds its output to the next observer.
pub struct OperatorStage<I, O> {
    operator: SharedOperator<I, O>,
    output: OutputBuffer<O>,
    input_pool: Arc<BatchPool<I>>,
    next: BoxedObserver<O>,
    watermark: Option<WatermarkSlot>,
    completed: bool,
}

impl<I, O> OperatorStage<I, O> {
    /// Creates a stage.
    ///
    /// # Arguments
    ///
    /// * `operator` - The operator to run
    /// * `input_pool` - Pool the incoming batches were checked out from
    /// * `output_pool` - Pool for the batches this stage produces
    /// * `next` - Downstream observer
    pub fn new(
        operator: SharedOperator<I, O>,
        input_pool: Arc<BatchPool<I>>,
        output_pool: Arc<BatchPool<O>>,
        next: BoxedObserver<O>,
    ) -> Self {
        Self {
            operator,
            output: OutputBuffer::new(output_pool),
            input_pool,
            next,
            watermark: None,
            completed: false,
        }
    }

    /// Publishes this stage's output punctuation into `slot`.
    #[must_use]
    pub fn with_watermark(mut self, slot: WatermarkSlot) -> Self {
        self.watermark = Some(slot);
        self
    }
}

impl<I: Send + Sync + 'static, O: Send + 'static> Observer<I> for OperatorStage<I, O> {
    fn on_batch(&mut self, batch: SharedBatch<I>) -> crate::Result<()> {
        if self.completed {
            tracing::warn!("batch pushed into a completed stage ignored");
            return Ok(());
        }
        resume_punctuation(&mut self.output, self.watermark.as_ref());
        {
            let mut operator = self.operator.lock();
            tracing::trace!(
                operator = operator.name(),
                events = batch.len(),
                "processing batch"
            );
            operator.process(&batch, &mut self.output)?;
        }
        self.input_pool.release(batch);
        forward(&mut self.output, self.next.as_mut(), self.watermark.as_ref())
    }

    fn on_completed(&mut self) -> crate::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        resume_punctuation(&mut self.output, self.watermark.as_ref());
        self.operator.lock().on_completed(&mut self.output)?;
        forward(&mut self.output, self.next.as_mut(), self.watermark.as_ref())?;
        self.next.on_completed()
    }
}

impl<I, O> CheckpointTarget for Mutex<Box<dyn Operator<I, O>>> {
    fn operator_name(&self) -> &'static str {
        self.lock().name()
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        self.lock().checkpoint()
    }

    fn restore(&self, state: OperatorState) -> Result<(), OperatorError> {
        self.lock().restore(state)
    }
}

struct BinaryCore<L, R, O> {
    operator: Box<dyn BinaryOperator<L, R, O>>,
    output: OutputBuffer<O>,
    left_pool: Arc<BatchPool<L>>,
    right_pool: Arc<BatchPool<R>>,
    next: BoxedObserver<O>,
    watermark: Option<WatermarkSlot>,
    left_completed: bool,
    right_completed: bool,
}

impl<L, R, O> BinaryCore<L, R, O> {
    fn resume_punctuation(&mut self) {
        resume_punctuation(&mut self.output, self.watermark.as_ref());
    }

    fn forward(&mut self) -> crate::Result<()> {
        forward(&mut self.output, self.next.as_mut(), self.watermark.as_ref())
    }

    fn finish_if_done(&mut self) -> crate::Result<()> {
        if self.left_completed && self.right_completed {
            self.next.on_completed()
        } else {
            Ok(())
        }
    }
}

impl<L, R, O> CheckpointTarget for Mutex<BinaryCore<L, R, O>>
where
    L: Send,
    R: Send,
    O: Send,
{
    fn operator_name(&self) -> &'static str {
        self.lock().operator.name()
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        self.lock().operator.checkpoint()
    }

    fn restore(&self, state: OperatorState) -> Result<(), OperatorError> {
        self.lock().operator.restore(state)
    }
}

/// Runs a two-input operator.
///
/// Obtain the input observers with [`left_input`](Self::left_input) and
/// [`right_input`](Self::right_input) and wire them to the upstream stages.
pub struct BinaryStage<L, R, O> {
    core: Arc<Mutex<BinaryCore<L, R, O>>>,
}

impl<L, R, O> BinaryStage<L, R, O>
where
    L: Send + Sync + 'static,
    R: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Creates a stage around `operator`.
    pub fn new(
        operator: Box<dyn BinaryOperator<L, R, O>>,
        left_pool: Arc<BatchPool<L>>,
        right_pool: Arc<BatchPool<R>>,
        output_pool: Arc<BatchPool<O>>,
        next: BoxedObserver<O>,
    ) -> Self {
        Self {
            core: Arc::new(Mutex::new(BinaryCore {
                operator,
                output: OutputBuffer::new(output_pool),
                left_pool,
                right_pool,
                next,
                watermark: None,
                left_completed: false,
                right_completed: false,
            })),
        }
    }

    /// Publishes this stage's output punctuation into `slot`.
    #[must_use]
    pub fn with_watermark(self, slot: WatermarkSlot) -> Self {
        self.core.lock().watermark = Some(slot);
        self
    }

    /// Observer for the left input.
    #[must_use]
    pub fn left_input(&self) -> BoxedObserver<L> {
        Box::new(LeftInput {
            core: Arc::clone(&self.core),
        })
    }

    /// Observer for the right input.
    #[must_use]
    pub fn right_input(&self) -> BoxedObserver<R> {
        Box::new(RightInput {
            core: Arc::clone(&self.core),
        })
    }

    /// The checkpoint handle for the operator.
    #[must_use]
    pub fn checkpoint_target(&self) -> Arc<dyn CheckpointTarget> {
        Arc::clone(&self.core) as Arc<dyn CheckpointTarget>
    }
}

struct LeftInput<L, R, O> {
    core: Arc<Mutex<BinaryCore<L, R, O>>>,
}

impl<L, R, O> Observer<L> for LeftInput<L, R, O>
where
    L: Send + Sync + 'static,
    R: Send + 'static,
    O: Send + 'static,
{
    fn on_batch(&mut self, batch: SharedBatch<L>) -> crate::Result<()> {
        let mut core = self.core.lock();
        let core = &mut *core;
        core.resume_punctuation();
        core.operator.process_left(&batch, &mut core.output)?;
        core.left_pool.release(batch);
        core.forward()
    }

    fn on_completed(&mut self) -> crate::Result<()> {
        let mut core = self.core.lock();
        if core.left_completed {
            return Ok(());
        }
        core.left_completed = true;
        let core = &mut *core;
        core.resume_punctuation();
        core.operator.on_left_completed(&mut core.output)?;
        core.forward()?;
        core.finish_if_done()
    }
}

struct RightInput<L, R, O> {
    core: Arc<Mutex<BinaryCore<L, R, O>>>,
}

impl<L, R, O> Observer<R> for RightInput<L, R, O>
where
    L: Send + 'static,
    R: Send + Sync + 'static,
    O: Send + 'static,
{
    fn on_batch(&mut self, batch: SharedBatch<R>) -> crate::Result<()> {
        let mut core = self.core.lock();
        let core = &mut *core;
        core.resume_punctuation();
        core.operator.process_right(&batch, &mut core.output)?;
        core.right_pool.release(batch);
        core.forward()
    }

    fn on_completed(&mut self) -> crate::Result<()> {
        let mut core = self.core.lock();
        if core.right_completed {
            return Ok(());
        }
        core.right_completed = true;
        let core = &mut *core;
        core.resume_punctuation();
        core.operator.on_right_completed(&mut core.output)?;
        core.forward()?;
        core.finish_if_done()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::event::StreamEvent;

    /// Collects every event it receives.
    pub struct Collector<P> {
        pub events: Arc<Mutex<Vec<StreamEvent<P>>>>,
        pub batches: Arc<Mutex<usize>>,
        pub completed: Arc<Mutex<bool>>,
    }

    impl<P> Default for Collector<P> {
        fn default() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
                batches: Arc::new(Mutex::new(0)),
                completed: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl<P> Clone for Collector<P> {
        fn clone(&self) -> Self {
            Self {
                events: Arc::clone(&self.events),
                batches: Arc::clone(&self.batches),
                completed: Arc::clone(&self.completed),
            }
        }
    }

    impl<P> Collector<P> {
        pub fn rendered(&self) -> Vec<String>
        where
            P: std::fmt::Debug,
        {
            self.events.lock().iter().map(ToString::to_string).collect()
        }
    }

    impl<P: Clone + Send + Sync + 'static> Observer<P> for Collector<P> {
        fn on_batch(&mut self, batch: SharedBatch<P>) -> crate::Result<()> {
            self.events.lock().extend(batch.iter().cloned());
            *self.batches.lock() += 1;
            Ok(())
        }

        fn on_completed(&mut self) -> crate::Result<()> {
            *self.completed.lock() = true;
            Ok(())
        }
    }
}
