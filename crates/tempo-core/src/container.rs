//! # Query Container
//!
//! Owns everything a set of pipelines shares: the engine configuration, the
//! batch pools, the watermark registry and the ordered list of checkpoint
//! targets.
//!
//! Pipelines are wired front to back. [`QueryContainer::ingress`] returns the
//! producer handle together with a [`Stream`]; every combinator consumes a
//! stream and returns the next one, and [`Stream::egress`] or
//! [`Stream::subscribe`] terminates it. Because batches are pushed, each
//! stream is a slot that its upstream stage forwards into once the stream is
//! connected. Events pushed into a stream nothing consumes are dropped.
//!
//! ```rust
//! use tempo_core::container::QueryContainer;
//! use tempo_core::egress::ReshapingPolicy;
//! use tempo_core::event::StreamEvent;
//! use tempo_core::ingress::IngressConfig;
//! use tempo_core::operator::Where;
//!
//! let container = QueryContainer::default();
//! let (input, stream) = container
//!     .ingress::<i64>("numbers", IngressConfig::default())
//!     .unwrap();
//! let output = stream
//!     .apply(Where::new(|v: &i64| v % 2 == 0))
//!     .egress(ReshapingPolicy::None);
//!
//! input.push(StreamEvent::interval(1, 5, 2).unwrap()).unwrap();
//! input.push(StreamEvent::interval(2, 5, 3).unwrap()).unwrap();
//! input.complete().unwrap();
//!
//! assert_eq!(output.data_events().len(), 1);
//! assert!(output.is_completed());
//! ```
//!
//! ## Checkpoints
//!
//! Ingress, every stateful operator, every binary stage and every egress
//! register a [`CheckpointTarget`] when they are wired, so two containers
//! built by the same code have the same targets in the same order.
//! [`QueryContainer::restore`] relies on that order. Take checkpoints and
//! restore them between pushes; a checkpoint taken while producers are
//! pushing on other threads is not consistent.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{Cache, CachedStream};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointTarget};
use crate::config::EngineConfig;
use crate::egress::{Egress, EgressHandle, ReshapingPolicy};
use crate::event::{Payload, PoolRegistry, SharedBatch};
use crate::ingress::{Ingress, IngressConfig, IngressHandle};
use crate::multicast::{MulticastReader, MulticastStage};
use crate::operator::{BinaryOperator, Operator, Union, WhereNotExists};
use crate::pipeline::{BinaryStage, BoxedObserver, Observer, OperatorStage, SharedOperator};
use crate::watermark::WatermarkRegistry;

struct ContainerInner {
    config: EngineConfig,
    pools: PoolRegistry,
    watermarks: Mutex<WatermarkRegistry>,
    targets: Mutex<Vec<Arc<dyn CheckpointTarget>>>,
    subscriptions: AtomicUsize,
    stages: AtomicUsize,
    epoch: AtomicU64,
}

impl ContainerInner {
    fn register_target(&self, target: Arc<dyn CheckpointTarget>) {
        tracing::trace!(operator = target.operator_name(), "registered checkpoint target");
        self.targets.lock().push(target);
    }

    fn stage_name(&self, operator: &str) -> String {
        let id = self.stages.fetch_add(1, Ordering::Relaxed);
        format!("{operator}#{id}")
    }
}

/// Hosts pipelines and checkpoints them as a unit.
#[derive(Clone)]
pub struct QueryContainer {
    inner: Arc<ContainerInner>,
}

impl QueryContainer {
    /// Creates a container.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let pools = PoolRegistry::new(config.effective_batch_size(), config.pool_max_free);
        Self {
            inner: Arc::new(ContainerInner {
                config,
                pools,
                watermarks: Mutex::new(WatermarkRegistry::new()),
                targets: Mutex::new(Vec::new()),
                subscriptions: AtomicUsize::new(0),
                stages: AtomicUsize::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// The configuration every pipeline in this container is built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Opens an input.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::InvalidConfig`](crate::ingress::IngressError::InvalidConfig)
    /// if the policies are invalid.
    pub fn ingress<P: Payload>(
        &self,
        name: impl Into<String>,
        config: IngressConfig,
    ) -> crate::Result<(IngressHandle<P>, Stream<P>)> {
        let name = name.into();
        let (stream, link) = Stream::detached(Arc::clone(&self.inner));
        let slot = self.inner.watermarks.lock().register(name.clone());
        let ingress = Ingress::new(name, config, self.inner.pools.pool::<P>(), link)?
            .with_watermark(slot);
        let handle = IngressHandle::new(ingress);
        self.inner.register_target(handle.checkpoint_target());
        Ok((handle, stream))
    }

    /// Snapshots every registered target.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while encoding a target's state.
    pub fn checkpoint(&self) -> crate::Result<Checkpoint> {
        let operators = self
            .inner
            .targets
            .lock()
            .iter()
            .map(|target| target.checkpoint())
            .collect::<Result<Vec<_>, _>>()?;
        let (watermark, watermarks) = {
            let registry = self.inner.watermarks.lock();
            (registry.low_watermark(), registry.checkpoint())
        };
        let epoch = self.inner.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            epoch,
            watermark = ?watermark,
            operators = operators.len(),
            "checkpoint taken"
        );
        Ok(Checkpoint {
            epoch,
            watermark,
            watermarks,
            operators,
        })
    }

    /// Replays `checkpoint` into every registered target.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::RestoreBeforeSubscription`] if no output is
    /// subscribed yet, a shape mismatch if the checkpoint came from a
    /// differently built container, or the first error raised by a target.
    pub fn restore(&self, checkpoint: &Checkpoint) -> crate::Result<()> {
        if self.inner.subscriptions.load(Ordering::Acquire) == 0 {
            return Err(CheckpointError::RestoreBeforeSubscription.into());
        }
        let targets = self.inner.targets.lock();
        checkpoint.validate_against(targets.iter().map(|t| t.operator_name()))?;
        for (target, state) in targets.iter().zip(&checkpoint.operators) {
            target.restore(state.clone())?;
        }
        self.inner.watermarks.lock().restore(&checkpoint.watermarks);
        self.inner.epoch.store(checkpoint.epoch, Ordering::Relaxed);
        tracing::info!(
            epoch = checkpoint.epoch,
            watermark = ?checkpoint.watermark,
            operators = targets.len(),
            "checkpoint restored"
        );
        Ok(())
    }

    /// Decodes and restores a checkpoint from [`Checkpoint::to_bytes`].
    ///
    /// # Errors
    ///
    /// Same as [`restore`](Self::restore), plus [`CheckpointError::Decode`].
    pub fn restore_from_bytes(&self, bytes: &[u8]) -> crate::Result<()> {
        let checkpoint = Checkpoint::from_bytes(bytes)?;
        self.restore(&checkpoint)
    }

    /// Minimum punctuation over every egress, once all of them have one.
    #[must_use]
    pub fn low_watermark(&self) -> Option<i64> {
        self.inner.watermarks.lock().low_watermark()
    }

    /// Last punctuation published by the named slot.
    #[must_use]
    pub fn watermark(&self, name: &str) -> Option<i64> {
        self.inner.watermarks.lock().get(name)
    }

    /// Number of outputs with a consumer.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.load(Ordering::Acquire)
    }

    /// Number of registered checkpoint targets.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.inner.targets.lock().len()
    }

    /// Epoch of the last checkpoint taken or restored.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Relaxed)
    }
}

impl Default for QueryContainer {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for QueryContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContainer")
            .field("config", &self.inner.config)
            .field("targets", &self.target_count())
            .field("subscriptions", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

type Connector<P> = Arc<Mutex<Option<BoxedObserver<P>>>>;

/// Upstream end of a [`Stream`]: forwards into whatever the stream is
/// connected to.
struct Link<P> {
    target: Connector<P>,
    warned: bool,
}

impl<P: Send + Sync + 'static> Observer<P> for Link<P> {
    fn on_batch(&mut self, batch: SharedBatch<P>) -> crate::Result<()> {
        let mut target = self.target.lock();
        match target.as_mut() {
            Some(next) => next.on_batch(batch),
            None => {
                if !self.warned {
                    tracing::warn!(events = batch.len(), "stream has no consumer, events dropped");
                    self.warned = true;
                }
                Ok(())
            }
        }
    }

    fn on_completed(&mut self) -> crate::Result<()> {
        match self.target.lock().as_mut() {
            Some(next) => next.on_completed(),
            None => Ok(()),
        }
    }
}

/// A not yet consumed pipeline output.
///
/// Every method consumes the stream: each output feeds exactly one
/// downstream stage. Use [`multicast`](Self::multicast) to feed several.
#[must_use = "events pushed into an unconsumed stream are dropped"]
pub struct Stream<P> {
    container: Arc<ContainerInner>,
    target: Connector<P>,
}

impl<P: Payload> Stream<P> {
    fn detached(container: Arc<ContainerInner>) -> (Self, BoxedObserver<P>) {
        let target: Connector<P> = Arc::new(Mutex::new(None));
        let link = Link {
            target: Arc::clone(&target),
            warned: false,
        };
        (Self { container, target }, Box::new(link))
    }

    fn downstream<Q: Payload>(&self) -> (Stream<Q>, BoxedObserver<Q>) {
        Stream::detached(Arc::clone(&self.container))
    }

    fn connect(self, observer: BoxedObserver<P>) {
        *self.target.lock() = Some(observer);
    }

    /// Runs `operator` over this stream.
    pub fn apply<O, Op>(self, mut operator: Op) -> Stream<O>
    where
        O: Payload,
        Op: Operator<P, O> + 'static,
    {
        let container = Arc::clone(&self.container);
        operator.configure(&container.config);
        let stage_name = container.stage_name(operator.name());
        let stateful = operator.is_stateful();
        let boxed: Box<dyn Operator<P, O>> = Box::new(operator);
        let shared: SharedOperator<P, O> = Arc::new(Mutex::new(boxed));
        if stateful {
            container.register_target(Arc::clone(&shared) as Arc<dyn CheckpointTarget>);
        }

        let (next, link) = self.downstream::<O>();
        let slot = container.watermarks.lock().register(stage_name);
        let stage = OperatorStage::new(
            shared,
            container.pools.pool::<P>(),
            container.pools.pool::<O>(),
            link,
        )
        .with_watermark(slot);
        self.connect(Box::new(stage));
        next
    }

    /// Runs a two-input `operator` with this stream on the left.
    ///
    /// Both streams must come from the same container.
    pub fn combine<R, O, Op>(self, right: Stream<R>, mut operator: Op) -> Stream<O>
    where
        R: Payload,
        O: Payload,
        Op: BinaryOperator<P, R, O> + 'static,
    {
        let container = Arc::clone(&self.container);
        operator.configure(&container.config);
        let stage_name = container.stage_name(operator.name());
        let (next, link) = self.downstream::<O>();
        let slot = container.watermarks.lock().register(stage_name);
        let stage = BinaryStage::new(
            Box::new(operator),
            container.pools.pool::<P>(),
            container.pools.pool::<R>(),
            container.pools.pool::<O>(),
            link,
        )
        .with_watermark(slot);
        container.register_target(stage.checkpoint_target());
        let (left, right_input) = (stage.left_input(), stage.right_input());
        self.connect(left);
        right.connect(right_input);
        next
    }

    /// Merges this stream with `other`.
    pub fn union(self, other: Stream<P>) -> Stream<P> {
        self.combine(other, Union::new())
    }

    /// Keeps the events of this stream during the time no event of `other`
    /// with the same key is alive.
    pub fn where_not_exists<R, K, FL, FR>(
        self,
        other: Stream<R>,
        left_key: FL,
        right_key: FR,
    ) -> Stream<P>
    where
        R: Payload,
        K: Payload + Eq + Hash,
        FL: Fn(&P) -> K + Send + Sync + 'static,
        FR: Fn(&R) -> K + Send + Sync + 'static,
    {
        self.combine(other, WhereNotExists::new(left_key, right_key))
    }

    /// Fans this stream out to `branches` downstream streams.
    pub fn multicast(self, branches: usize) -> Vec<Stream<P>> {
        self.multicast_with_readers(branches, 0).0
    }

    /// Fans this stream out to `attached` pushed branches and `readers`
    /// pulled ones.
    ///
    /// A reader that falls a full buffer behind makes the producer's push
    /// fail with [`MulticastError::BackpressureFull`](crate::multicast::MulticastError::BackpressureFull).
    pub fn multicast_with_readers(
        self,
        attached: usize,
        readers: usize,
    ) -> (Vec<Stream<P>>, Vec<MulticastReader<P>>) {
        let (streams, links): (Vec<_>, Vec<_>) =
            (0..attached).map(|_| self.downstream::<P>()).unzip();
        let (stage, readers) = MulticastStage::new(
            self.container.config.effective_multicast_capacity(),
            links,
            readers,
        );
        self.connect(Box::new(stage));
        (streams, readers)
    }

    /// Materializes the data events flowing through this stream.
    ///
    /// `limit` caps the number of recorded events, `0` for no cap. With
    /// `coalesce_edges`, Start/End pairs are recorded as intervals.
    pub fn cache(self, limit: usize, coalesce_edges: bool) -> (CachedStream<P>, Stream<P>) {
        let (cache, cached) = Cache::new(limit, coalesce_edges);
        (cached, self.apply(cache))
    }

    /// Terminates the stream in a collecting egress.
    pub fn egress(self, policy: ReshapingPolicy) -> EgressHandle<P> {
        let (egress, handle) = Egress::collect(policy);
        self.terminate(egress, handle)
    }

    /// Terminates the stream in an egress forwarding to `observer`.
    pub fn subscribe(self, policy: ReshapingPolicy, observer: BoxedObserver<P>) -> EgressHandle<P> {
        let (egress, handle) = Egress::forward(policy, observer);
        self.terminate(egress, handle)
    }

    fn terminate(self, egress: Egress<P>, handle: EgressHandle<P>) -> EgressHandle<P> {
        let container = Arc::clone(&self.container);
        let slot = container
            .watermarks
            .lock()
            .register_egress(container.stage_name("egress"));
        container.register_target(handle.checkpoint_target());
        self.connect(Box::new(egress.with_watermark(slot)));
        container.subscriptions.fetch_add(1, Ordering::AcqRel);
        handle
    }
}

impl<P> std::fmt::Debug for Stream<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("connected", &self.target.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEvent;
    use crate::ingress::PunctuationPolicy;
    use crate::operator::{Select, Where};

    #[test]
    fn test_pipeline_runs_end_to_end() {
        let container = QueryContainer::new(EngineConfig::with_batch_size(2));
        let (input, stream) = container
            .ingress::<i64>("in", IngressConfig::default())
            .unwrap();
        let output = stream
            .apply(Where::new(|v: &i64| *v > 1))
            .apply(Select::new(|v: &i64| v * 10))
            .egress(ReshapingPolicy::None);

        input
            .push_all((1..=4).map(|t| StreamEvent::interval(t, t + 1, t).unwrap()))
            .unwrap();
        input.complete().unwrap();

        let payloads: Vec<i64> = output
            .data_events()
            .iter()
            .filter_map(|e| e.payload().copied())
            .collect();
        assert_eq!(payloads, vec![20, 30, 40]);
        assert!(output.is_completed());
        assert_eq!(container.low_watermark(), Some(crate::event::INFINITY));
    }

    #[test]
    fn test_unconsumed_stream_drops_events() {
        let container = QueryContainer::default();
        let (input, _stream) = container
            .ingress::<i64>("in", IngressConfig::default())
            .unwrap();
        input.push(StreamEvent::start(1, 1).unwrap()).unwrap();
        input.complete().unwrap();
        assert_eq!(container.subscriber_count(), 0);
    }

    #[test]
    fn test_multicast_branches_see_every_event() {
        let container = QueryContainer::default();
        let (input, stream) = container
            .ingress::<i64>("in", IngressConfig::default())
            .unwrap();
        let mut branches = stream.multicast(2);
        let second = branches.pop().unwrap().egress(ReshapingPolicy::None);
        let first = branches.pop().unwrap().egress(ReshapingPolicy::None);

        input.push(StreamEvent::interval(1, 3, 7).unwrap()).unwrap();
        input.complete().unwrap();
        assert_eq!(first.data_events(), second.data_events());
        assert_eq!(first.data_events().len(), 1);
        assert_eq!(container.subscriber_count(), 2);
    }

    #[test]
    fn test_restore_requires_subscription() {
        let container = QueryContainer::default();
        let (_input, _stream) = container
            .ingress::<i64>("in", IngressConfig::default())
            .unwrap();
        let checkpoint = container.checkpoint().unwrap();
        assert!(matches!(
            container.restore(&checkpoint),
            Err(crate::Error::Checkpoint(
                CheckpointError::RestoreBeforeSubscription
            ))
        ));
    }

    #[test]
    fn test_checkpoint_shape_must_match() {
        let build = |stateful: bool| {
            let container = QueryContainer::default();
            let (_input, stream) = container
                .ingress::<i64>("in", IngressConfig::default())
                .unwrap();
            let stream = if stateful {
                stream.cache(0, false).1
            } else {
                stream
            };
            let _ = stream.egress(ReshapingPolicy::None);
            container
        };
        let checkpoint = build(true).checkpoint().unwrap();
        let other = build(false);
        assert!(matches!(
            other.restore(&checkpoint),
            Err(crate::Error::Checkpoint(
                CheckpointError::OperatorCountMismatch { .. }
            ))
        ));
    }

    #[test]
    fn test_epoch_advances_and_restores() {
        let container = QueryContainer::default();
        let (input, stream) = container
            .ingress::<i64>(
                "in",
                IngressConfig::default().with_punctuation(PunctuationPolicy::Time { period: 5 }),
            )
            .unwrap();
        let _output = stream.egress(ReshapingPolicy::None);
        input.push(StreamEvent::start(12, 1).unwrap()).unwrap();

        let first = container.checkpoint().unwrap();
        let second = container.checkpoint().unwrap();
        assert_eq!((first.epoch, second.epoch), (1, 2));
        assert_eq!(second.watermark, Some(10));

        let bytes = first.to_bytes().unwrap();
        container.restore_from_bytes(&bytes).unwrap();
        assert_eq!(container.epoch(), 1);
    }
}
