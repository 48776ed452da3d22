//! Grouped snapshot aggregation.
//!
//! [`GroupAggregate`] keeps one accumulator per group key and emits, for each
//! key, the aggregate value over every maximal span during which the set of
//! contributing events was stable. A snapshot is emitted as a `Start` when it
//! opens and an `End` (carrying the old value) when it is superseded.
//!
//! ## Emission cadence
//!
//! Changes are coalesced per instant. A key touched at time `t` is marked
//! dirty; its snapshot is only recomputed once time moves past `t`, either by
//! a later data event, a punctuation, or a scheduled interval end. So three
//! Starts at `t = 0` produce one `Start(0, 3)` instead of three snapshots.
//!
//! Within a key, the `End` of the previous snapshot always precedes the
//! `Start` of the next one at the same instant. Across keys, snapshots are
//! emitted in the order the keys were first touched since the last flush.
//!
//! ## Group lifecycle
//!
//! A group is created on the first contribution for its key and destroyed
//! once all contributions are retracted: its open snapshot is closed with an
//! `End` and no new `Start` follows.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::aggregate::Aggregate;
use super::{decode_state, encode_state, Operator, OperatorError, OperatorState, OutputBuffer};
use crate::event::{EventBatch, EventKind, Payload, StreamEvent, INFINITY, MIN_SYNC_TIME};

/// A grouped aggregate result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grouped<K, V> {
    /// Group key.
    pub key: K,
    /// Aggregate value.
    pub value: V,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Groups created.
    pub groups_created: u64,
    /// Groups destroyed after their last retraction.
    pub groups_closed: u64,
    /// Snapshot edges emitted (Start and End).
    pub edges_emitted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupState<S, O> {
    state: S,
    contributions: u64,
    /// Start time and value of the currently open snapshot.
    open: Option<(i64, O)>,
    dirty: bool,
}

#[derive(Serialize, Deserialize)]
struct Snapshot<K, S, O, P> {
    current_time: i64,
    groups: Vec<(K, GroupState<S, O>)>,
    dirty: Vec<K>,
    pending_ends: Vec<(i64, Vec<P>)>,
    stats: AggregateStats,
}

type KeyFn<P, K> = Box<dyn Fn(&P) -> K + Send + Sync>;
type ResultFn<K, V, O> = Box<dyn Fn(&K, V) -> O + Send + Sync>;

/// Grouped incremental aggregation with snapshot semantics.
///
/// # Type Parameters
///
/// * `P` - Input payload
/// * `K` - Group key
/// * `A` - The aggregate
/// * `O` - Output payload built from the key and the aggregate value
pub struct GroupAggregate<P, K, A: Aggregate<Input = P>, O> {
    key_fn: KeyFn<P, K>,
    aggregate: A,
    result_fn: ResultFn<K, A::Output, O>,
    groups: FxHashMap<K, GroupState<A::State, O>>,
    /// Keys touched since the last flush, in first-touch order.
    dirty: Vec<K>,
    /// Retractions scheduled by interval ends.
    pending_ends: BTreeMap<i64, SmallVec<[P; 4]>>,
    current_time: i64,
    stats: AggregateStats,
}

impl<P, A> GroupAggregate<P, (), A, A::Output>
where
    A: Aggregate<Input = P>,
{
    /// Aggregates the whole stream as a single group.
    pub fn ungrouped(aggregate: A) -> Self {
        Self::new(|_: &P| (), aggregate, |_, value| value)
    }
}

impl<P, K, A> GroupAggregate<P, K, A, Grouped<K, A::Output>>
where
    A: Aggregate<Input = P>,
    K: Clone + 'static,
{
    /// Aggregates per key, emitting [`Grouped`] results.
    pub fn grouped<F>(key_fn: F, aggregate: A) -> Self
    where
        F: Fn(&P) -> K + Send + Sync + 'static,
    {
        Self::new(key_fn, aggregate, |key: &K, value| Grouped {
            key: key.clone(),
            value,
        })
    }
}

impl<P, K, A, O> GroupAggregate<P, K, A, O>
where
    A: Aggregate<Input = P>,
{
    /// Creates a grouped aggregate.
    ///
    /// # Arguments
    ///
    /// * `key_fn` - Extracts the group key from a payload
    /// * `aggregate` - The incremental aggregate
    /// * `result_fn` - Builds the output payload, run only at emission
    pub fn new<F, R>(key_fn: F, aggregate: A, result_fn: R) -> Self
    where
        F: Fn(&P) -> K + Send + Sync + 'static,
        R: Fn(&K, A::Output) -> O + Send + Sync + 'static,
    {
        Self {
            key_fn: Box::new(key_fn),
            aggregate,
            result_fn: Box::new(result_fn),
            groups: FxHashMap::default(),
            dirty: Vec::new(),
            pending_ends: BTreeMap::new(),
            current_time: MIN_SYNC_TIME,
            stats: AggregateStats::default(),
        }
    }

    /// Number of live groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Operator counters.
    #[must_use]
    pub fn stats(&self) -> AggregateStats {
        self.stats
    }
}

impl<P, K, A, O> GroupAggregate<P, K, A, O>
where
    P: Payload,
    K: Payload + Eq + Hash,
    A: Aggregate<Input = P>,
    O: Payload,
{
    fn contribute(&mut self, payload: &P) {
        let key = (self.key_fn)(payload);
        let stats = &mut self.stats;
        let aggregate = &self.aggregate;
        let group = self.groups.entry(key.clone()).or_insert_with(|| {
            stats.groups_created += 1;
            GroupState {
                state: aggregate.initial_state(),
                contributions: 0,
                open: None,
                dirty: false,
            }
        });
        group.contributions += 1;
        aggregate.accumulate(&mut group.state, payload);
        if !group.dirty {
            group.dirty = true;
            self.dirty.push(key);
        }
    }

    fn retract(&mut self, payload: &P) {
        let key = (self.key_fn)(payload);
        let Some(group) = self.groups.get_mut(&key) else {
            tracing::warn!(time = self.current_time, "retraction for unknown group ignored");
            return;
        };
        group.contributions = group.contributions.saturating_sub(1);
        self.aggregate.deaccumulate(&mut group.state, payload);
        if !group.dirty {
            group.dirty = true;
            self.dirty.push(key);
        }
    }

    fn flush(&mut self, time: i64, output: &mut OutputBuffer<O>) {
        if self.dirty.is_empty() {
            return;
        }
        let dirty = std::mem::take(&mut self.dirty);
        tracing::debug!(time, groups = dirty.len(), "flushing aggregate snapshots");
        for key in dirty {
            let Some(group) = self.groups.get_mut(&key) else {
                continue;
            };
            group.dirty = false;

            if group.contributions == 0 {
                if let Some((start, value)) = group.open.take() {
                    output.push(StreamEvent::data_unchecked(EventKind::End, time, start, value));
                    self.stats.edges_emitted += 1;
                }
                self.groups.remove(&key);
                self.stats.groups_closed += 1;
                continue;
            }

            let value = (self.result_fn)(&key, self.aggregate.compute_result(&group.state));
            match group.open.take() {
                Some((start, old)) if old == value => {
                    group.open = Some((start, old));
                    continue;
                }
                Some((start, old)) => {
                    output.push(StreamEvent::data_unchecked(EventKind::End, time, start, old));
                    self.stats.edges_emitted += 1;
                }
                None => {}
            }
            output.push(StreamEvent::data_unchecked(
                EventKind::Start,
                time,
                INFINITY,
                value.clone(),
            ));
            self.stats.edges_emitted += 1;
            group.open = Some((time, value));
        }
    }

    /// Moves the operator's clock to `time`.
    ///
    /// Changes pending at the current instant are flushed, then every
    /// scheduled interval end before `time` is retracted and flushed at its
    /// own instant. Ends exactly at `time` are retracted but left dirty so
    /// they coalesce with whatever else happens at `time`.
    fn advance_to(&mut self, time: i64, output: &mut OutputBuffer<O>) {
        if time <= self.current_time {
            return;
        }
        self.flush(self.current_time, output);

        while let Some(entry) = self.pending_ends.first_entry() {
            let end = *entry.key();
            if end > time {
                break;
            }
            let payloads = entry.remove();
            for payload in &payloads {
                self.retract(payload);
            }
            self.current_time = end;
            if end < time {
                self.flush(end, output);
            }
        }
        self.current_time = time;
    }

    fn on_data(&mut self, event: &StreamEvent<P>, output: &mut OutputBuffer<O>) {
        let Some(payload) = event.payload() else {
            return;
        };
        self.advance_to(event.sync_time(), output);
        match event.kind() {
            EventKind::Start => self.contribute(payload),
            EventKind::Interval => {
                self.contribute(payload);
                self.pending_ends
                    .entry(event.other_time())
                    .or_default()
                    .push(payload.clone());
            }
            EventKind::End => self.retract(payload),
            EventKind::Punctuation => {}
        }
    }
}

impl<P, K, A: Aggregate<Input = P>, O> fmt::Debug for GroupAggregate<P, K, A, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupAggregate")
            .field("groups", &self.groups.len())
            .field("current_time", &self.current_time)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<P, K, A, O> Operator<P, O> for GroupAggregate<P, K, A, O>
where
    P: Payload,
    K: Payload + Eq + Hash,
    A: Aggregate<Input = P>,
    O: Payload,
{
    fn name(&self) -> &'static str {
        "group_aggregate"
    }

    fn process(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<O>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            if event.is_punctuation() {
                self.advance_to(event.sync_time(), output);
                output.push_punctuation(event.sync_time());
            } else {
                self.on_data(event, output);
            }
        }
        Ok(())
    }

    fn on_completed(&mut self, output: &mut OutputBuffer<O>) -> Result<(), OperatorError> {
        self.advance_to(INFINITY, output);
        Ok(())
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        let snapshot = Snapshot {
            current_time: self.current_time,
            groups: self
                .groups
                .iter()
                .map(|(k, g)| (k.clone(), g.clone()))
                .collect(),
            dirty: self.dirty.clone(),
            pending_ends: self
                .pending_ends
                .iter()
                .map(|(t, ps)| (*t, ps.to_vec()))
                .collect(),
            stats: self.stats,
        };
        encode_state(self.name(), &snapshot)
    }

    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError> {
        let snapshot: Snapshot<K, A::State, O, P> = decode_state(self.name(), &state)?;
        self.current_time = snapshot.current_time;
        self.groups = snapshot.groups.into_iter().collect();
        self.dirty = snapshot.dirty;
        self.pending_ends = snapshot
            .pending_ends
            .into_iter()
            .map(|(t, ps)| (t, SmallVec::from_vec(ps)))
            .collect();
        self.stats = snapshot.stats;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::aggregate::{CountAggregate, SumAggregate};
    use super::super::test_util::*;
    use super::*;

    fn starts(times: &[(i64, i64)]) -> Vec<StreamEvent<i64>> {
        times
            .iter()
            .map(|(t, v)| StreamEvent::start(*t, *v).unwrap())
            .collect()
    }

    #[test]
    fn test_running_count_steps_at_punctuation() {
        let mut op = GroupAggregate::ungrouped(CountAggregate::<i64>::new());
        let mut out = output();

        let mut events = starts(&[(0, 1), (0, 2), (0, 3)]);
        events.push(StreamEvent::punctuation(1));
        events.extend(starts(&[(1, 4), (1, 5), (1, 6)]));
        events.push(StreamEvent::punctuation(2));
        events.extend(starts(&[(2, 7), (2, 8), (2, 9)]));
        op.process(&batch(events), &mut out).unwrap();
        op.on_completed(&mut out).unwrap();

        let data: Vec<_> = out.drain_events().into_iter().filter(StreamEvent::is_data).collect();
        assert_eq!(
            render(&data),
            vec![
                "Start(0, 3)",
                "End(1, 0, 3)",
                "Start(1, 6)",
                "End(2, 1, 6)",
                "Start(2, 9)"
            ]
        );
    }

    #[test]
    fn test_group_closes_when_last_contribution_retracted() {
        let mut op = GroupAggregate::grouped(|v: &i64| v % 2, SumAggregate::new(|v: &i64| *v));
        let mut out = output();
        op.process(
            &batch(vec![
                StreamEvent::start(1, 4).unwrap(),
                StreamEvent::interval(1, 3, 5).unwrap(),
                StreamEvent::end(5, 1, 4).unwrap(),
                StreamEvent::punctuation(6),
            ]),
            &mut out,
        )
        .unwrap();

        assert_eq!(
            render(&out.drain_events()),
            vec![
                "Start(1, Grouped { key: 0, value: 4 })",
                "Start(1, Grouped { key: 1, value: 5 })",
                "End(3, 1, Grouped { key: 1, value: 5 })",
                "End(5, 1, Grouped { key: 0, value: 4 })",
                "Punctuation(6)",
            ]
        );
        assert_eq!(op.group_count(), 0);
        assert_eq!(op.stats().groups_closed, 2);
    }

    #[test]
    fn test_unchanged_value_emits_nothing() {
        let mut op = GroupAggregate::ungrouped(SumAggregate::new(|v: &i64| *v));
        let mut out = output();
        op.process(
            &batch(vec![
                StreamEvent::start(1, 2).unwrap(),
                StreamEvent::start(2, 0).unwrap(),
                StreamEvent::punctuation(3),
            ]),
            &mut out,
        )
        .unwrap();
        assert_eq!(
            render(&out.drain_events()),
            vec!["Start(1, 2)", "Punctuation(3)"]
        );
    }

    #[test]
    fn test_checkpoint_restore_resumes_snapshot() {
        let mut op = GroupAggregate::ungrouped(CountAggregate::<i64>::new());
        let mut out = output();
        op.process(
            &batch(vec![
                StreamEvent::interval(0, 10, 1).unwrap(),
                StreamEvent::start(0, 2).unwrap(),
                StreamEvent::punctuation(1),
            ]),
            &mut out,
        )
        .unwrap();
        let state = op.checkpoint().unwrap();

        let mut restored = GroupAggregate::ungrouped(CountAggregate::<i64>::new());
        restored.restore(state).unwrap();
        let mut out = output();
        restored
            .process(&batch(vec![StreamEvent::punctuation(20)]), &mut out)
            .unwrap();
        assert_eq!(
            render(&out.drain_events()),
            vec!["End(10, 0, 2)", "Start(10, 1)", "Punctuation(20)"]
        );
    }
}
