//! Interval anti-join.
//!
//! [`WhereNotExists`] passes a left row through for exactly the spans during
//! which no right row with the same key is alive. Output is edge-based: a
//! left row gets a `Start` when it becomes visible (it arrives unblocked, or
//! the last matching right row ends) and an `End` when it becomes hidden (a
//! matching right row starts) or its own lifetime ends.
//!
//! Both inputs are merged in time order first (left before right at equal
//! times). Blocking changes are coalesced per instant in the same way as
//! [`GroupAggregate`](super::GroupAggregate): a left row that is blocked and
//! unblocked at the same instant produces no output.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use super::merge::{Merged, TwoInputMerge};
use super::{
    decode_state, encode_state, BinaryOperator, OperatorError, OperatorState, OutputBuffer,
};
use crate::event::{EventBatch, EventKind, Payload, StreamEvent, INFINITY, MIN_SYNC_TIME};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeftRow<L> {
    /// Lifetime start as seen on the input.
    start: i64,
    /// Scheduled end for interval rows.
    end: Option<i64>,
    payload: L,
    /// Start time of the currently emitted output edge.
    emitted_since: Option<i64>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "L: Serialize, R: Serialize, K: Serialize",
    deserialize = "L: serde::de::DeserializeOwned, R: serde::de::DeserializeOwned, K: serde::de::DeserializeOwned"
))]
struct Snapshot<L, R, K> {
    merge: TwoInputMerge<L, R>,
    current_time: i64,
    left_rows: Vec<(K, Vec<LeftRow<L>>)>,
    right_open: Vec<(K, u64)>,
    left_ends: Vec<(i64, Vec<K>)>,
    right_ends: Vec<(i64, Vec<K>)>,
    dirty: Vec<K>,
}

type KeyFn<P, K> = Box<dyn Fn(&P) -> K + Send + Sync>;

/// Left rows with no concurrently alive right row of the same key.
pub struct WhereNotExists<L, R, K> {
    left_key: KeyFn<L, K>,
    right_key: KeyFn<R, K>,
    merge: TwoInputMerge<L, R>,
    current_time: i64,
    left_rows: FxHashMap<K, Vec<LeftRow<L>>>,
    /// Number of alive right rows per key.
    right_open: FxHashMap<K, u64>,
    left_ends: BTreeMap<i64, Vec<K>>,
    right_ends: BTreeMap<i64, Vec<K>>,
    dirty: Vec<K>,
    dirty_set: FxHashSet<K>,
}

impl<L, R, K> WhereNotExists<L, R, K>
where
    L: Clone,
    R: Clone,
{
    /// Creates the anti-join from a key selector for each side.
    pub fn new<FL, FR>(left_key: FL, right_key: FR) -> Self
    where
        FL: Fn(&L) -> K + Send + Sync + 'static,
        FR: Fn(&R) -> K + Send + Sync + 'static,
    {
        Self {
            left_key: Box::new(left_key),
            right_key: Box::new(right_key),
            merge: TwoInputMerge::new(),
            current_time: MIN_SYNC_TIME,
            left_rows: FxHashMap::default(),
            right_open: FxHashMap::default(),
            left_ends: BTreeMap::new(),
            right_ends: BTreeMap::new(),
            dirty: Vec::new(),
            dirty_set: FxHashSet::default(),
        }
    }
}

impl<L, R, K> WhereNotExists<L, R, K>
where
    L: Payload,
    R: Payload,
    K: Payload + Eq + Hash,
{
    fn mark_dirty(&mut self, key: &K) {
        if self.dirty_set.insert(key.clone()) {
            self.dirty.push(key.clone());
        }
    }

    fn flush(&mut self, time: i64, output: &mut OutputBuffer<L>) {
        if self.dirty.is_empty() {
            return;
        }
        self.dirty_set.clear();
        for key in std::mem::take(&mut self.dirty) {
            let blocked = self.right_open.get(&key).copied().unwrap_or(0) > 0;
            if !blocked {
                self.right_open.remove(&key);
            }
            let Some(rows) = self.left_rows.get_mut(&key) else {
                continue;
            };
            for row in rows.iter_mut() {
                match (blocked, row.emitted_since) {
                    (true, Some(since)) => {
                        output.push(StreamEvent::data_unchecked(
                            EventKind::End,
                            time,
                            since,
                            row.payload.clone(),
                        ));
                        row.emitted_since = None;
                    }
                    (false, None) => {
                        output.push(StreamEvent::data_unchecked(
                            EventKind::Start,
                            time,
                            INFINITY,
                            row.payload.clone(),
                        ));
                        row.emitted_since = Some(time);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Ends every left row of `key` scheduled to end at `time`.
    fn close_left_rows(&mut self, key: &K, time: i64, output: &mut OutputBuffer<L>) {
        let Some(rows) = self.left_rows.get_mut(key) else {
            return;
        };
        rows.retain(|row| {
            if row.end != Some(time) {
                return true;
            }
            if let Some(since) = row.emitted_since {
                output.push(StreamEvent::data_unchecked(
                    EventKind::End,
                    time,
                    since,
                    row.payload.clone(),
                ));
            }
            false
        });
        if rows.is_empty() {
            self.left_rows.remove(key);
        }
    }

    fn close_right_row(&mut self, key: &K) {
        if let Some(count) = self.right_open.get_mut(key) {
            *count = count.saturating_sub(1);
        } else {
            tracing::warn!(time = self.current_time, "right retraction for unknown key ignored");
        }
        self.mark_dirty(key);
    }

    fn advance_to(&mut self, time: i64, output: &mut OutputBuffer<L>) {
        if time <= self.current_time {
            return;
        }
        self.flush(self.current_time, output);

        loop {
            let next_left = self.left_ends.keys().next().copied();
            let next_right = self.right_ends.keys().next().copied();
            let next = match (next_left, next_right) {
                (Some(l), Some(r)) => l.min(r),
                (Some(l), None) => l,
                (None, Some(r)) => r,
                (None, None) => break,
            };
            if next > time {
                break;
            }
            if let Some(keys) = self.right_ends.remove(&next) {
                for key in &keys {
                    self.close_right_row(key);
                }
            }
            if let Some(keys) = self.left_ends.remove(&next) {
                for key in &keys {
                    self.close_left_rows(key, next, output);
                }
            }
            self.current_time = next;
            if next < time {
                self.flush(next, output);
            }
        }
        self.current_time = time;
    }

    fn on_left(&mut self, event: StreamEvent<L>, output: &mut OutputBuffer<L>) {
        self.advance_to(event.sync_time(), output);
        let kind = event.kind();
        let (sync, other) = (event.sync_time(), event.other_time());
        let Some(payload) = event.into_payload() else {
            return;
        };
        let key = (self.left_key)(&payload);
        match kind {
            EventKind::Start | EventKind::Interval => {
                let end = (kind == EventKind::Interval).then_some(other);
                if let Some(end) = end {
                    self.left_ends.entry(end).or_default().push(key.clone());
                }
                self.left_rows.entry(key.clone()).or_default().push(LeftRow {
                    start: sync,
                    end,
                    payload,
                    emitted_since: None,
                });
                self.mark_dirty(&key);
            }
            EventKind::End => {
                let Some(rows) = self.left_rows.get_mut(&key) else {
                    tracing::warn!(time = sync, "left end edge without open row ignored");
                    return;
                };
                let Some(idx) = rows
                    .iter()
                    .position(|r| r.end.is_none() && r.start == other && r.payload == payload)
                else {
                    tracing::warn!(time = sync, "left end edge without open row ignored");
                    return;
                };
                let row = rows.remove(idx);
                if rows.is_empty() {
                    self.left_rows.remove(&key);
                }
                if let Some(since) = row.emitted_since {
                    output.push(StreamEvent::data_unchecked(EventKind::End, sync, since, payload));
                }
            }
            EventKind::Punctuation => {}
        }
    }

    fn on_right(&mut self, event: StreamEvent<R>, output: &mut OutputBuffer<L>) {
        self.advance_to(event.sync_time(), output);
        let Some(payload) = event.payload() else {
            return;
        };
        let key = (self.right_key)(payload);
        match event.kind() {
            EventKind::Start | EventKind::Interval => {
                *self.right_open.entry(key.clone()).or_insert(0) += 1;
                if event.is_interval() {
                    self.right_ends
                        .entry(event.other_time())
                        .or_default()
                        .push(key.clone());
                }
                self.mark_dirty(&key);
            }
            EventKind::End => self.close_right_row(&key),
            EventKind::Punctuation => {}
        }
    }

    fn emit(&mut self, output: &mut OutputBuffer<L>) {
        for merged in self.merge.drain() {
            match merged {
                Merged::Left(event) => self.on_left(event, output),
                Merged::Right(event) => self.on_right(event, output),
                Merged::Punctuation(t) => {
                    self.advance_to(t, output);
                    output.push_punctuation(t);
                }
            }
        }
        if self.merge.is_completed() {
            self.advance_to(INFINITY, output);
        }
    }
}

impl<L, R, K> fmt::Debug for WhereNotExists<L, R, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhereNotExists")
            .field("current_time", &self.current_time)
            .field("left_keys", &self.left_rows.len())
            .field("right_keys", &self.right_open.len())
            .finish_non_exhaustive()
    }
}

impl<L, R, K> BinaryOperator<L, R, L> for WhereNotExists<L, R, K>
where
    L: Payload,
    R: Payload,
    K: Payload + Eq + Hash,
{
    fn name(&self) -> &'static str {
        "where_not_exists"
    }

    fn process_left(
        &mut self,
        batch: &EventBatch<L>,
        output: &mut OutputBuffer<L>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            self.merge.push_left(event);
        }
        self.emit(output);
        Ok(())
    }

    fn process_right(
        &mut self,
        batch: &EventBatch<R>,
        output: &mut OutputBuffer<L>,
    ) -> Result<(), OperatorError> {
        for event in batch {
            self.merge.push_right(event);
        }
        self.emit(output);
        Ok(())
    }

    fn on_left_completed(&mut self, output: &mut OutputBuffer<L>) -> Result<(), OperatorError> {
        self.merge.complete_left();
        self.emit(output);
        Ok(())
    }

    fn on_right_completed(&mut self, output: &mut OutputBuffer<L>) -> Result<(), OperatorError> {
        self.merge.complete_right();
        self.emit(output);
        Ok(())
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        let snapshot = Snapshot {
            merge: self.merge.clone(),
            current_time: self.current_time,
            left_rows: self
                .left_rows
                .iter()
                .map(|(k, rows)| (k.clone(), rows.clone()))
                .collect(),
            right_open: self.right_open.iter().map(|(k, n)| (k.clone(), *n)).collect(),
            left_ends: self
                .left_ends
                .iter()
                .map(|(t, ks)| (*t, ks.clone()))
                .collect(),
            right_ends: self
                .right_ends
                .iter()
                .map(|(t, ks)| (*t, ks.clone()))
                .collect(),
            dirty: self.dirty.clone(),
        };
        encode_state(self.name(), &snapshot)
    }

    fn restore(&mut self, state: OperatorState) -> Result<(), OperatorError> {
        let snapshot: Snapshot<L, R, K> = decode_state(self.name(), &state)?;
        self.merge = snapshot.merge;
        self.current_time = snapshot.current_time;
        self.left_rows = snapshot.left_rows.into_iter().collect();
        self.right_open = snapshot.right_open.into_iter().collect();
        self.left_ends = snapshot.left_ends.into_iter().collect();
        self.right_ends = snapshot.right_ends.into_iter().collect();
        self.dirty_set = snapshot.dirty.iter().cloned().collect();
        self.dirty = snapshot.dirty;
        Ok(())
    }
}
