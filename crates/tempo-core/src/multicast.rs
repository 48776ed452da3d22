//! # Multicast
//!
//! Fan-out of one stream to several independently consumed branches.
//!
//! [`MulticastBuffer`] is a bounded ring of reference-counted slots with one
//! read cursor per branch. Every published value is seen by every branch in
//! publish order; a slot is freed when its last branch consumes it, and that
//! branch receives the value by move rather than by clone. For
//! [`SharedBatch`]es this means the last branch holds the only reference and
//! can hand the batch back to its pool.
//!
//! [`MulticastStage`] pushes each batch to the attached branch observers
//! immediately. Detached branches read through a [`MulticastReader`] at
//! their own pace; when the slowest reader still holds the slot the next
//! publish needs, the publish fails with [`MulticastError::BackpressureFull`].
//!
//! Branches only ever receive shared references, so no branch can mutate a
//! batch another branch is reading.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::{SharedBatch, StreamEvent};
use crate::pipeline::{BoxedObserver, Observer};

/// Multicast errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MulticastError {
    /// The slowest branch has not released the slot the next value needs.
    #[error("multicast buffer full: a branch has not consumed {capacity} pending batches")]
    BackpressureFull {
        /// Slots in the ring.
        capacity: usize,
    },

    /// A branch index past the configured branch count.
    #[error("branch {index} out of range ({count} branches)")]
    BranchOutOfRange {
        /// Requested branch.
        index: usize,
        /// Number of branches.
        count: usize,
    },
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    /// Branches that still have to read this slot.
    pending: usize,
}

#[derive(Debug)]
struct Ring<T> {
    slots: VecDeque<Slot<T>>,
    /// Sequence number of `slots[0]`.
    base: u64,
    read_positions: Vec<u64>,
    closed: bool,
}

impl<T> Ring<T> {
    fn write_position(&self) -> u64 {
        self.base + self.slots.len() as u64
    }

    fn reclaim(&mut self) {
        while self.slots.front().is_some_and(|s| s.pending == 0) {
            self.slots.pop_front();
            self.base += 1;
        }
    }
}

/// Bounded single-producer, multi-consumer buffer with per-slot refcounts.
#[derive(Debug)]
pub struct MulticastBuffer<T> {
    ring: Mutex<Ring<T>>,
    capacity: usize,
    branch_count: usize,
}

impl<T: Clone> MulticastBuffer<T> {
    /// Creates a buffer with `capacity` slots (at least one) for
    /// `branch_count` branches.
    #[must_use]
    pub fn new(capacity: usize, branch_count: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: VecDeque::with_capacity(capacity),
                base: 0,
                read_positions: vec![0; branch_count],
                closed: false,
            }),
            capacity,
            branch_count,
        }
    }

    /// Publishes a value to every branch.
    ///
    /// # Errors
    ///
    /// Returns [`MulticastError::BackpressureFull`] if every slot is still
    /// held by some branch. The value is not published.
    pub fn publish(&self, value: T) -> Result<(), MulticastError> {
        if self.branch_count == 0 {
            return Ok(());
        }
        let mut ring = self.ring.lock();
        if ring.slots.len() >= self.capacity {
            return Err(MulticastError::BackpressureFull {
                capacity: self.capacity,
            });
        }
        ring.slots.push_back(Slot {
            value,
            pending: self.branch_count,
        });
        Ok(())
    }

    /// Takes the next value for `branch`, or `None` if it is caught up.
    ///
    /// # Errors
    ///
    /// Returns [`MulticastError::BranchOutOfRange`] for an unknown branch.
    pub fn consume(&self, branch: usize) -> Result<Option<T>, MulticastError> {
        if branch >= self.branch_count {
            return Err(MulticastError::BranchOutOfRange {
                index: branch,
                count: self.branch_count,
            });
        }
        let mut ring = self.ring.lock();
        let position = ring.read_positions[branch];
        if position >= ring.write_position() {
            return Ok(None);
        }
        #[allow(clippy::cast_possible_truncation)]
        let offset = (position - ring.base) as usize;
        ring.read_positions[branch] = position + 1;

        let slot = &mut ring.slots[offset];
        slot.pending -= 1;
        if slot.pending > 0 || offset > 0 {
            let value = slot.value.clone();
            ring.reclaim();
            return Ok(Some(value));
        }
        // Last reader of the oldest slot: move the value out.
        ring.base += 1;
        let value = ring.slots.pop_front().map(|s| s.value);
        ring.reclaim();
        Ok(value)
    }

    /// Marks the stream finished. Readers still drain what was published.
    pub fn close(&self) {
        self.ring.lock().closed = true;
    }

    /// Returns `true` if the buffer is closed and `branch` has read everything.
    #[must_use]
    pub fn is_drained(&self, branch: usize) -> bool {
        let ring = self.ring.lock();
        ring.closed
            && ring
                .read_positions
                .get(branch)
                .map_or(true, |&p| p >= ring.write_position())
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of branches.
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.branch_count
    }

    /// Values published and not yet read by every branch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.ring.lock().slots.len()
    }

    /// Total values published.
    #[must_use]
    pub fn write_position(&self) -> u64 {
        self.ring.lock().write_position()
    }
}

/// Pipeline stage fanning its input out to several branches.
///
/// Branches `0..attached` are observers pushed to synchronously, in branch
/// order; the remaining branches are [`MulticastReader`]s.
pub struct MulticastStage<P> {
    buffer: Arc<MulticastBuffer<SharedBatch<P>>>,
    attached: Vec<BoxedObserver<P>>,
    completed: bool,
}

impl<P> MulticastStage<P> {
    /// Creates the stage and one reader per detached branch.
    #[must_use]
    pub fn new(
        capacity: usize,
        attached: Vec<BoxedObserver<P>>,
        readers: usize,
    ) -> (Self, Vec<MulticastReader<P>>) {
        let branch_count = attached.len() + readers;
        let buffer = Arc::new(MulticastBuffer::new(capacity, branch_count));
        let readers = (attached.len()..branch_count)
            .map(|branch| MulticastReader {
                buffer: Arc::clone(&buffer),
                branch,
            })
            .collect();
        (
            Self {
                buffer,
                attached,
                completed: false,
            },
            readers,
        )
    }

    /// The underlying buffer.
    #[must_use]
    pub fn buffer(&self) -> &Arc<MulticastBuffer<SharedBatch<P>>> {
        &self.buffer
    }
}

impl<P: Send + Sync + 'static> Observer<P> for MulticastStage<P> {
    fn on_batch(&mut self, batch: SharedBatch<P>) -> crate::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.buffer.publish(batch)?;
        for (branch, observer) in self.attached.iter_mut().enumerate() {
            if let Some(shared) = self.buffer.consume(branch)? {
                observer.on_batch(shared)?;
            }
        }
        Ok(())
    }

    fn on_completed(&mut self) -> crate::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        self.buffer.close();
        for observer in &mut self.attached {
            observer.on_completed()?;
        }
        Ok(())
    }
}

/// Detached multicast branch, read at its own pace.
pub struct MulticastReader<P> {
    buffer: Arc<MulticastBuffer<SharedBatch<P>>>,
    branch: usize,
}

impl<P> MulticastReader<P> {
    /// Index of this branch in the buffer.
    #[must_use]
    pub fn branch(&self) -> usize {
        self.branch
    }

    /// Next pending batch, if any.
    #[must_use]
    pub fn next_batch(&self) -> Option<SharedBatch<P>> {
        self.buffer.consume(self.branch).ok().flatten()
    }

    /// Reads every pending batch and returns their events.
    #[must_use]
    pub fn drain_events(&self) -> Vec<StreamEvent<P>>
    where
        P: Clone,
    {
        let mut events = Vec::new();
        while let Some(batch) = self.next_batch() {
            events.extend(batch.iter().cloned());
        }
        events
    }

    /// Returns `true` once the source completed and this branch read everything.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.buffer.is_drained(self.branch)
    }
}

impl<P> Iterator for MulticastReader<P> {
    type Item = SharedBatch<P>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

impl<P> std::fmt::Debug for MulticastReader<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastReader")
            .field("branch", &self.branch)
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}
