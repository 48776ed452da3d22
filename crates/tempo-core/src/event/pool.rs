//! Arena of fixed-capacity batch buffers.
//!
//! A [`BatchPool`] hands out empty [`EventBatch`]es with explicit
//! checkout/return. Released buffers keep their allocation and go back on a
//! free list, so a steady-state pipeline stops allocating once every stage
//! has cycled a few batches.
//!
//! Pools are not global: a [`PoolRegistry`] is owned by the query container
//! and threaded through pipeline construction, one pool per payload type.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::{EventBatch, SharedBatch, StreamEvent};

/// Pool of batch buffers for one payload type.
///
/// # Thread Safety
///
/// Multicast branches may release batches from different threads, so the
/// free list sits behind a mutex. Checkout and return are O(1).
///
/// # Example
///
/// ```
/// use tempo_core::event::{BatchPool, StreamEvent};
///
/// let pool = BatchPool::<u32>::new(4, 8);
/// let mut batch = pool.checkout();
/// batch.push(StreamEvent::start(1, 7).unwrap()).unwrap();
/// pool.recycle(batch);
/// assert_eq!(pool.available(), 1);
///
/// // The recycled buffer comes back empty.
/// assert!(pool.checkout().is_empty());
/// ```
#[derive(Debug)]
pub struct BatchPool<P> {
    /// Capacity of every batch handed out.
    batch_capacity: usize,
    /// Maximum number of idle buffers kept.
    max_free: usize,
    /// Stack of idle buffers.
    free_list: Mutex<Vec<Vec<StreamEvent<P>>>>,
    /// Buffers allocated because the free list was empty.
    allocations: AtomicU64,
    /// Checkouts served from the free list.
    reuses: AtomicU64,
}

impl<P> BatchPool<P> {
    /// Creates an empty pool.
    ///
    /// # Arguments
    ///
    /// * `batch_capacity` - Capacity of each batch (raised to at least 1)
    /// * `max_free` - Idle buffers retained; extra returns are dropped
    #[must_use]
    pub fn new(batch_capacity: usize, max_free: usize) -> Self {
        Self {
            batch_capacity: batch_capacity.max(1),
            max_free,
            free_list: Mutex::new(Vec::with_capacity(max_free)),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// Checks out an empty batch.
    pub fn checkout(&self) -> EventBatch<P> {
        if let Some(buffer) = self.free_list.lock().pop() {
            self.reuses.fetch_add(1, Ordering::Relaxed);
            return EventBatch::from_buffer(buffer, self.batch_capacity);
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        EventBatch::with_capacity(self.batch_capacity)
    }

    /// Returns a batch to the pool.
    ///
    /// Returns `true` if the buffer was retained, `false` if it was dropped
    /// because the free list is full.
    pub fn recycle(&self, batch: EventBatch<P>) -> bool {
        let mut buffer = batch.into_events();
        buffer.clear();
        let mut free = self.free_list.lock();
        if free.len() < self.max_free {
            free.push(buffer);
            true
        } else {
            false
        }
    }

    /// Releases a shared batch.
    ///
    /// The buffer is recycled only when this was the last reference; other
    /// multicast branches still holding the batch keep it alive.
    pub fn release(&self, batch: SharedBatch<P>) -> bool {
        match Arc::try_unwrap(batch) {
            Ok(batch) => self.recycle(batch),
            Err(_) => false,
        }
    }

    /// Number of idle buffers.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Capacity of the batches handed out.
    #[inline]
    #[must_use]
    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    /// Number of buffers allocated because none were idle.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of checkouts served by a recycled buffer.
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }
}

/// One [`BatchPool`] per payload type, owned by a query container.
#[derive(Debug)]
pub struct PoolRegistry {
    batch_capacity: usize,
    max_free: usize,
    pools: Mutex<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl PoolRegistry {
    /// Creates a registry whose pools share the given sizing.
    #[must_use]
    pub fn new(batch_capacity: usize, max_free: usize) -> Self {
        Self {
            batch_capacity,
            max_free,
            pools: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the pool for payload type `P`, creating it on first use.
    #[must_use]
    pub fn pool<P: Send + Sync + 'static>(&self) -> Arc<BatchPool<P>> {
        let mut pools = self.pools.lock();
        let entry = pools
            .entry(TypeId::of::<P>())
            .or_insert_with(|| {
                Arc::new(BatchPool::<P>::new(self.batch_capacity, self.max_free))
                    as Arc<dyn Any + Send + Sync>
            })
            .clone();
        drop(pools);
        match entry.downcast::<BatchPool<P>>() {
            Ok(pool) => pool,
            // Keyed by TypeId, so the downcast cannot miss; fall back to a
            // private pool rather than panic.
            Err(_) => Arc::new(BatchPool::new(self.batch_capacity, self.max_free)),
        }
    }

    /// Number of payload types with a pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Returns true if no pool has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}
