//! # Watermark Propagation
//!
//! Punctuation-driven completeness tracking across a pipeline.
//!
//! - [`PunctuationTracker`] guards the monotonicity of one stream's
//!   punctuations.
//! - [`WatermarkSlot`] is a shared cell a stage publishes its output
//!   punctuation into.
//! - [`WatermarkRegistry`] owns every slot of a container and computes the
//!   low watermark: the minimum over the egress slots. A branching pipeline
//!   is only complete up to the slowest branch.
//!
//! Slots are read from any thread but written only by the stage that owns
//! them, so a relaxed atomic max is all the synchronization they need.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::event::MIN_SYNC_TIME;

/// Monotonic punctuation guard for a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunctuationTracker {
    current: i64,
}

impl PunctuationTracker {
    /// Creates a tracker that has not seen any punctuation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: MIN_SYNC_TIME,
        }
    }

    /// Records `time`. Returns `true` if it advances the watermark.
    pub fn observe(&mut self, time: i64) -> bool {
        if time > self.current {
            self.current = time;
            true
        } else {
            false
        }
    }

    /// The highest punctuation seen.
    #[must_use]
    pub fn current(&self) -> i64 {
        self.current
    }

    /// Returns `true` once a punctuation has been observed.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.current != MIN_SYNC_TIME
    }

    /// Returns `true` if a data event at `sync_time` would arrive late.
    #[must_use]
    pub fn is_late(&self, sync_time: i64) -> bool {
        sync_time < self.current
    }
}

impl Default for PunctuationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, monotonically advancing watermark cell.
#[derive(Debug, Clone)]
pub struct WatermarkSlot {
    value: Arc<AtomicI64>,
}

impl WatermarkSlot {
    /// Creates an unset slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicI64::new(MIN_SYNC_TIME)),
        }
    }

    /// Raises the slot to `time`. Lower values are ignored.
    pub fn advance(&self, time: i64) {
        self.value.fetch_max(time, Ordering::Relaxed);
    }

    /// Current value, or `None` if nothing was published yet.
    #[must_use]
    pub fn get(&self) -> Option<i64> {
        let value = self.value.load(Ordering::Relaxed);
        (value != MIN_SYNC_TIME).then_some(value)
    }

    fn set(&self, time: i64) {
        self.value.store(time, Ordering::Relaxed);
    }
}

impl Default for WatermarkSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct RegisteredSlot {
    name: String,
    slot: WatermarkSlot,
    egress: bool,
}

/// All watermark slots of one container, in registration order.
#[derive(Debug, Default)]
pub struct WatermarkRegistry {
    slots: Vec<RegisteredSlot>,
}

impl WatermarkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an intermediate slot and returns a handle to it.
    pub fn register(&mut self, name: impl Into<String>) -> WatermarkSlot {
        self.insert(name.into(), false)
    }

    /// Registers a slot that takes part in the low watermark.
    pub fn register_egress(&mut self, name: impl Into<String>) -> WatermarkSlot {
        self.insert(name.into(), true)
    }

    fn insert(&mut self, name: String, egress: bool) -> WatermarkSlot {
        let slot = WatermarkSlot::new();
        self.slots.push(RegisteredSlot {
            name,
            slot: slot.clone(),
            egress,
        });
        slot
    }

    /// Watermark of the first slot registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<i64> {
        self.slots
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.slot.get())
    }

    /// Minimum watermark over the egress slots.
    ///
    /// Returns `None` if there is no egress or one of them has not seen a
    /// punctuation yet.
    #[must_use]
    pub fn low_watermark(&self) -> Option<i64> {
        let mut low: Option<i64> = None;
        for registered in self.slots.iter().filter(|s| s.egress) {
            let value = registered.slot.get()?;
            low = Some(low.map_or(value, |l| l.min(value)));
        }
        low
    }

    /// Number of registered slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no slot is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Raw slot values, indexed by registration order.
    #[must_use]
    pub fn checkpoint(&self) -> Vec<i64> {
        self.slots
            .iter()
            .map(|s| s.slot.get().unwrap_or(MIN_SYNC_TIME))
            .collect()
    }

    /// Restores slot values from [`checkpoint`](Self::checkpoint).
    ///
    /// Extra values are ignored; slots without a value keep theirs.
    pub fn restore(&self, values: &[i64]) {
        for (registered, &value) in self.slots.iter().zip(values) {
            registered.slot.set(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_is_monotonic() {
        let mut tracker = PunctuationTracker::new();
        assert!(!tracker.is_set());
        assert!(tracker.observe(5));
        assert!(!tracker.observe(5));
        assert!(!tracker.observe(3));
        assert_eq!(tracker.current(), 5);
        assert!(tracker.is_late(4));
        assert!(!tracker.is_late(5));
    }

    #[test]
    fn test_slot_ignores_lower_values() {
        let slot = WatermarkSlot::new();
        assert_eq!(slot.get(), None);
        slot.advance(10);
        slot.advance(7);
        assert_eq!(slot.get(), Some(10));

        let shared = slot.clone();
        shared.advance(12);
        assert_eq!(slot.get(), Some(12));
    }

    #[test]
    fn test_low_watermark_is_min_over_egress() {
        let mut registry = WatermarkRegistry::new();
        let inner = registry.register("aggregate");
        let a = registry.register_egress("a");
        let b = registry.register_egress("b");

        inner.advance(100);
        a.advance(20);
        assert_eq!(registry.low_watermark(), None);

        b.advance(15);
        assert_eq!(registry.low_watermark(), Some(15));
        b.advance(40);
        assert_eq!(registry.low_watermark(), Some(20));
        assert_eq!(registry.get("aggregate"), Some(100));
    }

    #[test]
    fn test_checkpoint_restores_slot_values() {
        let mut registry = WatermarkRegistry::new();
        let slot = registry.register_egress("out");
        slot.advance(9);
        let saved = registry.checkpoint();

        let mut fresh = WatermarkRegistry::new();
        let restored = fresh.register_egress("out");
        fresh.restore(&saved);
        assert_eq!(restored.get(), Some(9));
        assert_eq!(fresh.low_watermark(), Some(9));
    }
}
