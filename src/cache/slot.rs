//! Cache slot records.
//!
//! A slot stands for one fixed-capacity buffer of attention state in the
//! model's KV cache. The slot pool owns every slot; this module only holds
//! the bookkeeping for one of them.

use std::time::Instant;

use crate::cache::input::Input;

/// Stable identity of a slot: its index in the pool.
pub type SlotId = usize;

/// One cache slot and its usage metadata.
#[derive(Debug, Clone)]
pub struct CacheSlot {
    /// Identity assigned at pool construction.
    pub id: SlotId,

    /// Inputs whose cached state is currently valid in this slot.
    pub inputs: Vec<Input>,

    /// Whether a request currently owns the slot.
    pub in_use: bool,

    /// Time of the most recent release, `None` if the slot was never released.
    /// `None` sorts before any instant, so untouched slots are evicted first.
    pub last_released: Option<Instant>,
}

impl CacheSlot {
    /// Create an empty, free slot.
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            inputs: Vec::new(),
            in_use: false,
            last_released: None,
        }
    }

    /// Number of resident inputs.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Whether the slot can be handed to a new request.
    pub fn is_free(&self) -> bool {
        !self.in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slot_is_empty_and_free() {
        let slot = CacheSlot::new(3);
        assert_eq!(slot.id, 3);
        assert!(slot.is_empty());
        assert!(slot.is_free());
        assert!(slot.last_released.is_none());
    }

    #[test]
    fn test_never_released_sorts_first() {
        let released = Some(Instant::now());
        assert!(None < released);
    }
}
