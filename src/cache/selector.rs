//! Slot selection policies: decide which slot should back a new prompt.
//!
//! Two policies are available:
//! - **Longest match**: reuse the free slot sharing the longest prefix with
//!   the prompt. Never disturbs other slots, keeps the cache footprint small.
//! - **Best match**: look at every slot, in use or not. Reuse the best one
//!   only if that wastes none of its cached inputs; otherwise fork the
//!   matching prefix into the least recently released free slot so the
//!   longer cached sequence survives for later requests.

use serde::{Deserialize, Serialize};

use crate::cache::error::SlotError;
use crate::cache::input::Input;
use crate::cache::prefix::common_prefix_len;
use crate::cache::slot::{CacheSlot, SlotId};

/// Which selection policy a pool uses when loading prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// [`find_longest_cache_slot`]; suited to a single user.
    Longest,
    /// [`find_best_cache_slot`]; better hit rates with many users.
    Best,
}

impl std::fmt::Display for SlotPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotPolicy::Longest => write!(f, "longest"),
            SlotPolicy::Best => write!(f, "best"),
        }
    }
}

/// Result of a selection: the slot to use and how many prompt inputs are
/// already computed somewhere in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSelection {
    /// Slot that should back the request.
    pub slot: SlotId,

    /// Number of leading prompt inputs that need no evaluation.
    pub prefix_len: usize,

    /// When set, the `prefix_len` inputs live in this other slot and must be
    /// copied into `slot` before they can be trusted.
    pub source: Option<SlotId>,
}

impl SlotSelection {
    /// Whether the selection requires copying a prefix from another slot.
    pub fn is_fork(&self) -> bool {
        self.source.is_some()
    }
}

/// Pick the free slot with the longest common prefix with `prompt`.
///
/// Ties go to the first slot in pool order.
pub fn find_longest_cache_slot(
    slots: &[CacheSlot],
    prompt: &[Input],
) -> Result<SlotSelection, SlotError> {
    let mut longest: Option<(SlotId, usize)> = None;

    for slot in slots.iter().filter(|s| s.is_free()) {
        let count = common_prefix_len(&slot.inputs, prompt);
        if longest.map_or(true, |(_, len)| count > len) {
            longest = Some((slot.id, count));
        }
    }

    let (slot, prefix_len) = longest.ok_or(SlotError::NoAvailableSlot)?;
    Ok(SlotSelection {
        slot,
        prefix_len,
        source: None,
    })
}

/// Pick a slot for `prompt` considering matches in every slot.
///
/// The best matching slot is used directly only when it is free and its
/// resident prefix is exactly the match. Otherwise the least recently
/// released free slot is chosen and the best match length is still
/// reported, with `source` naming the slot that holds those inputs.
pub fn find_best_cache_slot(
    slots: &[CacheSlot],
    prompt: &[Input],
) -> Result<SlotSelection, SlotError> {
    let mut best: Option<(&CacheSlot, usize)> = None;
    let mut oldest: Option<&CacheSlot> = None;

    for slot in slots {
        let count = common_prefix_len(&slot.inputs, prompt);
        if best.map_or(true, |(_, len)| count > len) {
            best = Some((slot, count));
        }

        if slot.is_free() && oldest.map_or(true, |o| slot.last_released < o.last_released) {
            oldest = Some(slot);
        }
    }

    let (best_slot, best_len) = best.ok_or(SlotError::NoAvailableSlot)?;

    if best_slot.is_free() && best_slot.len() == best_len {
        return Ok(SlotSelection {
            slot: best_slot.id,
            prefix_len: best_len,
            source: None,
        });
    }

    let target = oldest.ok_or(SlotError::NoAvailableSlot)?;
    let source = (best_len > 0 && target.id != best_slot.id).then_some(best_slot.id);

    Ok(SlotSelection {
        slot: target.id,
        prefix_len: best_len,
        source,
    })
}

/// Dispatch to the selection function for `policy`.
pub fn find_cache_slot(
    policy: SlotPolicy,
    slots: &[CacheSlot],
    prompt: &[Input],
) -> Result<SlotSelection, SlotError> {
    match policy {
        SlotPolicy::Longest => find_longest_cache_slot(slots, prompt),
        SlotPolicy::Best => find_best_cache_slot(slots, prompt),
    }
}
