//! Context shift sizing.
//!
//! When a sequence reaches its slot's context capacity, part of it has to
//! go. The first `num_keep` inputs (usually the system prompt) are
//! protected; the sizer aims to leave half of the remaining window free so
//! shifts stay infrequent.

use crate::cache::input::Input;

/// How a shift request was resolved by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShiftOutcome {
    /// The sequence still fits; nothing was discarded.
    NotNeeded,

    /// `discarded` inputs after the keep prefix were removed in place.
    Shifted { discarded: usize },

    /// The backend could not remove a range. The slot was cleared and these
    /// inputs (keep prefix plus the surviving tail) must be evaluated again.
    Reprocess { inputs: Vec<Input> },
}

/// Number of inputs following the first `num_keep` that must be discarded
/// so a sequence of `input_len` fits into `num_ctx` with room to grow.
///
/// ```text
/// target_free  = max(1, (num_ctx - num_keep) / 2)
/// current_free = num_ctx - input_len            (may be negative)
/// discard      = max(0, target_free - current_free)
/// ```
pub fn shift_discard_count(input_len: usize, num_keep: usize, num_ctx: usize) -> usize {
    let target_free = (num_ctx.saturating_sub(num_keep) / 2).max(1);
    (target_free + input_len).saturating_sub(num_ctx)
}
