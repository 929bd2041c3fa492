//! kv-slot-cache: prefix-cache slot management for LLM inference.
//!
//! Decides which KV-cache slot backs each generation request so that
//! computed attention state for shared prompt prefixes is reused:
//!   prefix matching → slot selection (longest / best match) → fork or evict
//!   → context shift when a sequence outgrows its slot.

pub mod cache;
pub mod config;
pub mod scheduler;

pub use cache::error::SlotError;
pub use cache::input::{Input, TokenId};
pub use cache::pool::{new_shared_pool, LoadedSlot, PoolStats, SharedSlotPool, SlotPool};
pub use cache::prefix::common_prefix_len;
pub use cache::selector::{SlotPolicy, SlotSelection};
pub use cache::shift::{shift_discard_count, ShiftOutcome};
pub use cache::slot::{CacheSlot, SlotId};
