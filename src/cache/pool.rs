//! Slot pool: owns every cache slot and coordinates their lifecycle.
//!
//! The pool is the central coordinator of the prefix cache. It:
//! - Holds a fixed number of slots sharing one context capacity
//! - Selects slots for new prompts (longest or best match)
//! - Forks cached prefixes between slots and trims stale tails
//! - Shifts a slot's context when a sequence outgrows the window
//! - Keeps usage counters for monitoring
//!
//! Every method is synchronous and short; callers share the pool through
//! [`SharedSlotPool`] so that selection and claim happen under one lock.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::backend::CacheBackend;
use crate::cache::error::SlotError;
use crate::cache::input::Input;
use crate::cache::prefix::common_prefix_len;
use crate::cache::selector::{self, SlotPolicy, SlotSelection};
use crate::cache::shift::{shift_discard_count, ShiftOutcome};
use crate::cache::slot::{CacheSlot, SlotId};
use crate::config::PoolConfig;

/// A slot handed to a request by [`SlotPool::load_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSlot {
    /// The claimed slot.
    pub slot: SlotId,

    /// Number of prompt inputs already present in the slot's cache.
    pub num_past: usize,

    /// Prompt inputs that still have to be evaluated, in order.
    pub remaining: Vec<Input>,
}

/// Cumulative counters since pool construction.
#[derive(Debug, Clone, Default)]
struct PoolCounters {
    loads: u64,
    reused_inputs: u64,
    forks: u64,
    evictions: u64,
    evicted_inputs: u64,
    shifts: u64,
    reprocessed: u64,
}

/// Point-in-time view of the pool for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub num_slots: usize,
    pub num_ctx: usize,
    pub slots_in_use: usize,
    /// Inputs resident across all slots.
    pub cached_inputs: usize,
    pub loads: u64,
    /// Prompt inputs served from cache instead of being evaluated.
    pub reused_inputs: u64,
    pub forks: u64,
    /// Loads that discarded cached inputs from the chosen slot.
    pub evictions: u64,
    pub evicted_inputs: u64,
    pub shifts: u64,
    /// Shifts the backend could not perform in place.
    pub reprocessed: u64,
}

impl PoolStats {
    /// Fraction of loaded prompt inputs that came from cache.
    pub fn reuse_ratio(&self, total_prompt_inputs: u64) -> f64 {
        if total_prompt_inputs == 0 {
            return 0.0;
        }
        self.reused_inputs as f64 / total_prompt_inputs as f64
    }
}

/// Fixed-size pool of cache slots.
pub struct SlotPool {
    /// All slots, indexed by id.
    slots: Vec<CacheSlot>,

    /// Maximum number of inputs a single slot may hold.
    num_ctx: usize,

    /// Policy used by [`SlotPool::load_slot`].
    policy: SlotPolicy,

    /// Physical cache, if any. Without one the pool only tracks metadata.
    backend: Option<Box<dyn CacheBackend>>,

    counters: PoolCounters,
}

impl SlotPool {
    /// Create a pool of `num_slots` empty slots of `num_ctx` inputs each,
    /// loading with the best-match policy.
    pub fn new(num_slots: usize, num_ctx: usize) -> Self {
        Self {
            slots: (0..num_slots).map(CacheSlot::new).collect(),
            num_ctx,
            policy: SlotPolicy::Best,
            backend: None,
            counters: PoolCounters::default(),
        }
    }

    /// Create a pool from configuration, splitting the KV cache evenly
    /// between the parallel slots.
    pub fn from_config(config: &PoolConfig) -> Result<Self, SlotError> {
        if config.num_slots == 0 {
            return Err(SlotError::InvalidConfig(
                "at least one slot is required".to_string(),
            ));
        }

        let num_ctx = config.num_ctx();
        if num_ctx < config.batch_size.max(1) {
            return Err(SlotError::InvalidConfig(format!(
                "kv size must be at least as large as batch size * parallel (kv: {} batch: {} parallel: {})",
                config.kv_size, config.batch_size, config.num_slots
            )));
        }

        let pool = Self::new(config.num_slots, num_ctx).with_policy(config.policy());
        info!(
            num_slots = config.num_slots,
            num_ctx,
            policy = %pool.policy,
            "Slot pool created"
        );
        Ok(pool)
    }

    /// Use `policy` when loading prompts.
    pub fn with_policy(mut self, policy: SlotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Mirror slot edits into a physical cache.
    pub fn with_backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Context capacity shared by all slots.
    pub fn num_ctx(&self) -> usize {
        self.num_ctx
    }

    pub fn policy(&self) -> SlotPolicy {
        self.policy
    }

    pub fn slots(&self) -> &[CacheSlot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> Option<&CacheSlot> {
        self.slots.get(id)
    }

    fn slot_mut(&mut self, id: SlotId) -> Result<&mut CacheSlot, SlotError> {
        self.slots.get_mut(id).ok_or(SlotError::UnknownSlot(id))
    }

    fn claimed_slot_mut(&mut self, id: SlotId) -> Result<&mut CacheSlot, SlotError> {
        let slot = self.slot_mut(id)?;
        if !slot.in_use {
            return Err(SlotError::SlotNotInUse(id));
        }
        Ok(slot)
    }

    // ─── Selection ──────────────────────────────────────────────────────────

    /// Longest-match selection over the free slots. Does not claim.
    pub fn find_longest_cache_slot(&self, prompt: &[Input]) -> Result<SlotSelection, SlotError> {
        selector::find_longest_cache_slot(&self.slots, prompt)
    }

    /// Best-match selection with LRU forking. Does not claim.
    pub fn find_best_cache_slot(&self, prompt: &[Input]) -> Result<SlotSelection, SlotError> {
        selector::find_best_cache_slot(&self.slots, prompt)
    }

    /// Selection with the pool's configured policy. Does not claim.
    pub fn find_cache_slot(&self, prompt: &[Input]) -> Result<SlotSelection, SlotError> {
        selector::find_cache_slot(self.policy, &self.slots, prompt)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Mark a free slot as owned by a request.
    pub fn claim(&mut self, id: SlotId) -> Result<(), SlotError> {
        let slot = self.slot_mut(id)?;
        if slot.in_use {
            return Err(SlotError::SlotInUse(id));
        }
        slot.in_use = true;
        Ok(())
    }

    /// Append freshly computed inputs to a claimed slot.
    ///
    /// Fails without appending anything if the slot would exceed the
    /// context capacity; the caller must shift first.
    pub fn extend(&mut self, id: SlotId, inputs: &[Input]) -> Result<(), SlotError> {
        let capacity = self.num_ctx;
        let slot = self.claimed_slot_mut(id)?;
        let len = slot.len() + inputs.len();
        if len > capacity {
            return Err(SlotError::CapacityExceeded {
                slot: id,
                len,
                capacity,
            });
        }
        slot.inputs.extend_from_slice(inputs);
        Ok(())
    }

    /// Shorten a claimed slot's resident prefix to at most `len` inputs.
    pub fn truncate(&mut self, id: SlotId, len: usize) -> Result<(), SlotError> {
        self.claimed_slot_mut(id)?.inputs.truncate(len);
        Ok(())
    }

    /// Replace a claimed slot's resident prefix.
    pub fn overwrite(&mut self, id: SlotId, inputs: Vec<Input>) -> Result<(), SlotError> {
        let capacity = self.num_ctx;
        let slot = self.claimed_slot_mut(id)?;
        if inputs.len() > capacity {
            return Err(SlotError::CapacityExceeded {
                slot: id,
                len: inputs.len(),
                capacity,
            });
        }
        slot.inputs = inputs;
        Ok(())
    }

    /// Return a slot to the pool, keeping its inputs cached.
    pub fn release(&mut self, id: SlotId) -> Result<(), SlotError> {
        self.release_at(id, Instant::now())
    }

    /// Return a slot to the pool, stamping it as released at `at`.
    ///
    /// Stamps never move backwards: an `at` earlier than the previous
    /// release is clamped to it.
    pub fn release_at(&mut self, id: SlotId, at: Instant) -> Result<(), SlotError> {
        let slot = self.claimed_slot_mut(id)?;
        slot.in_use = false;
        slot.last_released = Some(slot.last_released.map_or(at, |prev| prev.max(at)));
        debug!(id, inputs = slot.len(), "Released cache slot");
        Ok(())
    }

    // ─── Loading ────────────────────────────────────────────────────────────

    /// Select, prepare and claim a slot for `prompt`.
    ///
    /// The returned slot holds exactly `prompt[..num_past]`; the caller
    /// evaluates `remaining` and appends it with [`SlotPool::extend`]. When
    /// the whole prompt is cached, the last input is still returned so the
    /// model produces logits for it. With `cache_prompt` false nothing is
    /// reused.
    pub fn load_slot(&mut self, prompt: &[Input], cache_prompt: bool) -> Result<LoadedSlot, SlotError> {
        let selection = self.find_cache_slot(prompt)?;
        let id = selection.slot;

        let previous_len = self.slots[id].len();
        let matched_before = common_prefix_len(&self.slots[id].inputs, prompt);
        let mut num_past = selection.prefix_len;

        if let Some(src) = selection.source {
            if let Err(err) = self.fork_prefix(src, id, num_past) {
                warn!(src, dst = id, error = %err, "Prefix copy failed, evaluating full prompt");
                num_past = 0;
            }
        }

        self.slots[id].in_use = true;

        if !cache_prompt {
            num_past = 0;
        }

        // Leave one input to evaluate so there is something to sample from.
        if num_past > 0 && num_past == prompt.len() {
            num_past -= 1;
        }

        if let Some(backend) = self.backend.as_mut() {
            if num_past > 0 && !backend.can_resume(id, num_past) {
                num_past = 0;
            }

            if let Err(err) = backend.remove(id, num_past, None) {
                debug!(id, num_past, error = %err, "Partial cache removal failed, clearing slot");
                num_past = 0;
                if let Err(err) = backend.remove(id, 0, None) {
                    let slot = &mut self.slots[id];
                    slot.in_use = false;
                    slot.inputs.clear();
                    return Err(err.into());
                }
            }
        }

        let slot = &mut self.slots[id];
        slot.inputs.clear();
        slot.inputs.extend_from_slice(&prompt[..num_past]);

        let evicted = previous_len - matched_before.min(num_past);
        if evicted > 0 {
            debug!(id, inputs = previous_len, evicted, "Evicting cache slot");
            self.counters.evictions += 1;
            self.counters.evicted_inputs += evicted as u64;
        }

        self.counters.loads += 1;
        self.counters.reused_inputs += num_past as u64;

        debug!(
            id,
            cache = previous_len,
            prompt = prompt.len(),
            used = num_past,
            remaining = prompt.len() - num_past,
            "Loading cache slot"
        );

        Ok(LoadedSlot {
            slot: id,
            num_past,
            remaining: prompt[num_past..].to_vec(),
        })
    }

    /// Give `dst` the first `len` inputs of `src`.
    fn fork_prefix(&mut self, src: SlotId, dst: SlotId, len: usize) -> Result<(), SlotError> {
        debug!(
            src,
            dst,
            inputs = len,
            total = self.slots[src].len(),
            "Forking cache slot"
        );

        if let Some(backend) = self.backend.as_mut() {
            backend.copy_prefix(src, dst, len)?;
        }

        let prefix = self.slots[src].inputs[..len].to_vec();
        self.slots[dst].inputs = prefix;
        self.counters.forks += 1;
        Ok(())
    }

    // ─── Context shift ──────────────────────────────────────────────────────

    /// Discard count for a sequence of `input_len` in this pool's slots.
    pub fn shift_discard(&self, input_len: usize, num_keep: usize) -> usize {
        shift_discard_count(input_len, num_keep, self.num_ctx)
    }

    /// Make room in a slot by dropping inputs after the first `num_keep`.
    ///
    /// If the backend cannot remove a range, the slot is emptied and the
    /// surviving inputs are handed back for re-evaluation.
    pub fn shift_slot(&mut self, id: SlotId, num_keep: usize) -> Result<ShiftOutcome, SlotError> {
        let num_ctx = self.num_ctx;
        let input_len = self.claimed_slot_mut(id)?.len();

        if num_keep >= num_ctx {
            return Err(SlotError::KeepExceedsContext {
                keep: num_keep,
                capacity: num_ctx,
            });
        }

        let discard = shift_discard_count(input_len, num_keep, num_ctx);
        if discard == 0 {
            return Ok(ShiftOutcome::NotNeeded);
        }

        debug!(
            id,
            limit = num_ctx,
            input = input_len,
            keep = num_keep,
            discard,
            "Context limit hit - shifting"
        );

        let removed = match self.backend.as_mut() {
            Some(backend) => backend.remove(id, num_keep, Some(num_keep + discard)),
            None => Ok(()),
        };

        let slot = &mut self.slots[id];
        if let Err(err) = removed {
            debug!(id, error = %err, "KV cache removal unsupported, returning inputs for reprocessing");

            let mut inputs = std::mem::take(&mut slot.inputs);
            inputs.drain(num_keep..num_keep + discard);

            if let Some(backend) = self.backend.as_mut() {
                if let Err(err) = backend.remove(id, 0, None) {
                    warn!(id, error = %err, "Failed to clear cache slot");
                }
            }

            self.counters.reprocessed += 1;
            return Ok(ShiftOutcome::Reprocess { inputs });
        }

        slot.inputs.drain(num_keep..num_keep + discard);
        self.counters.shifts += 1;
        Ok(ShiftOutcome::Shifted { discarded: discard })
    }

    // ─── Monitoring ─────────────────────────────────────────────────────────

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            num_slots: self.slots.len(),
            num_ctx: self.num_ctx,
            slots_in_use: self.slots.iter().filter(|s| s.in_use).count(),
            cached_inputs: self.slots.iter().map(CacheSlot::len).sum(),
            loads: self.counters.loads,
            reused_inputs: self.counters.reused_inputs,
            forks: self.counters.forks,
            evictions: self.counters.evictions,
            evicted_inputs: self.counters.evicted_inputs,
            shifts: self.counters.shifts,
            reprocessed: self.counters.reprocessed,
        }
    }
}

/// Thread-safe wrapper around the slot pool.
pub type SharedSlotPool = Arc<Mutex<SlotPool>>;

/// Create a new thread-safe slot pool from configuration.
pub fn new_shared_pool(config: &PoolConfig) -> Result<SharedSlotPool, SlotError> {
    Ok(Arc::new(Mutex::new(SlotPool::from_config(config)?)))
}
