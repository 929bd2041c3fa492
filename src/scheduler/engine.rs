//! Request driver: plays the scheduler that sits on top of the slot pool.
//!
//! For each request the engine:
//! 1. Loads a slot for the prompt, waiting while every slot is busy
//! 2. Evaluates the uncached prompt suffix in batches (prefill)
//! 3. Generates tokens one at a time (decode)
//! 4. Shifts the slot's context whenever it runs out of room
//! 5. Releases the slot and reports progress on a streaming channel
//!
//! No model runs here: generated tokens are derived deterministically from
//! the previous input, so identical prompts produce identical completions.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::cache::error::SlotError;
use crate::cache::input::{Input, TokenId};
use crate::cache::pool::{LoadedSlot, SharedSlotPool};
use crate::cache::shift::ShiftOutcome;
use crate::cache::slot::{CacheSlot, SlotId};
use crate::config::Config;

/// A generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID.
    pub request_id: String,

    /// Prompt inputs.
    pub prompt: Vec<Input>,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Leading inputs protected from context shifts.
    pub num_keep: usize,

    /// Whether cached prompt prefixes may be reused.
    pub cache_prompt: bool,
}

/// Progress of a request.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A slot was claimed; `cached` prompt inputs were already computed.
    Loaded {
        slot: SlotId,
        cached: usize,
        remaining: usize,
    },
    /// The context was shifted in place.
    Shifted { discarded: usize },
    /// The context was rebuilt from `inputs` surviving inputs.
    Reprocessed { inputs: usize },
    /// A new token was generated.
    Token { token_id: TokenId },
    /// Generation is complete and the slot released.
    Done {
        slot: SlotId,
        prompt_tokens: usize,
        cached_tokens: usize,
        completion_tokens: usize,
    },
    /// An error occurred during generation.
    Error(String),
}

/// Drives requests against a shared slot pool.
pub struct Scheduler {
    /// Shared slot pool.
    pool: SharedSlotPool,

    /// Configuration.
    config: Arc<Config>,

    /// Signalled whenever a slot is released.
    slot_freed: Arc<Notify>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(pool: SharedSlotPool, config: Arc<Config>) -> Self {
        Self {
            pool,
            config,
            slot_freed: Arc::new(Notify::new()),
        }
    }

    pub fn pool(&self) -> &SharedSlotPool {
        &self.pool
    }

    /// Run a generation request, streaming events to the returned receiver.
    pub fn generate(&self, request: GenerationRequest) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(32);

        let pool = self.pool.clone();
        let config = self.config.clone();
        let slot_freed = self.slot_freed.clone();

        tokio::spawn(async move {
            info!(
                request_id = %request.request_id,
                prompt_tokens = request.prompt.len(),
                max_tokens = request.max_tokens,
                "Starting generation"
            );

            let loaded = match acquire_slot(&pool, &slot_freed, &request).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                    return;
                }
            };
            let slot = loaded.slot;
            let cached = loaded.num_past;

            let result = drive(&pool, &config, &request, loaded, &tx).await;

            {
                let mut pool = pool.lock().await;
                if let Err(e) = pool.release(slot) {
                    warn!(request_id = %request.request_id, slot, "Release failed: {e}");
                }
            }
            slot_freed.notify_one();

            match result {
                Ok(generated) => {
                    let _ = tx
                        .send(GenerationEvent::Done {
                            slot,
                            prompt_tokens: request.prompt.len(),
                            cached_tokens: cached,
                            completion_tokens: generated,
                        })
                        .await;
                    info!(
                        request_id = %request.request_id,
                        slot,
                        cached,
                        generated,
                        "Generation complete"
                    );
                }
                Err(e) => {
                    warn!(request_id = %request.request_id, slot, "Generation failed: {e}");
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                }
            }
        });

        rx
    }
}

/// Load a slot for the request, waiting for a release while none is free.
async fn acquire_slot(
    pool: &SharedSlotPool,
    slot_freed: &Notify,
    request: &GenerationRequest,
) -> Result<LoadedSlot, SlotError> {
    loop {
        let result = pool
            .lock()
            .await
            .load_slot(&request.prompt, request.cache_prompt);

        match result {
            Err(SlotError::NoAvailableSlot) => {
                debug!(request_id = %request.request_id, "All cache slots busy, waiting");
                slot_freed.notified().await;
            }
            other => return other,
        }
    }
}

/// Prefill and decode on a loaded slot. Returns the number of generated tokens.
async fn drive(
    pool: &SharedSlotPool,
    config: &Config,
    request: &GenerationRequest,
    loaded: LoadedSlot,
    tx: &mpsc::Sender<GenerationEvent>,
) -> Result<usize, SlotError> {
    let slot = loaded.slot;
    let num_ctx = pool.lock().await.num_ctx();
    let num_keep = request.num_keep.min(num_ctx.saturating_sub(1));
    let batch_size = config.pool.batch_size.max(1);

    let _ = tx
        .send(GenerationEvent::Loaded {
            slot,
            cached: loaded.num_past,
            remaining: loaded.remaining.len(),
        })
        .await;

    let mut last = request.prompt.last().cloned();
    let mut pending = loaded.remaining;
    while !pending.is_empty() {
        let take = pending.len().min(batch_size);
        let batch: Vec<Input> = pending.drain(..take).collect();
        append(pool, slot, batch, num_keep, tx).await?;
    }

    let mut generated = 0;
    for _ in 0..request.max_tokens {
        let token_id = next_token(last.as_ref(), config.scheduler.vocab_size);
        let input = Input::token(token_id);
        append(pool, slot, vec![input.clone()], num_keep, tx).await?;
        last = Some(input);
        generated += 1;

        if tx.send(GenerationEvent::Token { token_id }).await.is_err() {
            // Receiver dropped, stop generating.
            break;
        }
    }

    Ok(generated)
}

/// Append `inputs` to a claimed slot, shifting its context as needed.
async fn append(
    pool: &SharedSlotPool,
    slot: SlotId,
    mut inputs: Vec<Input>,
    num_keep: usize,
    tx: &mpsc::Sender<GenerationEvent>,
) -> Result<(), SlotError> {
    while !inputs.is_empty() {
        let event = {
            let mut pool = pool.lock().await;
            let len = pool.slot(slot).map_or(0, CacheSlot::len);
            let room = pool.num_ctx().saturating_sub(len);

            if room > 0 {
                let take = room.min(inputs.len());
                let chunk: Vec<Input> = inputs.drain(..take).collect();
                pool.extend(slot, &chunk)?;
                None
            } else {
                match pool.shift_slot(slot, num_keep)? {
                    ShiftOutcome::Shifted { discarded } => {
                        Some(GenerationEvent::Shifted { discarded })
                    }
                    ShiftOutcome::Reprocess { inputs: survivors } => {
                        let count = survivors.len();
                        let mut rebuilt = survivors;
                        rebuilt.append(&mut inputs);
                        inputs = rebuilt;
                        Some(GenerationEvent::Reprocessed { inputs: count })
                    }
                    // A full slot always needs a shift; nothing to report.
                    ShiftOutcome::NotNeeded => None,
                }
            }
        };

        if let Some(event) = event {
            let _ = tx.send(event).await;
        }
    }
    Ok(())
}

/// Deterministic stand-in for sampling: derive the next token from the
/// previous input.
fn next_token(previous: Option<&Input>, vocab_size: i32) -> TokenId {
    let vocab = i64::from(vocab_size.max(1));
    let seed = match previous {
        Some(Input::Token(id)) => i64::from(*id),
        Some(Input::Multimodal { hash, .. }) => (*hash % vocab as u64) as i64,
        None => 0,
    };
    ((seed * 31 + 7).rem_euclid(vocab)) as TokenId
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{BackendError, CacheBackend};
    use crate::cache::pool::{new_shared_pool, SlotPool};
    use crate::config::PoolConfig;
    use tokio::sync::Mutex;

    /// Backend that can only clear a slot entirely.
    struct WholeSlotBackend;

    impl CacheBackend for WholeSlotBackend {
        fn copy_prefix(&mut self, _src: SlotId, _dst: SlotId, _len: usize) -> Result<(), BackendError> {
            Ok(())
        }

        fn remove(&mut self, _slot: SlotId, begin: usize, end: Option<usize>) -> Result<(), BackendError> {
            if begin != 0 || end.is_some() {
                return Err(BackendError::Unsupported("range removal".to_string()));
            }
            Ok(())
        }
    }

    fn small_config(num_slots: usize, kv_size: usize) -> Arc<Config> {
        let mut config = Config::default();
        config.pool = PoolConfig {
            num_slots,
            kv_size,
            batch_size: 4,
            multi_user_cache: true,
        };
        Arc::new(config)
    }

    fn request(id: &str, prompt: &[i32], max_tokens: usize) -> GenerationRequest {
        GenerationRequest {
            request_id: id.to_string(),
            prompt: prompt.iter().copied().map(Input::token).collect(),
            max_tokens,
            num_keep: 2,
            cache_prompt: true,
        }
    }

    #[test]
    fn test_next_token_is_deterministic() {
        let a = next_token(Some(&Input::token(10)), 100);
        let b = next_token(Some(&Input::token(10)), 100);
        assert_eq!(a, b);
        assert!((0..100).contains(&a));
        assert!((0..100).contains(&next_token(Some(&Input::token(-50)), 100)));
        assert_eq!(next_token(None, 100), 7);
    }

    #[tokio::test]
    async fn test_generation_produces_tokens() {
        let config = small_config(2, 64);
        let pool = new_shared_pool(&config.pool).unwrap();
        let scheduler = Scheduler::new(pool, config);

        let mut rx = scheduler.generate(request("test-1", &[1, 2, 3], 5));

        let mut token_count = 0;
        let mut got_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Token { .. } => token_count += 1,
                GenerationEvent::Done {
                    completion_tokens, ..
                } => {
                    assert_eq!(completion_tokens, 5);
                    got_done = true;
                }
                GenerationEvent::Error(e) => panic!("Unexpected error: {e}"),
                _ => {}
            }
        }

        assert_eq!(token_count, 5);
        assert!(got_done);

        let pool = scheduler.pool().lock().await;
        assert_eq!(pool.stats().slots_in_use, 0);
        assert_eq!(pool.stats().cached_inputs, 8);
    }

    #[tokio::test]
    async fn test_generation_shifts_when_full() {
        // One slot of 8 inputs: the prompt and completion cannot fit.
        let config = small_config(1, 8);
        let pool = new_shared_pool(&config.pool).unwrap();
        let scheduler = Scheduler::new(pool, config);

        let mut rx = scheduler.generate(request("shift", &[1, 2, 3, 4, 5, 6], 10));

        let mut shifted = 0;
        let mut tokens = 0;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Shifted { discarded } => shifted += discarded,
                GenerationEvent::Token { .. } => tokens += 1,
                GenerationEvent::Error(e) => panic!("Unexpected error: {e}"),
                _ => {}
            }
        }

        assert_eq!(tokens, 10);
        assert!(shifted > 0);

        let pool = scheduler.pool().lock().await;
        let slot = pool.slot(0).unwrap();
        assert!(slot.len() <= 8);
        // The keep prefix survives every shift.
        assert_eq!(slot.inputs[..2], [Input::token(1), Input::token(2)]);
    }

    #[tokio::test]
    async fn test_generation_reprocesses_without_range_removal() {
        let config = small_config(1, 8);
        let pool = SlotPool::new(1, 8).with_backend(Box::new(WholeSlotBackend));
        let scheduler = Scheduler::new(Arc::new(Mutex::new(pool)), config);

        let mut rx = scheduler.generate(request("reprocess", &[1, 2, 3, 4, 5, 6], 10));

        let mut reprocessed = 0;
        let mut tokens = 0;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Reprocessed { inputs } => {
                    assert!(inputs > 0);
                    reprocessed += 1;
                }
                GenerationEvent::Shifted { .. } => panic!("Shifted in place without range removal"),
                GenerationEvent::Token { .. } => tokens += 1,
                GenerationEvent::Error(e) => panic!("Unexpected error: {e}"),
                _ => {}
            }
        }

        assert!(reprocessed > 0);
        assert_eq!(tokens, 10);

        let pool = scheduler.pool().lock().await;
        let slot = pool.slot(0).unwrap();
        assert!(slot.len() <= 8);
        assert_eq!(slot.inputs[..2], [Input::token(1), Input::token(2)]);
        assert_eq!(pool.stats().reprocessed, reprocessed);
        assert_eq!(pool.stats().shifts, 0);
    }
}
