//! Integration tests for the full scheduling pipeline.

use std::sync::Arc;

use kv_slot_cache::cache::pool::new_shared_pool;
use kv_slot_cache::config::{Config, PoolConfig};
use kv_slot_cache::scheduler::engine::{GenerationEvent, GenerationRequest, Scheduler};
use kv_slot_cache::scheduler::workload::Workload;
use kv_slot_cache::Input;

fn config(num_slots: usize, kv_size: usize, multi_user_cache: bool) -> Arc<Config> {
    let mut config = Config::default();
    config.pool = PoolConfig {
        num_slots,
        kv_size,
        batch_size: 8,
        multi_user_cache,
    };
    Arc::new(config)
}

fn request(id: &str, prompt: &[i32], max_tokens: usize) -> GenerationRequest {
    GenerationRequest {
        request_id: id.to_string(),
        prompt: prompt.iter().copied().map(Input::token).collect(),
        max_tokens,
        num_keep: 4,
        cache_prompt: true,
    }
}

/// Summary of one finished request.
#[derive(Debug, Default)]
struct Outcome {
    slot: Option<usize>,
    cached: usize,
    tokens: Vec<i32>,
    shifted: usize,
    done: bool,
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<GenerationEvent>) -> Outcome {
    let mut outcome = Outcome::default();
    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Loaded { slot, cached, .. } => {
                outcome.slot = Some(slot);
                outcome.cached = cached;
            }
            GenerationEvent::Token { token_id } => outcome.tokens.push(token_id),
            GenerationEvent::Shifted { discarded } => outcome.shifted += discarded,
            GenerationEvent::Reprocessed { .. } => {}
            GenerationEvent::Done {
                prompt_tokens,
                completion_tokens,
                cached_tokens,
                ..
            } => {
                assert_eq!(completion_tokens, outcome.tokens.len());
                assert_eq!(cached_tokens, outcome.cached);
                assert!(prompt_tokens >= cached_tokens);
                outcome.done = true;
            }
            GenerationEvent::Error(e) => panic!("Unexpected error: {e}"),
        }
    }
    outcome
}

#[tokio::test]
async fn test_repeated_prompt_reuses_cache() {
    let config = config(2, 256, false);
    let pool = new_shared_pool(&config.pool).unwrap();
    let scheduler = Scheduler::new(pool, config);
    let prompt: Vec<i32> = (1..=8).collect();

    let first = collect(scheduler.generate(request("first", &prompt, 4))).await;
    assert!(first.done);
    assert_eq!(first.cached, 0);

    let second = collect(scheduler.generate(request("second", &prompt, 4))).await;
    assert!(second.done);
    assert_eq!(second.slot, first.slot);
    // Whole prompt cached; the last input is evaluated again.
    assert_eq!(second.cached, 7);
    assert_eq!(second.tokens, first.tokens);
}

#[tokio::test]
async fn test_conversation_continues_in_same_slot() {
    let config = config(2, 256, false);
    let pool = new_shared_pool(&config.pool).unwrap();
    let scheduler = Scheduler::new(pool, config);

    let prompt: Vec<i32> = (1..=8).collect();
    let first = collect(scheduler.generate(request("turn-1", &prompt, 4))).await;

    let mut follow_up = prompt.clone();
    follow_up.extend(&first.tokens);
    follow_up.extend([100, 101]);

    let second = collect(scheduler.generate(request("turn-2", &follow_up, 2))).await;
    assert_eq!(second.slot, first.slot);
    assert_eq!(second.cached, 12);
}

#[tokio::test]
async fn test_multi_user_forks_shared_prefix() {
    let config = config(2, 256, true);
    let pool = new_shared_pool(&config.pool).unwrap();
    let scheduler = Scheduler::new(pool.clone(), config);

    let system: Vec<i32> = (1..=6).collect();
    let mut user_a = system.clone();
    user_a.extend([20, 21]);
    let mut user_b = system.clone();
    user_b.extend([30, 31]);

    let a = collect(scheduler.generate(request("a", &user_a, 2))).await;
    let b = collect(scheduler.generate(request("b", &user_b, 2))).await;

    // B shares the system prompt with A but must not overwrite A's slot.
    assert_ne!(a.slot, b.slot);
    assert_eq!(b.cached, system.len());

    let pool = pool.lock().await;
    let a_slot = pool.slot(a.slot.unwrap()).unwrap();
    assert_eq!(a_slot.len(), user_a.len() + 2);
    assert_eq!(pool.stats().forks, 1);
}

#[tokio::test]
async fn test_more_requests_than_slots() {
    let config = config(2, 128, true);
    let pool = new_shared_pool(&config.pool).unwrap();
    let scheduler = Scheduler::new(pool.clone(), config);

    let receivers: Vec<_> = (0..6)
        .map(|i| scheduler.generate(request(&format!("req-{i}"), &[1, 2, 3, i], 5)))
        .collect();

    let outcomes = futures::future::join_all(receivers.into_iter().map(collect)).await;
    assert!(outcomes.iter().all(|o| o.done && o.tokens.len() == 5));

    let stats = pool.lock().await.stats();
    assert_eq!(stats.loads, 6);
    assert_eq!(stats.slots_in_use, 0);
}

#[tokio::test]
async fn test_long_generation_shifts_context() {
    // Two slots of 32 inputs each.
    let config = config(2, 64, true);
    let pool = new_shared_pool(&config.pool).unwrap();
    let scheduler = Scheduler::new(pool.clone(), config);

    let prompt: Vec<i32> = (1..=20).collect();
    let outcome = collect(scheduler.generate(request("long", &prompt, 40))).await;

    assert!(outcome.done);
    assert_eq!(outcome.tokens.len(), 40);
    assert!(outcome.shifted > 0);

    let pool = pool.lock().await;
    let slot = pool.slot(outcome.slot.unwrap()).unwrap();
    assert!(slot.len() <= 32);
    let kept: Vec<Input> = prompt[..4].iter().copied().map(Input::token).collect();
    assert_eq!(slot.inputs[..4], kept[..]);
    assert!(pool.stats().shifts > 0);
}

#[tokio::test]
async fn test_workload_replay() {
    let workload: Workload = serde_json::from_str(
        r#"{
            "requests": [
                { "id": "a", "prompt": [1, 2, 3, {"multimodal": {"hash": 77}}, 5], "max_tokens": 3 },
                { "id": "b", "prompt": [1, 2, 3, {"multimodal": {"hash": 77}}, 6], "max_tokens": 3, "wave": 1 }
            ]
        }"#,
    )
    .unwrap();

    let config = config(2, 128, true);
    let pool = new_shared_pool(&config.pool).unwrap();
    let scheduler = Scheduler::new(pool.clone(), config.clone());

    let mut cached = Vec::new();
    for wave in workload.waves() {
        for request in wave {
            let rx = scheduler.generate(request.to_generation_request(&config.scheduler));
            cached.push(collect(rx).await.cached);
        }
    }

    // The image is matched by hash across requests.
    assert_eq!(cached, vec![0, 4]);
}
