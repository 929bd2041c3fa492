//! kv-slot-sim: replays a request workload against the prefix-cache slot pool.
//!
//! Plays the part of the inference server's scheduler: every request loads
//! a slot, evaluates its uncached suffix, generates synthetic tokens and
//! releases the slot. Prints the pool statistics as JSON when done.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{info, warn};

use kv_slot_cache::cache::pool::new_shared_pool;
use kv_slot_cache::config::{Cli, Config};
use kv_slot_cache::scheduler::engine::{GenerationEvent, Scheduler};
use kv_slot_cache::scheduler::workload::Workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_slot_cache=debug,kv_slot_sim=debug"
    } else {
        "kv_slot_cache=info,kv_slot_sim=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("kv-slot-sim v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Arc::new(Config::load(&cli.config)?);

    info!(
        num_slots = config.pool.num_slots,
        kv_size = config.pool.kv_size,
        num_ctx = config.pool.num_ctx(),
        policy = %config.pool.policy(),
        "Configuration loaded"
    );

    let workload = Workload::load(&cli.workload)?;
    info!(
        requests = workload.requests.len(),
        prompt_inputs = workload.total_prompt_inputs(),
        "Workload loaded"
    );

    let pool = new_shared_pool(&config.pool)?;
    let scheduler = Scheduler::new(pool.clone(), config.clone());
    let start = Instant::now();

    for (wave, requests) in workload.waves().into_iter().enumerate() {
        let receivers: Vec<_> = requests
            .iter()
            .map(|r| scheduler.generate(r.to_generation_request(&config.scheduler)))
            .collect();

        let outcomes = futures::future::join_all(receivers.into_iter().map(drain_events)).await;
        let failed = outcomes.iter().filter(|ok| !**ok).count();
        info!(wave, requests = outcomes.len(), failed, "Wave complete");
    }

    let stats = pool.lock().await.stats();
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        reuse_ratio = stats.reuse_ratio(workload.total_prompt_inputs()),
        "Replay complete"
    );

    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

/// Consume a request's events. Returns whether it completed.
async fn drain_events(mut rx: tokio::sync::mpsc::Receiver<GenerationEvent>) -> bool {
    let mut completed = false;
    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Done {
                slot,
                prompt_tokens,
                cached_tokens,
                completion_tokens,
            } => {
                info!(slot, prompt_tokens, cached_tokens, completion_tokens, "Request done");
                completed = true;
            }
            GenerationEvent::Error(e) => warn!("Request failed: {e}"),
            _ => {}
        }
    }
    completed
}
