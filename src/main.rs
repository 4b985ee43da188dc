//! kv-prefix-pool simulator.
//!
//! Replays a synthetic request mix against the block pool: requests share a
//! handful of system-prompt prefixes, are admitted while the pool can hold
//! their prompt, decode a fixed number of tokens and then finish. Sequences
//! that cannot grow are preempted (released and re-queued); their prompt is
//! revived from host RAM on re-admission.

use std::collections::VecDeque;

use clap::Parser;
use tracing::{info, warn};

use kv_prefix_pool::cache::block::TokenId;
use kv_prefix_pool::cache::manager::{new_shared_manager, SharedBlockManager};
use kv_prefix_pool::cache::sequence::{Sequence, SequenceStatus};
use kv_prefix_pool::config::{Cli, Config, WorkloadConfig};
use kv_prefix_pool::metrics::PoolMetrics;
use kv_prefix_pool::storage::host::HostStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_prefix_pool=debug"
    } else {
        "kv_prefix_pool=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-prefix-pool v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(requests) = cli.requests {
        config.workload.requests = requests;
    }

    info!(
        num_blocks = config.pool.num_blocks,
        block_size = config.pool.block_size,
        retain_released = config.pool.retain_released,
        block_bytes = config.kv_block_bytes(),
        pool_bytes = config.pool_bytes(),
        pool_tokens = config.pool_tokens(),
        "Configuration loaded"
    );

    let storage = HostStorage::for_pool(
        config.pool.num_blocks,
        config.pool.block_size,
        config.layout.bytes_per_token(),
    );
    let manager = new_shared_manager(&config.pool, storage);

    let report = simulate(&manager, &config.workload).await?;

    let mgr = manager.read().await;
    mgr.check_consistency()?;
    let stats = mgr.stats();
    info!(
        completed = report.completed,
        preempted = report.preempted,
        rejected = report.rejected,
        decode_steps = report.decode_steps,
        "Simulation finished"
    );
    info!(
        prefix_hits = stats.prefix_hits,
        prefix_forks = stats.prefix_forks,
        fresh_blocks = stats.fresh_blocks,
        decode_blocks = stats.decode_blocks,
        decode_copies = stats.decode_copies,
        evictions = stats.evictions,
        swap_outs = stats.swap_outs,
        swap_ins = stats.swap_ins,
        cached_prefixes = stats.cached_prefixes,
        "Pool activity"
    );
    let transfers = mgr.storage().stats();
    info!(
        d2h_bytes = transfers.total_d2h_bytes,
        h2d_bytes = transfers.total_h2d_bytes,
        prefix_copy_bytes = transfers.total_prefix_copy_bytes,
        "Tier traffic"
    );

    if cli.metrics {
        let metrics = PoolMetrics::new()?;
        metrics.observe(&stats);
        print!("{}", metrics.encode()?);
    }

    Ok(())
}

/// Outcome of one simulation run.
#[derive(Debug, Default)]
struct SimReport {
    completed: usize,
    preempted: usize,
    rejected: usize,
    decode_steps: usize,
}

/// A request waiting for or holding pool blocks.
struct Request {
    seq: Sequence,
    remaining: usize,
}

/// Deterministic token source (64-bit LCG, Knuth's MMIX constants).
struct TokenGen(u64);

impl TokenGen {
    fn next(&mut self) -> TokenId {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) % 32_000) as TokenId
    }

    fn take(&mut self, n: usize) -> Vec<TokenId> {
        (0..n).map(|_| self.next()).collect()
    }
}

fn build_requests(workload: &WorkloadConfig) -> VecDeque<Request> {
    let mut gen = TokenGen(workload.seed);
    let prefixes: Vec<Vec<TokenId>> = (0..workload.prefix_groups.max(1))
        .map(|_| gen.take(workload.shared_prefix_tokens))
        .collect();

    (0..workload.requests)
        .map(|i| {
            let mut tokens = prefixes[i % prefixes.len()].clone();
            tokens.extend(gen.take(workload.unique_prompt_tokens));
            Request {
                seq: Sequence::new(i as u64, tokens),
                remaining: workload.decode_tokens,
            }
        })
        .collect()
}

async fn simulate(
    manager: &SharedBlockManager<HostStorage>,
    workload: &WorkloadConfig,
) -> anyhow::Result<SimReport> {
    let mut report = SimReport::default();
    let mut waiting = build_requests(workload);
    let mut running: Vec<Request> = Vec::new();
    let mut gen = TokenGen(workload.seed ^ 0x9e37_79b9_7f4a_7c15);

    while !waiting.is_empty() || !running.is_empty() {
        // Admission.
        {
            let mut mgr = manager.write().await;
            while running.len() < workload.max_running.max(1) {
                let Some(mut req) = waiting.pop_front() else {
                    break;
                };
                if !mgr.can_allocate(&req.seq) {
                    if running.is_empty() {
                        warn!(request = req.seq.id, tokens = req.seq.len(), "Request exceeds pool capacity, rejected");
                        report.rejected += 1;
                        continue;
                    }
                    waiting.push_front(req);
                    break;
                }
                req.seq.status = SequenceStatus::Running;
                mgr.allocate(&mut req.seq)?;
                running.push(req);
            }
        }

        // One decode step for every running request.
        let solo = running.len() == 1;
        let mut still_running = Vec::with_capacity(running.len());
        for mut req in running.drain(..) {
            let mut mgr = manager.write().await;
            if req.remaining == 0 {
                mgr.deallocate(&mut req.seq)?;
                req.seq.status = SequenceStatus::Finished;
                report.completed += 1;
                continue;
            }
            if !mgr.can_append(&req.seq) {
                // Recompute preemption: release everything and retry later.
                mgr.deallocate(&mut req.seq)?;
                if solo {
                    warn!(request = req.seq.id, tokens = req.seq.len(), "Request cannot grow in an idle pool, rejected");
                    report.rejected += 1;
                    continue;
                }
                req.seq.status = SequenceStatus::Waiting;
                report.preempted += 1;
                waiting.push_front(req);
                continue;
            }
            req.seq.push_token(gen.next());
            mgr.append(&mut req.seq)?;
            req.remaining -= 1;
            report.decode_steps += 1;
            still_running.push(req);
        }
        running = still_running;

        tokio::task::yield_now().await;
    }

    Ok(report)
}
