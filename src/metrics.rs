//! Prometheus metrics for the block pool.
//!
//! The pool keeps its own counters in [`PoolStats`]; [`PoolMetrics`] mirrors a
//! snapshot into a private registry so it can be scraped or dumped in the
//! text exposition format.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::cache::manager::PoolStats;

/// Gauges for pool occupancy and counters for pool activity.
#[derive(Clone, Debug)]
pub struct PoolMetrics {
    registry: Registry,

    pub free_blocks: IntGauge,
    pub resident_blocks: IntGauge,
    pub evicted_blocks: IntGauge,
    pub evictable_blocks: IntGauge,
    pub cached_prefixes: IntGauge,

    pub prefix_hits: IntCounter,
    pub prefix_forks: IntCounter,
    pub fresh_blocks: IntCounter,
    pub decode_blocks: IntCounter,
    pub decode_copies: IntCounter,
    pub evictions: IntCounter,
    pub swap_outs: IntCounter,
    pub swap_ins: IntCounter,
}

impl PoolMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("kv_pool".to_string()), None)?;

        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        Ok(Self {
            free_blocks: gauge("free_blocks", "Blocks on the free list")?,
            resident_blocks: gauge("resident_blocks", "Blocks with content in the fast tier")?,
            evicted_blocks: gauge("evicted_blocks", "Claimed blocks with content only in the slow tier")?,
            evictable_blocks: gauge("evictable_blocks", "Resident blocks with no claims")?,
            cached_prefixes: gauge("cached_prefixes", "Prefixes resolvable in the prefix index")?,
            prefix_hits: counter("prefix_hits_total", "Prefill chunks served by an existing block")?,
            prefix_forks: counter("prefix_forks_total", "Prefill chunks served by copying a shared run")?,
            fresh_blocks: counter("fresh_blocks_total", "Prefill chunks computed from scratch")?,
            decode_blocks: counter("decode_blocks_total", "Blocks allocated for decode growth")?,
            decode_copies: counter("decode_copies_total", "Shared partial blocks copied before a decode write")?,
            evictions: counter("evictions_total", "Blocks swapped out to make room")?,
            swap_outs: counter("swap_outs_total", "Fast to slow tier transfers")?,
            swap_ins: counter("swap_ins_total", "Slow to fast tier transfers")?,
            registry,
        })
    }

    /// Bring every metric up to date with `stats`.
    pub fn observe(&self, stats: &PoolStats) {
        self.free_blocks.set(stats.free_blocks as i64);
        self.resident_blocks.set(stats.resident_blocks as i64);
        self.evicted_blocks.set(stats.evicted_blocks as i64);
        self.evictable_blocks.set(stats.evictable_blocks as i64);
        self.cached_prefixes.set(stats.cached_prefixes as i64);

        advance(&self.prefix_hits, stats.prefix_hits);
        advance(&self.prefix_forks, stats.prefix_forks);
        advance(&self.fresh_blocks, stats.fresh_blocks);
        advance(&self.decode_blocks, stats.decode_blocks);
        advance(&self.decode_copies, stats.decode_copies);
        advance(&self.evictions, stats.evictions);
        advance(&self.swap_outs, stats.swap_outs);
        advance(&self.swap_ins, stats.swap_ins);
    }

    /// Text exposition of the registry.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Counters only move forward; a stale snapshot is ignored.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}
