//! Eviction policy: least-recently-used order over allocated blocks.
//!
//! Every allocated block carries an access tick. Claims and re-hits move a
//! block to the most-recently-used end; victim selection scans from the
//! least-recently-used end and returns the first block the caller accepts.

use std::collections::BTreeMap;

use crate::cache::block::BlockId;

/// Access-ordered set of block ids.
#[derive(Debug)]
pub struct Evictor {
    /// Monotonic access clock.
    clock: u64,

    /// Tick → block, iterated oldest first.
    order: BTreeMap<u64, BlockId>,

    /// Block → its current tick, indexed by block id.
    ticks: Vec<Option<u64>>,
}

impl Evictor {
    /// Create a tracker for a pool of `num_blocks` blocks.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            clock: 0,
            order: BTreeMap::new(),
            ticks: vec![None; num_blocks],
        }
    }

    /// Insert `block_id` or move it to the most-recently-used end.
    pub fn touch(&mut self, block_id: BlockId) {
        if let Some(old) = self.ticks[block_id].take() {
            self.order.remove(&old);
        }
        self.clock += 1;
        self.order.insert(self.clock, block_id);
        self.ticks[block_id] = Some(self.clock);
    }

    /// Stop tracking `block_id`. Returns whether it was tracked.
    pub fn forget(&mut self, block_id: BlockId) -> bool {
        match self.ticks[block_id].take() {
            Some(tick) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.ticks[block_id].is_some()
    }

    /// Tracked blocks, least recently used first.
    pub fn lru_order(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.order.values().copied()
    }

    /// First block in LRU order accepted by `eligible`.
    pub fn select_victim<F>(&self, eligible: F) -> Option<BlockId>
    where
        F: Fn(BlockId) -> bool,
    {
        self.lru_order().find(|&id| eligible(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
