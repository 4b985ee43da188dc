//! Block manager: the fixed pool, prefix reuse and tiered eviction.
//!
//! The manager is the single owner of pool-wide state:
//! - every [`KvBlock`] and its tier buffers
//! - the free list
//! - the LRU [`Evictor`] over allocated blocks
//! - the [`PrefixTrie`] and the block → anchor back-references
//!
//! The scheduler checks admission with [`BlockManager::can_allocate`] /
//! [`BlockManager::can_append`], then calls [`BlockManager::allocate`] for
//! prefill, [`BlockManager::append`] for each decode step and
//! [`BlockManager::deallocate`] when a sequence finishes.
//!
//! A released block keeps its slow-tier mirror and its anchor while it sits
//! on the free list, so a later request for the same prefix revives it
//! instead of recomputing. The anchor is cleared when the block is recycled
//! for new content.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::block::{BlockId, BlockState, BlockStatus, BlockTable, KvBlock, Tier, TokenId};
use crate::cache::evictor::Evictor;
use crate::cache::sequence::BlockSequence;
use crate::cache::trie::{NodeId, PrefixAnchor, PrefixTrie};
use crate::config::PoolConfig;
use crate::storage::{KvStorage, StorageError, StorageHandle};

/// Errors from pool operations.
///
/// Every variant means a precondition was violated or the backend failed.
/// The request that triggered it should be aborted, not retried: retrying
/// without freed capacity cannot succeed.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No evictable block: all {allocated} allocated blocks are claimed or swapped out")]
    NoEvictableBlock { allocated: usize },

    #[error("Out of blocks: free list empty and nothing evictable in a pool of {num_blocks}")]
    OutOfBlocks { num_blocks: usize },

    #[error("Sequence already holds {blocks} blocks")]
    AlreadyAllocated { blocks: usize },

    #[error("Block {0} is not in the pool")]
    UnknownBlock(BlockId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Pool state inconsistent: {0}")]
    Inconsistent(String),
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub num_blocks: usize,
    pub free_blocks: usize,
    pub resident_blocks: usize,
    pub evicted_blocks: usize,
    pub evictable_blocks: usize,
    /// Anchors currently resolvable in the prefix index.
    pub cached_prefixes: usize,

    /// Prefill chunks served by claiming an existing block.
    pub prefix_hits: u64,
    /// Prefill chunks served by copying a shared run into a new block.
    pub prefix_forks: u64,
    /// Prefill chunks with no reusable state.
    pub fresh_blocks: u64,
    /// Blocks allocated for decode growth.
    pub decode_blocks: u64,
    /// Shared partial blocks copied before a decode write.
    pub decode_copies: u64,
    /// Blocks swapped out by the LRU scan.
    pub evictions: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
    /// Blocks returned to the free list.
    pub reclaimed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    prefix_hits: u64,
    prefix_forks: u64,
    fresh_blocks: u64,
    decode_blocks: u64,
    decode_copies: u64,
    evictions: u64,
    swap_outs: u64,
    swap_ins: u64,
    reclaimed: u64,
}

/// The block pool.
pub struct BlockManager<S> {
    /// Tokens per block.
    block_size: usize,

    /// Leave released blocks resident instead of reclaiming them.
    retain_released: bool,

    /// All blocks, indexed by id.
    blocks: Vec<KvBlock>,

    /// Blocks in the FREE state, reused oldest first.
    free_list: VecDeque<BlockId>,

    /// Recency order over every non-free block.
    evictor: Evictor,

    /// Prefix index.
    trie: PrefixTrie,

    /// Block → trie node holding its anchor.
    anchors: HashMap<BlockId, NodeId>,

    /// Number of RESIDENT blocks with no claims.
    num_evictable: usize,

    /// Tier buffer backend.
    storage: S,

    counters: Counters,
}

impl<S: KvStorage> BlockManager<S> {
    /// Create a pool of `config.num_blocks` free blocks backed by `storage`.
    pub fn new(config: &PoolConfig, storage: S) -> Self {
        assert!(config.block_size > 0, "block_size must be positive");

        let blocks = (0..config.num_blocks)
            .map(|id| KvBlock::new(id, config.block_size))
            .collect();

        info!(
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            retain_released = config.retain_released,
            "Block pool initialised"
        );

        Self {
            block_size: config.block_size,
            retain_released: config.retain_released,
            blocks,
            free_list: (0..config.num_blocks).collect(),
            evictor: Evictor::new(config.num_blocks),
            trie: PrefixTrie::new(),
            anchors: HashMap::new(),
            num_evictable: 0,
            storage,
            counters: Counters::default(),
        }
    }

    // ─── Admission ─────────────────────────────────────────────────────────

    /// Whether `allocate(seq)` can obtain a block for every chunk of the
    /// sequence's tokens. Stale as soon as the pool is mutated.
    pub fn can_allocate<Q: BlockSequence + ?Sized>(&self, seq: &Q) -> bool {
        let needed = seq.token_ids().len().div_ceil(self.block_size);
        needed <= self.free_list.len() + self.num_evictable
    }

    /// Whether `append(seq)` can place one more token.
    pub fn can_append<Q: BlockSequence + ?Sized>(&self, seq: &Q) -> bool {
        if !seq.is_running() {
            return false;
        }
        if self.extendable_last_block(seq.block_table()).is_some() {
            return true;
        }
        self.free_list.len() + self.num_evictable >= 1
    }

    // ─── Sequence operations ───────────────────────────────────────────────

    /// Build the block table for a sequence's prompt (prefill).
    ///
    /// Tokens are processed in chunks of `block_size`. Each chunk either
    /// claims the block already caching exactly that prefix, forks a block
    /// sharing a leading run of it, or takes a fresh block.
    ///
    /// On error the sequence keeps the claims pushed so far; release them
    /// with [`deallocate`](Self::deallocate).
    pub fn allocate<Q: BlockSequence + ?Sized>(&mut self, seq: &mut Q) -> Result<(), PoolError> {
        if !seq.block_table().is_empty() {
            return Err(PoolError::AlreadyAllocated {
                blocks: seq.block_table().len(),
            });
        }

        let len = seq.token_ids().len();
        let mut offset = 0;
        let mut cursor = PrefixTrie::ROOT;
        while offset < len {
            let chunk = self.block_size.min(len - offset);
            let (block_id, node) = self.allocate_chunk(seq.token_ids(), offset, chunk, cursor)?;
            seq.block_table_mut().push(block_id);
            offset += chunk;
            cursor = node;
        }

        debug!(tokens = len, blocks = seq.block_table().len(), "Allocated sequence");
        Ok(())
    }

    /// Reserve the slot for one newly generated token (decode step).
    ///
    /// Extends the last block in place when it has room and no other
    /// sequence shares it. A shared last block with room is copied into a
    /// private block that replaces it in the table (copy-on-write), so the
    /// table always holds exactly one block per chunk of tokens. A full last
    /// block is followed by a fresh one. Decode growth is never indexed for
    /// sharing.
    pub fn append<Q: BlockSequence + ?Sized>(&mut self, seq: &mut Q) -> Result<(), PoolError> {
        if let Some(last) = self.extendable_last_block(seq.block_table()) {
            self.swap_in_block(last)?;
            // The block no longer holds exactly its anchored prefix.
            self.detach_anchor(last);
            self.blocks[last].used += 1;
            self.evictor.touch(last);
            return Ok(());
        }

        if let Some(shared) = self.shared_partial_last_block(seq.block_table()) {
            let used = self.blocks[shared].used;
            let private = self.take_block(Some(shared))?;
            if let Err(e) = self.copy_prefix(shared, private, used) {
                self.discard(private)?;
                return Err(e);
            }
            self.blocks[private].used = used + 1;
            // Other holders keep the shared block, so this only drops a claim.
            self.release(shared)?;
            seq.block_table_mut().replace_last(private);
            self.counters.decode_copies += 1;
            debug!(shared, block_id = private, copied = used, "Copied shared block for decode");
            return Ok(());
        }

        let block_id = self.take_block(None)?;
        self.blocks[block_id].used = 1;
        seq.block_table_mut().push(block_id);
        self.counters.decode_blocks += 1;
        debug!(block_id, "Decode block allocated");
        Ok(())
    }

    /// Release the sequence's claim on every block in its table and clear it.
    ///
    /// A no-op on an empty table.
    pub fn deallocate<Q: BlockSequence + ?Sized>(&mut self, seq: &mut Q) -> Result<(), PoolError> {
        if seq.block_table().is_empty() {
            return Ok(());
        }

        let table = std::mem::take(seq.block_table_mut());
        let mut result = Ok(());
        for block_id in table.iter() {
            if let Err(e) = self.release(block_id) {
                warn!(block_id, error = %e, "Failed to release block");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        debug!(blocks = table.len(), "Deallocated sequence");
        result
    }

    /// Swap out every block the sequence holds exclusively, keeping its
    /// claims (preemption). Shared blocks stay resident.
    pub fn swap_out_sequence<Q: BlockSequence + ?Sized>(&mut self, seq: &Q) -> Result<usize, PoolError> {
        let mut swapped = 0;
        for block_id in seq.block_table().iter() {
            if self.blocks[block_id].state == (BlockState::Resident { refs: 1 }) {
                self.swap_out_block(block_id)?;
                swapped += 1;
            }
        }
        Ok(swapped)
    }

    /// Swap every evicted block of the sequence back into the fast tier.
    pub fn swap_in_sequence<Q: BlockSequence + ?Sized>(&mut self, seq: &Q) -> Result<usize, PoolError> {
        let mut swapped = 0;
        for block_id in seq.block_table().iter() {
            if self.blocks[block_id].status() == BlockStatus::Evicted {
                self.swap_in_block(block_id)?;
                swapped += 1;
            }
        }
        Ok(swapped)
    }

    // ─── Tier movement ─────────────────────────────────────────────────────

    /// Move a resident block's content to the slow tier. An unclaimed block is
    /// reclaimed to the free list; a claimed one becomes EVICTED. No-op for
    /// blocks not in the fast tier.
    pub fn swap_out(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        self.check_id(block_id)?;
        self.swap_out_block(block_id)
    }

    /// Bring an EVICTED block back into the fast tier. No-op otherwise.
    pub fn swap_in(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        self.check_id(block_id)?;
        self.swap_in_block(block_id)
    }

    /// Swap out the least-recently-used unclaimed resident block.
    pub fn evict(&mut self) -> Result<BlockId, PoolError> {
        self.evict_one(None)
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    pub fn block(&self, block_id: BlockId) -> Option<&KvBlock> {
        self.blocks.get(block_id)
    }

    /// Current reference count (0 for unknown ids).
    pub fn ref_count(&self, block_id: BlockId) -> usize {
        self.blocks.get(block_id).map_or(0, |b| b.ref_count())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_evictable_blocks(&self) -> usize {
        self.num_evictable
    }

    /// Allocated blocks, least recently used first.
    pub fn lru_order(&self) -> Vec<BlockId> {
        self.evictor.lru_order().collect()
    }

    pub fn trie(&self) -> &PrefixTrie {
        &self.trie
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Run `f` against the buffer currently holding the block's content, e.g.
    /// to write freshly computed KV state. None if the block holds no content.
    pub fn with_block_buffer<R>(
        &mut self,
        block_id: BlockId,
        f: impl FnOnce(&mut S, &StorageHandle) -> R,
    ) -> Option<R> {
        let handle = self.blocks.get(block_id)?.content_handle()?;
        Some(f(&mut self.storage, handle))
    }

    /// Get pool statistics for monitoring.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            num_blocks: self.blocks.len(),
            evictable_blocks: self.num_evictable,
            cached_prefixes: self.anchors.len(),
            prefix_hits: self.counters.prefix_hits,
            prefix_forks: self.counters.prefix_forks,
            fresh_blocks: self.counters.fresh_blocks,
            decode_blocks: self.counters.decode_blocks,
            decode_copies: self.counters.decode_copies,
            evictions: self.counters.evictions,
            swap_outs: self.counters.swap_outs,
            swap_ins: self.counters.swap_ins,
            reclaimed: self.counters.reclaimed,
            ..Default::default()
        };
        for block in &self.blocks {
            match block.status() {
                BlockStatus::Free => stats.free_blocks += 1,
                BlockStatus::Resident => stats.resident_blocks += 1,
                BlockStatus::Evicted => stats.evicted_blocks += 1,
            }
        }
        stats
    }

    /// Verify that block states, the free list, the recency set, tier
    /// buffers and anchor back-references agree with each other.
    pub fn check_consistency(&self) -> Result<(), PoolError> {
        let fail = |msg: String| -> Result<(), PoolError> { Err(PoolError::Inconsistent(msg)) };

        let mut on_free_list = vec![false; self.blocks.len()];
        for &id in &self.free_list {
            if std::mem::replace(&mut on_free_list[id], true) {
                return fail(format!("block {id} is on the free list twice"));
            }
        }

        let mut evictable = 0;
        for block in &self.blocks {
            let id = block.id;
            let free = block.state == BlockState::Free;
            if free != on_free_list[id] {
                return fail(format!("block {id} is {} but free-list membership is {}", block.status(), on_free_list[id]));
            }
            if free == self.evictor.contains(id) {
                return fail(format!("block {id} is {} but recency membership is {}", block.status(), !free));
            }
            if block.fast.is_some() != (block.status() == BlockStatus::Resident) {
                return fail(format!("block {id} is {} but has fast buffer: {}", block.status(), block.fast.is_some()));
            }
            if let BlockState::Evicted { refs } = block.state {
                if refs == 0 || block.slow.is_none() {
                    return fail(format!("block {id} evicted with refs {refs} and no mirror"));
                }
            }
            if block.used > block.capacity {
                return fail(format!("block {id} holds {} of {} tokens", block.used, block.capacity));
            }
            if block.state.is_evictable() {
                evictable += 1;
            }
        }
        if evictable != self.num_evictable {
            return fail(format!("evictable count {} but {evictable} blocks evictable", self.num_evictable));
        }

        for (&block_id, &node) in &self.anchors {
            match self.trie.anchor(node) {
                Some(anchor) if anchor.block_id == block_id => {}
                _ => return fail(format!("block {block_id} back-reference points at a foreign anchor")),
            }
        }
        Ok(())
    }

    // ─── Prefill internals ─────────────────────────────────────────────────

    /// Serve one chunk `tokens[offset..offset + chunk]`, starting the trie walk
    /// at `cursor` (the node for `tokens[..offset]`). Returns the block holding
    /// the chunk and the node for `tokens[..offset + chunk]`.
    fn allocate_chunk(
        &mut self,
        tokens: &[TokenId],
        offset: usize,
        chunk: usize,
        cursor: NodeId,
    ) -> Result<(BlockId, NodeId), PoolError> {
        let end = offset + chunk;
        let path = self.trie.walk(cursor, &tokens[offset..end]);

        // Exact hit: a block holding precisely this chunk.
        if path.len() == chunk {
            let node = path[chunk - 1];
            if let Some(block_id) = self.exact_hit(node, offset, &tokens[..end]) {
                self.claim(block_id)?;
                self.counters.prefix_hits += 1;
                debug!(block_id, offset, tokens = chunk, "Prefix hit");
                return Ok((block_id, node));
            }
        }

        // Diverging hit: copy the shared leading run, compute the rest.
        if let Some((shared_node, src)) = self.fork_source(&path, offset) {
            let run = self.trie.depth(shared_node) - offset;
            let dst = self.take_block(Some(src))?;
            if let Err(e) = self.copy_prefix(src, dst, run) {
                self.discard(dst)?;
                return Err(e);
            }
            self.blocks[dst].used = chunk;
            let node = self.trie.get_or_create_node_from(cursor, &tokens[offset..end]);
            self.register_anchor(node, dst, offset, &tokens[..end]);
            self.counters.prefix_forks += 1;
            debug!(src, dst, offset, copied = run, tokens = chunk, "Forked prefix block");
            return Ok((dst, node));
        }

        let block_id = self.take_block(None)?;
        self.blocks[block_id].used = chunk;
        let node = self.trie.get_or_create_node_from(cursor, &tokens[offset..end]);
        self.register_anchor(node, block_id, offset, &tokens[..end]);
        self.counters.fresh_blocks += 1;
        debug!(block_id, offset, tokens = chunk, "Fresh prefix block");
        Ok((block_id, node))
    }

    /// Block anchored at `node` if it starts at `offset` and caches exactly `prefix`.
    fn exact_hit(&self, node: NodeId, offset: usize, prefix: &[TokenId]) -> Option<BlockId> {
        let anchor = self.trie.anchor(node)?;
        if anchor.start != offset || !self.is_live(anchor) {
            return None;
        }
        if !anchor.is_prefix_of(prefix) {
            warn!(block_id = anchor.block_id, node, "Anchor prefix does not match its trie path");
            return None;
        }
        Some(anchor.block_id)
    }

    /// Deepest node along `path` below which some live anchor starts at
    /// `offset`, with that anchor's block. Skipped when taking a destination
    /// block would have to recycle the source itself.
    ///
    /// Path nodes with no anchors in their subtree are passed over without a
    /// search, and each search only enters anchored branches.
    fn fork_source(&self, path: &[NodeId], offset: usize) -> Option<(NodeId, BlockId)> {
        let max_depth = offset + self.block_size;
        path.iter()
            .rev()
            .filter(|&&node| self.trie.anchors_below(node) > 0)
            .find_map(|&node| {
                let src_node = self
                    .trie
                    .find_anchor_below(node, max_depth, |a| a.start == offset && self.is_live(a))?;
                let src = self.trie.anchor(src_node)?.block_id;
                self.can_take_excluding(src).then_some((node, src))
            })
    }

    /// An anchor whose back-reference is intact and whose block still holds
    /// the anchored content in some tier.
    fn is_live(&self, anchor: &PrefixAnchor) -> bool {
        let block = &self.blocks[anchor.block_id];
        self.anchors.contains_key(&anchor.block_id)
            && block.content_handle().is_some()
            && block.used == anchor.span()
    }

    fn copy_prefix(&mut self, src: BlockId, dst: BlockId, tokens: usize) -> Result<(), PoolError> {
        let (Some(src_buf), Some(dst_buf)) = (self.blocks[src].content_handle(), self.blocks[dst].fast.as_ref())
        else {
            return Err(PoolError::Inconsistent(format!("fork {src} -> {dst} without buffers")));
        };
        self.storage.copy_tokens(src_buf, dst_buf, tokens)?;
        Ok(())
    }

    fn register_anchor(&mut self, node: NodeId, block_id: BlockId, start: usize, prefix: &[TokenId]) {
        let anchor = PrefixAnchor {
            block_id,
            start,
            prefix: prefix.to_vec(),
            status: self.blocks[block_id].status(),
        };
        if let Some(old) = self.trie.set_anchor(node, anchor) {
            if old.block_id != block_id {
                self.anchors.remove(&old.block_id);
            }
        }
        self.anchors.insert(block_id, node);
    }

    /// Drop the block's anchor and back-reference, if any.
    fn detach_anchor(&mut self, block_id: BlockId) {
        if let Some(node) = self.anchors.remove(&block_id) {
            if self.trie.anchor(node).is_some_and(|a| a.block_id == block_id) {
                self.trie.clear_anchor(node);
            }
        }
    }

    fn sync_anchor_status(&mut self, block_id: BlockId) {
        if let Some(&node) = self.anchors.get(&block_id) {
            self.trie.set_anchor_status(node, self.blocks[block_id].status());
        }
    }

    // ─── Claims and block lifecycle ────────────────────────────────────────

    fn extendable_last_block(&self, table: &BlockTable) -> Option<BlockId> {
        let last = table.last()?;
        let block = self.blocks.get(last)?;
        (block.has_space() && block.ref_count() == 1).then_some(last)
    }

    /// Last block of the table if it has room but other sequences hold it too.
    fn shared_partial_last_block(&self, table: &BlockTable) -> Option<BlockId> {
        let last = table.last()?;
        let block = self.blocks.get(last)?;
        (block.has_space() && block.ref_count() > 1).then_some(last)
    }

    /// Whether a block other than `src` can be freed or evicted.
    fn can_take_excluding(&self, src: BlockId) -> bool {
        let src_counted = matches!(self.blocks[src].state, BlockState::Free | BlockState::Resident { refs: 0 });
        self.free_list.len() + self.num_evictable > usize::from(src_counted)
    }

    /// Take a block for new content with a single claim, evicting if the free
    /// list is empty. `protect` is never chosen.
    fn take_block(&mut self, protect: Option<BlockId>) -> Result<BlockId, PoolError> {
        let candidate = self.free_list.iter().copied().find(|&id| Some(id) != protect);
        let block_id = match candidate {
            Some(id) => id,
            None => match self.evict_one(protect) {
                Ok(id) => id,
                Err(PoolError::NoEvictableBlock { .. }) => {
                    return Err(PoolError::OutOfBlocks {
                        num_blocks: self.blocks.len(),
                    })
                }
                Err(e) => return Err(e),
            },
        };

        let fast = self.storage.allocate(Tier::Gpu)?;
        self.remove_from_free_list(block_id);
        // Recycling retires whatever prefix the old content cached.
        self.detach_anchor(block_id);

        let block = &mut self.blocks[block_id];
        block.used = 0;
        block.fast = Some(fast);
        self.set_state(block_id, BlockState::Resident { refs: 1 });
        self.evictor.touch(block_id);
        Ok(block_id)
    }

    /// Return a block fresh from [`take_block`](Self::take_block) whose
    /// content was never filled, e.g. after a failed copy.
    fn discard(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        let fast = self.blocks[block_id].fast.take();
        self.blocks[block_id].used = 0;
        self.reclaim(block_id);
        if let Some(fast) = fast {
            self.storage.free(fast)?;
        }
        debug!(block_id, "Discarded unfilled block");
        Ok(())
    }

    /// Add one claim, bringing the block into the fast tier first if needed.
    fn claim(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        let refs = match self.blocks[block_id].state {
            BlockState::Resident { refs } => refs,
            BlockState::Evicted { refs } => {
                self.load_fast(block_id)?;
                self.counters.swap_ins += 1;
                refs
            }
            BlockState::Free => {
                self.load_fast(block_id)?;
                self.remove_from_free_list(block_id);
                self.counters.swap_ins += 1;
                debug!(block_id, "Revived free block");
                0
            }
        };
        self.set_state(block_id, BlockState::Resident { refs: refs + 1 });
        self.evictor.touch(block_id);
        self.sync_anchor_status(block_id);
        Ok(())
    }

    /// Drop one claim. A block left without claims is swapped out and
    /// reclaimed, or kept resident and evictable under `retain_released`.
    fn release(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        match self.blocks[block_id].state {
            BlockState::Resident { refs: 0 } | BlockState::Free => {
                warn!(block_id, "Release of an unclaimed block ignored");
            }
            BlockState::Resident { refs } => {
                self.set_state(block_id, BlockState::Resident { refs: refs - 1 });
                if refs == 1 {
                    if self.retain_released {
                        self.evictor.touch(block_id);
                    } else {
                        self.swap_out_block(block_id)?;
                    }
                }
            }
            BlockState::Evicted { refs: 1 } => {
                // Content is already mirrored; only the slot is returned.
                self.reclaim(block_id);
            }
            BlockState::Evicted { refs } => {
                self.set_state(block_id, BlockState::Evicted { refs: refs - 1 });
            }
        }
        Ok(())
    }

    fn swap_out_block(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        let refs = match self.blocks[block_id].state {
            BlockState::Resident { refs } => refs,
            BlockState::Free | BlockState::Evicted { .. } => return Ok(()),
        };

        if self.blocks[block_id].slow.is_none() {
            let slow = self.storage.allocate(Tier::Ram)?;
            self.blocks[block_id].slow = Some(slow);
        }
        let block = &self.blocks[block_id];
        let (Some(fast), Some(slow)) = (block.fast.as_ref(), block.slow.as_ref()) else {
            return Err(PoolError::Inconsistent(format!("resident block {block_id} has no fast buffer")));
        };
        self.storage.mirror(fast, slow)?;

        // Leave the fast tier before returning the buffer, so a failed free
        // cannot strand a RESIDENT block without one.
        let fast = self.blocks[block_id].fast.take();
        self.counters.swap_outs += 1;
        if refs == 0 {
            self.reclaim(block_id);
        } else {
            self.set_state(block_id, BlockState::Evicted { refs });
            self.sync_anchor_status(block_id);
        }
        debug!(block_id, refs, "Swapped out block");

        if let Some(fast) = fast {
            self.storage.free(fast)?;
        }
        Ok(())
    }

    fn swap_in_block(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        let BlockState::Evicted { refs } = self.blocks[block_id].state else {
            return Ok(());
        };
        self.load_fast(block_id)?;
        self.set_state(block_id, BlockState::Resident { refs });
        self.sync_anchor_status(block_id);
        self.counters.swap_ins += 1;
        debug!(block_id, refs, "Swapped in block");
        Ok(())
    }

    /// Acquire a fast-tier buffer and fill it from the slow-tier mirror.
    fn load_fast(&mut self, block_id: BlockId) -> Result<(), PoolError> {
        let fast = self.storage.allocate(Tier::Gpu)?;
        if let Some(slow) = self.blocks[block_id].slow.as_ref() {
            if let Err(e) = self.storage.mirror(slow, &fast) {
                self.storage.free(fast)?;
                return Err(e.into());
            }
        }
        self.blocks[block_id].fast = Some(fast);
        Ok(())
    }

    /// Put a block with no claims and no fast buffer back on the free list.
    /// Its anchor survives until the block is recycled.
    fn reclaim(&mut self, block_id: BlockId) {
        self.set_state(block_id, BlockState::Free);
        self.evictor.forget(block_id);
        self.free_list.push_back(block_id);
        self.sync_anchor_status(block_id);
        self.counters.reclaimed += 1;
    }

    fn evict_one(&mut self, protect: Option<BlockId>) -> Result<BlockId, PoolError> {
        let blocks = &self.blocks;
        let victim = self
            .evictor
            .select_victim(|id| Some(id) != protect && blocks[id].state.is_evictable())
            .ok_or(PoolError::NoEvictableBlock {
                allocated: self.evictor.len(),
            })?;

        self.swap_out_block(victim)?;
        self.counters.evictions += 1;
        debug!(block_id = victim, "Evicted block");
        Ok(victim)
    }

    fn remove_from_free_list(&mut self, block_id: BlockId) {
        if let Some(pos) = self.free_list.iter().position(|&id| id == block_id) {
            self.free_list.remove(pos);
        }
    }

    /// The only place block state changes; keeps the evictable count in step.
    fn set_state(&mut self, block_id: BlockId, state: BlockState) {
        let old = std::mem::replace(&mut self.blocks[block_id].state, state);
        if old.is_evictable() {
            self.num_evictable -= 1;
        }
        if state.is_evictable() {
            self.num_evictable += 1;
        }
    }

    fn check_id(&self, block_id: BlockId) -> Result<(), PoolError> {
        if block_id < self.blocks.len() {
            Ok(())
        } else {
            Err(PoolError::UnknownBlock(block_id))
        }
    }
}

/// Thread-safe wrapper around the manager. Take the write lock for every
/// mutating call; admission checks under a read lock must be repeated under
/// the write lock before acting on them.
pub type SharedBlockManager<S> = Arc<RwLock<BlockManager<S>>>;

/// Create a new thread-safe manager.
pub fn new_shared_manager<S: KvStorage>(config: &PoolConfig, storage: S) -> SharedBlockManager<S> {
    Arc::new(RwLock::new(BlockManager::new(config, storage)))
}
