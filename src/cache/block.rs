//! KV block types and block table management.
//!
//! A block is one slot of the fixed pool. It holds the KV state of up to
//! `capacity` tokens and is the unit of sharing, eviction and tier movement.

use serde::{Deserialize, Serialize};

use crate::storage::StorageHandle;

/// Identifies which storage tier a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Fast tier: GPU VRAM.
    Gpu,
    /// Slow tier: pinned host RAM.
    Ram,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Gpu => write!(f, "GPU"),
            Tier::Ram => write!(f, "RAM"),
        }
    }
}

/// Stable pool index of a block.
pub type BlockId = usize;

/// Token id as produced by the tokenizer.
pub type TokenId = u32;

/// Coarse lifecycle status of a block, derived from [`BlockState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    Free,
    Resident,
    Evicted,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStatus::Free => write!(f, "FREE"),
            BlockStatus::Resident => write!(f, "RESIDENT"),
            BlockStatus::Evicted => write!(f, "EVICTED"),
        }
    }
}

/// Lifecycle state of a pool slot. The reference count lives inside the
/// variants so that "claimed but free" cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// On the free list. May still hold a slow-tier mirror of its last content.
    Free,
    /// Content in the fast tier. `refs == 0` means evictable.
    Resident { refs: usize },
    /// Content only in the slow tier, still claimed (`refs > 0`).
    Evicted { refs: usize },
}

impl BlockState {
    pub fn status(&self) -> BlockStatus {
        match self {
            BlockState::Free => BlockStatus::Free,
            BlockState::Resident { .. } => BlockStatus::Resident,
            BlockState::Evicted { .. } => BlockStatus::Evicted,
        }
    }

    pub fn ref_count(&self) -> usize {
        match *self {
            BlockState::Free => 0,
            BlockState::Resident { refs } | BlockState::Evicted { refs } => refs,
        }
    }

    /// Resident and unclaimed: can be swapped out to make room.
    pub fn is_evictable(&self) -> bool {
        matches!(self, BlockState::Resident { refs: 0 })
    }
}

/// A single pool slot.
#[derive(Debug)]
pub struct KvBlock {
    pub(crate) id: BlockId,

    /// Token capacity.
    pub(crate) capacity: usize,

    /// Tokens of state currently held.
    pub(crate) used: usize,

    pub(crate) state: BlockState,

    /// Fast-tier buffer, present iff the block is resident.
    pub(crate) fast: Option<StorageHandle>,

    /// Slow-tier buffer, allocated on first swap-out and kept afterwards.
    pub(crate) slow: Option<StorageHandle>,
}

impl KvBlock {
    /// Create a free, empty block.
    pub fn new(id: BlockId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            used: 0,
            state: BlockState::Free,
            fast: None,
            slow: None,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn status(&self) -> BlockStatus {
        self.state.status()
    }

    pub fn ref_count(&self) -> usize {
        self.state.ref_count()
    }

    /// Whether another token fits.
    pub fn has_space(&self) -> bool {
        self.used < self.capacity
    }

    pub fn fast_handle(&self) -> Option<&StorageHandle> {
        self.fast.as_ref()
    }

    pub fn slow_handle(&self) -> Option<&StorageHandle> {
        self.slow.as_ref()
    }

    /// Buffer currently holding the block's content: fast tier when resident,
    /// otherwise the slow-tier mirror.
    pub fn content_handle(&self) -> Option<&StorageHandle> {
        self.fast.as_ref().or(self.slow.as_ref())
    }
}

/// Ordered list of blocks backing one sequence.
///
/// Entry `i` holds the state for the `i`-th chunk of the sequence's tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block to the end of the sequence.
    pub fn push(&mut self, block_id: BlockId) {
        self.blocks.push(block_id);
    }

    /// Last block, where decode tokens land.
    pub fn last(&self) -> Option<BlockId> {
        self.blocks.last().copied()
    }

    /// Swap the last block for `block_id`, returning the one it replaces.
    /// None (and no change) on an empty table.
    pub fn replace_last(&mut self, block_id: BlockId) -> Option<BlockId> {
        self.blocks.last_mut().map(|last| std::mem::replace(last, block_id))
    }

    pub fn get(&self, idx: usize) -> Option<BlockId> {
        self.blocks.get(idx).copied()
    }

    /// Number of blocks in this sequence.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the block table is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn as_slice(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Tier::Gpu.to_string(), "GPU");
        assert_eq!(BlockStatus::Evicted.to_string(), "EVICTED");
    }

    #[test]
    fn test_state_derives_status_and_refs() {
        assert_eq!(BlockState::Free.status(), BlockStatus::Free);
        assert_eq!(BlockState::Free.ref_count(), 0);
        assert_eq!(BlockState::Resident { refs: 2 }.ref_count(), 2);
        assert_eq!(BlockState::Evicted { refs: 1 }.status(), BlockStatus::Evicted);

        assert!(BlockState::Resident { refs: 0 }.is_evictable());
        assert!(!BlockState::Resident { refs: 1 }.is_evictable());
        assert!(!BlockState::Evicted { refs: 1 }.is_evictable());
        assert!(!BlockState::Free.is_evictable());
    }

    #[test]
    fn test_block_space() {
        let mut block = KvBlock::new(3, 2);
        assert_eq!(block.status(), BlockStatus::Free);
        assert!(block.has_space());
        block.used = 2;
        assert!(!block.has_space());
        assert!(block.content_handle().is_none());
    }

    #[test]
    fn test_block_table_ops() {
        let mut table = BlockTable::new();
        assert!(table.is_empty());
        assert_eq!(table.last(), None);

        table.push(7);
        table.push(2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.last(), Some(2));
        assert_eq!(table.get(0), Some(7));
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![7, 2]);

        assert_eq!(table.replace_last(5), Some(2));
        assert_eq!(table.as_slice(), &[7, 5]);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.replace_last(1), None);
        assert!(table.is_empty());
    }
}
