//! Host-memory storage backend for both tiers.
//!
//! Each tier is a pool of fixed-size slots handed out from a free list with
//! O(1) alloc/free. The "GPU" tier is simulated in host memory, so this
//! backend is what tests, benches and the simulation binary run against.

use std::collections::VecDeque;

use tracing::debug;

use crate::cache::block::Tier;
use crate::storage::{KvStorage, StorageError, StorageHandle};

/// Per-tier slot pool.
#[derive(Debug)]
struct TierArena {
    tier: Tier,

    /// Slot size in bytes.
    slot_bytes: usize,

    /// Total number of slots.
    total_slots: usize,

    /// Free slot offsets.
    free_list: VecDeque<usize>,

    /// Slot contents, materialised on first allocation.
    slots: Vec<Option<Vec<u8>>>,

    /// Number of slots currently handed out.
    allocated: usize,
}

impl TierArena {
    fn new(tier: Tier, total_slots: usize, slot_bytes: usize) -> Self {
        let free_list: VecDeque<usize> = (0..total_slots).map(|i| i * slot_bytes).collect();

        Self {
            tier,
            slot_bytes,
            total_slots,
            free_list,
            slots: (0..total_slots).map(|_| None).collect(),
            allocated: 0,
        }
    }

    fn allocate(&mut self) -> Result<StorageHandle, StorageError> {
        let offset = self.free_list.pop_front().ok_or(StorageError::OutOfMemory {
            tier: self.tier,
            total: self.total_slots,
        })?;
        let idx = offset / self.slot_bytes;
        if self.slots[idx].is_none() {
            self.slots[idx] = Some(vec![0u8; self.slot_bytes]);
        }
        self.allocated += 1;
        Ok(StorageHandle::new(self.tier, offset, self.slot_bytes))
    }

    fn slot_index(&self, handle: &StorageHandle) -> Result<usize, StorageError> {
        let invalid = StorageError::InvalidHandle {
            tier: self.tier,
            offset: handle.offset(),
        };
        if handle.tier() != self.tier
            || handle.offset() % self.slot_bytes != 0
            || handle.offset() / self.slot_bytes >= self.total_slots
        {
            return Err(invalid);
        }
        Ok(handle.offset() / self.slot_bytes)
    }

    fn free(&mut self, handle: StorageHandle) -> Result<(), StorageError> {
        self.slot_index(&handle)?;
        self.free_list.push_back(handle.offset());
        self.allocated = self.allocated.saturating_sub(1);
        Ok(())
    }

    fn data(&self, handle: &StorageHandle) -> Result<&[u8], StorageError> {
        let idx = self.slot_index(handle)?;
        self.slots[idx]
            .as_deref()
            .ok_or(StorageError::InvalidHandle {
                tier: self.tier,
                offset: handle.offset(),
            })
    }

    fn data_mut(&mut self, handle: &StorageHandle) -> Result<&mut [u8], StorageError> {
        let idx = self.slot_index(handle)?;
        let tier = self.tier;
        self.slots[idx]
            .as_deref_mut()
            .ok_or(StorageError::InvalidHandle {
                tier,
                offset: handle.offset(),
            })
    }
}

/// Transfer statistics.
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    pub total_d2h_bytes: u64,
    pub total_h2d_bytes: u64,
    pub total_d2h_transfers: u64,
    pub total_h2d_transfers: u64,
    pub total_prefix_copies: u64,
    pub total_prefix_copy_bytes: u64,
}

/// In-memory two-tier storage.
pub struct HostStorage {
    gpu: TierArena,
    ram: TierArena,

    /// Bytes of KV state per token (all layers, K and V).
    bytes_per_token: usize,

    /// Tokens per block.
    block_size: usize,

    stats: TransferStats,
}

impl HostStorage {
    /// Create a backend with `gpu_slots` fast-tier and `ram_slots` slow-tier
    /// buffers of `block_size * bytes_per_token` bytes each.
    pub fn new(gpu_slots: usize, ram_slots: usize, block_size: usize, bytes_per_token: usize) -> Self {
        let slot_bytes = (block_size * bytes_per_token).max(1);
        Self {
            gpu: TierArena::new(Tier::Gpu, gpu_slots, slot_bytes),
            ram: TierArena::new(Tier::Ram, ram_slots, slot_bytes),
            bytes_per_token,
            block_size,
            stats: TransferStats::default(),
        }
    }

    /// A backend sized for a pool of `num_blocks` blocks: every block can hold
    /// one buffer in each tier.
    pub fn for_pool(num_blocks: usize, block_size: usize, bytes_per_token: usize) -> Self {
        Self::new(num_blocks, num_blocks, block_size, bytes_per_token)
    }

    fn arena(&self, tier: Tier) -> &TierArena {
        match tier {
            Tier::Gpu => &self.gpu,
            Tier::Ram => &self.ram,
        }
    }

    fn arena_mut(&mut self, tier: Tier) -> &mut TierArena {
        match tier {
            Tier::Gpu => &mut self.gpu,
            Tier::Ram => &mut self.ram,
        }
    }

    /// Full content of a buffer.
    pub fn read(&self, handle: &StorageHandle) -> Result<&[u8], StorageError> {
        self.arena(handle.tier()).data(handle)
    }

    /// State bytes of one token slot.
    pub fn read_token(&self, handle: &StorageHandle, token: usize) -> Result<&[u8], StorageError> {
        let range = self.token_range(token, 1)?;
        Ok(&self.read(handle)?[range])
    }

    /// Overwrite the state of token slot `token` with `bytes`.
    pub fn write_token(
        &mut self,
        handle: &StorageHandle,
        token: usize,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        if bytes.len() != self.bytes_per_token {
            return Err(StorageError::SizeMismatch {
                needed: self.bytes_per_token,
                available: bytes.len(),
            });
        }
        let range = self.token_range(token, 1)?;
        self.arena_mut(handle.tier()).data_mut(handle)?[range].copy_from_slice(bytes);
        Ok(())
    }

    fn token_range(&self, first: usize, count: usize) -> Result<std::ops::Range<usize>, StorageError> {
        if first + count > self.block_size {
            return Err(StorageError::SizeMismatch {
                needed: (first + count) * self.bytes_per_token,
                available: self.block_size * self.bytes_per_token,
            });
        }
        Ok(first * self.bytes_per_token..(first + count) * self.bytes_per_token)
    }

    /// Buffers currently handed out in `tier`.
    pub fn allocated(&self, tier: Tier) -> usize {
        self.arena(tier).allocated
    }

    /// Bytes of state per token.
    pub fn bytes_per_token(&self) -> usize {
        self.bytes_per_token
    }

    /// Get transfer statistics.
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}

impl KvStorage for HostStorage {
    fn allocate(&mut self, tier: Tier) -> Result<StorageHandle, StorageError> {
        let handle = self.arena_mut(tier).allocate()?;
        debug!(tier = %tier, offset = handle.offset(), "Allocated buffer");
        Ok(handle)
    }

    fn free(&mut self, handle: StorageHandle) -> Result<(), StorageError> {
        let tier = handle.tier();
        let offset = handle.offset();
        self.arena_mut(tier).free(handle)?;
        debug!(tier = %tier, offset, "Freed buffer");
        Ok(())
    }

    fn mirror(&mut self, src: &StorageHandle, dst: &StorageHandle) -> Result<(), StorageError> {
        if src.size() != dst.size() {
            return Err(StorageError::SizeMismatch {
                needed: src.size(),
                available: dst.size(),
            });
        }
        let data = self.read(src)?.to_vec();
        self.arena_mut(dst.tier())
            .data_mut(dst)?
            .copy_from_slice(&data);

        let bytes = data.len() as u64;
        match (src.tier(), dst.tier()) {
            (Tier::Gpu, Tier::Ram) => {
                self.stats.total_d2h_bytes += bytes;
                self.stats.total_d2h_transfers += 1;
            }
            (Tier::Ram, Tier::Gpu) => {
                self.stats.total_h2d_bytes += bytes;
                self.stats.total_h2d_transfers += 1;
            }
            _ => {}
        }
        debug!(from = %src.tier(), to = %dst.tier(), size = bytes, "Mirrored block");
        Ok(())
    }

    fn copy_tokens(
        &mut self,
        src: &StorageHandle,
        dst: &StorageHandle,
        tokens: usize,
    ) -> Result<(), StorageError> {
        let range = self.token_range(0, tokens)?;
        let data = self.read(src)?[range.clone()].to_vec();
        self.arena_mut(dst.tier()).data_mut(dst)?[range].copy_from_slice(&data);

        self.stats.total_prefix_copies += 1;
        self.stats.total_prefix_copy_bytes += data.len() as u64;
        Ok(())
    }
}
