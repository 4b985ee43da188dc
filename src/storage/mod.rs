//! Tier storage backends.
//!
//! The block manager never touches KV bytes itself. It creates and destroys
//! opaque [`StorageHandle`]s through a [`KvStorage`] backend and asks the
//! backend to move content between them:
//! - [`KvStorage::mirror`] copies a whole block between tiers (swap in/out)
//! - [`KvStorage::copy_tokens`] copies the leading tokens of a block (fork)
//!
//! - [`host`]: in-memory backend for both tiers, used for testing and simulation

pub mod host;

use thiserror::Error;

use crate::cache::block::Tier;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("Out of {tier} memory: all {total} slots in use")]
    OutOfMemory { tier: Tier, total: usize },

    #[error("Invalid {tier} handle at offset {offset}")]
    InvalidHandle { tier: Tier, offset: usize },

    #[error("Size mismatch: need {needed} bytes, have {available}")]
    SizeMismatch { needed: usize, available: usize },
}

/// An opaque, fixed-shape buffer holding one block of KV state in one tier.
///
/// Handles are move-only: whoever holds the handle owns the buffer and must
/// hand it back through [`KvStorage::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct StorageHandle {
    tier: Tier,
    offset: usize,
    size: usize,
}

impl StorageHandle {
    /// Create a handle. Only storage backends should call this.
    pub fn new(tier: Tier, offset: usize, size: usize) -> Self {
        Self { tier, offset, size }
    }

    /// Tier this buffer lives in.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Backend-specific offset of the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Backend that owns the memory behind block handles.
///
/// All operations are synchronous and total from the manager's point of view:
/// an `Err` is fatal for the request that triggered it.
pub trait KvStorage {
    /// Acquire a block-sized buffer in `tier`.
    fn allocate(&mut self, tier: Tier) -> Result<StorageHandle, StorageError>;

    /// Return a buffer to the backend.
    fn free(&mut self, handle: StorageHandle) -> Result<(), StorageError>;

    /// Copy the full content of `src` into `dst` (typically across tiers).
    fn mirror(&mut self, src: &StorageHandle, dst: &StorageHandle) -> Result<(), StorageError>;

    /// Copy the state of the first `tokens` tokens of `src` into `dst`.
    fn copy_tokens(
        &mut self,
        src: &StorageHandle,
        dst: &StorageHandle,
        tokens: usize,
    ) -> Result<(), StorageError>;
}
