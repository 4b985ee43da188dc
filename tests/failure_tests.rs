//! Integration tests for pool state after backend failures.

use kv_prefix_pool::cache::block::{BlockState, Tier, TokenId};
use kv_prefix_pool::cache::manager::{BlockManager, PoolError};
use kv_prefix_pool::cache::sequence::Sequence;
use kv_prefix_pool::config::PoolConfig;
use kv_prefix_pool::storage::host::HostStorage;
use kv_prefix_pool::storage::{KvStorage, StorageError, StorageHandle};

/// Host storage with switchable failures per operation.
#[derive(Default)]
struct Faults {
    copy: bool,
    mirror: bool,
    free: bool,
}

struct FaultyStorage {
    inner: HostStorage,
    faults: Faults,
}

impl KvStorage for FaultyStorage {
    fn allocate(&mut self, tier: Tier) -> Result<StorageHandle, StorageError> {
        self.inner.allocate(tier)
    }

    fn free(&mut self, handle: StorageHandle) -> Result<(), StorageError> {
        if self.faults.free {
            return Err(StorageError::InvalidHandle {
                tier: handle.tier(),
                offset: handle.offset(),
            });
        }
        self.inner.free(handle)
    }

    fn mirror(&mut self, src: &StorageHandle, dst: &StorageHandle) -> Result<(), StorageError> {
        if self.faults.mirror {
            return Err(StorageError::SizeMismatch {
                needed: src.size(),
                available: 0,
            });
        }
        self.inner.mirror(src, dst)
    }

    fn copy_tokens(
        &mut self,
        src: &StorageHandle,
        dst: &StorageHandle,
        tokens: usize,
    ) -> Result<(), StorageError> {
        if self.faults.copy {
            return Err(StorageError::SizeMismatch {
                needed: tokens,
                available: 0,
            });
        }
        self.inner.copy_tokens(src, dst, tokens)
    }
}

fn make_pool(num_blocks: usize, block_size: usize, retain_released: bool) -> BlockManager<FaultyStorage> {
    let config = PoolConfig {
        num_blocks,
        block_size,
        retain_released,
    };
    let storage = FaultyStorage {
        inner: HostStorage::for_pool(num_blocks, block_size, 1),
        faults: Faults::default(),
    };
    BlockManager::new(&config, storage)
}

#[test]
fn test_failed_fork_copy_returns_block() {
    let mut mgr = make_pool(4, 4, false);
    let mut a = Sequence::new(0, vec![1, 2, 3, 4]);
    mgr.allocate(&mut a).unwrap();

    mgr.storage_mut().faults.copy = true;
    let mut b = Sequence::new(1, vec![1, 2, 9, 9]);
    assert!(matches!(mgr.allocate(&mut b), Err(PoolError::Storage(_))));
    assert!(b.block_table.is_empty());
    assert_eq!(mgr.num_free_blocks(), 3);
    mgr.check_consistency().unwrap();

    mgr.storage_mut().faults.copy = false;
    mgr.deallocate(&mut a).unwrap();
    mgr.deallocate(&mut b).unwrap();
    assert_eq!(mgr.num_free_blocks(), 4);
    for id in 0..4 {
        assert_eq!(mgr.block(id).unwrap().state(), BlockState::Free);
    }
    assert_eq!(mgr.storage().inner.allocated(Tier::Gpu), 0);
    mgr.check_consistency().unwrap();
}

#[test]
fn test_failed_decode_copy_keeps_shared_tail() {
    let mut mgr = make_pool(4, 4, false);
    let prompt: Vec<TokenId> = (1..=6).collect();
    let mut a = Sequence::new(0, prompt.clone());
    let mut b = Sequence::new(1, prompt);
    mgr.allocate(&mut a).unwrap();
    mgr.allocate(&mut b).unwrap();
    let tail = a.block_table.get(1).unwrap();

    mgr.storage_mut().faults.copy = true;
    a.push_token(7);
    assert!(matches!(mgr.append(&mut a), Err(PoolError::Storage(_))));

    assert_eq!(a.block_table.last(), Some(tail));
    assert_eq!(mgr.ref_count(tail), 2);
    assert_eq!(mgr.num_free_blocks(), 2);
    mgr.check_consistency().unwrap();

    mgr.storage_mut().faults.copy = false;
    mgr.append(&mut a).unwrap();
    assert_eq!(a.block_table.len(), 2);
    assert_eq!(mgr.ref_count(tail), 1);
    mgr.check_consistency().unwrap();
}

#[test]
fn test_eviction_failure_is_not_reported_as_exhaustion() {
    let mut mgr = make_pool(1, 2, true);
    let mut a = Sequence::new(0, vec![1, 2]);
    mgr.allocate(&mut a).unwrap();
    mgr.deallocate(&mut a).unwrap();
    assert_eq!(mgr.num_evictable_blocks(), 1);

    mgr.storage_mut().faults.mirror = true;
    let mut b = Sequence::new(1, vec![3, 4]);
    assert!(mgr.can_allocate(&b));
    match mgr.allocate(&mut b) {
        Err(PoolError::Storage(StorageError::SizeMismatch { .. })) => {}
        other => panic!("expected storage error, got {other:?}"),
    }

    // The victim was never moved and is still evictable.
    assert_eq!(mgr.block(0).unwrap().state(), BlockState::Resident { refs: 0 });
    assert_eq!(mgr.num_evictable_blocks(), 1);
    mgr.check_consistency().unwrap();

    mgr.storage_mut().faults.mirror = false;
    mgr.allocate(&mut b).unwrap();
    assert_eq!(mgr.stats().evictions, 1);
}

#[test]
fn test_failed_free_leaves_block_evicted() {
    let mut mgr = make_pool(2, 2, false);
    let mut a = Sequence::new(0, vec![1, 2]);
    mgr.allocate(&mut a).unwrap();
    let id = a.block_table.get(0).unwrap();

    mgr.storage_mut().faults.free = true;
    assert!(matches!(mgr.swap_out(id), Err(PoolError::Storage(_))));

    let block = mgr.block(id).unwrap();
    assert_eq!(block.state(), BlockState::Evicted { refs: 1 });
    assert!(block.fast_handle().is_none());
    assert!(block.slow_handle().is_some());
    mgr.check_consistency().unwrap();

    mgr.storage_mut().faults.free = false;
    mgr.swap_in(id).unwrap();
    mgr.deallocate(&mut a).unwrap();
    assert_eq!(mgr.num_free_blocks(), 2);
    mgr.check_consistency().unwrap();
}
