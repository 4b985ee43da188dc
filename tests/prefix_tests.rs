//! Integration tests for prefix sharing, forking and admission.

use kv_prefix_pool::cache::block::{BlockStatus, TokenId};
use kv_prefix_pool::cache::manager::BlockManager;
use kv_prefix_pool::cache::sequence::Sequence;
use kv_prefix_pool::config::PoolConfig;
use kv_prefix_pool::storage::host::HostStorage;

fn make_pool(num_blocks: usize, block_size: usize, retain_released: bool) -> BlockManager<HostStorage> {
    let config = PoolConfig {
        num_blocks,
        block_size,
        retain_released,
    };
    BlockManager::new(&config, HostStorage::for_pool(num_blocks, block_size, 1))
}

/// Write `base + t` as the state of token slot `t` for the first `tokens` slots.
fn fill_block(mgr: &mut BlockManager<HostStorage>, block_id: usize, tokens: usize, base: u8) {
    mgr.with_block_buffer(block_id, |storage, handle| {
        for t in 0..tokens {
            storage.write_token(handle, t, &[base + t as u8]).unwrap();
        }
    })
    .unwrap();
}

fn block_bytes(mgr: &mut BlockManager<HostStorage>, block_id: usize) -> Vec<u8> {
    mgr.with_block_buffer(block_id, |storage, handle| storage.read(handle).unwrap().to_vec())
        .unwrap()
}

fn assert_claims_match(mgr: &BlockManager<HostStorage>, live: &[Sequence]) {
    let mut claims = vec![0usize; mgr.num_blocks()];
    for seq in live {
        for id in seq.block_table.iter() {
            claims[id] += 1;
        }
    }
    for (id, &expected) in claims.iter().enumerate() {
        assert_eq!(mgr.ref_count(id), expected, "block {id} refcount");
    }
}

#[test]
fn test_prefix_sharing() {
    let mut mgr = make_pool(16, 4, false);
    let prompt: Vec<TokenId> = (1..=12).collect();

    let mut a = Sequence::new(0, [prompt.clone(), vec![99]].concat());
    let mut b = Sequence::new(1, [prompt.clone(), vec![77, 78]].concat());
    let mut c = Sequence::new(2, prompt);
    mgr.allocate(&mut a).unwrap();
    mgr.allocate(&mut b).unwrap();
    mgr.allocate(&mut c).unwrap();

    for i in 0..3 {
        let id = a.block_table.get(i).unwrap();
        assert_eq!(b.block_table.get(i), Some(id));
        assert_eq!(c.block_table.get(i), Some(id));
        assert_eq!(mgr.ref_count(id), 3);
    }
    assert_ne!(a.block_table.get(3), b.block_table.get(3));
    assert_eq!(c.block_table.len(), 3);
    assert_eq!(mgr.stats().prefix_hits, 6);
    mgr.check_consistency().unwrap();
}

#[test]
fn test_fork_copies_common_run() {
    let mut mgr = make_pool(4, 4, false);
    let mut a = Sequence::new(0, vec![1, 2, 3, 4]);
    mgr.allocate(&mut a).unwrap();
    let src = a.block_table.get(0).unwrap();
    fill_block(&mut mgr, src, 4, 10);

    let mut b = Sequence::new(1, vec![1, 2, 9, 9]);
    mgr.allocate(&mut b).unwrap();
    let dst = b.block_table.get(0).unwrap();

    assert_ne!(src, dst);
    assert_eq!(mgr.block(dst).unwrap().used(), 4);
    assert_eq!(&block_bytes(&mut mgr, dst)[..2], &[10, 11]);
    // The diverging tail is not taken from the source.
    assert_eq!(&block_bytes(&mut mgr, dst)[2..], &[0, 0]);

    let copies = mgr.storage().stats();
    assert_eq!(copies.total_prefix_copies, 1);
    assert_eq!(copies.total_prefix_copy_bytes, 2);

    // The forked block is itself indexed for the full chunk.
    let node = mgr.trie().get_node(&[1, 2, 9, 9]).unwrap();
    assert_eq!(mgr.trie().anchor(node).unwrap().block_id, dst);
    assert_eq!(mgr.ref_count(src), 1);
    mgr.check_consistency().unwrap();
}

#[test]
fn test_fork_from_released_source_uses_mirror() {
    let mut mgr = make_pool(4, 4, false);
    let mut a = Sequence::new(0, vec![1, 2, 3, 4]);
    mgr.allocate(&mut a).unwrap();
    let src = a.block_table.get(0).unwrap();
    fill_block(&mut mgr, src, 4, 40);
    mgr.deallocate(&mut a).unwrap();
    assert_eq!(mgr.block(src).unwrap().status(), BlockStatus::Free);

    let mut b = Sequence::new(1, vec![1, 2, 3, 8]);
    mgr.allocate(&mut b).unwrap();
    let dst = b.block_table.get(0).unwrap();

    assert_ne!(src, dst);
    assert_eq!(&block_bytes(&mut mgr, dst)[..3], &[40, 41, 42]);
    // The source stays free and still serves its own prefix.
    assert_eq!(mgr.block(src).unwrap().status(), BlockStatus::Free);
    let mut c = Sequence::new(2, vec![1, 2, 3, 4]);
    mgr.allocate(&mut c).unwrap();
    assert_eq!(c.block_table.get(0), Some(src));
    assert_eq!(&block_bytes(&mut mgr, src), &[40, 41, 42, 43]);
    mgr.check_consistency().unwrap();
}

#[test]
fn test_fork_falls_back_when_only_source_is_available() {
    let mut mgr = make_pool(1, 4, false);
    let mut a = Sequence::new(0, vec![1, 2, 3, 4]);
    mgr.allocate(&mut a).unwrap();
    mgr.deallocate(&mut a).unwrap();

    let mut b = Sequence::new(1, vec![1, 2, 9, 9]);
    assert!(mgr.can_allocate(&b));
    mgr.allocate(&mut b).unwrap();

    assert_eq!(b.block_table.get(0), Some(0));
    let stats = mgr.stats();
    assert_eq!(stats.prefix_forks, 0);
    assert_eq!(stats.fresh_blocks, 2);
    // The recycled block no longer answers for the old prefix.
    let old = mgr.trie().get_node(&[1, 2, 3, 4]).unwrap();
    assert!(mgr.trie().anchor(old).is_none());
    mgr.check_consistency().unwrap();
}

#[test]
fn test_decode_on_shared_tail_copies_it() {
    let mut mgr = make_pool(4, 4, false);
    let prompt: Vec<TokenId> = (1..=6).collect();
    let mut a = Sequence::new(0, prompt.clone());
    let mut b = Sequence::new(1, prompt);
    mgr.allocate(&mut a).unwrap();
    mgr.allocate(&mut b).unwrap();
    let tail = a.block_table.get(1).unwrap();
    assert_eq!(b.block_table.get(1), Some(tail));
    fill_block(&mut mgr, tail, 2, 60);

    a.push_token(7);
    assert!(mgr.can_append(&a));
    mgr.append(&mut a).unwrap();

    assert_eq!(a.block_table.len(), a.token_ids.len().div_ceil(4));
    assert_eq!(a.block_table.get(0), b.block_table.get(0));
    let own = a.block_table.get(1).unwrap();
    assert_ne!(own, tail);
    assert_eq!(mgr.block(own).unwrap().used(), 3);
    assert_eq!(&block_bytes(&mut mgr, own)[..2], &[60, 61]);

    // The other holder's tail is untouched and keeps its anchor.
    assert_eq!(mgr.ref_count(tail), 1);
    assert_eq!(mgr.block(tail).unwrap().used(), 2);
    let node = mgr.trie().get_node(&[1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(mgr.trie().anchor(node).unwrap().block_id, tail);

    a.push_token(8);
    mgr.append(&mut a).unwrap();
    a.push_token(9);
    mgr.append(&mut a).unwrap();
    assert_eq!(a.block_table.len(), 3);
    assert_eq!(mgr.stats().decode_copies, 1);
    assert_eq!(mgr.stats().decode_blocks, 1);
    assert_claims_match(&mgr, &[a, b]);
    mgr.check_consistency().unwrap();
}

#[test]
fn test_exact_multiple_boundary() {
    let mut mgr = make_pool(2, 4, false);
    let exact = Sequence::new(0, (0..8).collect());
    let over = Sequence::new(1, (0..9).collect());

    assert!(mgr.can_allocate(&exact));
    assert!(!mgr.can_allocate(&over));

    let mut exact = exact;
    mgr.allocate(&mut exact).unwrap();
    assert_eq!(exact.block_table.len(), 2);
    assert_eq!(mgr.num_free_blocks(), 0);
}

#[test]
fn test_deallocate_idempotent() {
    let mut mgr = make_pool(2, 4, false);
    let mut seq = Sequence::new(0, vec![1, 2, 3]);
    mgr.deallocate(&mut seq).unwrap();

    mgr.allocate(&mut seq).unwrap();
    mgr.deallocate(&mut seq).unwrap();
    let after_first = mgr.stats();

    mgr.deallocate(&mut seq).unwrap();
    assert_eq!(mgr.stats(), after_first);
    assert!(seq.block_table.is_empty());
    assert_eq!(mgr.num_free_blocks(), 2);
    mgr.check_consistency().unwrap();
}

/// Deterministic op mix over a small pool: admitted allocations and
/// appends never fail, and refcounts always equal live claims.
fn run_mixed_workload(retain_released: bool) {
    let mut mgr = make_pool(12, 4, retain_released);
    let prefixes: [Vec<TokenId>; 3] = [
        vec![1, 2, 3, 4, 5, 6],
        vec![1, 2, 3, 7, 8, 9],
        vec![20, 21, 22, 23, 24, 25],
    ];
    let mut rng: u64 = 7;
    let mut next = move |bound: u64| {
        rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1);
        (rng >> 33) % bound
    };

    let mut live: Vec<Sequence> = Vec::new();
    let mut admitted = 0;
    for step in 0..400u64 {
        if live.len() < 6 && next(3) != 0 {
            let mut tokens = prefixes[next(3) as usize].clone();
            tokens.extend((0..next(6)).map(|_| 100 + next(4) as TokenId));
            let mut seq = Sequence::new(step, tokens);
            if mgr.can_allocate(&seq) {
                mgr.allocate(&mut seq).unwrap();
                live.push(seq);
                admitted += 1;
            }
        } else if !live.is_empty() {
            let idx = next(live.len() as u64) as usize;
            if next(2) == 0 {
                if mgr.can_append(&live[idx]) {
                    live[idx].push_token(500 + step as TokenId);
                    mgr.append(&mut live[idx]).unwrap();
                }
            } else {
                let mut seq = live.swap_remove(idx);
                mgr.deallocate(&mut seq).unwrap();
            }
        }
        assert_claims_match(&mgr, &live);
        for seq in &live {
            assert_eq!(seq.block_table.len(), seq.token_ids.len().div_ceil(4));
        }
        mgr.check_consistency().unwrap();
    }

    assert!(admitted > 10);
    let stats = mgr.stats();
    assert!(stats.prefix_hits > 0);
    assert!(stats.prefix_forks > 0);

    for mut seq in live.drain(..) {
        mgr.deallocate(&mut seq).unwrap();
    }
    assert_claims_match(&mgr, &live);
    assert_eq!(
        mgr.num_free_blocks() + mgr.num_evictable_blocks(),
        mgr.num_blocks()
    );
}

#[test]
fn test_admission_and_refcount_conservation() {
    run_mixed_workload(false);
}

#[test]
fn test_admission_and_refcount_conservation_retained() {
    run_mixed_workload(true);
}
