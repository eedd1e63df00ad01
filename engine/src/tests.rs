/// End-to-end tests over the public façade: allocation identity,
/// exhaustion, rebalance and resize releases, budget moves, traversal,
/// and cross-thread behavior.
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use crate::test_util::Fixture;
use crate::{
    AllocInfo, ClassId, Error, IterDecision, MemoryAllocatorConfig, PoolId, ReleaseMode,
    SLAB_SIZE,
};

const MIB: usize = 1024 * 1024;

/// 16 MiB backing region (4 slabs) with a two-class ladder.
fn fixture_128_256() -> Fixture {
    Fixture::with_config(
        4,
        MemoryAllocatorConfig {
            default_alloc_sizes: vec![128, 256],
        },
    )
}

#[test]
fn allocation_identity_reads_from_header() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();
    assert_eq!(pool, PoolId(0));
    assert_eq!(f.alloc.get_pool_id("A").unwrap(), pool);

    let p1 = f.alloc.allocate(pool, 100).unwrap().unwrap();
    assert_eq!(
        f.alloc.get_alloc_info(p1.as_ptr()).unwrap(),
        AllocInfo {
            pool_id: pool,
            class_id: f.alloc.classify(pool, 100).unwrap(),
            alloc_size: 128,
        }
    );
    assert_eq!(f.alloc.classify(pool, 100).unwrap(), ClassId(0));
    assert_eq!(f.alloc.get_alloc_size(pool, ClassId(0)).unwrap(), 128);
}

#[test]
fn pool_exhaustion_returns_none() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();

    // Two slabs of 128-byte chunks fit the 8 MiB target exactly.
    let per_slab = SLAB_SIZE / 128;
    for _ in 0..2 * per_slab {
        assert!(f.alloc.allocate(pool, 128).unwrap().is_some());
    }
    assert!(f.alloc.allocate(pool, 128).unwrap().is_none());

    let stats = f.alloc.pool_stats(pool).unwrap();
    assert_eq!(stats.current_size_bytes, 8 * MIB);
}

#[test]
fn allocate_validates_pool_and_size() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();
    assert_eq!(
        f.alloc.allocate(PoolId(7), 64).unwrap_err(),
        Error::UnknownPool(7)
    );
    assert_eq!(
        f.alloc.allocate(pool, 300).unwrap_err(),
        Error::SizeTooLarge {
            size: 300,
            largest: 256
        }
    );
}

#[test]
fn rebalance_release_moves_full_slab_between_classes() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();

    // Fill one 256-byte slab completely; the 128 class holds nothing.
    let per_slab = SLAB_SIZE / 256;
    let held: Vec<usize> = (0..per_slab)
        .map(|_| f.alloc.allocate(pool, 256).unwrap().unwrap().as_ptr() as usize)
        .collect();

    let ctx = f
        .alloc
        .start_slab_release(
            pool,
            ClassId(1),
            Some(ClassId(0)),
            ReleaseMode::Rebalance,
            None,
            None,
        )
        .unwrap();
    assert!(!ctx.is_released());
    assert_eq!(f.alloc.live_allocation_count(&ctx).unwrap(), per_slab);
    assert!(!f.alloc.all_allocs_freed(&ctx).unwrap());

    for &addr in &held {
        f.alloc.free(addr as *mut u8).unwrap();
    }
    assert!(f.alloc.all_allocs_freed(&ctx).unwrap());

    f.alloc.complete_slab_release(ctx).unwrap();

    // The slab now serves 128-byte chunks, and new allocations land
    // inside it.
    let info = f.alloc.get_alloc_info(held[0] as *const u8).unwrap();
    assert_eq!(info.class_id, ClassId(0));
    assert_eq!(info.alloc_size, 128);

    let p = f.alloc.allocate(pool, 128).unwrap().unwrap();
    let slab_base = held
        .iter()
        .copied()
        .min()
        .expect("held is non-empty");
    assert!(
        (slab_base..slab_base + SLAB_SIZE).contains(&(p.as_ptr() as usize)),
        "fresh allocation escaped the rebalanced slab"
    );
}

#[test]
fn budget_transfers_between_pools() {
    let f = fixture_128_256();
    let a = f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();
    let b = f.alloc.add_pool("B", 8 * MIB, None, false).unwrap();

    // Nothing is unreserved, so A cannot grow.
    assert!(!f.alloc.grow_pool(a, MIB).unwrap());

    assert!(f.alloc.resize_pools(b, a, 4 * MIB).unwrap());
    assert_eq!(f.alloc.pool_stats(a).unwrap().target_size_bytes, 12 * MIB);
    assert_eq!(f.alloc.pool_stats(b).unwrap().target_size_bytes, 4 * MIB);
    assert_eq!(f.alloc.bytes_unreserved(), 0);
}

#[test]
fn shrink_then_resize_release_clears_over_limit() {
    let f = Fixture::with_config(
        4,
        MemoryAllocatorConfig {
            default_alloc_sizes: vec![MIB as u32],
        },
    );
    let a = f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();

    // Hold 8 MiB in slabs.
    let held: Vec<usize> = (0..8)
        .map(|_| f.alloc.allocate(a, MIB).unwrap().unwrap().as_ptr() as usize)
        .collect();

    assert!(f.alloc.shrink_pool(a, 4 * MIB).unwrap());
    assert_eq!(f.alloc.get_pools_over_limit(), vec![a]);

    // Drain the second slab (the last four allocations) and release it.
    for &addr in &held[4..] {
        f.alloc.free(addr as *mut u8).unwrap();
    }
    let ctx = f
        .alloc
        .start_slab_release(a, ClassId(0), None, ReleaseMode::Resize, None, None)
        .unwrap();
    assert!(ctx.is_released());
    f.alloc.complete_slab_release(ctx).unwrap();

    assert!(f.alloc.get_pools_over_limit().is_empty());
    assert_eq!(f.alloc.pool_stats(a).unwrap().current_size_bytes, 4 * MIB);
    assert_eq!(f.alloc.stats().free_slabs, 3);
}

#[test]
fn allocations_are_disjoint_and_aligned() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();

    let mut spans: Vec<(usize, usize)> = Vec::new();
    for _ in 0..64 {
        let p = f.alloc.allocate(pool, 100).unwrap().unwrap().as_ptr() as usize;
        assert_eq!(p % crate::MIN_ALLOC_ALIGNMENT, 0);
        spans.push((p, 128));
    }
    for _ in 0..64 {
        let p = f.alloc.allocate(pool, 200).unwrap().unwrap().as_ptr() as usize;
        assert_eq!(p % crate::MIN_ALLOC_ALIGNMENT, 0);
        spans.push((p, 256));
    }

    spans.sort();
    for pair in spans.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "allocations overlap: {:?}",
            pair
        );
    }
}

#[test]
fn full_free_restores_initial_carve() {
    let f = Fixture::with_config(
        1,
        MemoryAllocatorConfig {
            default_alloc_sizes: vec![MIB as u32],
        },
    );
    let pool = f.alloc.add_pool("A", 4 * MIB, None, false).unwrap();

    let first: HashSet<usize> = (0..4)
        .map(|_| f.alloc.allocate(pool, MIB).unwrap().unwrap().as_ptr() as usize)
        .collect();
    assert!(f.alloc.allocate(pool, MIB).unwrap().is_none());
    for &addr in &first {
        f.alloc.free(addr as *mut u8).unwrap();
    }

    // The free list holds exactly the original carve-up again.
    let second: HashSet<usize> = (0..4)
        .map(|_| f.alloc.allocate(pool, MIB).unwrap().unwrap().as_ptr() as usize)
        .collect();
    assert_eq!(first, second);
}

#[test]
fn free_rejects_foreign_pointers() {
    let f = fixture_128_256();
    f.alloc.add_pool("A", 8 * MIB, None, false).unwrap();

    let mut on_stack = 0u8;
    assert_eq!(
        f.alloc.free(&mut on_stack as *mut u8),
        Err(Error::ForeignPointer)
    );
    assert_eq!(
        f.alloc.get_alloc_info(&on_stack as *const u8).unwrap_err(),
        Error::ForeignPointer
    );
}

#[test]
fn traversal_skips_unassigned_advised_and_marked_slabs() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 16 * MIB, None, false).unwrap();

    // Slab 0: 128-byte chunks. Slab 1: 256-byte chunks. Slabs 2-3 stay
    // unassigned.
    let small = f.alloc.allocate(pool, 128).unwrap().unwrap();
    let large = f.alloc.allocate(pool, 256).unwrap().unwrap();

    let mut visited = 0usize;
    let skipped = f.alloc.for_each_allocation(|_, _| {
        visited += 1;
        IterDecision::Continue
    });
    assert_eq!(skipped, 2);
    assert_eq!(visited, SLAB_SIZE / 128 + SLAB_SIZE / 256);

    // Advising a slab hides its chunks from traversal.
    assert!(f.alloc.mark_slab_advised(small.as_ptr(), true).unwrap());
    let mut visited = 0usize;
    let skipped = f.alloc.for_each_allocation(|_, _| {
        visited += 1;
        IterDecision::Continue
    });
    assert_eq!(skipped, 3);
    assert_eq!(visited, SLAB_SIZE / 256);
    assert_eq!(f.alloc.stats().bytes_advised, SLAB_SIZE);

    // Re-advising is a no-op; un-advising restores the slab.
    assert!(!f.alloc.mark_slab_advised(small.as_ptr(), true).unwrap());
    assert!(f.alloc.mark_slab_advised(small.as_ptr(), false).unwrap());
    assert_eq!(f.alloc.stats().bytes_advised, 0);

    // A slab mid-release is skipped as well.
    let ctx = f
        .alloc
        .start_slab_release(
            pool,
            ClassId(1),
            None,
            ReleaseMode::Resize,
            Some(large.as_ptr() as *const u8),
            None,
        )
        .unwrap();
    assert!(!ctx.is_released());
    let skipped = f.alloc.for_each_allocation(|_, _| IterDecision::Continue);
    assert_eq!(skipped, 3);

    // Aborting unmarks the slab and traversal sees it again.
    f.alloc.abort_slab_release(&ctx).unwrap();
    let skipped = f.alloc.for_each_allocation(|_, _| IterDecision::Continue);
    assert_eq!(skipped, 2);
}

#[test]
fn traversal_skip_and_stop_decisions() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 16 * MIB, None, false).unwrap();
    f.alloc.allocate(pool, 128).unwrap().unwrap();
    f.alloc.allocate(pool, 256).unwrap().unwrap();

    // SkipSlab visits one chunk per serving slab.
    let mut visits = 0usize;
    f.alloc.for_each_allocation(|_, _| {
        visits += 1;
        IterDecision::SkipSlab
    });
    assert_eq!(visits, 2);

    // Stop ends the walk after the first chunk.
    let mut visits = 0usize;
    let skipped = f.alloc.for_each_allocation(|_, _| {
        visits += 1;
        IterDecision::Stop
    });
    assert_eq!(visits, 1);
    assert!(skipped <= 2);
}

#[test]
fn advised_slab_is_not_a_release_victim() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 16 * MIB, None, false).unwrap();

    let p = f.alloc.allocate(pool, 128).unwrap().unwrap();
    f.alloc.free(p.as_ptr()).unwrap();
    assert!(f.alloc.mark_slab_advised(p.as_ptr(), true).unwrap());

    // The advised slab is the only one the class holds: neither a
    // pinned nor an unpinned release may take it.
    assert_eq!(
        f.alloc
            .start_slab_release(
                pool,
                ClassId(0),
                None,
                ReleaseMode::Resize,
                Some(p.as_ptr() as *const u8),
                None,
            )
            .unwrap_err(),
        Error::NoReleasableSlab
    );
    assert_eq!(
        f.alloc
            .start_slab_release(pool, ClassId(0), None, ReleaseMode::Resize, None, None)
            .unwrap_err(),
        Error::NoReleasableSlab
    );

    // Un-advising makes it eligible again.
    assert!(f.alloc.mark_slab_advised(p.as_ptr(), false).unwrap());
    let ctx = f
        .alloc
        .start_slab_release(pool, ClassId(0), None, ReleaseMode::Resize, None, None)
        .unwrap();
    assert!(ctx.is_released());
}

#[test]
fn advised_accounting_reconciles_through_release() {
    let f = Fixture::with_config(
        1,
        MemoryAllocatorConfig {
            default_alloc_sizes: vec![MIB as u32],
        },
    );
    let pool = f.alloc.add_pool("A", 4 * MIB, None, false).unwrap();
    let held = f.alloc.allocate(pool, MIB).unwrap().unwrap().as_ptr() as usize;

    let ctx = f
        .alloc
        .start_slab_release(pool, ClassId(0), None, ReleaseMode::Resize, None, None)
        .unwrap();
    assert!(!ctx.is_released());

    // Advising while the release is pending is allowed; the counter
    // must come back down when the slab is disposed of.
    assert!(f.alloc.mark_slab_advised(held as *const u8, true).unwrap());
    assert_eq!(f.alloc.stats().bytes_advised, SLAB_SIZE);

    f.alloc.free(held as *mut u8).unwrap();
    f.alloc.complete_slab_release(ctx).unwrap();
    assert_eq!(f.alloc.stats().bytes_advised, 0);
    assert_eq!(f.alloc.stats().free_slabs, 1);

    // The same physical slab serves a new owner with a clean flag byte;
    // advising it again counts exactly once.
    let p = f.alloc.allocate(pool, MIB).unwrap().unwrap();
    assert!(f.alloc.mark_slab_advised(p.as_ptr(), true).unwrap());
    assert_eq!(f.alloc.stats().bytes_advised, SLAB_SIZE);
}

#[test]
fn complete_blocks_until_last_free() {
    let f = Fixture::with_config(
        1,
        MemoryAllocatorConfig {
            default_alloc_sizes: vec![MIB as u32],
        },
    );
    let pool = f.alloc.add_pool("A", 4 * MIB, None, false).unwrap();
    let held = f.alloc.allocate(pool, MIB).unwrap().unwrap().as_ptr() as usize;

    let ctx = f
        .alloc
        .start_slab_release(pool, ClassId(0), None, ReleaseMode::Resize, None, None)
        .unwrap();
    assert!(!ctx.is_released());

    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            f.alloc.free(held as *mut u8).unwrap();
        });
        f.alloc.complete_slab_release(ctx).unwrap();
    });

    assert_eq!(f.alloc.stats().free_slabs, 1);
    assert_eq!(f.alloc.pool_stats(pool).unwrap().current_size_bytes, 0);
}

#[test]
fn concurrent_allocations_are_distinct() {
    let f = fixture_128_256();
    let pool = f.alloc.add_pool("A", 16 * MIB, None, false).unwrap();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;

    let mut all = Vec::new();
    thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    let mut addrs = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        let p = f.alloc.allocate(pool, 128).unwrap().unwrap();
                        addrs.push(p.as_ptr() as usize);
                    }
                    addrs
                })
            })
            .collect();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
    });

    let unique: HashSet<usize> = all.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);

    for addr in all {
        f.alloc.free(addr as *mut u8).unwrap();
    }
}
