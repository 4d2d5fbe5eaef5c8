//! Thread-local allocation: block budgets, disjointness across threads,
//! sharing through the global pool, and detach accounting.

mod common;

use std::ptr::NonNull;
use std::sync::Barrier;
use std::thread;

use common::{new_heap, small_config};
use msheap::{AllocFlags, CollectionRequest, DetachOutcome, HeapConfig, TlhConfig};

const THREADS: usize = 4;
const OBJECT: usize = 32;
/// Chunks of 32 bytes per 4 KB block: a 64-byte block header, then 8-byte
/// chunk headers.
const PER_BLOCK: usize = (4096 - 64) / (8 + OBJECT);

fn single_refill_config() -> HeapConfig {
    HeapConfig {
        thread_local: Some(TlhConfig {
            min_size: 8,
            max_size: 128,
            block_size: 4096,
            blocks_per_refill: 1,
            global_blocks_per_refill: 0,
        }),
        ..small_config()
    }
}

fn fill(object: NonNull<u8>, byte: u8) {
    // SAFETY: the object is live and OBJECT bytes long.
    unsafe { object.as_ptr().write_bytes(byte, OBJECT) };
}

fn holds(object: NonNull<u8>, byte: u8) -> bool {
    // SAFETY: as in `fill`.
    let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr(), OBJECT) };
    bytes.iter().all(|&b| b == byte)
}

const BUDGET_PER_BLOCK: usize = 64;

/// Blocks of exactly 64 chunks of `OBJECT` bytes. One block per refill, so
/// each thread creates blocks only for itself.
fn budget_config() -> HeapConfig {
    HeapConfig {
        thread_local: Some(TlhConfig {
            min_size: 8,
            max_size: 128,
            block_size: 64 + BUDGET_PER_BLOCK * (8 + OBJECT),
            blocks_per_refill: 1,
            global_blocks_per_refill: 0,
        }),
        ..small_config()
    }
}

#[test]
fn test_threads_allocate_disjoint_chunks_within_block_budget() {
    const PER_THREAD: usize = 250;
    let (heap, _runtime) = new_heap(budget_config());
    let m = heap.attach_thread("main");
    let baseline = m.lock_heap().stats();
    let barrier = Barrier::new(THREADS);

    let addresses: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = &heap;
                let barrier = &barrier;
                s.spawn(move || {
                    let mt = heap.attach_thread(&format!("worker-{t}"));
                    let pattern = u8::try_from(t + 1).unwrap();
                    let objects: Vec<_> = (0..PER_THREAD)
                        .map(|_| mt.allocate(OBJECT, AllocFlags::NONE).unwrap())
                        .collect();
                    for &object in &objects {
                        fill(object, pattern);
                    }
                    mt.blocking(|| barrier.wait());
                    for &object in &objects {
                        assert!(holds(object, pattern), "chunk overwritten by another thread");
                    }
                    objects
                        .iter()
                        .map(|object| object.as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        m.blocking(|| {
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        })
    });

    let mut sorted = addresses;
    sorted.sort_unstable();
    assert_eq!(sorted.len(), THREADS * PER_THREAD);
    for pair in sorted.windows(2) {
        assert!(pair[0] + OBJECT <= pair[1], "chunks overlap");
    }

    assert_eq!(heap.gc_history().total_recorded(), 0);
    let census = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(census.chunks_in_use, THREADS * PER_THREAD);
    assert_eq!(census.local_blocks, 0);
    let budget = PER_THREAD.div_ceil(BUDGET_PER_BLOCK) * THREADS;
    assert_eq!(budget, 16);
    assert!(
        census.blocks_created <= budget,
        "{} blocks created, budget {budget}",
        census.blocks_created
    );
    // 1000 chunks cannot fit in fewer.
    assert_eq!(census.blocks, budget);

    // The workers detached, so nothing is tracked anymore.
    m.collect(CollectionRequest::EXPLICIT);
    let metrics = heap.last_gc_metrics().unwrap();
    assert_eq!(metrics.objects_freed, THREADS * PER_THREAD);
    assert_eq!(metrics.blocks_released, budget);
    let census = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(census.blocks, 0);
    assert_eq!(census.chunks_in_use, 0);
    assert_eq!(census.blocks_released, census.blocks_created);

    let after = m.lock_heap().stats();
    assert_eq!(after.bytes_allocated, baseline.bytes_allocated);
    assert_eq!(after.objects_allocated, baseline.objects_allocated);
    assert_eq!(after.footprint, baseline.footprint);
}

#[test]
fn test_refill_cedes_blocks_to_other_threads() {
    let (heap, _runtime) = new_heap(small_config());
    let m = heap.attach_thread("main");

    m.allocate(OBJECT, AllocFlags::NONE).unwrap();
    let census = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(census.blocks_created, 2);
    assert_eq!(census.local_blocks, 1);
    assert_eq!(census.global_free_blocks, 1);

    thread::scope(|s| {
        let worker = s.spawn(|| {
            let mt = heap.attach_thread("worker");
            // A different size class: the ceded block is formatted for it.
            mt.allocate(2 * OBJECT, AllocFlags::NONE).unwrap();
            let census = mt.lock_heap().verify_thread_local_heaps().unwrap();
            assert_eq!(census.blocks_created, 2);
            assert_eq!(census.global_free_blocks, 0);
            assert_eq!(census.local_blocks, 2);
        });
        m.blocking(|| worker.join().unwrap());
    });

    let census = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(census.blocks_created, 2);
    assert_eq!(census.local_blocks, 1);
    assert_eq!(census.global_blocks, 1, "the worker's block was orphaned");
}

#[test]
fn test_detach_reports_orphaned_free_space() {
    const PER_THREAD: usize = PER_BLOCK + PER_BLOCK / 2;
    let (heap, _runtime) = new_heap(single_refill_config());
    let m = heap.attach_thread("main");
    let barrier = Barrier::new(THREADS);

    let outcomes: Vec<DetachOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = &heap;
                let barrier = &barrier;
                s.spawn(move || {
                    let mt = heap.attach_thread(&format!("worker-{t}"));
                    for _ in 0..PER_THREAD {
                        mt.allocate(OBJECT, AllocFlags::NONE).unwrap();
                    }
                    // Nobody adopts another worker's orphaned block.
                    mt.blocking(|| barrier.wait());
                    mt.detach()
                })
            })
            .collect();
        m.blocking(|| {
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        })
    });

    let census = m.lock_heap().verify_thread_local_heaps().unwrap();
    let orphaned: usize = outcomes.iter().map(|o| o.blocks_orphaned).sum();
    let free_bytes: usize = outcomes.iter().map(|o| o.free_bytes_orphaned).sum();
    for outcome in &outcomes {
        assert_eq!(outcome.blocks_orphaned, 2);
        assert_eq!(
            outcome.free_bytes_orphaned,
            (2 * PER_BLOCK - PER_THREAD) * OBJECT
        );
        assert_eq!(outcome.blocks_released, 0);
    }
    assert_eq!(census.global_blocks, orphaned);
    assert_eq!(census.global_free_chunk_bytes, free_bytes);
    assert_eq!(census.local_blocks, 0);
    assert_eq!(census.chunks_in_use, THREADS * PER_THREAD);
}

#[test]
fn test_orphaned_blocks_are_reused() {
    let (heap, _runtime) = new_heap(single_refill_config());
    let m = heap.attach_thread("main");

    thread::scope(|s| {
        let worker = s.spawn(|| {
            let mt = heap.attach_thread("worker");
            mt.allocate(OBJECT, AllocFlags::NONE).unwrap();
        });
        m.blocking(|| worker.join().unwrap());
    });
    let before = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(before.global_blocks, 1);

    // The orphaned partial block serves this thread before any refill.
    for _ in 0..PER_BLOCK - 1 {
        m.allocate(OBJECT, AllocFlags::NONE).unwrap();
    }
    let after = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(after.blocks_created, before.blocks_created);
    assert_eq!(after.global_blocks, 0);
    assert_eq!(after.local_blocks, 1);
    assert_eq!(after.chunks_in_use, PER_BLOCK);
}

#[test]
fn test_partially_freed_blocks_are_refilled_after_collection() {
    let (heap, _runtime) = new_heap(single_refill_config());
    let m = heap.attach_thread("main");

    let mut kept = Vec::new();
    for i in 0..PER_BLOCK {
        let flags = if i % 2 == 0 {
            AllocFlags::NONE
        } else {
            AllocFlags::DONT_TRACK
        };
        let object = m.allocate(OBJECT, flags).unwrap();
        if i % 2 == 0 {
            fill(object, 0x5A);
            kept.push(object);
        }
    }
    m.collect(CollectionRequest::FULL_PAUSE);
    let census = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(census.chunks_in_use, kept.len());
    let created = census.blocks_created;

    // The freed half is handed out again, zeroed, without a new block.
    for _ in 0..PER_BLOCK - kept.len() {
        let object = m.allocate(OBJECT, AllocFlags::NONE).unwrap();
        assert!(holds(object, 0));
    }
    let census = m.lock_heap().verify_thread_local_heaps().unwrap();
    assert_eq!(census.blocks_created, created);
    assert_eq!(census.chunks_in_use, PER_BLOCK);
    for &object in &kept {
        assert!(holds(object, 0x5A));
    }
}
