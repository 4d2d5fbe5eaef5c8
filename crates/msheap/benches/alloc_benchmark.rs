//! Benchmark: allocation paths and collection pause.
//!
//! Compares thread-local allocation against the global path and measures
//! full and concurrent collections of short-lived garbage.

use std::hint::black_box;
use std::ptr::NonNull;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use msheap::{AllocFlags, CollectionRequest, Heap, HeapConfig, Marker, RuntimeHooks};

/// A runtime without roots or references: every untracked object is garbage.
struct Leaf;

impl RuntimeHooks for Leaf {
    fn mark_roots(&self, _marker: &mut Marker<'_>) {}

    fn scan_object(&self, _object: NonNull<u8>, _marker: &mut Marker<'_>) {}
}

fn heap(config: HeapConfig) -> Heap {
    Heap::new(config, Arc::new(Leaf)).unwrap()
}

fn global_only() -> HeapConfig {
    HeapConfig {
        thread_local: None,
        ..HeapConfig::default()
    }
}

fn bench_thread_local_allocation(c: &mut Criterion) {
    let heap = heap(HeapConfig::default());
    let m = heap.attach_thread("bench");
    c.bench_function("allocate_32b_thread_local", |b| {
        b.iter(|| black_box(m.allocate(black_box(32), AllocFlags::DONT_TRACK).unwrap()));
    });
}

fn bench_global_allocation(c: &mut Criterion) {
    let heap = heap(global_only());
    let m = heap.attach_thread("bench");
    c.bench_function("allocate_32b_global", |b| {
        b.iter(|| black_box(m.allocate(black_box(32), AllocFlags::DONT_TRACK).unwrap()));
    });
    c.bench_function("allocate_4kb_global", |b| {
        b.iter(|| black_box(m.allocate(black_box(4096), AllocFlags::DONT_TRACK).unwrap()));
    });
}

fn bench_collection(c: &mut Criterion) {
    let heap = heap(HeapConfig::default());
    let m = heap.attach_thread("bench");
    for (name, request) in [
        ("collect_10000_garbage_full_pause", CollectionRequest::FULL_PAUSE),
        ("collect_10000_garbage_concurrent", CollectionRequest::EXPLICIT),
    ] {
        c.bench_function(name, |b| {
            b.iter(|| {
                for i in 0..10_000 {
                    black_box(m.allocate(16 + (i % 8) * 8, AllocFlags::DONT_TRACK).unwrap());
                }
                m.collect(request);
            });
        });
    }
}

fn bench_collection_with_live_set(c: &mut Criterion) {
    let heap = heap(HeapConfig::default());
    let m = heap.attach_thread("bench");
    let live: Vec<_> = (0..10_000)
        .map(|_| m.allocate(48, AllocFlags::NONE).unwrap())
        .collect();
    c.bench_function("collect_10000_live", |b| {
        b.iter(|| m.collect(CollectionRequest::FULL_PAUSE));
    });
    black_box(live);
}

criterion_group!(
    benches,
    bench_thread_local_allocation,
    bench_global_allocation,
    bench_collection,
    bench_collection_with_live_set,
);
criterion_main!(benches);
