//! One mark-sweep collection cycle.
//!
//! The cycle runs on the thread that requested it, with the heap lock held
//! on entry and on exit:
//!
//! 1. Suspend every other mutator. Upgrade a partial request to full when
//!    the heuristics ask for it.
//! 2. Begin marking and mark the roots. Objects allocated from here on are
//!    allocated marked.
//! 3. Trace. A concurrent cycle releases the lock and resumes mutators for
//!    this step, then relocks, re-suspends, re-marks roots, and re-scans
//!    dirty objects.
//! 4. Process reference objects and system weaks.
//! 5. Swap the mark and live bitmaps, then sweep what was live and is not
//!    anymore. A concurrent cycle sweeps with mutators running, taking the
//!    lock per batch.
//! 6. Consolidate thread-local blocks, adjust the allowed footprint, and
//!    decide whether the next partial collection must be full.
//! 7. Resume mutators, enqueue cleared references, and wake waiters.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::MutexGuard;

use super::marker::Marker;
use super::request::CollectionRequest;
use crate::gc::bitmap::HeapBitmap;
use crate::heap::{HeapInner, HeapState, Mutator};
use crate::metrics::{record_metrics, CollectionType, GcMetrics, PhaseTimer};
use crate::runtime::ReferenceLists;
use crate::source::Space;
use crate::sync::{LockGuard, LockOrder};
use crate::threads::PriorityGuard;
use crate::tlh::ThreadLocalAllocator;
use crate::tracing::internal::{self as log, GcPhase};

/// Objects freed per sweep batch. A concurrent sweep takes the heap lock
/// once per batch.
const SWEEP_BATCH: usize = 256;

#[derive(Debug, Default)]
struct SweepTotals {
    objects: usize,
    bytes: usize,
    blocks: usize,
}

/// Runs one collection cycle. See the module documentation.
pub(crate) fn run(
    mutator: &Mutator,
    state: &mut MutexGuard<'_, HeapState>,
    request: CollectionRequest,
) {
    let inner: &HeapInner = &mutator.inner;
    if state.gc_running {
        log::log_recursive_collection(request.reason);
        return;
    }
    let started = Instant::now();
    state.gc_running = true;

    let threads = &inner.threads;
    let me = mutator.thread();
    threads.suspend_all(Some(me));

    let partial = request.is_partial
        && !state.force_full
        && state.consecutive_partials < inner.config.max_consecutive_partial;
    if partial {
        state.consecutive_partials += 1;
    } else {
        state.consecutive_partials = 0;
        state.force_full = false;
    }
    let concurrent = request.is_concurrent;

    let gc_id = log::next_gc_id();
    let _span = log::trace_gc_collection(gc_id, request.reason, partial, concurrent);
    let priority = (!concurrent).then(PriorityGuard::raise);
    let mut timer = PhaseTimer::new();
    let hooks = &*inner.hooks;
    let source = &inner.source;

    // Root marking.
    timer.start();
    let immune_end = if partial {
        state.space.active_base()
    } else {
        source.base()
    };
    let mut marker = Marker::begin(source, &inner.cleared, source.base()..immune_end);
    inner.marking.store(true, Ordering::SeqCst);
    {
        let _phase = log::trace_phase(GcPhase::RootMarking);
        mark_heap_roots(inner, state, &mut marker);
        hooks.mark_roots(&mut marker);
        if partial {
            // Without a card table every base-image object is scanned for
            // references into the active region.
            source
                .live_bitmap()
                .for_each_set(source.base(), immune_end, |addr| {
                    if let Some(object) = NonNull::new(addr as *mut u8) {
                        hooks.scan_object(object, &mut marker);
                    }
                });
        }
    }
    timer.end_roots();

    // Tracing.
    if concurrent {
        hooks.clear_cards();
        MutexGuard::unlocked(state, || {
            threads.resume_all();
            timer.start();
            let _phase = log::trace_phase(GcPhase::Tracing);
            marker.drain(hooks);
            timer.end_mark();
        });
        timer.start();
        threads.suspend_all(Some(me));
        {
            let _phase = log::trace_phase(GcPhase::Remark);
            mark_heap_roots(inner, state, &mut marker);
            hooks.mark_roots(&mut marker);
            hooks.scan_dirty_objects(&mut marker);
            marker.drain(hooks);
        }
        timer.end_remark();
    } else {
        timer.start();
        let _phase = log::trace_phase(GcPhase::Tracing);
        marker.drain(hooks);
        timer.end_mark();
    }

    // References and system weaks.
    {
        let _phase = log::trace_phase(GcPhase::References);
        state.references = ReferenceLists::default();
        // Referents kept alive here may lead to more reference objects.
        loop {
            let mut discovered = marker.take_references();
            if discovered.is_empty() {
                break;
            }
            hooks.process_references(
                &mut discovered,
                request.preserve_soft_references,
                &mut marker,
            );
            marker.drain(hooks);
            state.references.append(&mut discovered);
        }
        hooks.sweep_system_weaks(&|object| marker.is_marked(object));
        hooks.verify_cards();
    }

    source.swap_mark_and_live_bitmaps(&mut state.space);
    inner.marking.store(false, Ordering::SeqCst);
    let sweep_end = state.space.top();
    drop(marker);

    // Sweep. After the swap the mark bitmap holds the previous live set.
    timer.start();
    let totals = {
        let _phase = log::trace_phase(GcPhase::Sweep);
        let old_live = source.mark_bitmap();
        let new_live = source.live_bitmap();
        if concurrent {
            hooks.clear_cards();
            MutexGuard::unlocked(state, || {
                threads.resume_all();
                sweep(inner, old_live, new_live, immune_end, sweep_end, true, |work| {
                    let _order = LockGuard::new(LockOrder::HeapLock);
                    work(&mut inner.state.lock().space);
                })
            })
        } else {
            let space = &mut state.space;
            sweep(inner, old_live, new_live, immune_end, sweep_end, false, |work| {
                work(space);
            })
        }
    };
    timer.end_sweep();

    // Consolidation and footprint policy.
    let mut blocks_released = totals.blocks;
    {
        let state = &mut **state;
        if let Some(tlh) = &inner.tlh {
            let space = &mut state.space;
            // SAFETY: the heap lock is held and `tlhs` lists every attached
            // thread-local heap.
            blocks_released += unsafe {
                tlh.release_free(&state.tlhs, concurrent, |block| source.free(space, block))
            };
        }
        source.grow_for_utilization(
            &mut state.space,
            inner.config.target_utilization,
            inner.config.min_free,
            inner.config.max_free,
        );
        if partial {
            let footprint = source.footprint(&state.space);
            let free = footprint.saturating_sub(state.space.bytes_allocated());
            if totals.bytes == 0
                || (free < inner.config.min_free_after_partial
                    && footprint >= source.ideal_footprint(&state.space))
            {
                state.force_full = true;
            }
        }
    }

    // Finish.
    if !concurrent {
        threads.resume_all();
    }
    drop(priority);

    let mut cleared = Vec::new();
    while let Some(addr) = inner.cleared.pop() {
        if let Some(reference) = NonNull::new(addr as *mut u8) {
            cleared.push(reference);
        }
    }
    if !cleared.is_empty() {
        hooks.enqueue_cleared_references(cleared);
    }

    let allocated = state.space.bytes_allocated();
    let footprint = source.footprint(&state.space);
    let metrics = GcMetrics {
        reason: request.reason,
        collection_type: if partial {
            CollectionType::Partial
        } else {
            CollectionType::Full
        },
        concurrent,
        objects_freed: totals.objects,
        bytes_freed: totals.bytes,
        root_pause: timer.roots,
        remark_pause: timer.remark,
        mark_duration: timer.mark,
        sweep_duration: timer.sweep,
        duration: started.elapsed(),
        bytes_allocated_after: allocated,
        footprint_after: footprint,
        blocks_released,
        total_collections: 0,
    };
    record_metrics(&inner.history, metrics);
    if inner.profiler.enabled() {
        inner.profiler.global.record_gc(totals.objects, totals.bytes);
        me.profile().record_gc(totals.objects, totals.bytes);
    }
    let percent_free = if footprint == 0 {
        100
    } else {
        footprint.saturating_sub(allocated) * 100 / footprint
    };
    log::log_collection_summary(
        request.reason,
        totals.objects,
        totals.bytes,
        percent_free,
        allocated,
        footprint,
        timer.roots,
        timer.remark,
    );

    state.gc_running = false;
    inner.collection_done.notify_all();
}

/// Marks the roots the heap itself owns: tracked allocations of every
/// thread and pinned objects.
fn mark_heap_roots(inner: &HeapInner, state: &HeapState, marker: &mut Marker<'_>) {
    for thread in inner.threads.threads() {
        for addr in thread.tracked() {
            if let Some(object) = NonNull::new(addr as *mut u8) {
                marker.mark(object);
            }
        }
    }
    for &addr in &state.pinned {
        if let Some(object) = NonNull::new(addr as *mut u8) {
            marker.mark(object);
        }
    }
}

/// Frees every object live in `old_live` but not in `new_live` within
/// `[lo, hi)`.
///
/// `with_space` runs a batch against the backing store with the heap lock
/// held.
fn sweep(
    inner: &HeapInner,
    old_live: &HeapBitmap,
    new_live: &HeapBitmap,
    lo: usize,
    hi: usize,
    concurrent: bool,
    mut with_space: impl FnMut(&mut dyn FnMut(&mut Space)),
) -> SweepTotals {
    let mut totals = SweepTotals::default();
    let mut batch = Vec::with_capacity(SWEEP_BATCH);
    let mut flush = |batch: &mut Vec<NonNull<u8>>, totals: &mut SweepTotals| {
        with_space(&mut |space: &mut Space| {
            // SAFETY: the heap lock is held and every pointer in the batch
            // is unreachable.
            unsafe { free_batch(inner, space, batch, concurrent, totals) };
        });
    };
    HeapBitmap::walk_garbage(old_live, new_live, lo, hi, |addr| {
        if let Some(object) = NonNull::new(addr as *mut u8) {
            batch.push(object);
        }
        if batch.len() == SWEEP_BATCH {
            flush(&mut batch, &mut totals);
        }
    });
    if !batch.is_empty() {
        flush(&mut batch, &mut totals);
    }
    totals
}

unsafe fn free_batch(
    inner: &HeapInner,
    space: &mut Space,
    batch: &mut Vec<NonNull<u8>>,
    concurrent: bool,
    totals: &mut SweepTotals,
) {
    let source = &inner.source;
    totals.objects += batch.len();
    for &object in batch.iter() {
        // SAFETY: every object in the batch is still allocated.
        totals.bytes += unsafe {
            ThreadLocalAllocator::object_size(object)
                .unwrap_or_else(|| source.chunk_size(object))
        };
    }
    if let Some(tlh) = &inner.tlh {
        // SAFETY: forwarded from the caller.
        totals.blocks += unsafe { tlh.reclaim(batch, concurrent) }.blocks_emitted;
    }
    for object in batch.drain(..) {
        // SAFETY: what `reclaim` leaves belongs to the backing store.
        unsafe { source.free(space, object) };
    }
}
