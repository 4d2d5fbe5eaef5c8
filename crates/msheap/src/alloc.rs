//! Object allocation and the out-of-memory escalation ladder.
//!
//! Requests in the thread-local size-class range first try the calling
//! thread's pool without taking the heap lock. Everything else, and every
//! thread-local miss, takes the heap lock and climbs the ladder:
//!
//! 1. allocate without growing the footprint;
//! 2. wait for the running collection, or run an alloc-triggered one;
//! 3. allocate without growing;
//! 4. allocate, growing the footprint up to the growth limit;
//! 5. run a full collection that clears soft references;
//! 6. allocate, growing.
//!
//! If the last step fails the lock is released and an out-of-memory error
//! is raised.

use std::ops::BitOr;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::config::GRANULE;
use crate::error::AllocError;
use crate::gc::request::CollectionRequest;
use crate::heap::{prebuilt_oom, HeapGuard, Mutator};
use crate::tlh::block::BLOCK_ALIGN;
use crate::tlh::{ThreadLocalAllocator, ThreadLocalHeap};
use crate::tracing::internal::{log_out_of_memory, log_reentrant_out_of_memory};

/// Options of [`Mutator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocFlags(u8);

impl AllocFlags {
    /// Default behaviour.
    pub const NONE: Self = Self(0);
    /// Do not register the object in the thread's tracking table. The
    /// caller must make it reachable from a root before the next safepoint.
    pub const DONT_TRACK: Self = Self(1);

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Mutator {
    /// Allocates `size` zeroed bytes aligned to at least 8 bytes.
    ///
    /// Unless `flags` contains [`AllocFlags::DONT_TRACK`], the object stays
    /// a root until [`release_tracked`](Self::release_tracked). A request of
    /// zero bytes allocates one granule.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfMemory`] once the escalation ladder is
    /// exhausted. The error carries the exception object to raise.
    pub fn allocate(&self, size: usize, flags: AllocFlags) -> Result<NonNull<u8>, AllocError> {
        self.safepoint();
        let size = size.max(GRANULE);
        let inner = &*self.inner;

        let thread_local = match (&inner.tlh, &self.tlh) {
            (Some(allocator), Some(tlh)) if allocator.size_class(size).is_some() => {
                Some((allocator, tlh))
            }
            _ => None,
        };

        let object = match thread_local {
            Some((allocator, tlh)) => match allocator.allocate(tlh, size) {
                Some(object) => {
                    inner
                        .source
                        .publish(object, inner.marking.load(Ordering::SeqCst));
                    object
                }
                None => self.allocate_slow(size, |heap, grow| {
                    refill_thread_local(heap, allocator, tlh, size, grow)
                })?,
            },
            None => self.allocate_slow(size, |heap, grow| {
                let source = &heap.mutator.inner.source;
                let space = &mut heap.state.space;
                if grow {
                    source.alloc_and_grow(space, size)
                } else {
                    source.alloc(space, size)
                }
            })?,
        };

        if !flags.contains(AllocFlags::DONT_TRACK) {
            self.thread.track(object.as_ptr() as usize);
        }
        if inner.profiler.enabled() {
            self.thread.profile().record_alloc(size);
            inner.profiler.global.record_alloc(size);
        }
        Ok(object)
    }

    /// Takes the heap lock and climbs the ladder with `attempt`, which is
    /// told whether it may grow the footprint. The object is published
    /// before the lock is released.
    fn allocate_slow(
        &self,
        size: usize,
        attempt: impl FnMut(&mut HeapGuard<'_>, bool) -> Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, AllocError> {
        let inner = &*self.inner;
        let mut heap = self.lock_heap();
        if let Some(object) = heap.escalate(attempt) {
            inner
                .source
                .publish(object, inner.marking.load(Ordering::SeqCst));
            inner.maybe_signal_daemon(&heap.state.space);
            return Ok(object);
        }
        let allocated = heap.state.space.bytes_allocated();
        let footprint = inner.source.footprint(&heap.state.space);
        drop(heap);
        Err(self.out_of_memory(size, allocated, footprint))
    }

    fn out_of_memory(&self, size: usize, allocated: usize, footprint: usize) -> AllocError {
        let inner = &*self.inner;
        if inner.profiler.enabled() {
            self.thread.profile().record_failed_alloc(size);
            inner.profiler.global.record_failed_alloc(size);
        }
        log_out_of_memory(size, allocated, footprint);

        let fresh = if self.thread.begin_throwing_oom() {
            // Before attachment completes the thread is not a root, so a
            // fresh error object could be collected under the caller.
            let fresh = if self.thread.is_rooted() {
                inner.hooks.new_out_of_memory_error(self, size)
            } else {
                None
            };
            self.thread.end_throwing_oom();
            fresh
        } else {
            log_reentrant_out_of_memory(size);
            None
        };

        match fresh {
            Some(exception) => AllocError::OutOfMemory {
                requested: size,
                exception,
                prebuilt: false,
            },
            None => AllocError::OutOfMemory {
                requested: size,
                exception: prebuilt_oom(inner),
                prebuilt: true,
            },
        }
    }
}

impl HeapGuard<'_> {
    fn escalate<T>(&mut self, mut attempt: impl FnMut(&mut Self, bool) -> Option<T>) -> Option<T> {
        if let Some(found) = attempt(self, false) {
            return Some(found);
        }
        if !self.wait_for_collection_to_complete() {
            self.collect(CollectionRequest::FOR_ALLOC);
        }
        if let Some(found) = attempt(self, false) {
            return Some(found);
        }
        if let Some(found) = attempt(self, true) {
            return Some(found);
        }
        self.wait_for_collection_to_complete();
        self.collect(CollectionRequest::BEFORE_OOM);
        attempt(self, true)
    }
}

/// Retries the thread-local pools, which a collection may have refilled,
/// then obtains fresh blocks from the backing store.
fn refill_thread_local(
    heap: &mut HeapGuard<'_>,
    allocator: &ThreadLocalAllocator,
    tlh: &ThreadLocalHeap,
    size: usize,
    grow: bool,
) -> Option<NonNull<u8>> {
    if let Some(object) = allocator.allocate(tlh, size) {
        return Some(object);
    }
    let source = &heap.mutator.inner.source;
    let config = allocator.config();
    let mut blocks = Vec::with_capacity(config.blocks_per_refill);
    while blocks.len() < config.blocks_per_refill {
        match source.alloc_block(&mut heap.state.space, config.block_size, BLOCK_ALIGN, grow) {
            Some(block) => blocks.push(block),
            None => break,
        }
    }
    if blocks.is_empty() {
        return None;
    }
    // SAFETY: the blocks were just carved from the backing store with the
    // configured size and alignment, and nothing else references them.
    unsafe { allocator.allocate_from_new_blocks(tlh, size, blocks) }
}
