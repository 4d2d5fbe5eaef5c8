//! The heap context and its per-thread handles.
//!
//! A [`Heap`] is an explicit context object: every entry point goes through
//! it or through a [`Mutator`] attached to it, and several heaps can coexist
//! in one process.
//!
//! # The heap lock
//!
//! [`HeapState`] sits behind one mutex, the heap lock, with a condition
//! variable broadcast whenever a collection finishes. A contended
//! [`Mutator::lock_heap`] switches the thread to [`ThreadStatus::VmWait`]
//! before spinning and blocking, so a collector holding the lock can
//! suspend the world without waiting for this thread.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::HeapConfig;
use crate::error::StartupError;
use crate::gc::collector;
use crate::gc::daemon::{DaemonSignal, GcDaemon};
use crate::gc::request::CollectionRequest;
use crate::metrics::{AllocProfileSnapshot, GcHistory, GcMetrics, Profiler};
use crate::runtime::{ReferenceLists, RuntimeHooks};
use crate::source::{HeapSource, Space};
use crate::sync::{spin_then_lock, LockGuard, LockOrder};
use crate::threads::{StatusGuard, ThreadList, ThreadState, ThreadStatus};
use crate::tlh::{tag, DetachOutcome, ThreadLocalAllocator, ThreadLocalHeap, TlhCensus};

/// Size of the pre-built out-of-memory error object.
const PREBUILT_OOM_SIZE: usize = 16;

/// Heap state guarded by the heap lock.
#[derive(Debug)]
pub(crate) struct HeapState {
    pub(crate) space: Space,
    /// Set for the whole of a collection cycle, including the windows where
    /// the lock is released.
    pub(crate) gc_running: bool,
    /// Upgrade the next partial collection to a full one.
    pub(crate) force_full: bool,
    pub(crate) consecutive_partials: usize,
    /// Reference objects discovered by the last collection.
    pub(crate) references: ReferenceLists,
    /// Thread-local heaps of every attached thread.
    pub(crate) tlhs: Vec<Arc<ThreadLocalHeap>>,
    /// Objects that are never collected.
    pub(crate) pinned: Vec<usize>,
}

/// Shared part of a heap, referenced by the [`Heap`] and every [`Mutator`].
pub(crate) struct HeapInner {
    pub(crate) config: HeapConfig,
    pub(crate) hooks: Arc<dyn RuntimeHooks>,
    pub(crate) source: HeapSource,
    pub(crate) state: Mutex<HeapState>,
    pub(crate) collection_done: Condvar,
    /// Set while the collector is marking; new objects are allocated
    /// marked.
    pub(crate) marking: AtomicBool,
    pub(crate) tlh: Option<ThreadLocalAllocator>,
    pub(crate) threads: ThreadList,
    pub(crate) profiler: Profiler,
    pub(crate) history: GcHistory,
    /// Reference objects cleared by the collection in progress.
    pub(crate) cleared: SegQueue<usize>,
    pub(crate) daemon: DaemonSignal,
    pub(crate) prebuilt_oom: OnceLock<usize>,
}

impl HeapInner {
    /// Requests a background collection if allocation came within the
    /// configured margin of the allowed footprint.
    pub(crate) fn maybe_signal_daemon(&self, space: &Space) {
        if self.config.background_gc
            && space.bytes_allocated() + self.config.concurrent_start_margin
                > space.allowed_footprint()
        {
            self.daemon.request();
        }
    }
}

/// Which allocator handed out an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    /// A chunk of a thread-local block.
    ThreadLocal,
    /// An extent of the backing store.
    Global,
}

/// Point-in-time heap statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes in allocated extents, thread-local blocks included.
    pub bytes_allocated: usize,
    /// Allocated extents.
    pub objects_allocated: usize,
    /// Distance from the heap base to the top of the used range.
    pub footprint: usize,
    /// Current soft ceiling on the footprint.
    pub allowed_footprint: usize,
    /// Ceiling the allowed footprint may grow to.
    pub growth_limit: usize,
    /// Free bytes below the top.
    pub free_bytes: usize,
    /// Size of the sealed base image.
    pub base_image_size: usize,
    /// Attached threads.
    pub threads: usize,
    /// Collections completed.
    pub collections: usize,
    /// Whether a collection is running.
    pub gc_running: bool,
}

/// A managed heap.
///
/// Dropping the heap stops its background collector. The memory itself is
/// released once every [`Mutator`] has detached. With
/// [`background_gc`](HeapConfig::background_gc) enabled, drop the calling
/// thread's mutator first: the collector may be waiting for it to reach a
/// safepoint.
pub struct Heap {
    inner: Arc<HeapInner>,
    daemon: Option<GcDaemon>,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("base", &(self.inner.source.base() as *const u8))
            .field("threads", &self.inner.threads.len())
            .field("background_gc", &self.daemon.is_some())
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Reserves the heap, allocates the pre-built out-of-memory error, and
    /// starts the background collector if configured.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is inconsistent, the address space cannot
    /// be reserved, or the collector thread cannot be started.
    pub fn new(config: HeapConfig, hooks: Arc<dyn RuntimeHooks>) -> Result<Self, StartupError> {
        config.validate()?;
        let (source, space) =
            HeapSource::new(config.maximum_size, config.starting_size, config.growth_limit)
                .map_err(StartupError::Reserve)?;
        let tlh = config
            .thread_local
            .clone()
            .map(|tlh| ThreadLocalAllocator::new(tlh, config.spin));

        let inner = Arc::new(HeapInner {
            config,
            hooks,
            source,
            state: Mutex::new(HeapState {
                space,
                gc_running: false,
                force_full: false,
                consecutive_partials: 0,
                references: ReferenceLists::default(),
                tlhs: Vec::new(),
                pinned: Vec::new(),
            }),
            collection_done: Condvar::new(),
            marking: AtomicBool::new(false),
            tlh,
            threads: ThreadList::new(),
            profiler: Profiler::default(),
            history: GcHistory::new(),
            cleared: SegQueue::new(),
            daemon: DaemonSignal::new(),
            prebuilt_oom: OnceLock::new(),
        });

        let prebuilt = {
            let mut state = inner.state.lock();
            let object = inner
                .source
                .alloc_and_grow(&mut state.space, PREBUILT_OOM_SIZE)
                .ok_or(StartupError::PrebuiltError)?;
            inner.source.publish(object, false);
            state.pinned.push(object.as_ptr() as usize);
            object
        };
        let _ = inner.prebuilt_oom.set(prebuilt.as_ptr() as usize);
        inner.hooks.init_prebuilt_out_of_memory_error(prebuilt);

        let daemon = if inner.config.background_gc {
            Some(GcDaemon::spawn(Arc::clone(&inner)).map_err(StartupError::Daemon)?)
        } else {
            None
        };
        Ok(Self { inner, daemon })
    }

    /// The configuration the heap was created with.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.inner.config
    }

    /// Attaches the calling thread as a mutator.
    ///
    /// The returned handle must stay on this thread; dropping it detaches.
    #[must_use]
    pub fn attach_thread(&self, name: &str) -> Mutator {
        Mutator::attach(&self.inner, name)
    }

    /// Returns `true` if `ptr` points to a live object of this heap.
    ///
    /// Safe to call concurrently with allocation. During a sweep the answer
    /// for objects not otherwise known to be live is unreliable.
    #[must_use]
    pub fn is_valid_object(&self, ptr: *const u8) -> bool {
        self.inner.source.contains(ptr)
    }

    /// Which allocator owns `object`, or `None` if it is not a live object.
    ///
    /// # Safety
    ///
    /// `object` must not be freed while this call runs.
    #[must_use]
    pub unsafe fn allocator_of(&self, object: *const u8) -> Option<AllocatorKind> {
        if !self.inner.source.contains(object) {
            return None;
        }
        let object = NonNull::new(object.cast_mut())?;
        // SAFETY: live objects are preceded by their header word.
        let word = unsafe { tag::header_word(object) };
        Some(if tag::is_thread_local(word) {
            AllocatorKind::ThreadLocal
        } else {
            AllocatorKind::Global
        })
    }

    /// Current statistics. Takes the heap lock.
    ///
    /// If the calling thread is attached and running, it waits for the lock
    /// in [`ThreadStatus::VmWait`], as [`Mutator::lock_heap`] does.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let _order = LockGuard::new(LockOrder::HeapLock);
        let state = self.lock_state();
        stats(&self.inner, &state)
    }

    fn lock_state(&self) -> MutexGuard<'_, HeapState> {
        let current = self.inner.threads.current_running();
        lock_state(&self.inner, current.as_deref())
    }

    /// Enables or disables allocation profiling.
    pub fn set_alloc_profiling(&self, enabled: bool) {
        self.inner.profiler.set_enabled(enabled);
    }

    /// Zeroes the heap-wide and every thread's profiling counters.
    pub fn reset_alloc_profile(&self) {
        self.inner.profiler.global.reset();
        for thread in self.inner.threads.threads() {
            thread.profile().reset();
        }
    }

    /// Heap-wide profiling counters.
    #[must_use]
    pub fn alloc_profile(&self) -> AllocProfileSnapshot {
        self.inner.profiler.global.snapshot()
    }

    /// Recent collections of this heap.
    #[must_use]
    pub fn gc_history(&self) -> &GcHistory {
        &self.inner.history
    }

    /// Metrics of the most recent collection, if any ran.
    #[must_use]
    pub fn last_gc_metrics(&self) -> Option<GcMetrics> {
        self.inner.history.last()
    }

    /// Walks every thread-local pool and checks the block invariants.
    ///
    /// Takes the heap lock the same way as [`stats`](Self::stats).
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation.
    pub fn verify_thread_local_heaps(&self) -> Result<TlhCensus, String> {
        let Some(tlh) = &self.inner.tlh else {
            return Ok(TlhCensus::default());
        };
        let _order = LockGuard::new(LockOrder::HeapLock);
        let state = self.lock_state();
        // SAFETY: the heap lock is held and `tlhs` lists every attached
        // thread-local heap.
        unsafe { tlh.census(&state.tlhs) }
    }

    /// The pre-built out-of-memory error object.
    #[must_use]
    pub fn prebuilt_out_of_memory_error(&self) -> NonNull<u8> {
        prebuilt_oom(&self.inner)
    }
}

/// Acquires the heap lock. Tries once without blocking; on contention
/// `thread`, if given, waits in [`ThreadStatus::VmWait`] while spinning and
/// blocking, so a collector holding the lock can suspend it.
fn lock_state<'a>(
    inner: &'a HeapInner,
    thread: Option<&ThreadState>,
) -> MutexGuard<'a, HeapState> {
    if let Some(state) = inner.state.try_lock() {
        return state;
    }
    let threads = &inner.threads;
    let _status = thread.map(|thread| StatusGuard::new(threads, thread, ThreadStatus::VmWait));
    spin_then_lock(&inner.state, inner.config.spin, || {
        if threads.suspend_pending() {
            std::thread::yield_now();
        }
    })
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.stop();
        }
    }
}

pub(crate) fn prebuilt_oom(inner: &HeapInner) -> NonNull<u8> {
    inner
        .prebuilt_oom
        .get()
        .and_then(|&addr| NonNull::new(addr as *mut u8))
        .unwrap_or(NonNull::dangling())
}

fn stats(inner: &HeapInner, state: &HeapState) -> HeapStats {
    let space = &state.space;
    HeapStats {
        bytes_allocated: space.bytes_allocated(),
        objects_allocated: space.objects_allocated(),
        footprint: inner.source.footprint(space),
        allowed_footprint: space.allowed_footprint(),
        growth_limit: space.growth_limit(),
        free_bytes: space.free_bytes(),
        base_image_size: space.active_base() - inner.source.base(),
        threads: inner.threads.len(),
        collections: inner.history.total_recorded(),
        gc_running: state.gc_running,
    }
}

/// A thread attached to a heap.
///
/// Allocation, collection, and heap-lock acquisition go through the
/// mutator. It is tied to the thread that attached it.
pub struct Mutator {
    pub(crate) inner: Arc<HeapInner>,
    pub(crate) thread: Arc<ThreadState>,
    pub(crate) tlh: Option<Arc<ThreadLocalHeap>>,
    detached: bool,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.thread.id())
            .field("name", &self.thread.name())
            .field("status", &self.thread.status())
            .finish_non_exhaustive()
    }
}

impl Mutator {
    pub(crate) fn attach(inner: &Arc<HeapInner>, name: &str) -> Self {
        let thread = inner.threads.register(name);
        inner.threads.safepoint(&thread);
        let tlh = inner.tlh.as_ref().map(ThreadLocalAllocator::attach);
        let mutator = Self {
            inner: Arc::clone(inner),
            thread,
            tlh,
            detached: false,
            _not_send: PhantomData,
        };
        if let Some(tlh) = &mutator.tlh {
            mutator.lock_heap().state.tlhs.push(Arc::clone(tlh));
        }
        mutator.inner.hooks.on_thread_attach(&mutator);
        mutator.thread.set_rooted();
        mutator
    }

    /// Identifier of this thread within the heap.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.thread.id()
    }

    /// Current status of this thread.
    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        self.thread.status()
    }

    /// Parks the thread if a collection wants the world stopped. Called at
    /// every allocation; long-running loops that never allocate should call
    /// it too.
    pub fn safepoint(&self) {
        self.inner.threads.safepoint(&self.thread);
    }

    /// Runs `f` in [`ThreadStatus::Native`], during which collections may
    /// proceed without this thread. `f` must not touch heap objects.
    ///
    /// Wrap every potentially long block (joins, barriers, I/O) in this.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        let _status = StatusGuard::new(&self.inner.threads, &self.thread, ThreadStatus::Native);
        f()
    }

    /// Acquires the heap lock.
    ///
    /// Tries once without blocking. On contention the thread switches to
    /// [`ThreadStatus::VmWait`], spins per the heap's
    /// [`SpinPolicy`](crate::SpinPolicy) while yielding to pending
    /// suspensions, then blocks. Running status is restored once the lock
    /// is held.
    pub fn lock_heap(&self) -> HeapGuard<'_> {
        let order = LockGuard::new(LockOrder::HeapLock);
        let state = lock_state(&self.inner, Some(&*self.thread));
        HeapGuard {
            mutator: self,
            state,
            _order: order,
        }
    }

    /// Acquires the heap lock only if it is free.
    pub fn try_lock_heap(&self) -> Option<HeapGuard<'_>> {
        let state = self.inner.state.try_lock()?;
        Some(HeapGuard {
            mutator: self,
            state,
            _order: LockGuard::unchecked(LockOrder::HeapLock),
        })
    }

    /// Runs a collection. Takes the heap lock for the duration.
    pub fn collect(&self, request: CollectionRequest) {
        self.lock_heap().collect(request);
    }

    /// Stops treating `object` as a root. Returns `false` if it was not
    /// tracked by this thread.
    pub fn release_tracked(&self, object: NonNull<u8>) -> bool {
        self.thread.untrack(object.as_ptr() as usize)
    }

    /// This thread's profiling counters.
    #[must_use]
    pub fn profile(&self) -> AllocProfileSnapshot {
        self.thread.profile().snapshot()
    }

    /// Detaches the thread from the heap. In-use thread-local blocks move
    /// to the global pool and free ones return to the backing store.
    ///
    /// Dropping the mutator does the same, discarding the outcome.
    pub fn detach(mut self) -> DetachOutcome {
        let outcome = self.release();
        self.detached = true;
        outcome
    }

    fn release(&mut self) -> DetachOutcome {
        let mut heap = self.lock_heap();
        let mut outcome = DetachOutcome::default();
        if let (Some(allocator), Some(tlh)) = (&self.inner.tlh, &self.tlh) {
            let state = &mut *heap.state;
            let source = &self.inner.source;
            // SAFETY: the heap lock is held and the thread-local heap is
            // never used again.
            outcome = unsafe {
                allocator.detach(tlh, |block| source.free(&mut state.space, block))
            };
            state.tlhs.retain(|other| !Arc::ptr_eq(other, tlh));
            crate::tracing::internal::log_thread_detach(
                self.thread.id(),
                outcome.blocks_orphaned,
                outcome.blocks_released,
            );
        }
        self.thread.clear_tracked();
        self.inner.threads.unregister(&self.thread);
        drop(heap);
        outcome
    }

    pub(crate) fn thread(&self) -> &ThreadState {
        &self.thread
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if !self.detached {
            self.release();
        }
    }
}

/// Held heap lock.
///
/// Every operation that needs the heap lock (collection, waiting for one,
/// footprint management) hangs off this guard.
pub struct HeapGuard<'a> {
    pub(crate) mutator: &'a Mutator,
    pub(crate) state: MutexGuard<'a, HeapState>,
    _order: LockGuard,
}

impl HeapGuard<'_> {
    /// Runs one collection cycle.
    ///
    /// A no-op, logged, if a collection is already running. Returns once
    /// the cycle is complete and every mutator resumed.
    pub fn collect(&mut self, request: CollectionRequest) {
        collector::run(self.mutator, &mut self.state, request);
    }

    /// Returns `true` while a collection is running.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.state.gc_running
    }

    /// Blocks until the running collection, if any, completes. Returns
    /// whether it had to wait.
    ///
    /// The thread is in [`ThreadStatus::VmWait`] around each wait. Waits
    /// longer than the configured threshold are logged.
    pub fn wait_for_collection_to_complete(&mut self) -> bool {
        if !self.state.gc_running {
            return false;
        }
        let mutator = self.mutator;
        let inner = &*mutator.inner;
        let start = Instant::now();
        while self.state.gc_running {
            let _status = StatusGuard::new(&inner.threads, &mutator.thread, ThreadStatus::VmWait);
            inner.collection_done.wait(&mut self.state);
        }
        let waited = start.elapsed();
        if waited > inner.config.long_wait_threshold {
            crate::tracing::internal::log_long_wait(waited);
        }
        true
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        stats(&self.mutator.inner, &self.state)
    }

    /// Returns the physical pages of free memory to the OS. Returns the
    /// number of bytes released.
    pub fn trim(&mut self) -> usize {
        self.mutator.inner.source.trim(&self.state.space)
    }

    /// Freezes everything allocated so far as the base image, which partial
    /// collections skip.
    pub fn seal_base_image(&mut self) {
        self.mutator.inner.source.seal_base_image(&mut self.state.space);
    }

    /// Lifts the growth limit to the maximum heap size.
    pub fn clear_growth_limit(&mut self) {
        self.mutator
            .inner
            .source
            .clear_growth_limit(&mut self.state.space);
    }

    /// Marks `object` as never collected.
    pub fn pin(&mut self, object: NonNull<u8>) {
        self.state.pinned.push(object.as_ptr() as usize);
    }

    /// Walks every thread-local pool and checks the block invariants.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation.
    pub fn verify_thread_local_heaps(&self) -> Result<TlhCensus, String> {
        let Some(tlh) = &self.mutator.inner.tlh else {
            return Ok(TlhCensus::default());
        };
        // SAFETY: the heap lock is held and `tlhs` lists every attached
        // thread-local heap.
        unsafe { tlh.census(&self.state.tlhs) }
    }

    /// Removes and returns the reference objects the last collection left
    /// pending after [`RuntimeHooks::process_references`].
    pub fn take_pending_references(&mut self) -> ReferenceLists {
        std::mem::take(&mut self.state.references)
    }

    /// Reverses [`pin`](Self::pin). Returns `false` if it was not pinned.
    pub fn unpin(&mut self, object: NonNull<u8>) -> bool {
        let addr = object.as_ptr() as usize;
        match self.state.pinned.iter().rposition(|&pinned| pinned == addr) {
            Some(pos) => {
                self.state.pinned.swap_remove(pos);
                true
            }
            None => false,
        }
    }
}
