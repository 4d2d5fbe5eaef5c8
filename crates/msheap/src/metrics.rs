//! Collection metrics and allocation profiling.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics from one collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Why the collection ran.
    pub reason: &'static str,
    /// Partial or full.
    pub collection_type: CollectionType,
    /// Whether mutators ran during tracing.
    pub concurrent: bool,
    /// Objects reclaimed by the sweep.
    pub objects_freed: usize,
    /// Bytes reclaimed by the sweep.
    pub bytes_freed: usize,
    /// Pause while marking roots.
    pub root_pause: Duration,
    /// Pause while re-marking after the concurrent window. Zero for
    /// non-concurrent collections.
    pub remark_pause: Duration,
    /// Wall time of transitive marking.
    pub mark_duration: Duration,
    /// Wall time of the sweep.
    pub sweep_duration: Duration,
    /// Wall time of the whole cycle.
    pub duration: Duration,
    /// Bytes allocated once the cycle finished.
    pub bytes_allocated_after: usize,
    /// Footprint once the cycle finished.
    pub footprint_after: usize,
    /// Thread-local blocks returned to the backing store.
    pub blocks_released: usize,
    /// Collections of this heap so far, this one included.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reason: "",
            collection_type: CollectionType::None,
            concurrent: false,
            objects_freed: 0,
            bytes_freed: 0,
            root_pause: Duration::ZERO,
            remark_pause: Duration::ZERO,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            duration: Duration::ZERO,
            bytes_allocated_after: 0,
            footprint_after: 0,
            blocks_released: 0,
            total_collections: 0,
        }
    }

    /// Longest stop-the-world pause of the cycle.
    ///
    /// A non-concurrent cycle pauses for its whole duration.
    #[must_use]
    pub fn max_pause(&self) -> Duration {
        if self.concurrent {
            self.root_pause.max(self.remark_pause)
        } else {
            self.duration
        }
    }
}

/// Type of collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Base-image objects are immune.
    Partial = 1,
    /// The whole heap is collected.
    Full = 2,
}

/// Captures phase durations of a collection.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Root marking.
    pub roots: Duration,
    /// Transitive marking.
    pub mark: Duration,
    /// Re-marking.
    pub remark: Duration,
    /// Sweeping.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Duration::ZERO,
            mark: Duration::ZERO,
            remark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End root marking.
    pub fn end_roots(&mut self) {
        let elapsed = self.take();
        self.roots += elapsed;
    }

    /// End a stretch of transitive marking.
    pub fn end_mark(&mut self) {
        let elapsed = self.take();
        self.mark += elapsed;
    }

    /// End re-marking.
    pub fn end_remark(&mut self) {
        let elapsed = self.take();
        self.remark += elapsed;
    }

    /// End the sweep.
    pub fn end_sweep(&mut self) {
        let elapsed = self.take();
        self.sweep += elapsed;
    }
}

/// Process-level cumulative collection statistics, across every heap.
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    partial_collections: AtomicUsize,
    full_collections: AtomicUsize,
    concurrent_collections: AtomicUsize,
    bytes_freed: AtomicUsize,
    objects_freed: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            partial_collections: AtomicUsize::new(0),
            full_collections: AtomicUsize::new(0),
            concurrent_collections: AtomicUsize::new(0),
            bytes_freed: AtomicUsize::new(0),
            objects_freed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Returns the total number of collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of partial collections performed.
    #[inline]
    #[must_use]
    pub fn total_partial_collections(&self) -> usize {
        self.partial_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of full collections performed.
    #[inline]
    #[must_use]
    pub fn total_full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of concurrent collections performed.
    #[inline]
    #[must_use]
    pub fn total_concurrent_collections(&self) -> usize {
        self.concurrent_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes freed.
    #[inline]
    #[must_use]
    pub fn total_bytes_freed(&self) -> usize {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects freed.
    #[inline]
    #[must_use]
    pub fn total_objects_freed(&self) -> usize {
        self.objects_freed.load(Ordering::Relaxed)
    }

    /// Returns the total of the longest pause of each collection, in
    /// nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    fn record(&self, metrics: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed
            .fetch_add(metrics.bytes_freed, Ordering::Relaxed);
        self.objects_freed
            .fetch_add(metrics.objects_freed, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            metrics.max_pause().as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        match metrics.collection_type {
            CollectionType::Partial => {
                self.partial_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::Full => {
                self.full_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::None => {}
        }
        if metrics.concurrent {
            self.concurrent_collections.fetch_add(1, Ordering::Relaxed);
        }
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Get the process-wide cumulative collection metrics.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Ring buffer size for collection history.
const HISTORY_SIZE: usize = 64;

/// Fixed-size ring buffer of recent [`GcMetrics`] of one heap.
///
/// The collecting thread pushes and any thread may read; both go through
/// one short lock.
#[derive(Debug)]
pub struct GcHistory {
    ring: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    buffer: [GcMetrics; HISTORY_SIZE],
    /// Snapshots pushed so far. May exceed the buffer size.
    written: usize,
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    /// Create a new `GcHistory` with an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                buffer: [GcMetrics::new(); HISTORY_SIZE],
                written: 0,
            }),
        }
    }

    /// Push a snapshot, overwriting the oldest when full. Numbers it with
    /// its position in the history.
    pub(crate) fn push(&self, mut metrics: GcMetrics) -> GcMetrics {
        let mut ring = self.ring.lock();
        metrics.total_collections = ring.written + 1;
        let idx = ring.written % HISTORY_SIZE;
        ring.buffer[idx] = metrics;
        ring.written += 1;
        metrics
    }

    /// Total number of snapshots recorded. May exceed the buffer size.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.ring.lock().written
    }

    /// The most recent snapshot, if any.
    #[must_use]
    pub fn last(&self) -> Option<GcMetrics> {
        self.recent(1).pop()
    }

    /// The most recent `n` snapshots, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let ring = self.ring.lock();
        let total = ring.written;
        let n = n.min(HISTORY_SIZE).min(total);
        (total - n..total)
            .map(|i| ring.buffer[i % HISTORY_SIZE])
            .collect()
    }

    /// Average longest pause of the most recent `n` collections.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total_ns: u128 = recent.iter().map(|m| m.max_pause().as_nanos()).sum();
        Duration::from_nanos(
            (total_ns / recent.len() as u128)
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }

    /// Longest pause of the most recent `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(GcMetrics::max_pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Records a finished collection in `history` and the process totals.
pub(crate) fn record_metrics(history: &GcHistory, metrics: GcMetrics) {
    let metrics = history.push(metrics);
    GLOBAL_METRICS.record(&metrics);
}

/// Allocation profiling counters.
///
/// One instance per thread and one per heap. Counters only move while
/// profiling is enabled on the heap.
#[derive(Debug, Default)]
pub struct AllocProfile {
    alloc_count: AtomicUsize,
    alloc_bytes: AtomicUsize,
    failed_alloc_count: AtomicUsize,
    failed_alloc_bytes: AtomicUsize,
    gc_count: AtomicUsize,
    freed_count: AtomicUsize,
    freed_bytes: AtomicUsize,
}

/// Point-in-time copy of an [`AllocProfile`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocProfileSnapshot {
    /// Successful allocations.
    pub alloc_count: usize,
    /// Bytes requested by successful allocations.
    pub alloc_bytes: usize,
    /// Allocations that ended in out-of-memory.
    pub failed_alloc_count: usize,
    /// Bytes requested by failed allocations.
    pub failed_alloc_bytes: usize,
    /// Collections run.
    pub gc_count: usize,
    /// Objects freed by those collections.
    pub freed_count: usize,
    /// Bytes freed by those collections.
    pub freed_bytes: usize,
}

impl AllocProfile {
    /// Creates zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alloc_count: AtomicUsize::new(0),
            alloc_bytes: AtomicUsize::new(0),
            failed_alloc_count: AtomicUsize::new(0),
            failed_alloc_bytes: AtomicUsize::new(0),
            gc_count: AtomicUsize::new(0),
            freed_count: AtomicUsize::new(0),
            freed_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_alloc(&self, bytes: usize) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_alloc(&self, bytes: usize) {
        self.failed_alloc_count.fetch_add(1, Ordering::Relaxed);
        self.failed_alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_gc(&self, objects: usize, bytes: usize) {
        self.gc_count.fetch_add(1, Ordering::Relaxed);
        self.freed_count.fetch_add(objects, Ordering::Relaxed);
        self.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> AllocProfileSnapshot {
        AllocProfileSnapshot {
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            alloc_bytes: self.alloc_bytes.load(Ordering::Relaxed),
            failed_alloc_count: self.failed_alloc_count.load(Ordering::Relaxed),
            failed_alloc_bytes: self.failed_alloc_bytes.load(Ordering::Relaxed),
            gc_count: self.gc_count.load(Ordering::Relaxed),
            freed_count: self.freed_count.load(Ordering::Relaxed),
            freed_bytes: self.freed_bytes.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters.
    pub fn reset(&self) {
        for counter in [
            &self.alloc_count,
            &self.alloc_bytes,
            &self.failed_alloc_count,
            &self.failed_alloc_bytes,
            &self.gc_count,
            &self.freed_count,
            &self.freed_bytes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Heap-wide profiling switch plus counters.
#[derive(Debug, Default)]
pub(crate) struct Profiler {
    enabled: AtomicBool,
    pub(crate) global: AllocProfile,
}

impl Profiler {
    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}
