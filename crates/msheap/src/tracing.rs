//! Collection tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured spans
//! and events for collections, allocation failures, and lock waits. Without
//! the feature every helper compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::{span, Level};

    /// Phases of one collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Marking roots with every mutator suspended.
        RootMarking,
        /// Transitive marking, concurrent with mutators if requested.
        Tracing,
        /// Re-marking roots and dirty objects after a concurrent window.
        Remark,
        /// Soft, weak, finalizer, and phantom reference processing.
        References,
        /// Reclaiming unmarked objects.
        Sweep,
    }

    /// Stable identifier for a collection.
    ///
    /// Correlates every event of one cycle. Monotonically increasing across
    /// all heaps in the process, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique collection ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for an entire collection.
    pub fn trace_gc_collection(
        gc_id: GcId,
        reason: &'static str,
        partial: bool,
        concurrent: bool,
    ) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            gc_id = gc_id.0,
            reason,
            partial,
            concurrent
        )
        .entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the end-of-cycle summary.
    #[allow(clippy::too_many_arguments)]
    pub fn log_collection_summary(
        reason: &'static str,
        objects_freed: usize,
        bytes_freed: usize,
        percent_free: usize,
        allocated: usize,
        footprint: usize,
        root_pause: Duration,
        remark_pause: Duration,
    ) {
        tracing::info!(
            reason,
            objects_freed,
            bytes_freed,
            percent_free,
            allocated,
            footprint,
            root_pause_us = root_pause.as_micros(),
            remark_pause_us = remark_pause.as_micros(),
            "collection complete"
        );
    }

    /// Log a collection requested while one was already running.
    pub fn log_recursive_collection(reason: &'static str) {
        tracing::warn!(reason, "collection already running; request ignored");
    }

    /// Log a wait for a running collection that exceeded the threshold.
    pub fn log_long_wait(waited: Duration) {
        tracing::info!(waited_us = waited.as_micros(), "waited for concurrent collection");
    }

    /// Log an out-of-memory condition being raised.
    pub fn log_out_of_memory(requested: usize, allocated: usize, footprint: usize) {
        tracing::warn!(requested, allocated, footprint, "out of memory");
    }

    /// Log an out-of-memory condition raised while already raising one.
    pub fn log_reentrant_out_of_memory(requested: usize) {
        tracing::error!(requested, "out of memory while raising out of memory");
    }

    /// Log an adjustment of the allowed footprint.
    pub fn log_footprint_growth(from: usize, to: usize) {
        tracing::debug!(from, to, "allowed footprint changed");
    }

    /// Log what a detaching thread left behind.
    pub fn log_thread_detach(thread: u64, orphaned: usize, released: usize) {
        tracing::debug!(thread, orphaned, released, "thread-local heap detached");
    }

    /// Log pages that could not be returned to the OS.
    pub fn log_decommit_failure(addr: usize, len: usize, err: &std::io::Error) {
        tracing::warn!(addr, len, error = %err, "failed to decommit heap pages");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn, clippy::too_many_arguments)]
pub mod internal {
    use std::time::Duration;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Marking roots with every mutator suspended.
        RootMarking,
        /// Transitive marking.
        Tracing,
        /// Re-marking after a concurrent window.
        Remark,
        /// Reference processing.
        References,
        /// Reclaiming unmarked objects.
        Sweep,
    }

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }

    /// Stub function when tracing is disabled.
    pub fn trace_gc_collection(_: GcId, _: &'static str, _: bool, _: bool) {}

    /// Stub function when tracing is disabled.
    pub fn trace_phase(_: GcPhase) {}

    /// Stub function when tracing is disabled.
    pub fn log_collection_summary(
        _: &'static str,
        _: usize,
        _: usize,
        _: usize,
        _: usize,
        _: usize,
        _: Duration,
        _: Duration,
    ) {
    }

    /// Stub function when tracing is disabled.
    pub fn log_recursive_collection(_: &'static str) {}

    /// Stub function when tracing is disabled.
    pub fn log_long_wait(_: Duration) {}

    /// Stub function when tracing is disabled.
    pub fn log_out_of_memory(_: usize, _: usize, _: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_reentrant_out_of_memory(_: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_footprint_growth(_: usize, _: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_thread_detach(_: u64, _: usize, _: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_decommit_failure(_: usize, _: usize, _: &std::io::Error) {}
}

pub use internal::{GcId, GcPhase};
