//! Collection requests.

/// Parameters of one collection cycle.
///
/// The four canonical requests cover every caller in the heap; custom
/// requests are accepted by [`HeapGuard::collect`](crate::HeapGuard::collect)
/// as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionRequest {
    /// Skip the sealed base image: its objects are treated as live and
    /// only scanned for references into the active region.
    pub is_partial: bool,
    /// Resume mutators while tracing, re-suspending them for a final
    /// re-mark.
    pub is_concurrent: bool,
    /// Keep softly reachable objects alive.
    pub preserve_soft_references: bool,
    /// Label for logs and metrics.
    pub reason: &'static str,
}

impl CollectionRequest {
    /// An allocation failed and no collection was running.
    pub const FOR_ALLOC: Self = Self {
        is_partial: true,
        is_concurrent: false,
        preserve_soft_references: true,
        reason: "GC_FOR_ALLOC",
    };

    /// Allocation crossed the background threshold.
    pub const BACKGROUND: Self = Self {
        is_partial: true,
        is_concurrent: true,
        preserve_soft_references: true,
        reason: "GC_CONCURRENT",
    };

    /// Requested by the runtime or the program.
    pub const EXPLICIT: Self = Self {
        is_partial: false,
        is_concurrent: true,
        preserve_soft_references: true,
        reason: "GC_EXPLICIT",
    };

    /// Last resort before raising out-of-memory.
    pub const BEFORE_OOM: Self = Self {
        is_partial: false,
        is_concurrent: false,
        preserve_soft_references: false,
        reason: "GC_BEFORE_OOM",
    };

    /// A full, non-concurrent collection that keeps soft references. Not
    /// used by the heap itself; handy for deterministic tests and tools.
    pub const FULL_PAUSE: Self = Self {
        is_partial: false,
        is_concurrent: false,
        preserve_soft_references: true,
        reason: "GC_FULL_PAUSE",
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_requests() {
        let r = CollectionRequest::FOR_ALLOC;
        assert!(r.is_partial && !r.is_concurrent && r.preserve_soft_references);

        let r = CollectionRequest::BACKGROUND;
        assert!(r.is_partial && r.is_concurrent && r.preserve_soft_references);

        let r = CollectionRequest::EXPLICIT;
        assert!(!r.is_partial && r.is_concurrent && r.preserve_soft_references);

        let r = CollectionRequest::BEFORE_OOM;
        assert!(!r.is_partial && !r.is_concurrent && !r.preserve_soft_references);
    }

    #[test]
    fn test_reasons_are_distinct() {
        let reasons = [
            CollectionRequest::FOR_ALLOC.reason,
            CollectionRequest::BACKGROUND.reason,
            CollectionRequest::EXPLICIT.reason,
            CollectionRequest::BEFORE_OOM.reason,
            CollectionRequest::FULL_PAUSE.reason,
        ];
        for (i, a) in reasons.iter().enumerate() {
            for b in &reasons[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
