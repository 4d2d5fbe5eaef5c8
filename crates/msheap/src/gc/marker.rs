//! The marking state handed to runtime hooks.

use std::ops::Range;
use std::ptr::NonNull;

use crossbeam_queue::SegQueue;

use crate::runtime::{ReferenceKind, ReferenceLists, RuntimeHooks};
use crate::source::HeapSource;

/// Entries reserved for the mark stack before marking starts.
const MARK_STACK_RESERVE: usize = 4096;

/// Marking state for one collection.
///
/// Hooks report references through [`mark`](Self::mark); marked objects are
/// queued and later passed back to
/// [`RuntimeHooks::scan_object`](crate::RuntimeHooks::scan_object) until the
/// queue drains.
pub struct Marker<'a> {
    source: &'a HeapSource,
    immune: Range<usize>,
    /// Worklist for iterative tracing.
    stack: Vec<NonNull<u8>>,
    references: ReferenceLists,
    cleared: &'a SegQueue<usize>,
    objects_marked: usize,
}

impl<'a> Marker<'a> {
    /// Clears the mark bitmap and prepares an empty mark stack.
    ///
    /// Objects in `immune` keep their live bits as mark bits and are never
    /// queued. Aborts the process if the mark stack cannot be reserved: the
    /// heap would otherwise be left half-marked.
    pub(crate) fn begin(
        source: &'a HeapSource,
        cleared: &'a SegQueue<usize>,
        immune: Range<usize>,
    ) -> Self {
        let mut stack = Vec::new();
        if let Err(err) = stack.try_reserve(MARK_STACK_RESERVE) {
            eprintln!("[msheap] CRITICAL: failed to reserve the mark stack: {err}");
            std::process::abort();
        }

        let mark = source.mark_bitmap();
        mark.clear_range(source.base(), source.limit());
        if !immune.is_empty() {
            mark.copy_range_from(source.live_bitmap(), immune.start, immune.end);
        }

        Self {
            source,
            immune,
            stack,
            references: ReferenceLists::default(),
            cleared,
            objects_marked: 0,
        }
    }

    /// Marks `object` reachable and queues it for scanning.
    ///
    /// Addresses that are not live heap objects are ignored, and so are
    /// base-image objects during a partial collection.
    pub fn mark(&mut self, object: NonNull<u8>) {
        let addr = object.as_ptr() as usize;
        if self.immune.contains(&addr) || !self.source.live_bitmap().test(addr) {
            return;
        }
        if !self.source.mark_bitmap().set(addr) {
            self.objects_marked += 1;
            self.stack.push(object);
        }
    }

    /// Returns `true` if `object` is marked. Pointers outside the heap are
    /// reported as marked, since the collector never frees them.
    #[must_use]
    pub fn is_marked(&self, object: NonNull<u8>) -> bool {
        let addr = object.as_ptr() as usize;
        if addr < self.source.base() || addr >= self.source.limit() {
            return true;
        }
        self.source.mark_bitmap().test(addr)
    }

    /// Queues an already marked object to be scanned again, for objects
    /// mutated while marking ran concurrently. Unmarked objects are ignored;
    /// they are scanned if they are ever marked.
    pub fn rescan(&mut self, object: NonNull<u8>) {
        if self.source.mark_bitmap().test(object.as_ptr() as usize) {
            self.stack.push(object);
        }
    }

    /// Records a reference object found while scanning, for
    /// [`RuntimeHooks::process_references`](crate::RuntimeHooks::process_references).
    pub fn discover_reference(&mut self, kind: ReferenceKind, reference: NonNull<u8>) {
        self.references.push(kind, reference);
    }

    /// Queues a reference object whose referent was cleared, for
    /// [`RuntimeHooks::enqueue_cleared_references`](crate::RuntimeHooks::enqueue_cleared_references)
    /// at the end of the cycle.
    pub fn clear_reference(&mut self, reference: NonNull<u8>) {
        self.cleared.push(reference.as_ptr() as usize);
    }

    /// Objects marked so far.
    #[must_use]
    pub const fn objects_marked(&self) -> usize {
        self.objects_marked
    }

    pub(crate) fn take_references(&mut self) -> ReferenceLists {
        std::mem::take(&mut self.references)
    }

    /// Scans queued objects until none are left.
    pub(crate) fn drain(&mut self, hooks: &dyn RuntimeHooks) {
        while let Some(object) = self.stack.pop() {
            hooks.scan_object(object, self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;

    impl RuntimeHooks for NoRoots {
        fn mark_roots(&self, _marker: &mut Marker<'_>) {}
        fn scan_object(&self, _object: NonNull<u8>, _marker: &mut Marker<'_>) {}
    }

    fn source() -> (HeapSource, crate::source::Space) {
        HeapSource::new(16 * sys_alloc::page_size(), 4096, 4096).unwrap()
    }

    #[test]
    fn test_mark_only_live_objects_once() {
        let (src, mut space) = source();
        let live = src.alloc(&mut space, 16).unwrap();
        let dead = src.alloc(&mut space, 16).unwrap();
        src.publish(live, false);
        let cleared = SegQueue::new();
        let mut marker = Marker::begin(&src, &cleared, 0..0);

        marker.mark(live);
        marker.mark(live);
        marker.mark(dead);
        assert_eq!(marker.objects_marked(), 1);
        assert!(marker.is_marked(live));
        assert!(!marker.is_marked(dead));
        assert!(marker.is_marked(NonNull::dangling()));
        marker.drain(&NoRoots);
        assert!(marker.stack.is_empty());
    }

    #[test]
    fn test_immune_range_is_premarked() {
        let (src, mut space) = source();
        let old = src.alloc(&mut space, 16).unwrap();
        src.publish(old, false);
        src.seal_base_image(&mut space);
        let young = src.alloc(&mut space, 16).unwrap();
        src.publish(young, false);

        let cleared = SegQueue::new();
        let mut marker = Marker::begin(&src, &cleared, src.base()..space.active_base());
        assert!(marker.is_marked(old));
        assert!(!marker.is_marked(young));
        marker.mark(old);
        assert_eq!(marker.objects_marked(), 0);
        marker.mark(young);
        assert_eq!(marker.objects_marked(), 1);
    }

    #[test]
    fn test_begin_clears_previous_marks() {
        let (src, mut space) = source();
        let a = src.alloc(&mut space, 16).unwrap();
        src.publish(a, true);
        let cleared = SegQueue::new();
        let marker = Marker::begin(&src, &cleared, 0..0);
        assert!(!marker.is_marked(a));
    }

    #[test]
    fn test_references_and_cleared_queue() {
        let (src, _space) = source();
        let cleared = SegQueue::new();
        let mut marker = Marker::begin(&src, &cleared, 0..0);
        let r = NonNull::<u8>::dangling();
        marker.discover_reference(ReferenceKind::Weak, r);
        marker.clear_reference(r);
        let lists = marker.take_references();
        assert_eq!(lists.get(ReferenceKind::Weak), &[r]);
        assert!(lists.get(ReferenceKind::Soft).is_empty());
        assert_eq!(cleared.pop(), Some(r.as_ptr() as usize));
    }
}
