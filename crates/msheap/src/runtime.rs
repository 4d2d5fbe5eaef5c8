//! The interface between the heap and the language runtime.
//!
//! The heap knows nothing about object layout. Everything that needs it
//! (finding roots, following references, reference-object semantics, card
//! tables, creating error objects) is delegated to a [`RuntimeHooks`]
//! implementation, invoked at fixed points of the collection cycle.

use std::ptr::NonNull;

use crate::gc::marker::Marker;
use crate::heap::Mutator;

/// Kinds of reference objects the collector treats specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Cleared only when memory is short.
    Soft,
    /// Cleared as soon as the referent is otherwise unreachable.
    Weak,
    /// Keeps an unreachable referent alive until it is finalized.
    Finalizer,
    /// Enqueued after the referent is finalized.
    Phantom,
}

impl ReferenceKind {
    /// Every kind, in processing order.
    pub const ALL: [Self; 4] = [Self::Soft, Self::Weak, Self::Finalizer, Self::Phantom];

    const fn index(self) -> usize {
        match self {
            Self::Soft => 0,
            Self::Weak => 1,
            Self::Finalizer => 2,
            Self::Phantom => 3,
        }
    }
}

/// Reference objects discovered during marking, by kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReferenceLists {
    lists: [Vec<NonNull<u8>>; 4],
}

// SAFETY: the lists hold addresses of heap objects and are only read or
// written under the heap lock.
unsafe impl Send for ReferenceLists {}

impl ReferenceLists {
    /// References of `kind`, in discovery order.
    #[must_use]
    pub fn get(&self, kind: ReferenceKind) -> &[NonNull<u8>] {
        &self.lists[kind.index()]
    }

    /// Removes and returns the references of `kind`.
    pub fn take(&mut self, kind: ReferenceKind) -> Vec<NonNull<u8>> {
        std::mem::take(&mut self.lists[kind.index()])
    }

    /// Adds a reference of `kind`.
    pub fn push(&mut self, kind: ReferenceKind, reference: NonNull<u8>) {
        self.lists[kind.index()].push(reference);
    }

    /// Moves every reference of `other` to the end of the matching list.
    pub fn append(&mut self, other: &mut Self) {
        for (list, more) in self.lists.iter_mut().zip(other.lists.iter_mut()) {
            list.append(more);
        }
    }

    /// Total references across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    /// Returns `true` if no reference was discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }
}

/// Runtime callbacks used by the heap.
///
/// Every callback runs on the collecting thread. Those invoked during a
/// collection run either with every mutator suspended or, for
/// [`scan_object`](Self::scan_object) in a concurrent collection, while
/// mutators run; implementations must tolerate that.
pub trait RuntimeHooks: Send + Sync + 'static {
    /// Marks every root: stacks, globals, interned tables, and so on.
    fn mark_roots(&self, marker: &mut Marker<'_>);

    /// Marks every object referenced by `object`, and reports reference
    /// objects through [`Marker::discover_reference`] instead of following
    /// their referents.
    fn scan_object(&self, object: NonNull<u8>, marker: &mut Marker<'_>);

    /// After a concurrent window, re-scans every object mutated since
    /// [`clear_cards`](Self::clear_cards), usually through
    /// [`Marker::rescan`].
    fn scan_dirty_objects(&self, marker: &mut Marker<'_>) {
        let _ = marker;
    }

    /// Forgets which objects were mutated.
    fn clear_cards(&self) {}

    /// Checks the card table once marking is complete.
    fn verify_cards(&self) {}

    /// Decides the fate of discovered references. Referents that must stay
    /// alive are marked through `marker`; references whose referent is
    /// cleared are passed to [`Marker::clear_reference`]. Soft referents may
    /// only be cleared when `preserve_soft` is `false`.
    ///
    /// Called again for any reference objects discovered while tracing
    /// from the referents kept alive. References left in `references` stay
    /// pending on the heap until the next cycle.
    fn process_references(
        &self,
        references: &mut ReferenceLists,
        preserve_soft: bool,
        marker: &mut Marker<'_>,
    ) {
        let _ = (references, preserve_soft, marker);
    }

    /// Removes unmarked entries from runtime-internal weak tables.
    fn sweep_system_weaks(&self, is_marked: &dyn Fn(NonNull<u8>) -> bool) {
        let _ = is_marked;
    }

    /// Hands cleared reference objects to the runtime's reference queues.
    fn enqueue_cleared_references(&self, cleared: Vec<NonNull<u8>>) {
        let _ = cleared;
    }

    /// Creates an out-of-memory error object for `mutator`, or returns
    /// `None` to raise the heap's pre-built error. May allocate through
    /// `mutator`; a nested failure does not recurse.
    fn new_out_of_memory_error(&self, mutator: &Mutator, requested: usize) -> Option<NonNull<u8>> {
        let _ = (mutator, requested);
        None
    }

    /// Called once when a thread attaches, before it becomes part of the
    /// root set.
    fn on_thread_attach(&self, mutator: &Mutator) {
        let _ = mutator;
    }

    /// Initializes the heap's pre-built out-of-memory error object, a
    /// zeroed 16-byte allocation that is never collected.
    fn init_prebuilt_out_of_memory_error(&self, object: NonNull<u8>) {
        let _ = object;
    }
}
