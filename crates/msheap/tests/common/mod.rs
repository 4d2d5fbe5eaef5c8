//! A synthetic object-graph runtime shared by the integration tests.
//!
//! Objects are arrays of words. The first word is a header: a kind tag in
//! the high half and, for plain nodes, the slot count in the low half.
//! Reference objects have one slot, their referent. Roots are an explicit
//! set and a dirty set stands in for the card table.

#![allow(dead_code)]

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use msheap::{
    AllocFlags, Heap, HeapConfig, Marker, Mutator, ReferenceKind, ReferenceLists, RuntimeHooks,
    SpinPolicy, TlhConfig,
};
use parking_lot::Mutex;

pub const WORD: usize = 8;
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

const NODE: usize = 0x4E4F_4445 << 32;
const WEAK: usize = 0x5745_414B << 32;
const SOFT: usize = 0x534F_4654 << 32;
const KIND_MASK: usize = !0 << 32;

/// Events recorded by [`GraphRuntime`], for assertions.
#[derive(Debug, Default)]
pub struct Counters {
    pub mark_roots: AtomicUsize,
    pub scans: AtomicUsize,
    pub dirty_rescans: AtomicUsize,
    pub clear_cards: AtomicUsize,
    pub verify_cards: AtomicUsize,
    pub reference_rounds: AtomicUsize,
    pub attached: AtomicUsize,
    pub oom_errors_requested: AtomicUsize,
}

#[derive(Default)]
pub struct GraphRuntime {
    roots: Mutex<Vec<usize>>,
    dirty: Mutex<HashSet<usize>>,
    interned: Mutex<Vec<usize>>,
    enqueued: Mutex<Vec<usize>>,
    oom_reserve: Mutex<Option<usize>>,
    allocate_oom_error: AtomicBool,
    pub counters: Counters,
}

fn word(object: NonNull<u8>, index: usize) -> &'static AtomicUsize {
    // SAFETY: tests only pass live objects with at least `index + 1` words.
    unsafe { &*object.as_ptr().cast::<AtomicUsize>().add(index) }
}

fn as_object(addr: usize) -> Option<NonNull<u8>> {
    NonNull::new(addr as *mut u8)
}

impl GraphRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_root(&self, object: NonNull<u8>) {
        self.roots.lock().push(object.as_ptr() as usize);
    }

    pub fn remove_root(&self, object: NonNull<u8>) {
        let addr = object.as_ptr() as usize;
        self.roots.lock().retain(|&root| root != addr);
    }

    pub fn clear_roots(&self) {
        self.roots.lock().clear();
    }

    /// Adds `object` to the runtime's weak intern table.
    pub fn intern(&self, object: NonNull<u8>) {
        self.interned.lock().push(object.as_ptr() as usize);
    }

    pub fn interned(&self) -> Vec<usize> {
        self.interned.lock().clone()
    }

    /// Reference objects handed to the runtime's queues.
    pub fn enqueued(&self) -> Vec<usize> {
        self.enqueued.lock().clone()
    }

    /// Makes the out-of-memory hook return `object`.
    pub fn set_oom_reserve(&self, object: NonNull<u8>) {
        *self.oom_reserve.lock() = Some(object.as_ptr() as usize);
    }

    /// Makes the out-of-memory hook try to allocate a fresh error object.
    pub fn allocate_oom_errors(&self, enabled: bool) {
        self.allocate_oom_error.store(enabled, Ordering::SeqCst);
    }

    /// Stores `child` in `slot` of `node`, recording the write.
    pub fn set_child(&self, node: NonNull<u8>, slot: usize, child: Option<NonNull<u8>>) {
        assert!(slot < slots(node), "slot {slot} out of range");
        let value = child.map_or(0, |child| child.as_ptr() as usize);
        word(node, slot + 1).store(value, Ordering::SeqCst);
        self.dirty.lock().insert(node.as_ptr() as usize);
    }
}

/// Number of child slots of `node`.
pub fn slots(node: NonNull<u8>) -> usize {
    let header = word(node, 0).load(Ordering::SeqCst);
    if header & KIND_MASK == NODE {
        header & !KIND_MASK
    } else {
        0
    }
}

pub fn child(node: NonNull<u8>, slot: usize) -> Option<NonNull<u8>> {
    as_object(word(node, slot + 1).load(Ordering::SeqCst))
}

pub fn referent(reference: NonNull<u8>) -> Option<NonNull<u8>> {
    as_object(word(reference, 1).load(Ordering::SeqCst))
}

/// Allocates a node with `slots` empty child slots. The node is tracked by
/// the mutator.
pub fn node(m: &Mutator, slots: usize) -> NonNull<u8> {
    node_with(m, slots, AllocFlags::NONE)
}

pub fn node_with(m: &Mutator, slots: usize, flags: AllocFlags) -> NonNull<u8> {
    let object = m.allocate((slots + 1) * WORD, flags).unwrap();
    word(object, 0).store(NODE | slots, Ordering::SeqCst);
    object
}

/// Allocates a reference object of `kind` pointing at `target`.
pub fn reference(m: &Mutator, kind: ReferenceKind, target: NonNull<u8>) -> NonNull<u8> {
    let object = m.allocate(2 * WORD, AllocFlags::DONT_TRACK).unwrap();
    let tag = match kind {
        ReferenceKind::Soft => SOFT,
        _ => WEAK,
    };
    word(object, 1).store(target.as_ptr() as usize, Ordering::SeqCst);
    word(object, 0).store(tag, Ordering::SeqCst);
    object
}

impl GraphRuntime {
    fn clear_if_dead(reference: NonNull<u8>, marker: &mut Marker<'_>) {
        if let Some(target) = referent(reference) {
            if !marker.is_marked(target) {
                word(reference, 1).store(0, Ordering::SeqCst);
                marker.clear_reference(reference);
            }
        }
    }
}

impl RuntimeHooks for GraphRuntime {
    fn mark_roots(&self, marker: &mut Marker<'_>) {
        self.counters.mark_roots.fetch_add(1, Ordering::Relaxed);
        for &root in self.roots.lock().iter() {
            if let Some(object) = as_object(root) {
                marker.mark(object);
            }
        }
    }

    fn scan_object(&self, object: NonNull<u8>, marker: &mut Marker<'_>) {
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        let header = word(object, 0).load(Ordering::SeqCst);
        match header & KIND_MASK {
            NODE => {
                for slot in 0..(header & !KIND_MASK) {
                    if let Some(target) = child(object, slot) {
                        marker.mark(target);
                    }
                }
            }
            WEAK => marker.discover_reference(ReferenceKind::Weak, object),
            SOFT => marker.discover_reference(ReferenceKind::Soft, object),
            _ => {}
        }
    }

    fn scan_dirty_objects(&self, marker: &mut Marker<'_>) {
        for &addr in self.dirty.lock().iter() {
            if let Some(object) = as_object(addr) {
                self.counters.dirty_rescans.fetch_add(1, Ordering::Relaxed);
                marker.rescan(object);
            }
        }
    }

    fn clear_cards(&self) {
        self.counters.clear_cards.fetch_add(1, Ordering::Relaxed);
        self.dirty.lock().clear();
    }

    fn verify_cards(&self) {
        self.counters.verify_cards.fetch_add(1, Ordering::Relaxed);
    }

    fn process_references(
        &self,
        references: &mut ReferenceLists,
        preserve_soft: bool,
        marker: &mut Marker<'_>,
    ) {
        self.counters.reference_rounds.fetch_add(1, Ordering::Relaxed);
        for soft in references.take(ReferenceKind::Soft) {
            if preserve_soft {
                if let Some(target) = referent(soft) {
                    marker.mark(target);
                }
            } else {
                Self::clear_if_dead(soft, marker);
            }
        }
        for weak in references.take(ReferenceKind::Weak) {
            Self::clear_if_dead(weak, marker);
        }
    }

    fn sweep_system_weaks(&self, is_marked: &dyn Fn(NonNull<u8>) -> bool) {
        self.interned
            .lock()
            .retain(|&addr| as_object(addr).is_some_and(is_marked));
    }

    fn enqueue_cleared_references(&self, cleared: Vec<NonNull<u8>>) {
        self.enqueued
            .lock()
            .extend(cleared.into_iter().map(|r| r.as_ptr() as usize));
    }

    fn new_out_of_memory_error(&self, mutator: &Mutator, _requested: usize) -> Option<NonNull<u8>> {
        self.counters
            .oom_errors_requested
            .fetch_add(1, Ordering::SeqCst);
        let reserve = *self.oom_reserve.lock();
        if let Some(reserve) = reserve.and_then(as_object) {
            return Some(reserve);
        }
        if self.allocate_oom_error.load(Ordering::SeqCst) {
            return mutator.allocate(4 * WORD, AllocFlags::NONE).ok();
        }
        None
    }

    fn on_thread_attach(&self, _mutator: &Mutator) {
        self.counters.attached.fetch_add(1, Ordering::Relaxed);
    }
}

/// A small heap with a thread-local allocator for objects of 8 to 128
/// bytes.
pub fn small_config() -> HeapConfig {
    HeapConfig {
        starting_size: 256 * KB,
        growth_limit: MB,
        maximum_size: 2 * MB,
        min_free: 32 * KB,
        max_free: 256 * KB,
        concurrent_start_margin: 32 * KB,
        min_free_after_partial: 16 * KB,
        spin: SpinPolicy::default(),
        background_gc: false,
        thread_local: Some(TlhConfig {
            min_size: 8,
            max_size: 128,
            block_size: 4 * KB,
            blocks_per_refill: 2,
            global_blocks_per_refill: 1,
        }),
        ..HeapConfig::default()
    }
}

/// [`small_config`] with every allocation on the global path.
pub fn global_only_config() -> HeapConfig {
    HeapConfig {
        thread_local: None,
        ..small_config()
    }
}

pub fn new_heap(config: HeapConfig) -> (Heap, Arc<GraphRuntime>) {
    let runtime = GraphRuntime::new();
    let heap = Heap::new(config, Arc::clone(&runtime) as Arc<dyn RuntimeHooks>).unwrap();
    (heap, runtime)
}
