//! Thread-local allocation.
//!
//! Small requests are served from per-thread heaps without taking the heap
//! lock. Each [`ThreadLocalHeap`] owns a local [`Pool`] of blocks; blocks are
//! carved into equally sized chunks per size class. When a thread runs out,
//! it takes blocks from the global pool, or asks the heap for fresh ones.
//!
//! The collector hands swept objects back through
//! [`ThreadLocalAllocator::reclaim`], which recycles thread-local chunks into
//! their blocks and passes every other pointer through to the backing store.
//!
//! # Lock order
//!
//! Heap lock, then the global pool, then a local pool. See [`crate::sync`].

pub mod block;
pub mod pool;
pub mod tag;

use std::collections::HashSet;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use self::block::{Block, ListKind, UNSIZED};
use self::pool::{Pool, PoolGuard, PoolLists};
use crate::config::{SpinPolicy, TlhConfig, SIZE_CLASS_QUANTUM};

/// Per-thread allocation state.
///
/// Cache-line aligned so the pool locks of different threads never share a
/// line.
#[repr(align(64))]
#[derive(Debug)]
pub struct ThreadLocalHeap {
    id: u64,
    pool: Pool,
}

impl ThreadLocalHeap {
    /// Identifier, unique within the process.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Result of a [`ThreadLocalAllocator::reclaim`] batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimOutcome {
    /// Thread-local chunks returned to their blocks.
    pub chunks_recycled: usize,
    /// Blocks that became empty and were emitted for release.
    pub blocks_emitted: usize,
}

/// What a detaching thread left behind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DetachOutcome {
    /// In-use blocks handed to the global pool.
    pub blocks_orphaned: usize,
    /// Free chunk bytes inside the orphaned blocks.
    pub free_bytes_orphaned: usize,
    /// Empty blocks released to the backing store.
    pub blocks_released: usize,
}

/// Snapshot of every pool, taken by [`ThreadLocalAllocator::census`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TlhCensus {
    /// Blocks across all pools.
    pub blocks: usize,
    /// Blocks held by thread-local pools.
    pub local_blocks: usize,
    /// Blocks held by the global pool.
    pub global_blocks: usize,
    /// Unformatted blocks on the global free list.
    pub global_free_blocks: usize,
    /// Free chunk bytes in the global pool's formatted blocks.
    pub global_free_chunk_bytes: usize,
    /// Chunks in use across all pools.
    pub chunks_in_use: usize,
    /// Blocks obtained from the backing store over the heap's lifetime.
    pub blocks_created: usize,
    /// Blocks returned to the backing store over the heap's lifetime.
    pub blocks_released: usize,
}

/// Shared state of the thread-local allocator: configuration, the global
/// pool, and lifetime counters.
#[derive(Debug)]
pub struct ThreadLocalAllocator {
    config: TlhConfig,
    spin: SpinPolicy,
    classes: usize,
    global: Pool,
    next_id: AtomicU64,
    blocks_created: AtomicUsize,
    blocks_released: AtomicUsize,
}

impl ThreadLocalAllocator {
    /// Creates the allocator and its empty global pool.
    #[must_use]
    pub fn new(config: TlhConfig, spin: SpinPolicy) -> Self {
        let classes = config.size_class_count();
        Self {
            config,
            spin,
            classes,
            global: Pool::global(classes),
            next_id: AtomicU64::new(1),
            blocks_created: AtomicUsize::new(0),
            blocks_released: AtomicUsize::new(0),
        }
    }

    /// The allocator's geometry.
    #[must_use]
    pub const fn config(&self) -> &TlhConfig {
        &self.config
    }

    /// Size class for a request, or `None` if the request must use the
    /// global path.
    #[must_use]
    pub const fn size_class(&self, size: usize) -> Option<usize> {
        if size < self.config.min_size || size > self.config.max_size {
            return None;
        }
        Some((size - self.config.min_size).div_ceil(SIZE_CLASS_QUANTUM))
    }

    /// Payload bytes of every chunk in `class`.
    #[must_use]
    pub const fn payload_size(&self, class: usize) -> usize {
        self.config.min_size + class * SIZE_CLASS_QUANTUM
    }

    fn class_id(class: usize) -> u16 {
        debug_assert!(class < usize::from(UNSIZED));
        u16::try_from(class).unwrap_or(UNSIZED)
    }

    /// Creates a thread-local heap for the calling thread.
    ///
    /// The heap is allocated with the process allocator, which aborts if it
    /// cannot satisfy the request.
    #[must_use]
    pub fn attach(&self) -> Arc<ThreadLocalHeap> {
        Arc::new(ThreadLocalHeap {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pool: Pool::local(self.classes),
        })
    }

    /// Allocates `size` zeroed bytes from `tlh`.
    ///
    /// Tries the thread's current block, its partial and free blocks, then
    /// the global pool's partial and free blocks. Returns `None` when none of
    /// them has room; the caller then obtains fresh blocks and calls
    /// [`allocate_from_new_blocks`](Self::allocate_from_new_blocks).
    pub fn allocate(&self, tlh: &ThreadLocalHeap, size: usize) -> Option<NonNull<u8>> {
        let class = self.size_class(size)?;
        let payload = self.payload_size(class);

        let mut local = tlh.pool.lock(self.spin);
        // SAFETY: the local pool lock is held.
        if let Some(chunk) = unsafe { take_local(&mut local, class, payload) } {
            drop(local);
            return Some(zeroed(chunk, payload));
        }

        let (mut global, mut local) = match self.global.try_lock() {
            Some(global) => (global, local),
            None => {
                drop(local);
                let global = self.global.lock(self.spin);
                let mut local = tlh.pool.lock(self.spin);
                // SAFETY: the local pool lock is held.
                if let Some(chunk) = unsafe { take_local(&mut local, class, payload) } {
                    drop(local);
                    drop(global);
                    return Some(zeroed(chunk, payload));
                }
                (global, local)
            }
        };

        // SAFETY: both pool locks are held.
        let chunk = unsafe { self.adopt_global(&mut global, &mut local, tlh, class, payload) };
        drop(local);
        drop(global);
        chunk.map(|chunk| zeroed(chunk, payload))
    }

    /// Moves a global partial or free block into the local pool and takes a
    /// chunk from it.
    unsafe fn adopt_global(
        &self,
        global: &mut PoolGuard<'_>,
        local: &mut PoolGuard<'_>,
        tlh: &ThreadLocalHeap,
        class: usize,
        payload: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: the caller holds both pool locks.
        unsafe {
            let block = if let Some(block) = global.partial[class].front() {
                global.partial[class].remove(block);
                block
            } else {
                let block = global.free.pop_front()?;
                block.format(Self::class_id(class), payload);
                block
            };
            block.set_owner(tlh);
            local.partial[class].push_front(block);
            local.current[class] = Some(block);
            take_from(local, block, class)
        }
    }

    /// Adds freshly obtained blocks and allocates `size` bytes from the first.
    ///
    /// Up to `global_blocks_per_refill` of the remaining blocks go to the
    /// global pool if its lock is free; the rest join the local free list.
    ///
    /// # Safety
    ///
    /// Every pointer in `blocks` must be an exclusively owned,
    /// `BLOCK_ALIGN`-aligned backing-store allocation of `block_size` bytes.
    pub unsafe fn allocate_from_new_blocks(
        &self,
        tlh: &ThreadLocalHeap,
        size: usize,
        blocks: Vec<NonNull<u8>>,
    ) -> Option<NonNull<u8>> {
        let class = self.size_class(size)?;
        let payload = self.payload_size(class);
        let block_size = self.config.block_size;
        self.blocks_created.fetch_add(blocks.len(), Ordering::Relaxed);

        let mut blocks = blocks.into_iter();
        let first = blocks.next()?;

        let mut global = self.global.try_lock();
        let mut local = tlh.pool.lock(self.spin);
        let mut ceded = 0;
        // SAFETY: the caller hands over exclusive ownership of the memory.
        unsafe {
            for memory in blocks {
                match global.as_mut() {
                    Some(global) if ceded < self.config.global_blocks_per_refill => {
                        global.free.push_front(Block::init(memory, block_size, ptr::null()));
                        ceded += 1;
                    }
                    _ => local.free.push_front(Block::init(memory, block_size, tlh)),
                }
            }
            drop(global);

            let block = Block::init(first, block_size, tlh);
            block.format(Self::class_id(class), payload);
            local.partial[class].push_front(block);
            local.current[class] = Some(block);
            let chunk = take_from(&mut local, block, class);
            drop(local);
            chunk.map(|chunk| zeroed(chunk, payload))
        }
    }

    /// Locks the pool owning `block`, retrying if ownership changes while the
    /// lock is being acquired.
    ///
    /// # Safety
    ///
    /// The caller must hold the heap lock, so the owning thread-local heap
    /// cannot detach and be freed.
    unsafe fn lock_owner(&self, block: Block) -> PoolGuard<'_> {
        loop {
            let owner = block.owner();
            let pool = if owner.is_null() {
                &self.global
            } else {
                // SAFETY: detaching needs the heap lock, held by the caller.
                unsafe { &(*owner).pool }
            };
            let guard = pool.lock(self.spin);
            if block.owner() == owner {
                return guard;
            }
        }
    }

    /// Returns swept objects to their allocators.
    ///
    /// Thread-local chunks go back to their blocks. Pointers the backing
    /// store owns are kept, and so is the memory of any block that became
    /// empty; `objects` is filtered in place to those and the caller frees
    /// them. A thread's current block that becomes empty is kept during a
    /// concurrent collection and released otherwise.
    ///
    /// # Safety
    ///
    /// The caller must hold the heap lock, and every pointer must be an
    /// unreachable object that nothing will touch again.
    pub unsafe fn reclaim(
        &self,
        objects: &mut Vec<NonNull<u8>>,
        concurrent: bool,
    ) -> ReclaimOutcome {
        let mut outcome = ReclaimOutcome::default();
        let mut kept = 0;
        for index in 0..objects.len() {
            let object = objects[index];
            // SAFETY: the object was allocated by the heap.
            match unsafe { tag::owning_block(object) } {
                None => {
                    objects[kept] = object;
                    kept += 1;
                }
                Some(header) => {
                    outcome.chunks_recycled += 1;
                    // SAFETY: tagged headers point at formatted blocks.
                    let block = unsafe { Block::from_header(header) };
                    // SAFETY: forwarded from the caller.
                    if let Some(empty) = unsafe { self.recycle(block, object, concurrent) } {
                        objects[kept] = empty.memory();
                        kept += 1;
                        outcome.blocks_emitted += 1;
                    }
                }
            }
        }
        objects.truncate(kept);
        self.blocks_released
            .fetch_add(outcome.blocks_emitted, Ordering::Relaxed);
        outcome
    }

    unsafe fn recycle(&self, block: Block, object: NonNull<u8>, concurrent: bool) -> Option<Block> {
        // SAFETY: the caller holds the heap lock.
        let mut lists = unsafe { self.lock_owner(block) };
        // SAFETY: the owning pool lock is held.
        unsafe {
            let class = usize::from(block.size_class());
            let was_full = block.is_full();
            block.give_back(object);
            if block.is_empty() {
                if concurrent && lists.current[class] == Some(block) {
                    return None;
                }
                lists.unlink(block);
                block.unformat();
                return Some(block);
            }
            if was_full {
                lists.full[class].remove(block);
                lists.partial[class].push_front(block);
            }
        }
        None
    }

    /// Moves partial blocks of every thread to the global pool and releases
    /// every fully free block through `release`.
    ///
    /// Threads keep their current blocks during a concurrent collection,
    /// since they are still allocating from them.
    ///
    /// # Safety
    ///
    /// The caller must hold the heap lock, and `tlhs` must be every attached
    /// thread-local heap.
    pub unsafe fn release_free(
        &self,
        tlhs: &[Arc<ThreadLocalHeap>],
        concurrent: bool,
        mut release: impl FnMut(NonNull<u8>),
    ) -> usize {
        let mut released = 0;
        let mut global = self.global.lock(self.spin);
        for tlh in tlhs {
            let mut local = tlh.pool.lock(self.spin);
            // SAFETY: both pool locks are held.
            unsafe {
                for class in 0..self.classes {
                    let current = local.current[class];
                    for block in local.partial[class].blocks() {
                        if concurrent && current == Some(block) {
                            continue;
                        }
                        local.unlink(block);
                        if block.is_empty() {
                            block.unformat();
                            release(block.memory());
                            released += 1;
                        } else {
                            block.set_owner(ptr::null());
                            global.partial[class].push_front(block);
                        }
                    }
                }
                for block in local.free.drain() {
                    release(block.memory());
                    released += 1;
                }
            }
        }
        // SAFETY: the global pool lock is held.
        for block in unsafe { global.free.drain() } {
            release(block.memory());
            released += 1;
        }
        self.blocks_released.fetch_add(released, Ordering::Relaxed);
        released
    }

    /// Hands every in-use block of `tlh` to the global pool and releases its
    /// free blocks through `release`.
    ///
    /// # Safety
    ///
    /// The caller must hold the heap lock, and `tlh` must not be used for
    /// allocation again.
    pub unsafe fn detach(
        &self,
        tlh: &ThreadLocalHeap,
        mut release: impl FnMut(NonNull<u8>),
    ) -> DetachOutcome {
        let mut outcome = DetachOutcome::default();
        let mut global = self.global.lock(self.spin);
        let mut local = tlh.pool.lock(self.spin);
        // SAFETY: both pool locks are held.
        unsafe {
            for class in 0..self.classes {
                local.current[class] = None;
                for (block, full) in local.partial[class]
                    .drain()
                    .into_iter()
                    .map(|block| (block, false))
                    .chain(local.full[class].drain().into_iter().map(|block| (block, true)))
                {
                    if block.is_empty() {
                        block.unformat();
                        release(block.memory());
                        outcome.blocks_released += 1;
                        continue;
                    }
                    block.set_owner(ptr::null());
                    outcome.blocks_orphaned += 1;
                    outcome.free_bytes_orphaned += block.free_list_len() * block.payload_size();
                    if full {
                        global.full[class].push_front(block);
                    } else {
                        global.partial[class].push_front(block);
                    }
                }
            }
            for block in local.free.drain() {
                release(block.memory());
                outcome.blocks_released += 1;
            }
        }
        self.blocks_released
            .fetch_add(outcome.blocks_released, Ordering::Relaxed);
        outcome
    }

    /// Payload size of a thread-local object, or `None` for objects the
    /// backing store owns.
    ///
    /// # Safety
    ///
    /// `object` must be a live heap object.
    #[must_use]
    pub unsafe fn object_size(object: NonNull<u8>) -> Option<usize> {
        // SAFETY: a live chunk keeps its block formatted.
        unsafe { tag::owning_block(object).map(|header| Block::from_header(header).payload_size()) }
    }

    /// Walks every pool and checks the block invariants: each block is on
    /// exactly one list matching its state and class, its owner matches the
    /// pool, current blocks sit on their partial lists, and free chunks plus
    /// in-use chunks equal capacity.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation found.
    ///
    /// # Safety
    ///
    /// The caller must hold the heap lock, and `tlhs` must be every attached
    /// thread-local heap.
    pub unsafe fn census(&self, tlhs: &[Arc<ThreadLocalHeap>]) -> Result<TlhCensus, String> {
        let mut census = TlhCensus {
            blocks_created: self.blocks_created.load(Ordering::Relaxed),
            blocks_released: self.blocks_released.load(Ordering::Relaxed),
            ..TlhCensus::default()
        };
        let mut seen = HashSet::new();

        let global = self.global.lock(self.spin);
        // SAFETY: the global pool lock is held.
        unsafe { self.check_pool(&global, ptr::null(), &mut seen, &mut census)? };
        census.global_blocks = census.blocks;
        census.global_free_blocks = global.free.len();
        // SAFETY: the global pool lock is held.
        for block in unsafe { global.all_blocks() } {
            census.global_free_chunk_bytes +=
                unsafe { block.free_list_len() * block.payload_size() };
        }

        // The global lock stays held: blocks only change pools under it.
        for tlh in tlhs {
            let local = tlh.pool.lock(self.spin);
            // SAFETY: the local pool lock is held.
            unsafe { self.check_pool(&local, Arc::as_ptr(tlh), &mut seen, &mut census)? };
        }
        drop(global);
        census.local_blocks = census.blocks - census.global_blocks;
        Ok(census)
    }

    unsafe fn check_pool(
        &self,
        lists: &PoolLists,
        owner: *const ThreadLocalHeap,
        seen: &mut HashSet<usize>,
        census: &mut TlhCensus,
    ) -> Result<(), String> {
        // SAFETY: the caller holds the pool lock.
        unsafe {
            for block in lists.free.blocks() {
                check_membership(block, ListKind::Free, UNSIZED, owner, seen)?;
                census.blocks += 1;
            }
            for class in 0..self.classes {
                let id = Self::class_id(class);
                for block in lists.partial[class].blocks() {
                    check_membership(block, ListKind::Partial, id, owner, seen)?;
                    check_counts(block)?;
                    if block.free_list_len() == 0 {
                        return Err(format!("partial block {:p} has no free chunk", block.memory()));
                    }
                    census.blocks += 1;
                    census.chunks_in_use += block.in_use();
                }
                for block in lists.full[class].blocks() {
                    check_membership(block, ListKind::Full, id, owner, seen)?;
                    check_counts(block)?;
                    if block.free_list_len() != 0 {
                        return Err(format!("full block {:p} has free chunks", block.memory()));
                    }
                    census.blocks += 1;
                    census.chunks_in_use += block.in_use();
                }
                if let Some(current) = lists.current[class] {
                    if current.list() != ListKind::Partial || current.size_class() != id {
                        return Err(format!(
                            "current block {:p} of class {class} is not on its partial list",
                            current.memory()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

unsafe fn check_membership(
    block: Block,
    kind: ListKind,
    class: u16,
    owner: *const ThreadLocalHeap,
    seen: &mut HashSet<usize>,
) -> Result<(), String> {
    let addr = block.memory().as_ptr() as usize;
    if !seen.insert(addr) {
        return Err(format!("block {addr:#x} is on more than one list"));
    }
    // SAFETY: the caller holds the pool lock.
    let (list, size_class) = unsafe { (block.list(), block.size_class()) };
    if list != kind {
        return Err(format!("block {addr:#x} on a {kind:?} list records {list:?}"));
    }
    if size_class != class {
        return Err(format!("block {addr:#x} of class {size_class} is on a list for class {class}"));
    }
    if block.owner() != owner {
        return Err(format!("block {addr:#x} has the wrong owner"));
    }
    Ok(())
}

unsafe fn check_counts(block: Block) -> Result<(), String> {
    // SAFETY: the caller holds the pool lock.
    let (free, in_use, capacity) =
        unsafe { (block.free_list_len(), block.in_use(), block.capacity()) };
    if free + in_use == capacity {
        Ok(())
    } else {
        Err(format!(
            "block {:p}: {free} free + {in_use} in use != capacity {capacity}",
            block.memory()
        ))
    }
}

/// Takes a chunk from the thread's current block, another partial block, or
/// a free block formatted on the spot.
unsafe fn take_local(lists: &mut PoolLists, class: usize, payload: usize) -> Option<NonNull<u8>> {
    // SAFETY: the caller holds the local pool lock.
    unsafe {
        let block = match lists.current[class].or_else(|| lists.partial[class].front()) {
            Some(block) => block,
            None => {
                let block = lists.free.pop_front()?;
                block.format(ThreadLocalAllocator::class_id(class), payload);
                lists.partial[class].push_front(block);
                block
            }
        };
        lists.current[class] = Some(block);
        take_from(lists, block, class)
    }
}

/// Takes a chunk from `block`, a partial block of `class`, moving it to the
/// full list when its last chunk goes.
unsafe fn take_from(lists: &mut PoolLists, block: Block, class: usize) -> Option<NonNull<u8>> {
    // SAFETY: the caller holds the pool lock.
    unsafe {
        let chunk = block.take_chunk();
        debug_assert!(chunk.is_some(), "partial block without a free chunk");
        if block.is_full() {
            lists.partial[class].remove(block);
            lists.full[class].push_front(block);
            if lists.current[class] == Some(block) {
                lists.current[class] = None;
            }
        }
        chunk
    }
}

fn zeroed(chunk: NonNull<u8>, payload: usize) -> NonNull<u8> {
    // SAFETY: the chunk is exclusively ours and `payload` bytes long.
    unsafe { chunk.as_ptr().write_bytes(0, payload) };
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlh::block::tests::TestBlock;

    fn allocator() -> ThreadLocalAllocator {
        ThreadLocalAllocator::new(
            TlhConfig {
                min_size: 16,
                max_size: 64,
                block_size: 1024,
                blocks_per_refill: 2,
                global_blocks_per_refill: 1,
            },
            SpinPolicy::NONE,
        )
    }

    fn owning(object: NonNull<u8>) -> Block {
        unsafe { Block::from_header(tag::owning_block(object).unwrap()) }
    }

    /// Allocates from `buffers[0]` until one chunk is left, so the block
    /// stays current. The other buffers join the pools as free blocks.
    fn nearly_fill(
        tlh: &ThreadLocalAllocator,
        heap: &ThreadLocalHeap,
        buffers: &[TestBlock],
    ) -> (Block, Vec<NonNull<u8>>) {
        let memory = buffers.iter().map(TestBlock::memory).collect();
        let first = unsafe { tlh.allocate_from_new_blocks(heap, 32, memory) }.unwrap();
        let block = owning(first);
        let capacity = unsafe { block.capacity() };
        let mut objects = vec![first];
        while objects.len() < capacity - 1 {
            objects.push(tlh.allocate(heap, 32).unwrap());
        }
        assert!(objects.iter().all(|&object| owning(object) == block));
        (block, objects)
    }

    #[test]
    fn test_concurrent_reclaim_keeps_empty_current_block() {
        let buffers = [TestBlock::new(1024)];
        let tlh = allocator();
        let heap = tlh.attach();
        let class = tlh.size_class(32).unwrap();
        let (block, mut objects) = nearly_fill(&tlh, &heap, &buffers);
        let count = objects.len();

        let outcome = unsafe { tlh.reclaim(&mut objects, true) };
        assert_eq!(
            outcome,
            ReclaimOutcome {
                chunks_recycled: count,
                blocks_emitted: 0,
            }
        );
        assert!(objects.is_empty());
        let local = heap.pool.lock(SpinPolicy::NONE);
        assert_eq!(local.current[class], Some(block));
        unsafe {
            assert!(block.is_empty());
            assert_eq!(block.list(), ListKind::Partial);
        }
        drop(local);

        // The thread keeps allocating from it.
        let again = tlh.allocate(&heap, 32).unwrap();
        assert_eq!(owning(again), block);
    }

    #[test]
    fn test_paused_reclaim_emits_empty_current_block() {
        let buffers = [TestBlock::new(1024)];
        let tlh = allocator();
        let heap = tlh.attach();
        let class = tlh.size_class(32).unwrap();
        let (block, mut objects) = nearly_fill(&tlh, &heap, &buffers);
        let count = objects.len();

        let outcome = unsafe { tlh.reclaim(&mut objects, false) };
        assert_eq!(
            outcome,
            ReclaimOutcome {
                chunks_recycled: count,
                blocks_emitted: 1,
            }
        );
        assert_eq!(objects, vec![buffers[0].memory()]);
        let local = heap.pool.lock(SpinPolicy::NONE);
        assert_eq!(local.current[class], None);
        assert!(local.partial[class].is_empty());
        unsafe { assert_eq!(block.list(), ListKind::Detached) };
        drop(local);
        assert_eq!(unsafe { tlh.census(&[heap.clone()]) }.unwrap().blocks, 0);
    }

    #[test]
    fn test_reclaim_passes_foreign_pointers_through() {
        let buffers = [TestBlock::new(1024)];
        let foreign = TestBlock::new(1024);
        let tlh = allocator();
        let heap = tlh.attach();
        let (_block, objects) = nearly_fill(&tlh, &heap, &buffers);

        // Untagged memory is not a thread-local chunk.
        let outside = unsafe { NonNull::new_unchecked(foreign.memory().as_ptr().add(64)) };
        let mut batch = vec![objects[0], outside, objects[1]];
        let outcome = unsafe { tlh.reclaim(&mut batch, true) };
        assert_eq!(outcome.chunks_recycled, 2);
        assert_eq!(batch, vec![outside]);
    }

    fn non_ceding_allocator() -> ThreadLocalAllocator {
        ThreadLocalAllocator::new(
            TlhConfig {
                global_blocks_per_refill: 0,
                ..allocator().config().clone()
            },
            SpinPolicy::NONE,
        )
    }

    #[test]
    fn test_concurrent_release_keeps_current_block() {
        let buffers = [TestBlock::new(1024), TestBlock::new(1024)];
        let tlh = non_ceding_allocator();
        let heap = tlh.attach();
        let class = tlh.size_class(32).unwrap();
        let (block, _objects) = nearly_fill(&tlh, &heap, &buffers);

        let mut released = Vec::new();
        let count = unsafe { tlh.release_free(&[heap.clone()], true, |m| released.push(m)) };
        assert_eq!(count, 1);
        assert_eq!(released, vec![buffers[1].memory()]);

        let local = heap.pool.lock(SpinPolicy::NONE);
        assert_eq!(local.current[class], Some(block));
        assert_eq!(local.partial[class].front(), Some(block));
        assert!(local.free.is_empty());
        drop(local);
        assert_eq!(block.owner(), Arc::as_ptr(&heap));
        assert!(tlh.global.lock(SpinPolicy::NONE).partial[class].is_empty());
    }

    #[test]
    fn test_paused_release_moves_current_block_to_global() {
        let buffers = [TestBlock::new(1024), TestBlock::new(1024)];
        let tlh = non_ceding_allocator();
        let heap = tlh.attach();
        let class = tlh.size_class(32).unwrap();
        let (block, objects) = nearly_fill(&tlh, &heap, &buffers);

        let mut released = Vec::new();
        let count = unsafe { tlh.release_free(&[heap.clone()], false, |m| released.push(m)) };
        assert_eq!(count, 1);
        assert_eq!(released, vec![buffers[1].memory()]);

        let local = heap.pool.lock(SpinPolicy::NONE);
        assert_eq!(local.current[class], None);
        assert!(local.partial[class].is_empty());
        drop(local);
        assert!(block.owner().is_null());
        assert_eq!(
            tlh.global.lock(SpinPolicy::NONE).partial[class].front(),
            Some(block)
        );

        // Once its chunks die the block is released as well.
        let mut batch = objects;
        let outcome = unsafe { tlh.reclaim(&mut batch, false) };
        assert_eq!(outcome.blocks_emitted, 1);
        assert_eq!(batch, vec![buffers[0].memory()]);
        assert!(tlh.global.lock(SpinPolicy::NONE).partial[class].is_empty());
    }

    #[test]
    fn test_size_classes() {
        let tlh = allocator();
        assert_eq!(tlh.size_class(8), None);
        assert_eq!(tlh.size_class(15), None);
        assert_eq!(tlh.size_class(16), Some(0));
        assert_eq!(tlh.size_class(17), Some(1));
        assert_eq!(tlh.size_class(24), Some(1));
        assert_eq!(tlh.size_class(64), Some(6));
        assert_eq!(tlh.size_class(65), None);
        for size in 16..=64 {
            let class = tlh.size_class(size).unwrap();
            assert!(tlh.payload_size(class) >= size);
            assert!(tlh.payload_size(class) < size + SIZE_CLASS_QUANTUM);
        }
    }

    #[test]
    fn test_attach_is_cache_line_aligned() {
        let tlh = allocator();
        let a = tlh.attach();
        let b = tlh.attach();
        assert_eq!(Arc::as_ptr(&a) as usize % 64, 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_empty_heap_has_nothing() {
        let tlh = allocator();
        let heap = tlh.attach();
        assert!(tlh.allocate(&heap, 32).is_none());
        assert!(tlh.allocate(&heap, 8).is_none());
    }
}
