//! Block pools.
//!
//! A [`Pool`] owns blocks on intrusive doubly linked lists: one list of free
//! blocks, and per size class a partial list and a full list. Every pool is
//! guarded by its own lock. The global pool holds blocks orphaned by exited
//! threads or ceded during refills; each thread-local heap has a local pool.

use parking_lot::{Mutex, MutexGuard};

use super::block::{Block, ListKind};
use crate::config::SpinPolicy;
use crate::sync::{spin_then_lock, LockGuard, LockOrder};

/// An intrusive list of blocks.
///
/// Blocks are linked through their headers, so insertion at the head and
/// removal of a known block are constant time. Each block records which kind
/// of list it is on, which lets membership be checked.
#[derive(Debug)]
pub struct BlockList {
    head: Option<Block>,
    len: usize,
    kind: ListKind,
}

impl BlockList {
    /// Creates an empty list of the given kind.
    #[must_use]
    pub const fn new(kind: ListKind) -> Self {
        Self {
            head: None,
            len: 0,
            kind,
        }
    }

    /// Number of blocks on the list.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First block on the list.
    #[must_use]
    pub const fn front(&self) -> Option<Block> {
        self.head
    }

    /// Links `block` at the head.
    ///
    /// # Safety
    ///
    /// `block` must not be on any list, and the caller must hold the lock of
    /// the pool owning this list.
    pub unsafe fn push_front(&mut self, block: Block) {
        // SAFETY: the caller holds the pool lock.
        unsafe {
            debug_assert_eq!(block.list(), ListKind::Detached);
            block.set_prev(None);
            block.set_next(self.head);
            if let Some(head) = self.head {
                head.set_prev(Some(block));
            }
            block.set_list(self.kind);
        }
        self.head = Some(block);
        self.len += 1;
    }

    /// Unlinks `block`, which must be on this list.
    ///
    /// # Safety
    ///
    /// `block` must be on this list, and the caller must hold the lock of the
    /// pool owning this list.
    pub unsafe fn remove(&mut self, block: Block) {
        // SAFETY: the caller holds the pool lock.
        unsafe {
            debug_assert_eq!(block.list(), self.kind);
            let prev = block.prev();
            let next = block.next();
            match prev {
                Some(prev) => prev.set_next(next),
                None => {
                    debug_assert_eq!(self.head, Some(block));
                    self.head = next;
                }
            }
            if let Some(next) = next {
                next.set_prev(prev);
            }
            block.set_prev(None);
            block.set_next(None);
            block.set_list(ListKind::Detached);
        }
        self.len -= 1;
    }

    /// Unlinks and returns the head block.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock of the pool owning this list.
    pub unsafe fn pop_front(&mut self) -> Option<Block> {
        let head = self.head?;
        // SAFETY: forwarded from the caller.
        unsafe { self.remove(head) };
        Some(head)
    }

    /// Unlinks every block, head first.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock of the pool owning this list.
    pub unsafe fn drain(&mut self) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(self.len);
        // SAFETY: forwarded from the caller.
        while let Some(block) = unsafe { self.pop_front() } {
            blocks.push(block);
        }
        blocks
    }

    /// Collects the blocks on the list without unlinking them.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock of the pool owning this list.
    #[must_use]
    pub unsafe fn blocks(&self) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(block) = cursor {
            blocks.push(block);
            // SAFETY: forwarded from the caller.
            cursor = unsafe { block.next() };
        }
        blocks
    }
}

/// The lists of one pool, guarded by the pool lock.
#[derive(Debug)]
pub struct PoolLists {
    /// Fully free, unformatted blocks.
    pub free: BlockList,
    /// Per size class, blocks with at least one free chunk.
    pub partial: Box<[BlockList]>,
    /// Per size class, blocks with no free chunk.
    pub full: Box<[BlockList]>,
    /// Per size class, the block allocation currently draws from. It always
    /// also sits on the class's partial list. Unused by the global pool.
    pub current: Box<[Option<Block>]>,
}

// SAFETY: the lists only hold block handles, which are plain heap addresses
// whose contents are guarded by the pool lock.
unsafe impl Send for PoolLists {}

impl PoolLists {
    fn new(classes: usize) -> Self {
        Self {
            free: BlockList::new(ListKind::Free),
            partial: (0..classes).map(|_| BlockList::new(ListKind::Partial)).collect(),
            full: (0..classes).map(|_| BlockList::new(ListKind::Full)).collect(),
            current: vec![None; classes].into_boxed_slice(),
        }
    }

    /// Unlinks `block` from whichever list it is on.
    ///
    /// # Safety
    ///
    /// The caller must hold this pool's lock and `block` must belong to it.
    pub unsafe fn unlink(&mut self, block: Block) {
        // SAFETY: forwarded from the caller.
        unsafe {
            let class = usize::from(block.size_class());
            match block.list() {
                ListKind::Free => self.free.remove(block),
                ListKind::Partial => {
                    if self.current[class] == Some(block) {
                        self.current[class] = None;
                    }
                    self.partial[class].remove(block);
                }
                ListKind::Full => self.full[class].remove(block),
                ListKind::Detached => {}
            }
        }
    }

    /// Every block in the pool, in list order: free, then partial and full
    /// per class.
    ///
    /// # Safety
    ///
    /// The caller must hold this pool's lock.
    #[must_use]
    pub unsafe fn all_blocks(&self) -> Vec<Block> {
        // SAFETY: forwarded from the caller.
        unsafe {
            let mut blocks = self.free.blocks();
            for (partial, full) in self.partial.iter().zip(self.full.iter()) {
                blocks.extend(partial.blocks());
                blocks.extend(full.blocks());
            }
            blocks
        }
    }
}

/// A lock-protected set of block lists.
#[derive(Debug)]
pub struct Pool {
    lists: Mutex<PoolLists>,
    order: LockOrder,
}

/// Held lock on a pool.
pub struct PoolGuard<'a> {
    lists: MutexGuard<'a, PoolLists>,
    _order: LockGuard,
}

impl std::ops::Deref for PoolGuard<'_> {
    type Target = PoolLists;

    fn deref(&self) -> &PoolLists {
        &self.lists
    }
}

impl std::ops::DerefMut for PoolGuard<'_> {
    fn deref_mut(&mut self) -> &mut PoolLists {
        &mut self.lists
    }
}

impl Pool {
    /// Creates the global pool.
    #[must_use]
    pub fn global(classes: usize) -> Self {
        Self {
            lists: Mutex::new(PoolLists::new(classes)),
            order: LockOrder::GlobalPool,
        }
    }

    /// Creates a thread-local pool.
    #[must_use]
    pub fn local(classes: usize) -> Self {
        Self {
            lists: Mutex::new(PoolLists::new(classes)),
            order: LockOrder::LocalPool,
        }
    }

    /// Acquires the pool lock, spinning per `spin` before blocking.
    pub fn lock(&self, spin: SpinPolicy) -> PoolGuard<'_> {
        let order = LockGuard::new(self.order);
        PoolGuard {
            lists: spin_then_lock(&self.lists, spin, || {}),
            _order: order,
        }
    }

    /// Acquires the pool lock only if it is free.
    pub fn try_lock(&self) -> Option<PoolGuard<'_>> {
        self.lists.try_lock().map(|lists| PoolGuard {
            lists,
            _order: LockGuard::unchecked(self.order),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlh::block::tests::TestBlock;
    use crate::tlh::block::BLOCK_HEADER_SIZE;

    fn blocks(n: usize) -> (Vec<TestBlock>, Vec<Block>) {
        let buffers: Vec<_> = (0..n).map(|_| TestBlock::new(BLOCK_HEADER_SIZE + 256)).collect();
        let blocks = buffers.iter().map(TestBlock::block).collect();
        (buffers, blocks)
    }

    #[test]
    fn test_push_and_remove_middle() {
        let (_buffers, b) = blocks(3);
        let mut list = BlockList::new(ListKind::Free);
        unsafe {
            list.push_front(b[0]);
            list.push_front(b[1]);
            list.push_front(b[2]);
            assert_eq!(list.blocks(), [b[2], b[1], b[0]]);

            list.remove(b[1]);
            assert_eq!(list.len(), 2);
            assert_eq!(list.blocks(), [b[2], b[0]]);
            assert_eq!(b[1].list(), ListKind::Detached);

            list.remove(b[2]);
            assert_eq!(list.front(), Some(b[0]));
            assert_eq!(list.pop_front(), Some(b[0]));
            assert!(list.is_empty());
            assert_eq!(list.pop_front(), None);
        }
    }

    #[test]
    fn test_list_kind_recorded() {
        let (_buffers, b) = blocks(1);
        let mut partial = BlockList::new(ListKind::Partial);
        unsafe {
            partial.push_front(b[0]);
            assert_eq!(b[0].list(), ListKind::Partial);
            partial.remove(b[0]);
            let mut full = BlockList::new(ListKind::Full);
            full.push_front(b[0]);
            assert_eq!(b[0].list(), ListKind::Full);
            assert_eq!(full.drain(), [b[0]]);
        }
    }

    #[test]
    fn test_unlink_clears_current() {
        let (_buffers, b) = blocks(1);
        let pool = Pool::local(4);
        let mut lists = pool.lock(SpinPolicy::NONE);
        unsafe {
            b[0].format(2, 16);
            lists.partial[2].push_front(b[0]);
            lists.current[2] = Some(b[0]);
            assert_eq!(lists.all_blocks(), [b[0]]);
            lists.unlink(b[0]);
        }
        assert!(lists.current[2].is_none());
        assert!(lists.partial[2].is_empty());
    }

    #[test]
    fn test_try_lock_contended() {
        let pool = Pool::global(1);
        let _held = pool.lock(SpinPolicy::NONE);
        assert!(pool.try_lock().is_none());
    }
}
