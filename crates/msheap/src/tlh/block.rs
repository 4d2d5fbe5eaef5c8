//! Thread-local allocation blocks.
//!
//! A block is one backing-store allocation carved into equally sized chunks:
//!
//! ```text
//! +--------------+---------+-----------+---------+-----------+-----
//! | BlockHeader  | tag hdr | payload   | tag hdr | payload   | ...
//! | (64 bytes)   | 8 bytes | size class| 8 bytes | size class|
//! +--------------+---------+-----------+---------+-----------+-----
//! ```
//!
//! Each chunk header holds the tagged block address and is written once when
//! the block is formatted for a size class. It never changes while the block
//! stays formatted, so any object in the block can find its block at any
//! time. Free chunks are threaded through the first payload word, in
//! descending address order.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use super::tag::{tag_block, HEADER_SIZE};
use super::ThreadLocalHeap;

const BLOCK_MAGIC: u32 = 0x544C_4842; // "TLHB"

/// Size class of a block that is not formatted for any class.
pub const UNSIZED: u16 = u16::MAX;

/// Space reserved for the block header at the start of every block.
pub const BLOCK_HEADER_SIZE: usize = 64;

/// Alignment of every block.
pub const BLOCK_ALIGN: usize = 64;

/// Smallest block able to hold one chunk of `max_payload` bytes.
#[must_use]
pub const fn min_block_size(max_payload: usize) -> usize {
    BLOCK_HEADER_SIZE + HEADER_SIZE + max_payload
}

/// Which pool list a block is currently linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListKind {
    /// Not on any list (being moved, or about to be released).
    Detached = 0,
    /// Fully free blocks, not formatted for any class.
    Free = 1,
    /// Blocks with at least one free and one used chunk, or freshly formatted.
    Partial = 2,
    /// Blocks with no free chunk.
    Full = 3,
}

/// In-place header at the start of each block.
#[repr(C, align(64))]
pub struct BlockHeader {
    magic: u32,
    size_class: u16,
    list: ListKind,
    owner: AtomicPtr<ThreadLocalHeap>,
    block_size: u32,
    stride: u32,
    capacity: u32,
    in_use: u32,
    free_head: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

/// Handle to a block.
///
/// All accessors work through raw field projections and never form a
/// reference to the whole header, because the `owner` field is read without
/// the pool lock while the lock holder updates other fields.
///
/// Unless stated otherwise, every `unsafe` method requires the caller to hold
/// the lock of the pool the block currently belongs to (or to own the block
/// exclusively, as during formatting and release).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(NonNull<BlockHeader>);

// SAFETY: blocks are heap memory; access is serialized by pool locks.
unsafe impl Send for Block {}

impl Block {
    /// Writes a fresh, unsized header at `memory`.
    ///
    /// # Safety
    ///
    /// `memory` must be a `BLOCK_ALIGN`-aligned, exclusively owned region of
    /// `block_size` bytes.
    pub unsafe fn init(
        memory: NonNull<u8>,
        block_size: usize,
        owner: *const ThreadLocalHeap,
    ) -> Self {
        debug_assert_eq!(memory.as_ptr() as usize % BLOCK_ALIGN, 0);
        let header = memory.cast::<BlockHeader>();
        // SAFETY: the caller owns the region and it is large enough.
        unsafe {
            header.as_ptr().write(BlockHeader {
                magic: BLOCK_MAGIC,
                size_class: UNSIZED,
                list: ListKind::Detached,
                owner: AtomicPtr::new(owner.cast_mut()),
                block_size: u32::try_from(block_size).unwrap_or(u32::MAX),
                stride: 0,
                capacity: 0,
                in_use: 0,
                free_head: 0,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
        }
        Self(header)
    }

    /// Reinterprets a header pointer, typically recovered from a chunk tag.
    ///
    /// # Safety
    ///
    /// `header` must point at a block initialized by [`Block::init`].
    #[must_use]
    pub unsafe fn from_header(header: NonNull<BlockHeader>) -> Self {
        // SAFETY: forwarded from the caller.
        debug_assert_eq!(unsafe { (*header.as_ptr()).magic }, BLOCK_MAGIC);
        Self(header)
    }

    /// Address of the block, which is also the backing-store allocation.
    #[must_use]
    pub const fn memory(self) -> NonNull<u8> {
        self.0.cast()
    }

    pub(crate) const fn header(self) -> NonNull<BlockHeader> {
        self.0
    }

    const fn raw(self) -> *mut BlockHeader {
        self.0.as_ptr()
    }

    fn chunks_start(self) -> usize {
        self.raw() as usize + BLOCK_HEADER_SIZE
    }

    /// Formats the block into chunks of `payload` bytes for `size_class`.
    ///
    /// Writes every chunk's tagged header and threads all chunks onto the
    /// free list, highest address first.
    ///
    /// # Safety
    ///
    /// The block must be empty and held exclusively or under its pool lock.
    pub unsafe fn format(self, size_class: u16, payload: usize) {
        let stride = HEADER_SIZE + payload;
        let block_size = self.block_size();
        let capacity = (block_size - BLOCK_HEADER_SIZE) / stride;
        let tag = tag_block(self.0);
        let start = self.chunks_start();

        let mut next = 0usize;
        for index in 0..capacity {
            let chunk = start + index * stride;
            // SAFETY: every chunk lies within the block.
            unsafe {
                (chunk as *mut usize).write(tag);
                ((chunk + HEADER_SIZE) as *mut usize).write(next);
            }
            next = chunk;
        }

        let raw = self.raw();
        // SAFETY: see the method contract.
        unsafe {
            (*raw).size_class = size_class;
            (*raw).stride = u32::try_from(stride).unwrap_or(u32::MAX);
            (*raw).capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
            (*raw).in_use = 0;
            (*raw).free_head = next;
        }
    }

    /// Drops the size-class formatting of an empty block.
    ///
    /// # Safety
    ///
    /// The block must be empty and held exclusively or under its pool lock.
    pub unsafe fn unformat(self) {
        debug_assert!(unsafe { self.in_use() } == 0);
        let raw = self.raw();
        // SAFETY: see the method contract.
        unsafe {
            (*raw).size_class = UNSIZED;
            (*raw).stride = 0;
            (*raw).capacity = 0;
            (*raw).free_head = 0;
        }
    }

    /// Pops the lowest-listed free chunk and returns its payload address.
    ///
    /// # Safety
    ///
    /// Requires the pool lock.
    pub unsafe fn take_chunk(self) -> Option<NonNull<u8>> {
        let raw = self.raw();
        // SAFETY: requires the pool lock.
        unsafe {
            let chunk = (*raw).free_head;
            if chunk == 0 {
                return None;
            }
            let payload = chunk + HEADER_SIZE;
            (*raw).free_head = (payload as *const usize).read();
            (*raw).in_use += 1;
            NonNull::new(payload as *mut u8)
        }
    }

    /// Returns a chunk to the block's free list.
    ///
    /// # Safety
    ///
    /// Requires the pool lock, and `payload` must be an in-use chunk of this
    /// block.
    pub unsafe fn give_back(self, payload: NonNull<u8>) {
        debug_assert!(self.holds_chunk(payload));
        let raw = self.raw();
        let chunk = payload.as_ptr() as usize - HEADER_SIZE;
        // SAFETY: requires the pool lock; the chunk belongs to this block.
        unsafe {
            debug_assert!((*raw).in_use > 0);
            payload.as_ptr().cast::<usize>().write((*raw).free_head);
            (*raw).free_head = chunk;
            (*raw).in_use -= 1;
        }
    }

    /// Returns `true` if `payload` is the payload address of one of this
    /// block's chunks.
    #[must_use]
    pub fn holds_chunk(self, payload: NonNull<u8>) -> bool {
        // SAFETY: stride and capacity are only written while formatting.
        let (stride, capacity) =
            unsafe { ((*self.raw()).stride as usize, (*self.raw()).capacity as usize) };
        let addr = payload.as_ptr() as usize;
        let start = self.chunks_start() + HEADER_SIZE;
        stride != 0
            && addr >= start
            && addr < start + capacity * stride
            && (addr - start) % stride == 0
    }

    /// Block size in bytes, header included.
    #[must_use]
    pub fn block_size(self) -> usize {
        // SAFETY: written once at init.
        unsafe { (*self.raw()).block_size as usize }
    }

    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn size_class(self) -> u16 {
        unsafe { (*self.raw()).size_class }
    }

    /// Payload bytes per chunk, or zero if unsized.
    ///
    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn payload_size(self) -> usize {
        unsafe { ((*self.raw()).stride as usize).saturating_sub(HEADER_SIZE) }
    }

    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn capacity(self) -> usize {
        unsafe { (*self.raw()).capacity as usize }
    }

    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn in_use(self) -> usize {
        unsafe { (*self.raw()).in_use as usize }
    }

    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn is_full(self) -> bool {
        unsafe { (*self.raw()).free_head == 0 && (*self.raw()).capacity > 0 }
    }

    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn is_empty(self) -> bool {
        unsafe { (*self.raw()).in_use == 0 }
    }

    /// Counts the free list by walking it.
    ///
    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn free_list_len(self) -> usize {
        let mut len = 0;
        // SAFETY: requires the pool lock; links point at this block's chunks.
        let mut chunk = unsafe { (*self.raw()).free_head };
        while chunk != 0 {
            len += 1;
            chunk = unsafe { ((chunk + HEADER_SIZE) as *const usize).read() };
        }
        len
    }

    /// Current owner; null for the global pool. Readable without the lock.
    #[must_use]
    pub fn owner(self) -> *const ThreadLocalHeap {
        // SAFETY: the field is atomic and no `&mut` to the header exists.
        unsafe { (*self.raw()).owner.load(Ordering::Acquire) }
    }

    /// # Safety
    ///
    /// Requires the locks of both the old and the new owning pool.
    pub unsafe fn set_owner(self, owner: *const ThreadLocalHeap) {
        unsafe { (*self.raw()).owner.store(owner.cast_mut(), Ordering::Release) };
    }

    /// # Safety
    ///
    /// Requires the pool lock.
    #[must_use]
    pub unsafe fn list(self) -> ListKind {
        unsafe { (*self.raw()).list }
    }

    pub(super) unsafe fn set_list(self, list: ListKind) {
        unsafe { (*self.raw()).list = list };
    }

    pub(super) unsafe fn prev(self) -> Option<Self> {
        NonNull::new(unsafe { (*self.raw()).prev }).map(Self)
    }

    pub(super) unsafe fn next(self) -> Option<Self> {
        NonNull::new(unsafe { (*self.raw()).next }).map(Self)
    }

    pub(super) unsafe fn set_prev(self, prev: Option<Self>) {
        unsafe { (*self.raw()).prev = prev.map_or(ptr::null_mut(), Self::raw) };
    }

    pub(super) unsafe fn set_next(self, next: Option<Self>) {
        unsafe { (*self.raw()).next = next.map_or(ptr::null_mut(), Self::raw) };
    }
}
