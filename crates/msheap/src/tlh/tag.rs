//! Chunk header tagging.
//!
//! Every object handed out by the heap is preceded by one header word.
//! Objects from the backing store carry their extent size there, which is a
//! multiple of 8 and so has `00` in its low two bits. Objects carved from a
//! thread-local block carry the block's address with the low two bits set to
//! `11` instead. Reading the word before an object therefore tells which
//! allocator owns it, and for thread-local objects, which block.

use std::ptr::NonNull;

use super::block::BlockHeader;

/// Low-bit marker identifying a thread-local chunk header.
pub const TLH_TAG: usize = 0b11;

/// Mask covering the marker bits.
pub const TAG_MASK: usize = 0b11;

/// Size of the header word preceding every object.
pub const HEADER_SIZE: usize = std::mem::size_of::<usize>();

/// Encodes a block address as a chunk header word.
///
/// Blocks are cache-line aligned, so the marker bits of the address are free.
#[inline]
#[must_use]
pub fn tag_block(block: NonNull<BlockHeader>) -> usize {
    let addr = block.as_ptr() as usize;
    debug_assert_eq!(addr & TAG_MASK, 0, "block {addr:#x} is not tag aligned");
    addr | TLH_TAG
}

/// Returns `true` if `word` is a thread-local chunk header.
#[inline]
#[must_use]
pub const fn is_thread_local(word: usize) -> bool {
    word & TAG_MASK == TLH_TAG
}

/// Decodes a chunk header word, returning the owning block for thread-local
/// headers and `None` for backing-store size headers.
#[inline]
#[must_use]
pub fn untag(word: usize) -> Option<NonNull<BlockHeader>> {
    if is_thread_local(word) {
        NonNull::new((word & !TAG_MASK) as *mut BlockHeader)
    } else {
        None
    }
}

/// Reads the header word preceding `object`.
///
/// # Safety
///
/// `object` must have been returned by the heap and not yet reclaimed.
#[inline]
#[must_use]
pub unsafe fn header_word(object: NonNull<u8>) -> usize {
    // SAFETY: every heap object is preceded by an aligned header word.
    unsafe { object.as_ptr().sub(HEADER_SIZE).cast::<usize>().read() }
}

/// Returns the block owning `object`, or `None` if the backing store owns it.
///
/// # Safety
///
/// Same as [`header_word`].
#[inline]
#[must_use]
pub unsafe fn owning_block(object: NonNull<u8>) -> Option<NonNull<BlockHeader>> {
    // SAFETY: forwarded from the caller.
    untag(unsafe { header_word(object) })
}
