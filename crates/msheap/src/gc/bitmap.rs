//! Heap bitmaps for liveness and marking.
//!
//! A [`HeapBitmap`] records one bit per 8-byte granule of the heap
//! reservation. The heap keeps two of them: the live bitmap (objects that
//! currently exist) and the mark bitmap (objects found reachable by the
//! collection in progress). Bits are atomic words, so lookups such as
//! [`Heap::is_valid_object`](crate::Heap::is_valid_object) need no lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::GRANULE;

const BITS_PER_WORD: usize = 64;

/// Bytes of heap covered by one bitmap word.
const BYTES_PER_WORD: usize = BITS_PER_WORD * GRANULE;

/// A bitmap over `[base, base + len)` with one bit per granule.
#[derive(Debug)]
pub struct HeapBitmap {
    base: usize,
    len: usize,
    words: Box<[AtomicU64]>,
}

impl HeapBitmap {
    /// Creates a cleared bitmap covering `len` bytes starting at `base`.
    #[must_use]
    pub fn new(base: usize, len: usize) -> Self {
        let words = len.div_ceil(BYTES_PER_WORD);
        Self {
            base,
            len,
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Returns `true` if `addr` is a granule-aligned address inside the
    /// covered range.
    #[must_use]
    pub const fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len && addr % GRANULE == 0
    }

    #[inline]
    fn locate(&self, addr: usize) -> (usize, u64) {
        debug_assert!(self.covers(addr), "address {addr:#x} outside bitmap");
        let index = (addr - self.base) / GRANULE;
        (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD))
    }

    /// Sets the bit for `addr`, returning whether it was already set.
    #[inline]
    pub fn set(&self, addr: usize) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Returns the bit for `addr`. Addresses outside the range read as unset.
    #[inline]
    #[must_use]
    pub fn test(&self, addr: usize) -> bool {
        if !self.covers(addr) {
            return false;
        }
        let (word, mask) = self.locate(addr);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Clears the bit for `addr`.
    #[inline]
    pub fn clear(&self, addr: usize) {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Clears every bit in `[lo, hi)`.
    pub fn clear_range(&self, lo: usize, hi: usize) {
        self.update_range(lo, hi, |index, mask| {
            self.words[index].fetch_and(!mask, Ordering::Relaxed);
        });
    }

    /// Copies the bits of `[lo, hi)` from `other`, which must cover the same
    /// reservation.
    pub fn copy_range_from(&self, other: &Self, lo: usize, hi: usize) {
        debug_assert_eq!(self.base, other.base);
        self.update_range(lo, hi, |index, mask| {
            let src = other.words[index].load(Ordering::Relaxed) & mask;
            let dst = self.words[index].load(Ordering::Relaxed) & !mask;
            self.words[index].store(dst | src, Ordering::Relaxed);
        });
    }

    /// Calls `f` with the index of every word overlapping `[lo, hi)` and the
    /// mask of its bits inside the range.
    fn update_range(&self, lo: usize, hi: usize, mut f: impl FnMut(usize, u64)) {
        let lo = lo.max(self.base);
        let hi = hi.min(self.base + self.len);
        if lo >= hi {
            return;
        }
        let first = (lo - self.base) / GRANULE;
        let last = (hi - self.base).div_ceil(GRANULE);
        let mut index = first;
        while index < last {
            let word = index / BITS_PER_WORD;
            let start_bit = index % BITS_PER_WORD;
            let end_bit = (last - word * BITS_PER_WORD).min(BITS_PER_WORD);
            f(word, range_mask(start_bit, end_bit));
            index = (word + 1) * BITS_PER_WORD;
        }
    }

    /// Calls `f` with the address of every set bit in `[lo, hi)`, in
    /// ascending order.
    pub fn for_each_set(&self, lo: usize, hi: usize, mut f: impl FnMut(usize)) {
        self.update_range(lo, hi, |index, mask| {
            let word_base = self.base + index * BYTES_PER_WORD;
            let mut bits = self.words[index].load(Ordering::Acquire) & mask;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f(word_base + bit * GRANULE);
                bits &= bits - 1;
            }
        });
    }

    /// Number of set bits in `[lo, hi)`.
    #[must_use]
    pub fn count(&self, lo: usize, hi: usize) -> usize {
        let mut count = 0;
        self.update_range(lo, hi, |index, mask| {
            count += (self.words[index].load(Ordering::Relaxed) & mask).count_ones() as usize;
        });
        count
    }

    /// Calls `f` for every address in `[lo, hi)` set in `old` but clear in
    /// `new`, in ascending order. This is the garbage between a pre-swap live
    /// bitmap and the post-swap one.
    pub fn walk_garbage(old: &Self, new: &Self, lo: usize, hi: usize, mut f: impl FnMut(usize)) {
        debug_assert_eq!(old.base, new.base);
        old.update_range(lo, hi, |index, mask| {
            let word_base = old.base + index * BYTES_PER_WORD;
            let mut bits = old.words[index].load(Ordering::Acquire)
                & !new.words[index].load(Ordering::Acquire)
                & mask;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f(word_base + bit * GRANULE);
                bits &= bits - 1;
            }
        });
    }
}

/// Mask with bits `start..end` set.
const fn range_mask(start: usize, end: usize) -> u64 {
    let upper = if end >= BITS_PER_WORD {
        u64::MAX
    } else {
        (1u64 << end) - 1
    };
    upper & !((1u64 << start) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const BASE: usize = 0x10_0000;

    #[test]
    fn test_set_test_clear() {
        let bitmap = HeapBitmap::new(BASE, 4096);
        assert!(!bitmap.test(BASE));
        assert!(!bitmap.set(BASE));
        assert!(bitmap.set(BASE));
        assert!(bitmap.test(BASE));
        bitmap.clear(BASE);
        assert!(!bitmap.test(BASE));
    }

    #[test]
    fn test_out_of_range_reads_unset() {
        let bitmap = HeapBitmap::new(BASE, 4096);
        assert!(!bitmap.test(BASE - 8));
        assert!(!bitmap.test(BASE + 4096));
        assert!(!bitmap.test(BASE + 4));
        assert!(!bitmap.covers(BASE + 3));
    }

    #[test]
    fn test_range_mask() {
        assert_eq!(range_mask(0, 64), u64::MAX);
        assert_eq!(range_mask(0, 1), 1);
        assert_eq!(range_mask(4, 8), 0xF0);
        assert_eq!(range_mask(63, 64), 1 << 63);
    }

    #[test]
    fn test_clear_range_partial_words() {
        let bitmap = HeapBitmap::new(BASE, 8192);
        for addr in (BASE..BASE + 8192).step_by(GRANULE) {
            bitmap.set(addr);
        }
        bitmap.clear_range(BASE + 40, BASE + 1000);
        assert!(bitmap.test(BASE + 32));
        assert!(!bitmap.test(BASE + 40));
        assert!(!bitmap.test(BASE + 992));
        assert!(bitmap.test(BASE + 1000));
        assert_eq!(bitmap.count(BASE, BASE + 8192), 1024 - (1000 - 40) / 8);
    }

    #[test]
    fn test_for_each_set_ascending() {
        let bitmap = HeapBitmap::new(BASE, 8192);
        let addrs = [BASE + 8, BASE + 504, BASE + 512, BASE + 4096, BASE + 8184];
        for &addr in addrs.iter().rev() {
            bitmap.set(addr);
        }
        let mut seen = Vec::new();
        bitmap.for_each_set(BASE, BASE + 8192, |addr| seen.push(addr));
        assert_eq!(seen, addrs);

        let mut bounded = Vec::new();
        bitmap.for_each_set(BASE + 16, BASE + 4096, |addr| bounded.push(addr));
        assert_eq!(bounded, [BASE + 504, BASE + 512]);
    }

    #[test]
    fn test_copy_range_from() {
        let live = HeapBitmap::new(BASE, 4096);
        let mark = HeapBitmap::new(BASE, 4096);
        live.set(BASE);
        live.set(BASE + 1024);
        live.set(BASE + 2048);
        mark.set(BASE + 3072);
        mark.copy_range_from(&live, BASE, BASE + 2048);
        assert!(mark.test(BASE));
        assert!(mark.test(BASE + 1024));
        assert!(!mark.test(BASE + 2048));
        assert!(mark.test(BASE + 3072));
    }

    #[test]
    fn test_walk_garbage() {
        let old = HeapBitmap::new(BASE, 4096);
        let new = HeapBitmap::new(BASE, 4096);
        for addr in [BASE, BASE + 64, BASE + 600, BASE + 4088] {
            old.set(addr);
        }
        new.set(BASE + 64);
        new.set(BASE + 128);
        let mut garbage = Vec::new();
        HeapBitmap::walk_garbage(&old, &new, BASE, BASE + 4096, |addr| garbage.push(addr));
        assert_eq!(garbage, [BASE, BASE + 600, BASE + 4088]);
    }

    #[test]
    fn test_concurrent_set() {
        let bitmap = Arc::new(HeapBitmap::new(BASE, 4 * 4096));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || {
                    for j in 0..512 {
                        bitmap.set(BASE + (i * 512 + j) * GRANULE);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bitmap.count(BASE, BASE + 4 * 4096), 2048);
    }
}
