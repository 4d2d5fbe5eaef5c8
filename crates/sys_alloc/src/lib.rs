//! Virtual memory primitives for heap reservations.
//!
//! A heap reserves its whole address range once, then commits pages as its
//! footprint grows and decommits them when the footprint shrinks. The
//! reservation itself stays mapped until the [`Mmap`] is dropped.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A handle to an anonymous memory reservation.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the reservation.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the reservation in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the reservation is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Makes `[offset, offset + len)` usable.
    ///
    /// On Unix, anonymous private pages are committed on first touch and this
    /// only validates the range. On Windows, the pages are committed with
    /// `MEM_COMMIT`. Committing an already committed page is harmless.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is outside the reservation, or the
    /// OS error if the commit fails.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range lies inside this reservation.
        unsafe { self.inner.commit(offset, len) }
    }

    /// Returns the physical pages backing `[offset, offset + len)` to the OS.
    ///
    /// Both ends are rounded inward to page boundaries, so partially covered
    /// pages are left alone. Returns the number of bytes actually released.
    /// The contents of released pages read as zero once committed again.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is outside the reservation, or the
    /// OS error if the decommit fails.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<usize> {
        self.check_range(offset, len)?;
        let page = page_size();
        let start = offset.next_multiple_of(page);
        let end = (offset + len) / page * page;
        if end <= start {
            return Ok(0);
        }
        // SAFETY: the rounded range lies inside this reservation.
        unsafe { self.inner.decommit(start, end - start)? };
        Ok(end - start)
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside of reservation",
            )),
        }
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
// SAFETY: commit and decommit are thread-safe OS calls.
unsafe impl Sync for Mmap {}

/// Configuration for creating a reservation.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with length 0.
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            no_reserve: false,
        }
    }

    /// Sets the length of the reservation in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Reserves address space only, without charging swap or commit.
    ///
    /// On Linux, this adds `MAP_NORESERVE`. On Windows, the region is only
    /// reserved and callers must [`Mmap::commit`] before touching it.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled reservation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the OS error if the
    /// mapping fails.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        // SAFETY: a fresh anonymous mapping does not alias any existing memory.
        let inner = unsafe { os::MmapInner::map_anon(self.len, self.no_reserve)? };
        Ok(Mmap { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = MmapOptions::new().map_anon().err().expect("zero length");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_reserve_commit_write() {
        let len = page_size() * 4;
        let mmap = MmapOptions::new()
            .len(len)
            .no_reserve(true)
            .map_anon()
            .expect("failed to map");
        assert_eq!(mmap.ptr() as usize % page_size(), 0);
        assert_eq!(mmap.len(), len);

        mmap.commit(0, len).expect("commit");
        unsafe {
            let p = mmap.ptr().add(page_size());
            assert_eq!(ptr::read_volatile(p), 0);
            ptr::write_volatile(p, 42);
            assert_eq!(ptr::read_volatile(p), 42);
        }
    }

    #[test]
    fn test_decommit_zeroes_pages() {
        let page = page_size();
        let mmap = MmapOptions::new()
            .len(page * 4)
            .map_anon()
            .expect("failed to map");
        mmap.commit(0, page * 4).expect("commit");
        unsafe { ptr::write_volatile(mmap.ptr().add(page), 7) };

        let released = mmap.decommit(page, page * 2).expect("decommit");
        assert_eq!(released, page * 2);

        mmap.commit(page, page * 2).expect("recommit");
        unsafe { assert_eq!(ptr::read_volatile(mmap.ptr().add(page)), 0) };
    }

    #[test]
    fn test_decommit_rounds_inward() {
        let page = page_size();
        let mmap = MmapOptions::new()
            .len(page * 4)
            .map_anon()
            .expect("failed to map");
        assert_eq!(mmap.decommit(8, page).expect("decommit"), 0);
        assert_eq!(mmap.decommit(8, page * 2).expect("decommit"), page);
    }

    #[test]
    fn test_out_of_range() {
        let mmap = MmapOptions::new()
            .len(page_size())
            .map_anon()
            .expect("failed to map");
        assert!(mmap.commit(0, page_size() + 1).is_err());
        assert!(mmap.decommit(page_size(), 1).is_err());
        assert!(mmap.commit(usize::MAX, 2).is_err());
    }
}
