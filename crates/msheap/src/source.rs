//! The backing store.
//!
//! [`HeapSource`] owns the heap's address-space reservation and its two
//! bitmaps. The allocation state, [`Space`], lives inside the heap lock;
//! every `HeapSource` method taking `&mut Space` therefore runs with the
//! heap lock held.
//!
//! # Layout
//!
//! Memory is handed out in extents. Each extent starts with an 8-byte header
//! holding the extent length, followed by the object. Extent lengths are
//! multiples of 8 and at least 16 bytes. Free extents live in an
//! address-ordered map and are coalesced on free; allocation is first-fit
//! over the map, then a bump from the top of the used range.
//!
//! The footprint is the distance from the base to the top of the used range.
//! It is bounded by the allowed footprint for plain allocation, which
//! [`alloc_and_grow`](HeapSource::alloc_and_grow) may raise up to the growth
//! limit.

use std::collections::BTreeMap;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use sys_alloc::{Mmap, MmapOptions};

use crate::config::GRANULE;
use crate::gc::bitmap::HeapBitmap;
use crate::tlh::tag::{self, HEADER_SIZE};

/// Smallest extent: a header plus one granule.
const MIN_EXTENT: usize = HEADER_SIZE + GRANULE;

/// Reservation, bitmaps, and the lock-free queries over them.
#[derive(Debug)]
pub struct HeapSource {
    region: Region,
    base: usize,
    limit: usize,
    bitmaps: [HeapBitmap; 2],
    live_index: AtomicUsize,
}

struct Region(Mmap);

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.0.ptr())
            .field("len", &self.0.len())
            .finish()
    }
}

/// Allocation state of the backing store, guarded by the heap lock.
#[derive(Debug)]
pub struct Space {
    top: usize,
    allowed: usize,
    growth_limit: usize,
    maximum: usize,
    active_base: usize,
    free: BTreeMap<usize, usize>,
    free_bytes: usize,
    bytes_allocated: usize,
    objects_allocated: usize,
}

impl Space {
    /// Bytes in allocated extents, headers included.
    #[must_use]
    pub const fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of allocated extents.
    #[must_use]
    pub const fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }

    /// Bytes in free extents below the top.
    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Current ceiling on the footprint for allocation without growth.
    #[must_use]
    pub const fn allowed_footprint(&self) -> usize {
        self.allowed
    }

    /// Ceiling the allowed footprint may grow to.
    #[must_use]
    pub const fn growth_limit(&self) -> usize {
        self.growth_limit
    }

    /// Start of the active region. Everything below it is the sealed base
    /// image; equal to the heap base until one is sealed.
    #[must_use]
    pub const fn active_base(&self) -> usize {
        self.active_base
    }

    /// End of the used range.
    #[must_use]
    pub const fn top(&self) -> usize {
        self.top
    }

    fn take(&mut self, start: usize, len: usize) {
        self.free.remove(&start);
        self.free_bytes -= len;
    }

    fn give(&mut self, start: usize, len: usize) {
        debug_assert!(len >= MIN_EXTENT && len % GRANULE == 0);
        self.free.insert(start, len);
        self.free_bytes += len;
    }
}

/// Where a new extent goes.
struct Placement {
    /// Start of the free range the extent is carved from.
    from: usize,
    /// Length of that free range, or 0 for a bump from the top.
    from_len: usize,
    /// Start of the extent (its header).
    start: usize,
    /// Extent length.
    len: usize,
}

/// Extent length for an object of `size` bytes.
const fn extent_len(size: usize) -> usize {
    let len = (HEADER_SIZE + size).next_multiple_of(GRANULE);
    if len < MIN_EXTENT {
        MIN_EXTENT
    } else {
        len
    }
}

/// Start of an extent at or after `from` whose object is `align`-aligned,
/// leaving either no gap or a gap large enough to stay a free extent.
const fn aligned_start(from: usize, align: usize) -> usize {
    let mut start = (from + HEADER_SIZE).next_multiple_of(align) - HEADER_SIZE;
    if start != from && start - from < MIN_EXTENT {
        start += align;
    }
    start
}

impl HeapSource {
    /// Reserves `maximum` bytes of address space and creates the initial
    /// allocation state.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the reservation fails.
    pub fn new(maximum: usize, starting: usize, growth_limit: usize) -> io::Result<(Self, Space)> {
        let region = MmapOptions::new().len(maximum).no_reserve(true).map_anon()?;
        let base = region.ptr() as usize;
        let limit = base + region.len();
        let source = Self {
            region: Region(region),
            base,
            limit,
            bitmaps: [HeapBitmap::new(base, maximum), HeapBitmap::new(base, maximum)],
            live_index: AtomicUsize::new(0),
        };
        let space = Space {
            top: base,
            allowed: starting,
            growth_limit,
            maximum,
            active_base: base,
            free: BTreeMap::new(),
            free_bytes: 0,
            bytes_allocated: 0,
            objects_allocated: 0,
        };
        Ok((source, space))
    }

    /// Lowest address of the reservation.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// One past the highest address of the reservation.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// The bitmap of objects that currently exist.
    #[must_use]
    pub fn live_bitmap(&self) -> &HeapBitmap {
        &self.bitmaps[self.live_index.load(Ordering::Acquire)]
    }

    /// The bitmap the collector marks into.
    #[must_use]
    pub fn mark_bitmap(&self) -> &HeapBitmap {
        &self.bitmaps[self.live_index.load(Ordering::Acquire) ^ 1]
    }

    /// Exchanges the live and mark bitmaps. Called with the heap lock held
    /// and every mutator suspended.
    pub fn swap_mark_and_live_bitmaps(&self, _space: &mut Space) {
        self.live_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// Returns `true` if `ptr` is a live object of this heap.
    ///
    /// Safe without the heap lock: the live bit of a new object is set
    /// before the object is handed out.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.live_bitmap().test(ptr as usize)
    }

    /// Records a new object as live, and as marked if a collection is
    /// marking.
    pub fn publish(&self, object: NonNull<u8>, marking: bool) {
        let addr = object.as_ptr() as usize;
        if marking {
            self.mark_bitmap().set(addr);
        }
        self.live_bitmap().set(addr);
    }

    /// Usable bytes of a backing-store object.
    ///
    /// # Safety
    ///
    /// `object` must be a live object allocated by this store.
    #[must_use]
    pub unsafe fn chunk_size(&self, object: NonNull<u8>) -> usize {
        // SAFETY: forwarded from the caller.
        let word = unsafe { tag::header_word(object) };
        debug_assert!(!tag::is_thread_local(word));
        word - HEADER_SIZE
    }

    /// Footprint the heap aims for: the allowed ceiling.
    #[must_use]
    pub const fn ideal_footprint(&self, space: &Space) -> usize {
        space.allowed
    }

    /// Distance from the base to the top of the used range.
    #[must_use]
    pub const fn footprint(&self, space: &Space) -> usize {
        space.top - self.base
    }

    /// Allocates `size` zeroed bytes without growing past the allowed
    /// footprint. The object is not yet published.
    pub fn alloc(&self, space: &mut Space, size: usize) -> Option<NonNull<u8>> {
        self.allocate(space, size, GRANULE, false)
    }

    /// Like [`alloc`](Self::alloc), but may raise the allowed footprint up
    /// to the growth limit.
    pub fn alloc_and_grow(&self, space: &mut Space, size: usize) -> Option<NonNull<u8>> {
        self.allocate(space, size, GRANULE, true)
    }

    /// Allocates a block of `size` bytes aligned to `align`, for the
    /// thread-local allocator.
    pub fn alloc_block(
        &self,
        space: &mut Space,
        size: usize,
        align: usize,
        grow: bool,
    ) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two() && align >= GRANULE);
        self.allocate(space, size, align, grow)
    }

    fn allocate(
        &self,
        space: &mut Space,
        size: usize,
        align: usize,
        grow: bool,
    ) -> Option<NonNull<u8>> {
        if size > self.limit - self.base {
            return None;
        }
        let len = extent_len(size);
        let placement = self
            .first_fit(space, len, align)
            .or_else(|| self.bump(space, len, align, grow))?;
        self.region
            .0
            .commit(placement.start - self.base, placement.len)
            .ok()?;

        if placement.from_len == 0 {
            if placement.start > placement.from {
                space.give(placement.from, placement.start - placement.from);
            }
            let end = placement.start + placement.len;
            if end - self.base > space.allowed {
                crate::tracing::internal::log_footprint_growth(space.allowed, end - self.base);
                space.allowed = end - self.base;
            }
            space.top = end;
        } else {
            space.take(placement.from, placement.from_len);
            if placement.start > placement.from {
                space.give(placement.from, placement.start - placement.from);
            }
            let end = placement.start + placement.len;
            let tail = placement.from + placement.from_len - end;
            if tail > 0 {
                space.give(end, tail);
            }
        }
        space.bytes_allocated += placement.len;
        space.objects_allocated += 1;

        let start = placement.start as *mut u8;
        // SAFETY: the extent lies inside the committed reservation and is
        // exclusively ours.
        unsafe {
            start.cast::<usize>().write(placement.len);
            let object = start.add(HEADER_SIZE);
            object.write_bytes(0, placement.len - HEADER_SIZE);
            Some(NonNull::new_unchecked(object))
        }
    }

    fn first_fit(&self, space: &Space, len: usize, align: usize) -> Option<Placement> {
        space
            .free
            .range(space.active_base..)
            .find_map(|(&from, &from_len)| {
                let start = aligned_start(from, align);
                let end = from + from_len;
                if start + len > end {
                    return None;
                }
                // Absorb a tail too small to stay a free extent.
                let len = if end - (start + len) < MIN_EXTENT {
                    end - start
                } else {
                    len
                };
                Some(Placement {
                    from,
                    from_len,
                    start,
                    len,
                })
            })
    }

    fn bump(&self, space: &Space, len: usize, align: usize, grow: bool) -> Option<Placement> {
        let start = aligned_start(space.top, align);
        let end = start.checked_add(len)?;
        let ceiling = if grow {
            space.growth_limit.max(space.allowed)
        } else {
            space.allowed
        };
        if end > self.limit || end - self.base > ceiling {
            return None;
        }
        Some(Placement {
            from: space.top,
            from_len: 0,
            start,
            len,
        })
    }

    /// Returns an object or block to the free map, coalescing with its
    /// neighbours. Freeing the extent at the top lowers the top and
    /// decommits the pages above it.
    ///
    /// # Safety
    ///
    /// `object` must have been allocated by this store and never be used
    /// again.
    pub unsafe fn free(&self, space: &mut Space, object: NonNull<u8>) {
        let addr = object.as_ptr() as usize;
        // SAFETY: forwarded from the caller.
        let len = unsafe { tag::header_word(object) };
        debug_assert!(!tag::is_thread_local(len), "freeing a thread-local chunk");
        let mut start = addr - HEADER_SIZE;
        let mut merged = len;

        space.bytes_allocated -= len;
        space.objects_allocated -= 1;
        self.live_bitmap().clear(addr);

        if let Some((&prev, &prev_len)) = space.free.range(..start).next_back() {
            if prev + prev_len == start {
                space.take(prev, prev_len);
                start = prev;
                merged += prev_len;
            }
        }
        if let Some(&next_len) = space.free.get(&(start + merged)) {
            space.take(start + merged, next_len);
            merged += next_len;
        }

        let end = start + merged;
        if end == space.top {
            let new_top = start.max(space.active_base);
            if new_top > start {
                space.give(start, new_top - start);
            }
            self.decommit(new_top, space.top - new_top);
            space.top = new_top;
        } else {
            space.give(start, merged);
        }
    }

    /// Decommits the whole pages inside every free extent, returning the
    /// number of bytes released. Pages are committed again before reuse.
    pub fn trim(&self, space: &Space) -> usize {
        space
            .free
            .iter()
            .map(|(&start, &len)| self.decommit(start, len))
            .sum()
    }

    /// Returns the whole pages inside `[start, start + len)` to the OS.
    /// A failure leaves them committed, which only costs memory.
    fn decommit(&self, start: usize, len: usize) -> usize {
        match self.region.0.decommit(start - self.base, len) {
            Ok(released) => released,
            Err(err) => {
                crate::tracing::internal::log_decommit_failure(start, len, &err);
                0
            }
        }
    }

    /// Adjusts the allowed footprint after a collection so that live bytes
    /// make up `target` of it, keeping between `min_free` and `max_free`
    /// bytes of headroom, capped by the growth limit.
    pub fn grow_for_utilization(
        &self,
        space: &mut Space,
        target: f64,
        min_free: usize,
        max_free: usize,
    ) {
        let live = space.bytes_allocated;
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let ideal = (live as f64 / target) as usize;
        let allowed = ideal
            .clamp(live + min_free, live + max_free)
            .min(space.growth_limit);
        if allowed != space.allowed {
            crate::tracing::internal::log_footprint_growth(space.allowed, allowed);
            space.allowed = allowed;
        }
    }

    /// Freezes everything allocated so far as the base image. New objects
    /// are placed above it, and partial collections neither trace through
    /// nor sweep it.
    pub fn seal_base_image(&self, space: &mut Space) {
        space.active_base = space.top;
    }

    /// Lifts the growth limit to the size of the reservation.
    pub fn clear_growth_limit(&self, space: &mut Space) {
        space.growth_limit = space.maximum;
    }
}
