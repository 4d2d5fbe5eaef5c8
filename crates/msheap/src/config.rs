//! Heap configuration.
//!
//! [`HeapConfig`] collects every tunable of the heap: footprint limits, the
//! utilization policy used after each collection, the partial-collection
//! heuristics, lock spinning, and the thread-local allocator geometry.

use std::time::Duration;

use crate::error::ConfigError;

/// Allocation granule. Every object address and size is a multiple of this.
pub const GRANULE: usize = 8;

/// Step between consecutive thread-local size classes.
pub const SIZE_CLASS_QUANTUM: usize = 8;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Bounded spinning before a blocking lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Number of spin rounds (each an exponential `Backoff` step) before
    /// falling back to a blocking acquire. Zero disables spinning.
    pub spins: u32,
}

impl SpinPolicy {
    /// Never spin; go straight to the blocking acquire.
    pub const NONE: Self = Self { spins: 0 };
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self { spins: 64 }
    }
}

/// Geometry of the thread-local allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlhConfig {
    /// Smallest request served by a thread-local heap. Smaller requests use
    /// the global path.
    pub min_size: usize,
    /// Largest request served by a thread-local heap.
    pub max_size: usize,
    /// Bytes per block, header included.
    pub block_size: usize,
    /// Blocks obtained from the backing store when a thread-local heap runs
    /// out of chunks.
    pub blocks_per_refill: usize,
    /// How many of a refill's blocks are handed to the global pool instead
    /// of the requesting thread, when the global pool is uncontended.
    pub global_blocks_per_refill: usize,
}

impl Default for TlhConfig {
    fn default() -> Self {
        Self {
            min_size: 8,
            max_size: 256,
            block_size: 16 * KB,
            blocks_per_refill: 2,
            global_blocks_per_refill: 1,
        }
    }
}

impl TlhConfig {
    /// Number of size classes between `min_size` and `max_size`.
    #[must_use]
    pub const fn size_class_count(&self) -> usize {
        (self.max_size - self.min_size) / SIZE_CLASS_QUANTUM + 1
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size < GRANULE || self.min_size % GRANULE != 0 {
            return Err(ConfigError::InvalidSizeClassRange {
                min: self.min_size,
                max: self.max_size,
            });
        }
        if self.max_size < self.min_size || self.max_size % SIZE_CLASS_QUANTUM != 0 {
            return Err(ConfigError::InvalidSizeClassRange {
                min: self.min_size,
                max: self.max_size,
            });
        }
        // Class ids must stay below the unsized marker.
        let limit = usize::from(crate::tlh::block::UNSIZED);
        if self.size_class_count() > limit {
            return Err(ConfigError::TooManySizeClasses {
                count: self.size_class_count(),
                limit,
            });
        }
        if u32::try_from(self.block_size).is_err() {
            return Err(ConfigError::BlockTooLarge(self.block_size));
        }
        let required = crate::tlh::block::min_block_size(self.max_size);
        if self.block_size < required || self.block_size % GRANULE != 0 {
            return Err(ConfigError::BlockTooSmall {
                block_size: self.block_size,
                required,
            });
        }
        if self.blocks_per_refill == 0 || self.global_blocks_per_refill >= self.blocks_per_refill {
            return Err(ConfigError::InvalidRefill {
                blocks: self.blocks_per_refill,
                global: self.global_blocks_per_refill,
            });
        }
        Ok(())
    }
}

/// Configuration for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Initial allowed footprint.
    pub starting_size: usize,
    /// Ceiling the allowed footprint may grow to, until
    /// [`HeapGuard::clear_growth_limit`](crate::HeapGuard::clear_growth_limit).
    pub growth_limit: usize,
    /// Size of the address-space reservation.
    pub maximum_size: usize,
    /// Desired ratio of live bytes to allowed footprint after a collection.
    pub target_utilization: f64,
    /// Minimum headroom left above live bytes after a collection.
    pub min_free: usize,
    /// Maximum headroom left above live bytes after a collection.
    pub max_free: usize,
    /// A background collection is requested once allocated bytes come within
    /// this many bytes of the allowed footprint.
    pub concurrent_start_margin: usize,
    /// Partial collections in a row before the next one is upgraded to full.
    pub max_consecutive_partial: usize,
    /// A partial collection that leaves less free space than this while the
    /// footprint is at its ceiling forces the next collection to be full.
    pub min_free_after_partial: usize,
    /// Spinning before blocking on a contended lock.
    pub spin: SpinPolicy,
    /// Waits for a running collection longer than this are logged.
    pub long_wait_threshold: Duration,
    /// Run a background collector thread.
    pub background_gc: bool,
    /// Thread-local allocator geometry, or `None` to route every allocation
    /// through the global path.
    pub thread_local: Option<TlhConfig>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            starting_size: 2 * MB,
            growth_limit: 64 * MB,
            maximum_size: 64 * MB,
            target_utilization: 0.5,
            min_free: 512 * KB,
            max_free: 2 * MB,
            concurrent_start_margin: 128 * KB,
            max_consecutive_partial: 10,
            min_free_after_partial: 256 * KB,
            spin: SpinPolicy::default(),
            long_wait_threshold: Duration::from_millis(100),
            background_gc: false,
            thread_local: Some(TlhConfig::default()),
        }
    }
}

impl HeapConfig {
    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maximum_size == 0 || self.maximum_size % sys_alloc::page_size() != 0 {
            return Err(ConfigError::InvalidMaximum(self.maximum_size));
        }
        if self.growth_limit > self.maximum_size {
            return Err(ConfigError::GrowthLimitExceedsMaximum {
                growth_limit: self.growth_limit,
                maximum: self.maximum_size,
            });
        }
        if self.starting_size == 0 || self.starting_size > self.growth_limit {
            return Err(ConfigError::StartingSizeOutOfRange {
                starting: self.starting_size,
                growth_limit: self.growth_limit,
            });
        }
        if !(self.target_utilization > 0.0 && self.target_utilization <= 1.0) {
            return Err(ConfigError::InvalidUtilization(self.target_utilization));
        }
        if self.min_free > self.max_free {
            return Err(ConfigError::InvalidFreeBounds {
                min: self.min_free,
                max: self.max_free,
            });
        }
        if let Some(tlh) = &self.thread_local {
            tlh.validate()?;
        }
        Ok(())
    }
}
