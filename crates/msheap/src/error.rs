//! Error types.

use std::io;
use std::ptr::NonNull;

use thiserror::Error;

/// Failure to satisfy an allocation after the whole escalation ladder ran.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The heap could not grow far enough to satisfy the request, even after
    /// a full collection that cleared soft references.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request.
        requested: usize,
        /// The language-level out-of-memory error object.
        exception: NonNull<u8>,
        /// `true` if `exception` is the heap's pre-built error rather than a
        /// freshly created one.
        prebuilt: bool,
    },
}

impl AllocError {
    /// Size of the request that failed.
    #[must_use]
    pub const fn requested(&self) -> usize {
        match self {
            Self::OutOfMemory { requested, .. } => *requested,
        }
    }

    /// The error object to raise in the managed language.
    #[must_use]
    pub const fn exception(&self) -> NonNull<u8> {
        match self {
            Self::OutOfMemory { exception, .. } => *exception,
        }
    }
}

// SAFETY: `exception` is the address of a heap object, which any attached
// thread may reference.
unsafe impl Send for AllocError {}
// SAFETY: see above; the error exposes the address only by value.
unsafe impl Sync for AllocError {}

/// An inconsistent [`HeapConfig`](crate::HeapConfig).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The reservation size is zero or not page aligned.
    #[error("maximum heap size {0} must be a non-zero multiple of the page size")]
    InvalidMaximum(usize),

    /// The growth limit is larger than the reservation.
    #[error("growth limit {growth_limit} exceeds maximum heap size {maximum}")]
    GrowthLimitExceedsMaximum {
        /// Configured growth limit.
        growth_limit: usize,
        /// Configured maximum.
        maximum: usize,
    },

    /// The starting size is zero or above the growth limit.
    #[error("starting size {starting} must be in 1..={growth_limit}")]
    StartingSizeOutOfRange {
        /// Configured starting size.
        starting: usize,
        /// Configured growth limit.
        growth_limit: usize,
    },

    /// The target utilization is not in `(0, 1]`.
    #[error("target utilization {0} must be in (0, 1]")]
    InvalidUtilization(f64),

    /// `min_free` exceeds `max_free`.
    #[error("min free {min} exceeds max free {max}")]
    InvalidFreeBounds {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The thread-local size-class range is empty or misaligned.
    #[error("invalid thread-local size class range {min}..={max}")]
    InvalidSizeClassRange {
        /// Configured smallest class.
        min: usize,
        /// Configured largest class.
        max: usize,
    },

    /// More size classes than a block header can number.
    #[error("{count} thread-local size classes exceed the limit of {limit}")]
    TooManySizeClasses {
        /// Classes between the configured smallest and largest size.
        count: usize,
        /// Largest supported number of classes.
        limit: usize,
    },

    /// A block larger than its header can describe.
    #[error("block size {0} does not fit in 32 bits")]
    BlockTooLarge(usize),

    /// A block cannot hold a single chunk of the largest class.
    #[error("block size {block_size} is below the {required} bytes needed")]
    BlockTooSmall {
        /// Configured block size.
        block_size: usize,
        /// Smallest usable block size.
        required: usize,
    },

    /// The refill split leaves nothing for the requesting thread.
    #[error("refill of {blocks} blocks cannot cede {global} to the global pool")]
    InvalidRefill {
        /// Blocks per refill.
        blocks: usize,
        /// Blocks ceded to the global pool.
        global: usize,
    },
}

/// Failure to bring up a [`Heap`](crate::Heap).
#[derive(Debug, Error)]
pub enum StartupError {
    /// The configuration is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The address-space reservation failed.
    #[error("failed to reserve heap address space")]
    Reserve(#[source] io::Error),

    /// The pre-built out-of-memory error could not be allocated.
    #[error("failed to allocate the pre-built out-of-memory error")]
    PrebuiltError,

    /// The background collector thread could not be started.
    #[error("failed to start the background collector")]
    Daemon(#[source] io::Error),
}
