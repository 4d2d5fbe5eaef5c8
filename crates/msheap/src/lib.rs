//! A mark-sweep heap for managed-language runtimes.
//!
//! `msheap` provides the allocation and collection machinery a language
//! runtime sits on: a non-moving mark-sweep collector with optional
//! **concurrent** tracing and **partial** collections that skip a sealed
//! base image, plus a **thread-local allocator** serving small requests from
//! per-thread pools of size-classed blocks.
//!
//! The heap knows nothing about object layout. A runtime implements
//! [`RuntimeHooks`] to report roots and references, and the heap calls it at
//! fixed points of each collection.
//!
//! # Quick Start
//!
//! ```
//! use std::ptr::NonNull;
//! use std::sync::Arc;
//!
//! use msheap::{AllocFlags, CollectionRequest, Heap, HeapConfig, Marker, RuntimeHooks};
//!
//! struct Leaves;
//!
//! impl RuntimeHooks for Leaves {
//!     fn mark_roots(&self, _marker: &mut Marker<'_>) {}
//!     fn scan_object(&self, _object: NonNull<u8>, _marker: &mut Marker<'_>) {}
//! }
//!
//! let heap = Heap::new(HeapConfig::default(), Arc::new(Leaves)).unwrap();
//! let mutator = heap.attach_thread("main");
//!
//! let kept = mutator.allocate(32, AllocFlags::NONE).unwrap();
//! let dropped = mutator.allocate(32, AllocFlags::DONT_TRACK).unwrap();
//! mutator.collect(CollectionRequest::FULL_PAUSE);
//!
//! assert!(heap.is_valid_object(kept.as_ptr()));
//! assert!(!heap.is_valid_object(dropped.as_ptr()));
//! ```
//!
//! # Threads
//!
//! Every thread touching the heap attaches through [`Heap::attach_thread`]
//! and gets a [`Mutator`]. Collections stop the world at safepoints: every
//! allocation is one, and [`Mutator::blocking`] marks a stretch of code
//! during which the thread does not need to be stopped.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod alloc;
pub mod config;
pub mod error;
pub mod gc;
mod heap;
pub mod metrics;
pub mod runtime;
pub mod source;
pub mod sync;
pub mod threads;
/// Thread-local allocator internals.
///
/// This module is public for testing and advanced use cases.
/// Most users should go through [`Mutator::allocate`].
pub mod tlh;
pub mod tracing;

// Re-export public API
pub use alloc::AllocFlags;
pub use config::{HeapConfig, SpinPolicy, TlhConfig};
pub use error::{AllocError, ConfigError, StartupError};
pub use gc::marker::Marker;
pub use gc::request::CollectionRequest;
pub use heap::{AllocatorKind, Heap, HeapGuard, HeapStats, Mutator};
pub use metrics::{
    global_metrics, AllocProfileSnapshot, CollectionType, GcHistory, GcMetrics, GlobalMetrics,
};
pub use runtime::{ReferenceKind, ReferenceLists, RuntimeHooks};
pub use threads::ThreadStatus;
pub use tlh::{DetachOutcome, TlhCensus};
pub use crate::tracing::{GcId, GcPhase};
