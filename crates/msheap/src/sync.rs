//! # Lock Ordering Discipline for Deadlock Prevention
//!
//! The heap has three kinds of locks, which must be acquired in increasing
//! level:
//!
//! | Level | Lock         | Description                                  |
//! |-------|--------------|----------------------------------------------|
//! | 1     | `HeapLock`   | Heap state, backing store, collection flag   |
//! | 2     | `GlobalPool` | Orphaned and ceded thread-local blocks       |
//! | 3     | `LocalPool`  | One thread-local heap's blocks               |
//!
//! A thread holding a local pool lock that needs the global pool releases the
//! local lock, blocks on the global lock, then reacquires the local one.
//! `try_lock` acquisitions cannot deadlock and are exempt from validation.
//!
//! ## Validation
//!
//! In debug builds every [`LockGuard`] pushes its level onto a thread-local
//! stack and asserts that no lock above the new one's level is already held.
//!
//! This module also provides the two-phase acquire used for contended locks:
//! a bounded spin on multi-core machines, then a blocking wait.

use std::cell::RefCell;
use std::sync::OnceLock;

use crossbeam::utils::Backoff;
use parking_lot::{Mutex, MutexGuard};

use crate::config::SpinPolicy;

const MAX_LOCK_DEPTH: usize = 8;

thread_local!(static LOCK_STACK: RefCell<Vec<u8>> =
    RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// The heap lock (level 1).
    HeapLock = 1,
    /// The global block pool (level 2).
    GlobalPool = 2,
    /// A thread-local block pool (level 3).
    LocalPool = 3,
}

impl LockOrder {
    /// The acquisition level of this lock.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    const fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::HeapLock),
            2 => Some(Self::GlobalPool),
            3 => Some(Self::LocalPool),
            _ => None,
        }
    }
}

/// RAII record of a held lock.
///
/// Create it immediately before acquiring the lock it describes and keep it
/// alive for as long as the lock is held.
#[must_use = "LockGuard must be held for the duration of the critical section"]
#[derive(Debug)]
pub struct LockGuard {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    tag: LockOrder,
}

impl LockGuard {
    /// Validates and records the acquisition of `tag`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of a higher level is already held.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            if let Some(held) = highest_held() {
                validate_lock_order(tag, held);
            }
            push(tag);
        }
        Self { tag }
    }

    /// Records the acquisition of `tag` without validating it. Used for
    /// `try_lock`, which cannot deadlock.
    pub fn unchecked(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        push(tag);
        Self { tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let tag = self.tag.level();
        let _ = LOCK_STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|&level| level == tag) {
                stack.remove(pos);
            }
        });
    }
}

#[cfg(debug_assertions)]
fn push(tag: LockOrder) {
    let _ = LOCK_STACK.try_with(|stack| stack.borrow_mut().push(tag.level()));
}

/// Highest lock level currently held by this thread.
#[must_use]
pub fn highest_held() -> Option<LockOrder> {
    LOCK_STACK
        .try_with(|stack| stack.borrow().iter().copied().max())
        .ok()
        .flatten()
        .and_then(LockOrder::from_level)
}

/// Asserts that `tag` may be acquired while `held` is the highest lock held.
///
/// Same-level acquisitions are allowed (two local pools are never held at
/// once, but the global pool may be relocked after a `try_lock`).
///
/// # Panics
///
/// Panics in debug builds on a downgrade.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn validate_lock_order(tag: LockOrder, held: LockOrder) {
    debug_assert!(
        tag.level() >= held.level(),
        "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding {held:?} (level {}).",
        tag.level(),
        held.level()
    );
    let _ = (tag, held);
}

fn is_multi_core() -> bool {
    static MULTI_CORE: OnceLock<bool> = OnceLock::new();
    *MULTI_CORE.get_or_init(|| {
        std::thread::available_parallelism().is_ok_and(|n| n.get() > 1)
    })
}

/// Acquires `mutex` in two phases.
///
/// An uncontended lock is taken immediately. Otherwise, on machines with more
/// than one hardware thread, the lock is retried for `policy.spins` rounds of
/// exponential backoff, calling `poll` between rounds; then the thread blocks.
pub fn spin_then_lock<'a, T>(
    mutex: &'a Mutex<T>,
    policy: SpinPolicy,
    mut poll: impl FnMut(),
) -> MutexGuard<'a, T> {
    if let Some(guard) = mutex.try_lock() {
        return guard;
    }
    if policy.spins > 0 && is_multi_core() {
        let backoff = Backoff::new();
        for _ in 0..policy.spins {
            backoff.spin();
            poll();
            if let Some(guard) = mutex.try_lock() {
                return guard;
            }
        }
    }
    mutex.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_order_levels() {
        assert!(LockOrder::HeapLock.level() < LockOrder::GlobalPool.level());
        assert!(LockOrder::GlobalPool.level() < LockOrder::LocalPool.level());
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_valid_order() {
        let _heap = LockGuard::new(LockOrder::HeapLock);
        let _global = LockGuard::new(LockOrder::GlobalPool);
        let _local = LockGuard::new(LockOrder::LocalPool);
        assert_eq!(highest_held(), Some(LockOrder::LocalPool));
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_release_restores_level() {
        {
            let _heap = LockGuard::new(LockOrder::HeapLock);
            let _local = LockGuard::new(LockOrder::LocalPool);
        }
        assert_eq!(highest_held(), None);
        let _global = LockGuard::new(LockOrder::GlobalPool);
        assert_eq!(highest_held(), Some(LockOrder::GlobalPool));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_global_after_local_panics() {
        let _local = LockGuard::new(LockOrder::LocalPool);
        let _global = LockGuard::new(LockOrder::GlobalPool);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_heap_after_pool_panics() {
        let _global = LockGuard::new(LockOrder::GlobalPool);
        let _heap = LockGuard::new(LockOrder::HeapLock);
    }

    #[test]
    fn test_unchecked_allows_out_of_order_try_lock() {
        let _local = LockGuard::new(LockOrder::LocalPool);
        let _global = LockGuard::unchecked(LockOrder::GlobalPool);
    }

    #[test]
    fn test_spin_then_lock_uncontended() {
        let mutex = Mutex::new(5);
        let mut polls = 0;
        let guard = spin_then_lock(&mutex, SpinPolicy::default(), || polls += 1);
        assert_eq!(*guard, 5);
        assert_eq!(polls, 0);
    }

    #[test]
    fn test_spin_then_lock_contended() {
        let mutex = Arc::new(Mutex::new(0usize));
        let polls = Arc::new(AtomicUsize::new(0));
        let held = mutex.lock();

        let waiter = {
            let mutex = Arc::clone(&mutex);
            let polls = Arc::clone(&polls);
            thread::spawn(move || {
                let mut guard = spin_then_lock(&mutex, SpinPolicy { spins: 8 }, || {
                    polls.fetch_add(1, Ordering::Relaxed);
                });
                *guard += 1;
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap();
        assert_eq!(*mutex.lock(), 1);
        assert!(polls.load(Ordering::Relaxed) <= 8);
    }
}
