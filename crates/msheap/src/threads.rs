//! Mutator threads and the stop-the-world rendezvous.
//!
//! Every attached thread has a [`ThreadState`] with a status. A thread in
//! [`ThreadStatus::Running`] may touch heap objects; any other status means
//! it promises not to until it transitions back, and a transition back to
//! `Running` waits while a suspension is in effect.
//!
//! The collector calls [`ThreadList::suspend_all`], which returns once every
//! other attached thread is out of `Running`. Running threads notice the
//! request at their next safepoint (every allocation is one).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::metrics::AllocProfile;

/// What an attached thread is doing, as far as the collector cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Executing managed code; may touch heap objects at any time.
    Running = 0,
    /// Blocked on a heap-internal wait (the heap lock, a collection).
    VmWait = 1,
    /// Parked at a safepoint for a suspension.
    Suspended = 2,
    /// Outside managed code (blocking I/O, native calls, idle waits).
    Native = 3,
}

impl ThreadStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::VmWait,
            2 => Self::Suspended,
            _ => Self::Native,
        }
    }
}

/// Per-thread state shared between the thread and the collector.
#[derive(Debug)]
pub struct ThreadState {
    id: u64,
    name: String,
    /// The OS thread that attached.
    os_thread: ThreadId,
    status: AtomicU8,
    /// Set once attachment finished; the thread is then part of the root set.
    rooted: AtomicBool,
    /// Set while this thread is raising an out-of-memory error.
    throwing_oom: AtomicBool,
    /// Allocations that act as roots until released.
    tracked: Mutex<Vec<usize>>,
    profile: AllocProfile,
}

impl ThreadState {
    /// Identifier, unique within the heap.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Name given at attach time.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn store_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_rooted(&self) -> bool {
        self.rooted.load(Ordering::Acquire)
    }

    pub(crate) fn set_rooted(&self) {
        self.rooted.store(true, Ordering::Release);
    }

    /// Marks the start of raising an OOM error, returning `false` if one is
    /// already being raised on this thread.
    pub(crate) fn begin_throwing_oom(&self) -> bool {
        !self.throwing_oom.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_throwing_oom(&self) {
        self.throwing_oom.store(false, Ordering::Release);
    }

    pub(crate) fn track(&self, object: usize) {
        self.tracked.lock().push(object);
    }

    /// Removes one registration of `object`, returning whether it was
    /// tracked.
    pub(crate) fn untrack(&self, object: usize) -> bool {
        let mut tracked = self.tracked.lock();
        match tracked.iter().rposition(|&tracked| tracked == object) {
            Some(pos) => {
                tracked.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn tracked(&self) -> Vec<usize> {
        self.tracked.lock().clone()
    }

    pub(crate) fn clear_tracked(&self) {
        self.tracked.lock().clear();
    }

    /// Allocation profile of this thread.
    #[must_use]
    pub const fn profile(&self) -> &AllocProfile {
        &self.profile
    }
}

#[derive(Debug, Default)]
struct ListInner {
    threads: Vec<Arc<ThreadState>>,
    suspend_count: usize,
}

/// Registry of attached threads and the suspension protocol.
#[derive(Debug, Default)]
pub struct ThreadList {
    inner: Mutex<ListInner>,
    changed: Condvar,
    suspend_pending: AtomicBool,
    next_id: AtomicU64,
    attached: AtomicUsize,
}

impl ThreadList {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new thread in `Running` status.
    pub fn register(&self, name: &str) -> Arc<ThreadState> {
        let state = Arc::new(ThreadState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            name: name.to_owned(),
            os_thread: thread::current().id(),
            status: AtomicU8::new(ThreadStatus::Running as u8),
            rooted: AtomicBool::new(false),
            throwing_oom: AtomicBool::new(false),
            tracked: Mutex::new(Vec::new()),
            profile: AllocProfile::new(),
        });
        self.inner.lock().threads.push(Arc::clone(&state));
        self.attached.fetch_add(1, Ordering::Relaxed);
        state
    }

    /// Removes a thread and wakes a collector waiting for it.
    pub fn unregister(&self, thread: &ThreadState) {
        let mut inner = self.inner.lock();
        inner.threads.retain(|t| t.id != thread.id);
        self.attached.fetch_sub(1, Ordering::Relaxed);
        self.changed.notify_all();
    }

    /// Number of attached threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attached.load(Ordering::Relaxed)
    }

    /// Returns `true` if no thread is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the attached threads.
    #[must_use]
    pub fn threads(&self) -> Vec<Arc<ThreadState>> {
        self.inner.lock().threads.clone()
    }

    /// The calling OS thread's state, if it is attached and running.
    #[must_use]
    pub fn current_running(&self) -> Option<Arc<ThreadState>> {
        let me = thread::current().id();
        self.inner
            .lock()
            .threads
            .iter()
            .find(|t| t.os_thread == me && t.status() == ThreadStatus::Running)
            .cloned()
    }

    /// Returns `true` while a suspension is requested or in effect.
    #[must_use]
    pub fn suspend_pending(&self) -> bool {
        self.suspend_pending.load(Ordering::SeqCst)
    }

    /// Suspends every attached thread except `current`.
    ///
    /// Returns once no other thread is in `Running`. Threads in other
    /// statuses count as suspended; they block on their way back to
    /// `Running` until [`resume_all`](Self::resume_all).
    pub fn suspend_all(&self, current: Option<&ThreadState>) {
        let mut inner = self.inner.lock();
        inner.suspend_count += 1;
        self.suspend_pending.store(true, Ordering::SeqCst);
        let current = current.map(ThreadState::id);
        while inner
            .threads
            .iter()
            .any(|t| Some(t.id) != current && t.status() == ThreadStatus::Running)
        {
            self.changed.wait(&mut inner);
        }
    }

    /// Ends a suspension started by [`suspend_all`](Self::suspend_all).
    pub fn resume_all(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.suspend_count > 0, "resume without suspend");
        inner.suspend_count = inner.suspend_count.saturating_sub(1);
        if inner.suspend_count == 0 {
            self.suspend_pending.store(false, Ordering::SeqCst);
        }
        self.changed.notify_all();
    }

    /// Moves `thread` out of `Running`.
    pub fn leave_running(&self, thread: &ThreadState, status: ThreadStatus) {
        debug_assert_ne!(status, ThreadStatus::Running);
        thread.store_status(status);
        if self.suspend_pending() {
            let _inner = self.inner.lock();
            self.changed.notify_all();
        }
    }

    /// Moves `thread` back to `Running`, waiting out any suspension.
    pub fn enter_running(&self, thread: &ThreadState) {
        loop {
            thread.store_status(ThreadStatus::Running);
            if !self.suspend_pending() {
                return;
            }
            let mut inner = self.inner.lock();
            thread.store_status(ThreadStatus::Suspended);
            self.changed.notify_all();
            while inner.suspend_count > 0 {
                self.changed.wait(&mut inner);
            }
        }
    }

    /// Parks `thread` if a suspension is pending. Called by running threads
    /// at safepoints.
    pub fn safepoint(&self, thread: &ThreadState) {
        if self.suspend_pending() {
            self.enter_running(thread);
        }
    }
}

/// Scoped status flip: leaves `Running` on creation and re-enters it,
/// honouring suspensions, on drop.
pub struct StatusGuard<'a> {
    list: &'a ThreadList,
    thread: &'a ThreadState,
}

impl<'a> StatusGuard<'a> {
    /// Switches `thread` to `status` until the guard drops.
    pub fn new(list: &'a ThreadList, thread: &'a ThreadState, status: ThreadStatus) -> Self {
        list.leave_running(thread, status);
        Self { list, thread }
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.list.enter_running(self.thread);
    }
}

/// Raises the calling thread's scheduling priority for the length of a
/// stop-the-world collection, restoring it on drop.
#[derive(Debug)]
pub struct PriorityGuard {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    saved: Option<i32>,
}

impl PriorityGuard {
    /// Lowers the thread's niceness to the normal level if it is running
    /// below it. Failures (for example, missing privileges) leave the
    /// priority unchanged.
    #[must_use]
    pub fn raise() -> Self {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: gettid, getpriority and setpriority have no memory
            // preconditions.
            unsafe {
                let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
                *libc::__errno_location() = 0;
                let current = libc::getpriority(libc::PRIO_PROCESS, tid);
                if *libc::__errno_location() == 0
                    && current > 0
                    && libc::setpriority(libc::PRIO_PROCESS, tid, 0) == 0
                {
                    return Self {
                        saved: Some(current),
                    };
                }
            }
        }
        Self { saved: None }
    }
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Some(priority) = self.saved {
            // SAFETY: see `raise`.
            unsafe {
                let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
                libc::setpriority(libc::PRIO_PROCESS, tid, priority);
            }
        }
    }
}
