//! The background collector thread.
//!
//! Allocation signals the daemon once the heap comes within
//! [`concurrent_start_margin`](crate::HeapConfig::concurrent_start_margin)
//! bytes of its allowed footprint. The daemon then runs a partial,
//! concurrent collection unless one is already in progress.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::gc::request::CollectionRequest;
use crate::heap::{HeapInner, Mutator};

const DAEMON_NAME: &str = "heap-gc-daemon";

#[derive(Debug, Default)]
struct SignalState {
    requested: bool,
    shutdown: bool,
}

/// Wake-up channel of the daemon.
#[derive(Debug, Default)]
pub(crate) struct DaemonSignal {
    state: Mutex<SignalState>,
    wake: Condvar,
}

impl DaemonSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Asks for a background collection. Requests made while one is
    /// pending coalesce.
    pub(crate) fn request(&self) {
        let mut state = self.state.lock();
        if !state.requested {
            state.requested = true;
            self.wake.notify_one();
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_one();
    }

    /// Blocks until a collection is requested or shutdown begins. Returns
    /// `false` on shutdown.
    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while !state.requested && !state.shutdown {
            self.wake.wait(&mut state);
        }
        state.requested = false;
        !state.shutdown
    }
}

/// Handle to a running daemon thread.
pub(crate) struct GcDaemon {
    inner: Arc<HeapInner>,
    handle: JoinHandle<()>,
}

impl GcDaemon {
    /// Starts the daemon as a mutator of the heap.
    pub(crate) fn spawn(inner: Arc<HeapInner>) -> io::Result<Self> {
        let heap = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(DAEMON_NAME.to_owned())
            .spawn(move || {
                let mutator = Mutator::attach(&heap, DAEMON_NAME);
                while mutator.blocking(|| heap.daemon.wait()) {
                    let mut guard = mutator.lock_heap();
                    if !guard.is_collecting() {
                        guard.collect(CollectionRequest::BACKGROUND);
                    }
                }
            })?;
        Ok(Self { inner, handle })
    }

    /// Stops the daemon and waits for it to exit. A collection in progress
    /// finishes first.
    pub(crate) fn stop(self) {
        self.inner.daemon.shutdown();
        if self.handle.join().is_err() {
            eprintln!("[msheap] background collector panicked");
        }
    }
}
