use std::sync::{
    Condvar, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

/// A latching "signaled forever" event.
///
/// [`set()`](Self::set) is a one-way transition: once the event is signaled it
/// stays signaled, every thread currently parked in [`wait()`](Self::wait) is
/// released, and every later `wait()` returns immediately. The release-store
/// in `set` pairs with the acquire-load in `is_set`/`wait`, so observers need
/// no extra synchronization of their own.
///
/// The runtime uses this for the start gate (workers park until construction
/// completes), the all-halted gate, and per-node completion.
pub struct OnceEvent {
    state: AtomicBool,
    lock: Mutex<()>,
    waiters: Condvar,
}

impl OnceEvent {
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
            lock: Mutex::new(()),
            waiters: Condvar::new(),
        }
    }

    /// Returns whether the event has been signaled.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }

    /// Signals the event, waking every waiter. Idempotent.
    pub fn set(&self) {
        // The store happens under the mutex so a waiter cannot check the flag,
        // miss the notification, and then park.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.state.store(true, Ordering::Release);
        self.waiters.notify_all();
    }

    /// Blocks the calling thread until the event is signaled.
    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.state.load(Ordering::Relaxed) {
            guard = self
                .waiters
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for OnceEvent {
    fn default() -> Self {
        Self::new()
    }
}
