use std::sync::Arc;
use std::task::Waker;

use futures::task::AtomicWaker;

/// One parked fiber.
///
/// A cell is pushed into its condvar's queue exactly once per blocking
/// receive; re-polls of the same pending receive only refresh the waker.
/// [`FiberCondvar::signal`] pops the cell and wakes it, so a woken fiber finds
/// either a queued value or the drained condition on its next poll.
pub(crate) struct WaitCell {
    waker: AtomicWaker,
}

impl WaitCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            waker: AtomicWaker::new(),
        })
    }

    /// Records the task to wake. Safe to call on every poll; the newest waker
    /// wins.
    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    fn wake(&self) {
        self.waker.wake();
    }
}

/// A condition variable whose waiters are fibers, not OS threads.
///
/// An input channel that runs dry parks the owning node's fiber here: the
/// fiber enqueues a [`WaitCell`] and returns `Pending`, handing its worker
/// thread back to the scheduler. [`signal`](Self::signal) wakes at most one
/// waiter by setting its node's wake flag through the registered waker.
///
/// `enqueue` and `signal` must run under the owning channel's mutex; that is
/// what makes a signal that follows a queue push impossible to miss.
/// [`any_waiting`](Self::any_waiting) is deliberately lock-free and therefore
/// only advisory unless the caller holds that same mutex.
pub(crate) struct FiberCondvar {
    tx: flume::Sender<Arc<WaitCell>>,
    rx: flume::Receiver<Arc<WaitCell>>,
}

impl FiberCondvar {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Parks a fiber: queues its wait cell for a later [`signal`](Self::signal).
    pub(crate) fn enqueue(&self, cell: Arc<WaitCell>) {
        // Both halves live in `self`; the channel cannot be disconnected.
        let _ = self.tx.send(cell);
    }

    /// Wakes at most one waiter; returns whether one was present.
    pub(crate) fn signal(&self) -> bool {
        match self.rx.try_recv() {
            Ok(cell) => {
                cell.wake();
                true
            }
            Err(_) => false,
        }
    }

    /// Lock-free probe: is any fiber parked here?
    pub(crate) fn any_waiting(&self) -> bool {
        !self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    use super::*;

    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Signal on an empty condvar reports no waiter.
    #[test]
    fn test_signal_without_waiters() {
        let cv = FiberCondvar::new();
        assert!(!cv.any_waiting());
        assert!(!cv.signal());
    }

    /// Each signal wakes exactly one queued waiter, in queue order.
    #[test]
    fn test_signal_wakes_one() {
        let cv = FiberCondvar::new();
        let first = Arc::new(CountingWake(AtomicUsize::new(0)));
        let second = Arc::new(CountingWake(AtomicUsize::new(0)));

        let cell_a = WaitCell::new();
        cell_a.register(&Waker::from(first.clone()));
        cv.enqueue(cell_a);

        let cell_b = WaitCell::new();
        cell_b.register(&Waker::from(second.clone()));
        cv.enqueue(cell_b);

        assert!(cv.any_waiting());

        assert!(cv.signal());
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);

        assert!(cv.signal());
        assert_eq!(second.0.load(Ordering::SeqCst), 1);

        assert!(!cv.signal());
        assert!(!cv.any_waiting());
    }

    /// Re-registering replaces the waker instead of queuing a second waiter.
    #[test]
    fn test_reregister_keeps_one_waiter() {
        let cv = FiberCondvar::new();
        let stale = Arc::new(CountingWake(AtomicUsize::new(0)));
        let fresh = Arc::new(CountingWake(AtomicUsize::new(0)));

        let cell = WaitCell::new();
        cell.register(&Waker::from(stale.clone()));
        cv.enqueue(cell.clone());

        // A second poll of the same pending receive.
        cell.register(&Waker::from(fresh.clone()));

        assert!(cv.signal());
        assert_eq!(stale.0.load(Ordering::SeqCst), 0);
        assert_eq!(fresh.0.load(Ordering::SeqCst), 1);
        assert!(!cv.any_waiting());
    }
}
