use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};

use crate::channel::endpoint::{Held, InputEndpoint};
use crate::channel::Datum;
use crate::condvar::{FiberCondvar, WaitCell};
use crate::node::NodeCore;

/// Receiving endpoint of a channel: an unbounded FIFO owned by one node.
///
/// Handles are cheap clones of a shared core, so a machine keeps one copy in
/// its fields (for wiring) and moves another into its fiber body.
pub struct Input<T: Datum> {
    pub(crate) core: Arc<InputCore<T>>,
}

impl<T: Datum> Clone for Input<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Datum> Input<T> {
    /// A fresh, unbound input. It becomes owned by a node when a machine
    /// registers it in [`Machine::initialize`](crate::Machine::initialize).
    pub fn new() -> Self {
        Self {
            core: Arc::new(InputCore {
                owner: OnceLock::new(),
                state: Mutex::new(InputState {
                    queue: VecDeque::new(),
                    sources: Vec::new(),
                    caused_halt: false,
                }),
                waiters: FiberCondvar::new(),
            }),
        }
    }

    /// Receives the next value in delivery order.
    ///
    /// Resolves `Some(value)` as soon as the queue is non-empty, suspending
    /// the calling fiber (not the worker thread) while it is empty. Resolves
    /// `None` exactly when the input is terminally drained: the queue is
    /// empty and every connected output's owner has halted. An input with no
    /// connections counts as drained.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            input: self,
            cell: None,
        }
    }

    /// Non-blocking probe: the front of the queue, if any.
    pub fn try_recv(&self) -> Option<T> {
        self.core.lock_state().queue.pop_front()
    }

    /// Binds this input to its owning node and registers it with the
    /// scheduler.
    pub(crate) fn bind(&self, node: &Arc<NodeCore>) {
        assert!(
            self.core.owner.set(Arc::downgrade(node)).is_ok(),
            "channel endpoint is already registered to a node"
        );
        node.register_input(self.core.clone());
    }
}

impl<T: Datum> Default for Input<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct InputState<T> {
    queue: VecDeque<T>,
    /// Owners of every connected output; the drained check asks them all.
    sources: Vec<Weak<NodeCore>>,
    /// Set once this input's drain condition has fired; latches the
    /// end-of-stream answer for later receives.
    caused_halt: bool,
}

pub(crate) struct InputCore<T> {
    owner: OnceLock<Weak<NodeCore>>,
    state: Mutex<InputState<T>>,
    waiters: FiberCondvar,
}

impl<T: Datum> InputCore<T> {
    fn lock_state(&self) -> MutexGuard<'_, InputState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn owner(&self) -> Option<Arc<NodeCore>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Records a newly connected output's owner. Runs before the connection
    /// replays anything, so the drained check never misses a live source.
    pub(crate) fn add_source(&self, owner: Weak<NodeCore>) {
        self.lock_state().sources.push(owner);
    }

    /// Queues a value and rouses the owner: wake flag first, then the parked
    /// fiber. Called with the sending output's lock held; takes this input's
    /// lock, so the condvar signal happens-after the push.
    pub(crate) fn deliver(&self, value: T) {
        let mut state = self.lock_state();
        state.queue.push_back(value);
        if let Some(owner) = self.owner() {
            owner.set_pending();
        }
        self.waiters.signal();
    }

    /// Terminally drained: nothing queued and no producer left that could
    /// still send. Vacuously true with no connections at all.
    fn drained(state: &InputState<T>) -> bool {
        state.queue.is_empty()
            && state
                .sources
                .iter()
                .all(|s| s.upgrade().is_none_or(|n| n.is_halted()))
    }
}

impl<T: Datum> InputEndpoint for InputCore<T> {
    fn source_owners(&self) -> Vec<Arc<NodeCore>> {
        self.lock_state()
            .sources
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn is_blocked(&self) -> bool {
        self.waiters.any_waiting()
    }

    fn check_will_halt(&self) {
        let mut state = self.lock_state();
        if Self::drained(&state) {
            state.caused_halt = true;
            // End-of-stream: wake the parked fiber (if any) so its receive
            // reports it, and nudge the owner to re-poll either way.
            self.waiters.signal();
            if let Some(owner) = self.owner() {
                owner.set_pending();
            }
        }
    }

    fn hold_lock(&self) -> Box<dyn Held + '_> {
        Box::new(self.lock_state())
    }
}

/// Future of one receive; see [`Input::recv`].
#[must_use = "futures do nothing unless polled"]
pub struct RecvFuture<'a, T: Datum> {
    input: &'a Input<T>,
    /// The queued wait cell, once this receive has parked. Pushed at most
    /// once; re-polls only refresh its waker.
    cell: Option<Arc<WaitCell>>,
}

/// Safe: the struct is not self-referential:
/// future fields are not pointing to other fields within the same struct
impl<T: Datum> Unpin for RecvFuture<'_, T> {}

impl<T: Datum> Future for RecvFuture<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let core = &this.input.core;
        let mut state = core.lock_state();

        if let Some(value) = state.queue.pop_front() {
            drop(state);
            // The signal that delivered this value consumed our cell.
            this.cell = None;
            return Poll::Ready(Some(value));
        }

        if state.caused_halt || InputCore::drained(&state) {
            state.caused_halt = true;
            drop(state);
            this.cell = None;
            return Poll::Ready(None);
        }

        match &this.cell {
            // Re-poll of a pending receive (the node was woken for another
            // input): refresh the waker instead of parking twice.
            Some(cell) => cell.register(cx.waker()),
            None => {
                let cell = WaitCell::new();
                cell.register(cx.waker());
                // Still under the input lock, so a delivery that follows can
                // not miss this waiter.
                core.waiters.enqueue(cell.clone());
                this.cell = Some(cell);
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Wake, Waker};

    use futures::executor::block_on;

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

    /// Deliveries come out in FIFO order.
    #[test]
    fn test_fifo() {
        let input: Input<i32> = Input::new();
        input.core.deliver(1);
        input.core.deliver(2);
        input.core.deliver(3);
        assert_eq!(input.try_recv(), Some(1));
        assert_eq!(input.try_recv(), Some(2));
        assert_eq!(input.try_recv(), Some(3));
        assert_eq!(input.try_recv(), None);
    }

    /// An unconnected, empty input is vacuously drained: recv reports
    /// end-of-stream instead of parking forever.
    #[test]
    fn test_vacuously_drained() {
        let input: Input<i32> = Input::new();
        assert_eq!(block_on(input.recv()), None);
    }

    /// Once the drain condition has fired, it latches.
    #[test]
    fn test_drain_latches() {
        let input: Input<i32> = Input::new();
        input.core.check_will_halt();
        assert_eq!(block_on(input.recv()), None);
        assert_eq!(block_on(input.recv()), None);
    }

    /// A parked receive is woken by a delivery and resolves to the value.
    #[test]
    fn test_delivery_wakes_parked_receive() {
        let input: Input<i32> = Input::new();
        let producer = NodeCore::new("producer".into());
        input.core.add_source(Arc::downgrade(&producer));

        let wake = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(wake.clone());
        let mut cx = Context::from_waker(&waker);

        let mut future = input.recv();
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        assert!(input.core.is_blocked());

        input.core.deliver(42);
        assert_eq!(wake.0.load(Ordering::SeqCst), 1);
        assert!(!input.core.is_blocked());

        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(Some(42)) => {}
            other => panic!("expected Ready(Some(42)), got {other:?}"),
        }
    }

    /// Re-polling a pending receive does not queue a second waiter.
    #[test]
    fn test_repoll_keeps_single_waiter() {
        let input: Input<i32> = Input::new();
        let producer = NodeCore::new("producer".into());
        input.core.add_source(Arc::downgrade(&producer));

        let wake = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(wake.clone());
        let mut cx = Context::from_waker(&waker);

        let mut future = input.recv();
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        assert!(input.core.is_blocked());

        input.core.deliver(1);
        assert!(!input.core.is_blocked());
    }

    /// check_will_halt with a live producer does nothing; after the producer
    /// halts it drains the input and wakes the waiter.
    #[test]
    fn test_check_will_halt_tracks_producer() {
        let input: Input<i32> = Input::new();
        let producer = NodeCore::new("producer".into());
        input.core.add_source(Arc::downgrade(&producer));

        let wake = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(wake.clone());
        let mut cx = Context::from_waker(&waker);

        let mut future = input.recv();
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());

        input.core.check_will_halt();
        assert_eq!(wake.0.load(Ordering::SeqCst), 0);
        assert!(input.core.is_blocked());

        producer.mark_halted();
        input.core.check_will_halt();
        assert_eq!(wake.0.load(Ordering::SeqCst), 1);
        assert!(matches!(
            Pin::new(&mut future).poll(&mut cx),
            Poll::Ready(None)
        ));
    }

    /// recv is an ordinary future: it can be awaited from any executor, not
    /// just a collective worker.
    #[tokio::test]
    async fn test_recv_from_foreign_executor() {
        let output: crate::channel::Output<i32> = crate::channel::Output::new();
        let input: Input<i32> = Input::new();
        output.connect(&input);
        output.send(1);
        output.send(2);

        let consumer = tokio::spawn({
            let input = input.clone();
            async move {
                let mut received = Vec::new();
                while let Some(value) = input.recv().await {
                    received.push(value);
                }
                received
            }
        });

        // The producer side is unbound, so after the queue drains the input
        // reports end-of-stream and the task finishes.
        assert_eq!(consumer.await.unwrap(), vec![1, 2]);
    }

    /// Queued values drain out before end-of-stream is reported.
    #[test]
    fn test_values_before_end_of_stream() {
        let input: Input<i32> = Input::new();
        input.core.deliver(7);
        input.core.check_will_halt();
        assert_eq!(block_on(input.recv()), Some(7));
        assert_eq!(block_on(input.recv()), None);
    }
}
