//! The collective scheduler.
//!
//! A [`Collective`] owns a graph of nodes and a pool of OS worker threads.
//! Scheduling is two-tier: the workers run in parallel, and each one
//! multiplexes cooperative fibers (the nodes' bodies) by sweeping the shared
//! registry:
//!
//!```text
//!  worker 1 ──┐   ┌───────────────────────────────┐
//!  worker 2 ──┼─→ │ registry (lock-free list)     │
//!  worker N ──┘   │  node: wake flag ── fiber     │
//!                 └───────────────────────────────┘
//!    sweep: swap(wake, false) == true ? poll fiber : next node
//!```
//!
//! The wake flag is the admission gate: `swap(false, AcqRel)` hands the node
//! to exactly one worker per wake, and the node's run lock makes the
//! discipline airtight — a fiber never runs on two workers at once. A fiber
//! that suspends on an empty input parks in that input's condvar; the next
//! delivery (or the halt of its last producer) raises the wake flag again.
//!
//! Workers are released by `construction_completed` and stop when every node
//! has halted. While nothing is runnable they spin over the registry with a
//! [`Backoff`] snooze, which keeps wake-to-poll latency low at a bounded
//! idle cost.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};

use crossbeam_utils::Backoff;

use crate::channel::{Datum, Held, Input, InputEndpoint, Output, OutputEndpoint};
use crate::event::OnceEvent;
use crate::list::LockFreeForwardList;
use crate::node::{Dock, Fiber, Machine, Node, NodeCore, NodeWaker};

/// Owner of a node graph, its worker pool, and the halt bookkeeping.
///
/// Lifecycle: construct, [`create_node`](Self::create_node) and
/// [`connect`](Self::connect) the graph, release the workers with
/// [`construction_completed`](Self::construction_completed), then
/// [`join`](Self::join). Dropping a collective force-releases the workers, so
/// an abandoned (or deadlocked) graph cannot hang the host.
pub struct Collective {
    shared: Arc<CollectiveCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct CollectiveCore {
    registry: LockFreeForwardList<Arc<NodeCore>>,
    /// Released once construction is complete; workers park here first.
    start_blocker: OnceEvent,
    /// Released once every registered node has halted.
    blocker: OnceEvent,
    halted_nodes: AtomicUsize,
    registered: AtomicUsize,
}

impl Collective {
    /// A collective with one worker per available CPU.
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get())
    }

    /// A collective with exactly `count` workers (`count >= 1`).
    pub fn with_workers(count: usize) -> Self {
        assert!(count >= 1, "a collective needs at least one worker");
        let shared = Arc::new(CollectiveCore {
            registry: LockFreeForwardList::new(),
            start_blocker: OnceEvent::new(),
            blocker: OnceEvent::new(),
            halted_nodes: AtomicUsize::new(0),
            registered: AtomicUsize::new(0),
        });
        let workers = (0..count)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("collective-worker-{index}"))
                    .spawn(move || shared.worker_loop())
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Instantiates `machine` as a node: runs its
    /// [`initialize`](Machine::initialize), installs its fiber, and registers
    /// it runnable. Nodes can only be created before
    /// [`construction_completed`](Self::construction_completed).
    pub fn create_node<M: Machine>(&self, name: impl Into<String>, machine: M) -> Node {
        assert!(
            !self.shared.start_blocker.is_set(),
            "create_node after construction_completed"
        );
        let core = NodeCore::new(name.into());
        let mut machine = machine;
        machine.initialize(&mut Dock { node: &core });
        let body = machine.compute();
        let waker = Waker::from(Arc::new(NodeWaker { node: core.clone() }));
        *core.fiber.lock().unwrap_or_else(PoisonError::into_inner) = Some(Fiber {
            machine: Box::new(machine),
            body,
            waker,
        });
        core.set_pending();
        self.shared.registered.fetch_add(1, Ordering::SeqCst);
        self.shared.registry.push_front(core.clone());
        tracing::debug!(node = core.name(), "node registered");
        Node { core }
    }

    /// Wires `output` into `input`, replaying everything already sent.
    /// Connections can only be made before
    /// [`construction_completed`](Self::construction_completed).
    pub fn connect<T: Datum>(&self, input: &Input<T>, output: &Output<T>) {
        assert!(
            !self.shared.start_blocker.is_set(),
            "connect after construction_completed"
        );
        output.connect(input);
    }

    /// Releases the workers to start scheduling. Call exactly once.
    pub fn construction_completed(&self) {
        assert!(
            !self.shared.start_blocker.is_set(),
            "construction_completed called twice"
        );
        tracing::debug!(
            nodes = self.shared.registered.load(Ordering::SeqCst),
            "construction completed"
        );
        self.shared.start_blocker.set();
    }

    /// Blocks until every node has halted, then reaps the workers.
    pub fn join(&self) {
        self.shared.blocker.wait();
        for node in self.shared.registry.iter() {
            node.completion().wait();
        }
        self.reap_workers();
    }

    /// Non-blocking: has every node halted? Monotone.
    pub fn is_done(&self) -> bool {
        self.shared.blocker.is_set()
    }

    /// Looks for a cycle of nodes that can never make progress: every member
    /// is parked on an input that only the other members could feed. Returns
    /// a witness node from the cycle, or `None`.
    ///
    /// With `lock_all` the pass holds every node's endpoint registry and
    /// every input's lock, freezing the blocked set — a non-`None` answer is
    /// then definitive. Without it the answer is advisory either way, since
    /// fibers keep running mid-pass.
    ///
    /// The runtime never breaks a deadlock; what to do with the witness is
    /// the host's call.
    pub fn detect_deadlock(&self, lock_all: bool) -> Option<Node> {
        let nodes: Vec<Arc<NodeCore>> = self
            .shared
            .registry
            .iter()
            .filter(|node| !node.is_halted())
            .collect();
        let inputs_per_node: Vec<Vec<Arc<dyn InputEndpoint>>> =
            nodes.iter().map(|node| node.inputs()).collect();

        // Guards drop in reverse declaration order, after the pass.
        let mut _meta_guards: Vec<Box<dyn Held + '_>> = Vec::new();
        let mut _input_guards: Vec<Box<dyn Held + '_>> = Vec::new();
        if lock_all {
            _meta_guards = nodes.iter().map(|node| node.hold_meta()).collect();
            _input_guards = inputs_per_node
                .iter()
                .flatten()
                .map(|input| input.hold_lock())
                .collect();
        }

        // Edges run from a blocked consumer to each producer it waits on.
        let index_of: HashMap<*const NodeCore, usize> = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (Arc::as_ptr(node), index))
            .collect();
        let count = nodes.len();
        let mut waits_on: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut waited_on_by: Vec<usize> = vec![0; count];
        for (consumer, inputs) in inputs_per_node.iter().enumerate() {
            for input in inputs {
                if !input.is_blocked() {
                    continue;
                }
                for producer in input.source_owners() {
                    if producer.is_halted() {
                        continue;
                    }
                    let Some(&p) = index_of.get(&Arc::as_ptr(&producer)) else {
                        continue;
                    };
                    waits_on[consumer].push(p);
                    waited_on_by[p] += 1;
                }
            }
        }

        // Kahn-like flood: a node nobody waits on can make progress, and so
        // can everything it was waiting on — regardless of remaining edges.
        let mut blocked: Vec<bool> = waited_on_by.iter().map(|&d| d > 0).collect();
        let mut visited: Vec<bool> = waited_on_by.iter().map(|&d| d == 0).collect();
        let mut queue: VecDeque<usize> = (0..count).filter(|&i| waited_on_by[i] == 0).collect();
        while let Some(unblocked) = queue.pop_front() {
            for &next in &waits_on[unblocked] {
                if !visited[next] {
                    visited[next] = true;
                    blocked[next] = false;
                    queue.push_back(next);
                }
            }
        }

        let witness = (0..count).find(|&i| blocked[i]).map(|i| Node {
            core: nodes[i].clone(),
        });
        if let Some(node) = &witness {
            tracing::debug!(node = node.name(), "deadlock witness");
        }
        witness
    }

    fn reap_workers(&self) {
        let handles = mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Default for Collective {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Collective {
    fn drop(&mut self) {
        // Force-release the workers: blocker first so a worker woken from the
        // start gate exits without sweeping a half-built graph.
        self.shared.blocker.set();
        self.shared.start_blocker.set();
        self.reap_workers();
    }
}

impl CollectiveCore {
    fn worker_loop(&self) {
        self.start_blocker.wait();
        tracing::trace!("worker released");
        let mut backoff = Backoff::new();
        while !self.blocker.is_set() {
            let mut drove = false;
            for node in self.registry.iter() {
                if node.take_pending() {
                    drove = true;
                    self.drive(&node);
                }
            }
            // Also covers the empty graph, which no halt path would finish.
            if self.halted_nodes.load(Ordering::SeqCst) >= self.registered.load(Ordering::SeqCst) {
                self.blocker.set();
            }
            if drove {
                backoff = Backoff::new();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Polls the node's fiber once it has won admission. The run lock keeps
    /// the single-runnable discipline: on contention the admission is handed
    /// back and the sweep moves on.
    fn drive(&self, node: &Arc<NodeCore>) {
        let mut slot = match node.fiber.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::WouldBlock) => {
                node.set_pending();
                return;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let finished = match slot.as_mut() {
            None => return,
            Some(fiber) => {
                let mut cx = Context::from_waker(&fiber.waker);
                match panic::catch_unwind(AssertUnwindSafe(|| fiber.body.as_mut().poll(&mut cx))) {
                    Ok(Poll::Pending) => false,
                    Ok(Poll::Ready(())) => true,
                    Err(_) => {
                        // A body that unwinds has returned by other means.
                        tracing::error!(node = node.name(), "fiber body panicked; halting node");
                        true
                    }
                }
            }
        };
        if !finished {
            return;
        }
        let Some(mut fiber) = slot.take() else { return };
        drop(slot);

        node.mark_halted();
        tracing::debug!(node = node.name(), "node halted");
        self.propagate_halt(node);
        fiber.machine.terminate();
        node.completion().set();

        let halted = self.halted_nodes.fetch_add(1, Ordering::SeqCst) + 1;
        if halted >= self.registered.load(Ordering::SeqCst) {
            self.blocker.set();
        }
    }

    /// Re-evaluates every input of every node downstream of a halt: inputs
    /// whose last producer just went away wake their parked fibers to report
    /// end-of-stream.
    fn propagate_halt(&self, node: &Arc<NodeCore>) {
        let mut dependents: Vec<Arc<NodeCore>> = Vec::new();
        for output in node.outputs() {
            for owner in output.connected_owners() {
                if owner.is_halted() {
                    continue;
                }
                if !dependents.iter().any(|d| Arc::ptr_eq(d, &owner)) {
                    dependents.push(owner);
                }
            }
        }
        for dependent in dependents {
            for input in dependent.inputs() {
                input.check_will_halt();
            }
        }
    }
}
