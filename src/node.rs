use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Wake, Waker};

use crossbeam_utils::CachePadded;
use futures::future::BoxFuture;

use crate::channel::{Datum, Held, Input, InputEndpoint, Output, OutputEndpoint};
use crate::event::OnceEvent;

/// A user computation node.
///
/// A machine's life has three phases, driven by the
/// [`Collective`](crate::Collective):
///
/// 1. [`initialize`](Self::initialize) runs synchronously at
///    [`create_node`](crate::Collective::create_node) time and registers the
///    machine's channel endpoints through the [`Dock`].
/// 2. [`compute`](Self::compute) produces the fiber body: a future that reads
///    inputs (suspending on empty) and writes outputs (never suspending).
///    Endpoint handles are cheap clones, so the body captures clones of what
///    it needs and owns them for its whole run.
/// 3. [`terminate`](Self::terminate) runs after the body returns, once the
///    node has halted.
///
/// A body that returns — by finishing its work or because every input
/// reported end-of-stream — halts the node and cascades the halt downstream.
pub trait Machine: Send + 'static {
    /// Register endpoints; runs before scheduling begins for this node. The
    /// `Dock` only exists during this call, which confines registration to
    /// construction time.
    fn initialize(&mut self, dock: &mut Dock<'_>) {
        let _ = dock;
    }

    /// The fiber body.
    fn compute(&mut self) -> BoxFuture<'static, ()>;

    /// Cleanup after halt.
    fn terminate(&mut self) {}
}

/// Endpoint registrar handed to [`Machine::initialize`].
pub struct Dock<'a> {
    pub(crate) node: &'a Arc<NodeCore>,
}

impl Dock<'_> {
    /// Binds `input` to this node: deliveries will set the node's wake flag,
    /// and the scheduler sees the input for halt and deadlock bookkeeping.
    pub fn register_input<T: Datum>(&mut self, input: &Input<T>) {
        input.bind(self.node);
    }

    /// Binds `output` to this node: the node becomes the producer whose halt
    /// drains the connected inputs.
    pub fn register_output<T: Datum>(&mut self, output: &Output<T>) {
        output.bind(self.node);
    }

    /// Creates and registers a fresh input.
    pub fn input<T: Datum>(&mut self) -> Input<T> {
        let input = Input::new();
        self.register_input(&input);
        input
    }

    /// Creates and registers a fresh output.
    pub fn output<T: Datum>(&mut self) -> Output<T> {
        let output = Output::new();
        self.register_output(&output);
        output
    }
}

/// The machine plus its running body; lives behind the node's run lock so the
/// body is polled by one worker at a time.
pub(crate) struct Fiber {
    pub(crate) machine: Box<dyn Machine>,
    pub(crate) body: BoxFuture<'static, ()>,
    pub(crate) waker: Waker,
}

#[derive(Default)]
struct NodeMeta {
    inputs: Vec<Arc<dyn InputEndpoint>>,
    outputs: Vec<Arc<dyn OutputEndpoint>>,
}

/// Runtime record of one node; shared between the registry, the endpoints
/// (weakly) and the public [`Node`] handle.
pub(crate) struct NodeCore {
    name: String,
    /// Admission gate: a worker that wins `swap(false)` may drive the fiber.
    pending: CachePadded<AtomicBool>,
    /// Monotone: set once, never cleared.
    halted: AtomicBool,
    completion: OnceEvent,
    /// Run lock; `None` once the body has returned.
    pub(crate) fiber: Mutex<Option<Fiber>>,
    /// Endpoint registry; a mutex the deadlock detector can hold without
    /// stalling a mid-poll fiber.
    meta: Mutex<NodeMeta>,
}

impl NodeCore {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            pending: CachePadded::new(AtomicBool::new(false)),
            halted: AtomicBool::new(false),
            completion: OnceEvent::new(),
            fiber: Mutex::new(None),
            meta: Mutex::new(NodeMeta::default()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Marks the node runnable. Release pairs with the acquire half of
    /// [`take_pending`](Self::take_pending), so the winning worker observes
    /// whatever was published before the wake.
    pub(crate) fn set_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Test-and-clear admission: at most one sweeping worker wins.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_halted(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn completion(&self) -> &OnceEvent {
        &self.completion
    }

    fn lock_meta(&self) -> MutexGuard<'_, NodeMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_input(&self, endpoint: Arc<dyn InputEndpoint>) {
        self.lock_meta().inputs.push(endpoint);
    }

    pub(crate) fn register_output(&self, endpoint: Arc<dyn OutputEndpoint>) {
        self.lock_meta().outputs.push(endpoint);
    }

    pub(crate) fn inputs(&self) -> Vec<Arc<dyn InputEndpoint>> {
        self.lock_meta().inputs.clone()
    }

    pub(crate) fn outputs(&self) -> Vec<Arc<dyn OutputEndpoint>> {
        self.lock_meta().outputs.clone()
    }

    pub(crate) fn hold_meta(&self) -> Box<dyn Held + '_> {
        Box::new(self.lock_meta())
    }
}

/// Waking a node's fiber raises its wake flag; the sweeping workers pick the
/// node up on their next pass.
pub(crate) struct NodeWaker {
    pub(crate) node: Arc<NodeCore>,
}

impl Wake for NodeWaker {
    fn wake(self: Arc<Self>) {
        self.node.set_pending();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.node.set_pending();
    }
}

/// Shared handle to a registered node.
///
/// Returned by [`create_node`](crate::Collective::create_node) and as the
/// deadlock witness; identity is node identity.
#[derive(Clone)]
pub struct Node {
    pub(crate) core: Arc<NodeCore>,
}

impl Node {
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Whether the node's body has returned. Monotone.
    pub fn is_halted(&self) -> bool {
        self.core.is_halted()
    }

    /// Blocks until the node has halted and finished its cleanup.
    pub fn join(&self) {
        self.core.completion().wait();
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.core.name())
            .field("halted", &self.is_halted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Dock registration wires endpoints into the node's registry and binds
    /// their owner.
    #[test]
    fn test_dock_registration() {
        let core = NodeCore::new("probe".into());
        let mut dock = Dock { node: &core };

        let input: Input<u32> = dock.input();
        let output: Output<u32> = dock.output();

        assert_eq!(core.inputs().len(), 1);
        assert_eq!(core.outputs().len(), 1);

        // The bound owner is this node: a delivery raises its wake flag.
        output.connect(&input);
        output.send(7);
        assert!(core.take_pending());
        assert_eq!(input.try_recv(), Some(7));
    }

    /// Rebinding an endpoint to a second node is a construction error.
    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_bind_panics() {
        let first = NodeCore::new("first".into());
        let second = NodeCore::new("second".into());
        let input: Input<u32> = Input::new();
        input.bind(&first);
        input.bind(&second);
    }

    /// The node waker raises the wake flag.
    #[test]
    fn test_node_waker() {
        let core = NodeCore::new("probe".into());
        assert!(!core.take_pending());
        let waker = Waker::from(Arc::new(NodeWaker { node: core.clone() }));
        waker.wake_by_ref();
        assert!(core.take_pending());
        assert!(!core.take_pending());
    }
}
