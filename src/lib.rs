//! Dataflow concurrency runtime
//!
//! Compose a static graph of computation nodes connected by typed, unbounded
//! channels, and let a pool of worker threads drive the nodes as cooperative
//! fibers until the whole graph has halted.
//!
//!```text
//!   ┌───────────┐  Output<T>      Input<T>  ┌───────────┐
//!   │ producer  │ ──────────────────────────→ consumer  │
//!   │  (fiber)  │    replay log + FIFO       │  (fiber)  │
//!   └───────────┘                            └───────────┘
//!         ▲                                        ▲
//!         └──────── worker threads sweep ──────────┘
//!                   the lock-free registry
//!```
//!
//! ## How it works
//!
//! - A [`Collective`] owns the graph: create nodes from user [`Machine`]s,
//!   wire outputs into inputs with [`Collective::connect`], then release the
//!   workers with [`Collective::construction_completed`] and wait with
//!   [`Collective::join`].
//! - A node's body is a future. Receiving from an empty [`Input`] suspends
//!   the *fiber*, never the worker thread; sending on an [`Output`] never
//!   suspends and immediately fans the value out to every connected input.
//! - A body that returns halts its node. Halts cascade: an input whose
//!   producers have all halted reports end-of-stream, which lets the
//!   downstream body finish its loop and halt in turn. When every node has
//!   halted, `join` returns.
//! - [`Collective::detect_deadlock`] finds cycles of nodes that starve each
//!   other; the runtime reports a witness and leaves the policy to you.
//!
//! The node registry is a [`LockFreeForwardList`], a reference-counted
//! sentinel-tagged linked list that is useful on its own; see the
//! [`list`] module docs for its protocol.
//!
//! ## Example
//!
//!```
//! use futures::future::BoxFuture;
//! use insieme::{Collective, Dock, Input, Machine, Output};
//!
//! struct Doubler {
//!     input: Input<i32>,
//!     out: Output<i32>,
//! }
//!
//! impl Machine for Doubler {
//!     fn initialize(&mut self, dock: &mut Dock<'_>) {
//!         dock.register_input(&self.input);
//!         dock.register_output(&self.out);
//!     }
//!
//!     fn compute(&mut self) -> BoxFuture<'static, ()> {
//!         let input = self.input.clone();
//!         let out = self.out.clone();
//!         Box::pin(async move {
//!             while let Some(value) = input.recv().await {
//!                 out.send(value * 2);
//!             }
//!         })
//!     }
//! }
//!
//! struct Source {
//!     out: Output<i32>,
//! }
//!
//! impl Machine for Source {
//!     fn initialize(&mut self, dock: &mut Dock<'_>) {
//!         dock.register_output(&self.out);
//!     }
//!
//!     fn compute(&mut self) -> BoxFuture<'static, ()> {
//!         let out = self.out.clone();
//!         Box::pin(async move {
//!             for value in 1..=3 {
//!                 out.send(value);
//!             }
//!         })
//!     }
//! }
//!
//! let collective = Collective::with_workers(2);
//!
//! let source = Source { out: Output::new() };
//! let doubler = Doubler { input: Input::new(), out: Output::new() };
//! let source_out = source.out.clone();
//! let doubler_input = doubler.input.clone();
//!
//! collective.create_node("source", source);
//! collective.create_node("doubler", doubler);
//! collective.connect(&doubler_input, &source_out);
//!
//! collective.construction_completed();
//! collective.join();
//! assert!(collective.is_done());
//!```

pub mod channel;
pub mod collective;
mod condvar;
pub mod event;
pub mod list;
pub mod node;
pub mod scan;

pub use channel::{Datum, Input, Output, RecvFuture};
pub use collective::Collective;
pub use event::OnceEvent;
pub use list::{Cursor, LockFreeForwardList};
pub use node::{Dock, Machine, Node};
