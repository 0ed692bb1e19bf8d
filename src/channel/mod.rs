//! Typed channels between nodes.
//!
//! An [`Output`] fans out to any number of [`Input`]s:
//!
//!```text
//!              ┌────────────┐
//!   send(v) ─→ │ replay log │──┬─→ Input A (queue, fiber condvar)
//!              │ v0 v1 v2 … │  └─→ Input B (queue, fiber condvar)
//!              └────────────┘
//!                 per-connection cursor: next value to copy
//!```
//!
//! Every value ever sent stays in the output's replay log, and each
//! connection keeps a cursor into it. Connecting an input late replays the
//! whole log into it first, so graph construction can wire endpoints in any
//! order without losing data. That replay is also why payloads are `Clone`:
//! one send may land in several queues.
//!
//! Receiving from an empty input parks the owning node's *fiber* (the worker
//! thread moves on); the next delivery, or the halt of every connected
//! producer, wakes it. A receive resolves `None` exactly when the input is
//! terminally drained: queue empty and no connected producer left running.
//!
//! ## Ordering
//!
//! - One output to one input: deliveries happen in send order.
//! - Several outputs into one input: deliveries happen in the order the
//!   `send` calls serialized on the output locks.
//! - Across different inputs there is no ordering.

mod endpoint;
mod input;
mod output;

pub(crate) use endpoint::{Held, InputEndpoint, OutputEndpoint};
pub use input::{Input, RecvFuture};
pub use output::Output;

/// Payload bound for channel transport.
///
/// `Clone` because an output replays its log into every connection; `Send +
/// 'static` because values cross worker threads and outlive the sending
/// fiber's stack.
pub trait Datum: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Datum for T {}
