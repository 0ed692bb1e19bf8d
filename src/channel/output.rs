use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::channel::Datum;
use crate::channel::endpoint::OutputEndpoint;
use crate::channel::input::{Input, InputCore};
use crate::node::NodeCore;

/// Sending endpoint of a channel, owned by one node.
///
/// Keeps the full history of sent values (the replay log) so connections made
/// after the fact still observe everything; see the [module docs](super).
pub struct Output<T: Datum> {
    pub(crate) core: Arc<OutputCore<T>>,
}

impl<T: Datum> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Datum> Output<T> {
    /// A fresh, unbound output. It becomes owned by a node when a machine
    /// registers it in [`Machine::initialize`](crate::Machine::initialize).
    pub fn new() -> Self {
        Self {
            core: Arc::new(OutputCore {
                owner: OnceLock::new(),
                state: Mutex::new(OutputState {
                    log: Vec::new(),
                    connections: Vec::new(),
                }),
            }),
        }
    }

    /// Appends `value` to the replay log and copies every undelivered log
    /// entry into each connected input, waking their owners. Never suspends.
    pub fn send(&self, value: T) {
        let mut state = self.core.lock_state();
        state.log.push(value);
        OutputCore::transmit(&mut state);
    }

    /// Wires `input` into this output and replays the whole log into it, so
    /// a late connection misses nothing.
    pub(crate) fn connect(&self, input: &Input<T>) {
        // The input learns its new source before any replay lands; the
        // drained check must never run ahead of the bookkeeping.
        input
            .core
            .add_source(self.core.owner.get().cloned().unwrap_or_default());
        let mut state = self.core.lock_state();
        state.connections.push(Connection {
            input: input.core.clone(),
            next_index: 0,
        });
        OutputCore::transmit(&mut state);
        tracing::trace!(replayed = state.log.len(), "input connected");
    }

    /// Binds this output to its owning node and registers it with the
    /// scheduler.
    pub(crate) fn bind(&self, node: &Arc<NodeCore>) {
        assert!(
            self.core.owner.set(Arc::downgrade(node)).is_ok(),
            "channel endpoint is already registered to a node"
        );
        node.register_output(self.core.clone());
    }
}

impl<T: Datum> Default for Output<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One wired input plus the index of the next log entry to copy into it.
/// The index never decreases and never passes the log length.
struct Connection<T> {
    input: Arc<InputCore<T>>,
    next_index: usize,
}

struct OutputState<T> {
    log: Vec<T>,
    connections: Vec<Connection<T>>,
}

pub(crate) struct OutputCore<T> {
    owner: OnceLock<Weak<NodeCore>>,
    state: Mutex<OutputState<T>>,
}

impl<T: Datum> OutputCore<T> {
    fn lock_state(&self) -> MutexGuard<'_, OutputState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Brings every connection up to date with the log. Runs under the
    /// output lock; input locks are taken one delivery at a time, so the
    /// only nested-lock direction in the runtime is output → input.
    fn transmit(state: &mut OutputState<T>) {
        let OutputState { log, connections } = state;
        for connection in connections.iter_mut() {
            while connection.next_index < log.len() {
                connection.input.deliver(log[connection.next_index].clone());
                connection.next_index += 1;
            }
        }
    }
}

impl<T: Datum> OutputEndpoint for OutputCore<T> {
    fn connected_owners(&self) -> Vec<Arc<NodeCore>> {
        self.lock_state()
            .connections
            .iter()
            .filter_map(|connection| connection.input.owner())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    /// Values sent before the connection are replayed into it: send 10, 20,
    /// connect, and the input still receives 10 then 20.
    #[test]
    fn test_replay_on_connect() {
        let output: Output<i32> = Output::new();
        output.send(10);
        output.send(20);

        let input: Input<i32> = Input::new();
        output.connect(&input);

        assert_eq!(block_on(input.recv()), Some(10));
        assert_eq!(block_on(input.recv()), Some(20));
        // The producer side is unbound, so the input is now drained.
        assert_eq!(block_on(input.recv()), None);
    }

    /// Fan-out: every connected input sees the full sequence.
    #[test]
    fn test_fan_out() {
        let output: Output<i32> = Output::new();
        let first: Input<i32> = Input::new();
        let second: Input<i32> = Input::new();
        output.connect(&first);
        output.send(1);
        output.connect(&second);
        output.send(2);

        for input in [&first, &second] {
            assert_eq!(input.try_recv(), Some(1));
            assert_eq!(input.try_recv(), Some(2));
            assert_eq!(input.try_recv(), None);
        }
    }

    /// Fan-in: deliveries interleave in send order across outputs.
    #[test]
    fn test_fan_in_serialization_order() {
        let left: Output<i32> = Output::new();
        let right: Output<i32> = Output::new();
        let input: Input<i32> = Input::new();
        left.connect(&input);
        right.connect(&input);

        left.send(1);
        right.send(10);
        left.send(2);

        assert_eq!(input.try_recv(), Some(1));
        assert_eq!(input.try_recv(), Some(10));
        assert_eq!(input.try_recv(), Some(2));
    }

    /// A delivery raises the owning node's wake flag.
    #[test]
    fn test_delivery_sets_pending() {
        let owner = NodeCore::new("consumer".into());
        let input: Input<i32> = Input::new();
        input.bind(&owner);
        assert!(!owner.take_pending());

        let output: Output<i32> = Output::new();
        output.connect(&input);
        output.send(5);
        assert!(owner.take_pending());
    }

    /// connected_owners reports the owners of wired inputs.
    #[test]
    fn test_connected_owners() {
        let owner = NodeCore::new("consumer".into());
        let bound: Input<i32> = Input::new();
        bound.bind(&owner);
        let unbound: Input<i32> = Input::new();

        let output: Output<i32> = Output::new();
        output.connect(&bound);
        output.connect(&unbound);

        let owners = output.core.connected_owners();
        assert_eq!(owners.len(), 1);
        assert!(Arc::ptr_eq(&owners[0], &owner));
    }
}
