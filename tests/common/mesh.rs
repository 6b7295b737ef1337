//! In-process mesh of dispatchers wired together with in-memory pipes.
//!
//! Each link uses two one-way duplex pipes so that either side can go away
//! independently, the way a worker process exiting closes both its pipes.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

use dispatchertron_lib::bus::{Dispatcher, PeerId};
use dispatchertron_lib::config::DispatcherConfig;
use dispatchertron_lib::ipc::{attach_stream, inbound_channel, InboundSender, MessagePump};

const PIPE_CAPACITY: usize = 64 * 1024;

/// One simulated process: a dispatcher and its message pump.
pub struct Node {
    pub name: String,
    pub dispatcher: Dispatcher,
    inbound: InboundSender,
    _pump: JoinHandle<()>,
}

impl Node {
    pub fn start(name: &str) -> Self {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (inbound, rx) = inbound_channel();
        let pump = MessagePump::start(dispatcher.clone(), rx);
        Self {
            name: name.to_string(),
            dispatcher,
            inbound,
            _pump: pump,
        }
    }

    /// Register `n` listeners that do nothing.
    pub fn with_listeners(self, n: usize) -> Self {
        for _ in 0..n {
            self.dispatcher.register(|_: &Value| {});
        }
        self
    }
}

/// Link `a` and `b`. Returns `b`'s id as seen by `a`, and `a`'s id as seen by `b`.
pub fn connect(a: &Node, b: &Node) -> (PeerId, PeerId) {
    let (a_out, b_in) = tokio::io::duplex(PIPE_CAPACITY);
    let (b_out, a_in) = tokio::io::duplex(PIPE_CAPACITY);
    let b_at_a = attach_stream(&a.dispatcher, b.name.clone(), a_in, a_out, &a.inbound);
    let a_at_b = attach_stream(&b.dispatcher, a.name.clone(), b_in, b_out, &b.inbound);
    (b_at_a, a_at_b)
}

/// A peer that reads requests but never answers. Dropping it closes its pipes.
pub struct SilentPeer {
    pub id: PeerId,
    pub requests: Lines<BufReader<DuplexStream>>,
    _to_node: DuplexStream,
}

impl SilentPeer {
    pub fn attach(node: &Node) -> Self {
        let (node_out, silent_in) = tokio::io::duplex(PIPE_CAPACITY);
        let (silent_out, node_in) = tokio::io::duplex(PIPE_CAPACITY);
        let id = attach_stream(&node.dispatcher, "silent", node_in, node_out, &node.inbound);
        Self {
            id,
            requests: BufReader::new(silent_in).lines(),
            _to_node: silent_out,
        }
    }
}

/// Register a listener that records every payload it sees.
pub fn recorder(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    dispatcher.register(move |payload: &Value| sink.lock().unwrap().push(payload.clone()));
    seen
}
