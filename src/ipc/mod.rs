//! Transport between dispatchers.
//!
//! `wire` defines the messages, `link` the outbound half every transport
//! implements, `pump` the single inbound queue of a process, and `stream`
//! the newline-delimited JSON transport used for worker processes.

pub mod link;
pub mod pump;
pub mod stream;
pub mod wire;

pub use link::{PeerLink, TransportError};
pub use pump::{inbound_channel, Inbound, InboundReceiver, InboundSender, MessagePump};
pub use stream::{
    attach_stream, connect_parent, spawn_reader, spawn_worker, StreamLink, WorkerProcess,
};
pub use wire::{Channel, Envelope, EventKind, Phase, WireMessage};
