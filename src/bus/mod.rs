//! Cross-process event bus.
//!
//! Every process owns one [`Dispatcher`]. A dispatch runs the process's own
//! listeners first, then broadcasts the payload to every attached peer and
//! waits until each one has acknowledged or gone away.
//!
//! # Architecture
//!
//! - `LocalRegistry`: insertion-ordered listener callbacks of this process
//! - `PeerRegistry`: insertion-ordered links to the other processes
//! - `AckTracker`: one correlation slot per event kind, completing a
//!   broadcast when its outstanding counter reaches zero
//! - `Dispatcher`: the public surface, holding the single-flight guard that
//!   drops re-entrant dispatch and clear calls

mod dispatcher;
mod error;
mod listeners;
mod peers;
mod tracker;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{DeliveryReport, DispatchError, FaultReport, RemoteFault};
pub use listeners::{Callback, InvocationReport, ListenerFault, LocalRegistry, SubscriptionId};
pub use peers::{PeerId, PeerRegistry};
pub use tracker::{AckTracker, Completion, PeerReply, ReplyOutcome};
