use std::fmt;

use super::listeners::ListenerFault;
use super::peers::PeerId;
use crate::ipc::EventKind;

/// Listener faults reported by a peer in a failure acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    pub peer: PeerId,
    pub messages: Vec<String>,
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}: {}", self.peer, self.messages.join("; "))
    }
}

/// What a dispatch or clear round trip reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Local listeners invoked (for `clear`, listeners removed).
    pub local_listeners: usize,
    /// Peers that acknowledged.
    pub peers_acknowledged: usize,
    /// Peers that detached or could not be reached before acknowledging.
    pub peers_vacated: usize,
}

/// Every listener fault seen during one dispatch, local and remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultReport {
    pub local: Vec<ListenerFault>,
    pub remote: Vec<RemoteFault>,
    pub delivery: DeliveryReport,
}

impl FaultReport {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    pub fn total(&self) -> usize {
        self.local.len() + self.remote.iter().map(|r| r.messages.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// Listeners panicked. The event was still delivered everywhere it could be.
    #[error("{} listener(s) faulted during dispatch", .0.total())]
    ListenerFaults(FaultReport),
    /// The broadcast's correlation table was replaced before it settled.
    #[error("{kind} broadcast was superseded before every peer acknowledged")]
    Superseded { kind: EventKind },
}

impl DispatchError {
    pub fn faults(&self) -> Option<&FaultReport> {
        match self {
            DispatchError::ListenerFaults(report) => Some(report),
            _ => None,
        }
    }
}
