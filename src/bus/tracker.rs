//! Acknowledgment tracking for outbound broadcasts.
//!
//! Each event kind owns one correlation slot. A broadcast fills the slot with
//! a table of per-peer entries and an outstanding counter; every resolved
//! entry decrements the counter and the broadcast completes when it reaches
//! zero. Entries resolve on acknowledgment, on send failure, or when their
//! peer detaches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::DispatchError;
use super::peers::{PeerId, PeerRegistry};
use crate::ipc::{Channel, Envelope, EventKind, PeerLink, WireMessage};

/// How one peer's entry was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// The peer acknowledged, optionally with a result value.
    Acked(Option<Value>),
    /// The peer acknowledged but its listeners faulted.
    Faulted(Vec<String>),
    /// The peer went away before acknowledging.
    Vacated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerReply {
    pub peer: PeerId,
    pub outcome: ReplyOutcome,
}

struct Entry {
    peer: PeerId,
    outcome: Option<ReplyOutcome>,
}

struct PendingBroadcast {
    round: u64,
    entries: Vec<Entry>,
    outstanding: usize,
    done: Option<oneshot::Sender<Vec<PeerReply>>>,
}

impl PendingBroadcast {
    fn finish(&mut self) {
        let replies = self
            .entries
            .iter_mut()
            .map(|entry| PeerReply {
                peer: entry.peer.clone(),
                outcome: entry.outcome.take().unwrap_or(ReplyOutcome::Vacated),
            })
            .collect();
        if let Some(done) = self.done.take() {
            // The waiter may have given up; nothing to do then.
            let _ = done.send(replies);
        }
    }
}

/// Future side of a broadcast.
pub struct Completion {
    kind: EventKind,
    rx: oneshot::Receiver<Vec<PeerReply>>,
}

impl Completion {
    fn ready(kind: EventKind) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Vec::new());
        Self { kind, rx }
    }

    /// Wait for every addressed peer to resolve.
    pub async fn wait(self) -> Result<Vec<PeerReply>, DispatchError> {
        self.rx
            .await
            .map_err(|_| DispatchError::Superseded { kind: self.kind })
    }
}

pub struct AckTracker {
    slots: Mutex<[Option<PendingBroadcast>; 3]>,
    next_round: AtomicU64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([None, None, None]),
            next_round: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [Option<PendingBroadcast>; 3]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address `targets` with a `kind` request and return the join of their
    /// acknowledgments.
    ///
    /// `targets` is a snapshot of `attached`. The correlation table is in place
    /// before the first message is sent, so an acknowledgment can never arrive
    /// ahead of its entry. A target that has left `attached` by then is
    /// vacated here, since its detach found no table to vacate.
    pub fn broadcast(
        &self,
        kind: EventKind,
        payload: Option<&Value>,
        targets: Vec<(PeerId, Arc<dyn PeerLink>)>,
        attached: &PeerRegistry,
    ) -> Completion {
        if targets.is_empty() {
            return Completion::ready(kind);
        }

        let round = self.next_round.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.lock();
            let slot = &mut slots[kind.slot()];
            if let Some(previous) = slot.as_ref() {
                tracing::warn!(
                    "{kind} round {} superseded by round {round} with {} acknowledgments outstanding",
                    previous.round,
                    previous.outstanding
                );
            }
            *slot = Some(PendingBroadcast {
                round,
                entries: targets
                    .iter()
                    .map(|(peer, _)| Entry {
                        peer: peer.clone(),
                        outcome: None,
                    })
                    .collect(),
                outstanding: targets.len(),
                done: Some(tx),
            });
        }

        tracing::debug!("{kind} round {round} sent to {} peer(s)", targets.len());
        for (idx, (peer, link)) in targets.iter().enumerate() {
            if !attached.contains(peer) {
                tracing::debug!("{peer} detached before {kind} round {round} was sent");
                self.settle(kind, round, idx, None, ReplyOutcome::Vacated);
                continue;
            }
            let mut envelope = Envelope::new(idx, round);
            if let Some(payload) = payload {
                envelope = envelope.with_data(payload.clone());
            }
            if let Err(e) = link.send(WireMessage::new(Channel::request(kind), envelope)) {
                tracing::warn!(
                    "{kind} to {peer} ({}) failed, treating as vacated: {e}",
                    link.label()
                );
                self.settle(kind, round, idx, None, ReplyOutcome::Vacated);
            }
        }

        Completion { kind, rx }
    }

    /// Resolve the entry at `idx` with an acknowledgment received from `from`.
    ///
    /// Returns `false` when the acknowledgment does not match a live,
    /// unresolved entry addressed to `from`, in which case it is ignored.
    pub fn resolve(
        &self,
        kind: EventKind,
        round: u64,
        idx: usize,
        from: &PeerId,
        outcome: ReplyOutcome,
    ) -> bool {
        self.settle(kind, round, idx, Some(from), outcome)
    }

    fn settle(
        &self,
        kind: EventKind,
        round: u64,
        idx: usize,
        from: Option<&PeerId>,
        outcome: ReplyOutcome,
    ) -> bool {
        let mut slots = self.lock();
        let slot = &mut slots[kind.slot()];
        let Some(pending) = slot.as_mut() else {
            tracing::debug!("ignoring {kind} ack idx={idx} round={round}: nothing in flight");
            return false;
        };
        if pending.round != round {
            tracing::debug!(
                "ignoring stale {kind} ack idx={idx} round={round} (current round {})",
                pending.round
            );
            return false;
        }
        let Some(entry) = pending.entries.get_mut(idx) else {
            tracing::debug!("ignoring {kind} ack with unknown idx={idx} round={round}");
            return false;
        };
        if let Some(from) = from {
            if &entry.peer != from {
                tracing::warn!(
                    "ignoring {kind} ack idx={idx} round={round} from {from}: slot belongs to {}",
                    entry.peer
                );
                return false;
            }
        }
        if entry.outcome.is_some() {
            tracing::debug!("ignoring duplicate {kind} ack idx={idx} round={round}");
            return false;
        }

        entry.outcome = Some(outcome);
        pending.outstanding -= 1;
        if pending.outstanding == 0 {
            pending.finish();
            *slot = None;
        }
        true
    }

    /// Resolve every unresolved entry addressed to `peer`, across all kinds.
    /// Returns how many entries were vacated.
    pub fn vacate_peer(&self, peer: &PeerId) -> usize {
        let mut slots = self.lock();
        let mut vacated = 0;
        for slot in slots.iter_mut() {
            let Some(pending) = slot.as_mut() else {
                continue;
            };
            for entry in pending.entries.iter_mut() {
                if &entry.peer == peer && entry.outcome.is_none() {
                    entry.outcome = Some(ReplyOutcome::Vacated);
                    pending.outstanding -= 1;
                    vacated += 1;
                }
            }
            if pending.outstanding == 0 {
                pending.finish();
                *slot = None;
            }
        }
        vacated
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}
