use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::{json, Value};
use uuid::Uuid;

use super::error::{DeliveryReport, DispatchError, FaultReport, RemoteFault};
use super::listeners::{LocalRegistry, SubscriptionId};
use super::peers::{PeerId, PeerRegistry};
use super::tracker::{AckTracker, PeerReply, ReplyOutcome};
use crate::config::DispatcherConfig;
use crate::ipc::{EventKind, Phase, PeerLink, WireMessage};

/// Result of a `dispatch` or `clear` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The round trip ran to completion.
    Completed(DeliveryReport),
    /// Another dispatch or clear was in flight; nothing was delivered.
    Dropped,
}

impl DispatchOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, DispatchOutcome::Dropped)
    }

    pub fn report(&self) -> Option<&DeliveryReport> {
        match self {
            DispatchOutcome::Completed(report) => Some(report),
            DispatchOutcome::Dropped => None,
        }
    }
}

struct Inner {
    instance: Uuid,
    listeners: LocalRegistry,
    peers: PeerRegistry,
    tracker: AckTracker,
    dispatching: AtomicBool,
    count_gate: tokio::sync::Mutex<()>,
    close_watches: Mutex<HashMap<PeerId, tokio::task::AbortHandle>>,
}

impl Inner {
    fn detach(&self, peer: &PeerId) -> bool {
        if !self.peers.detach(peer) {
            return false;
        }
        if let Some(watch) = self
            .close_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
        {
            watch.abort();
        }
        let vacated = self.tracker.vacate_peer(peer);
        tracing::info!(
            "[{}] peer {peer} detached ({vacated} pending acknowledgment(s) vacated, {} peer(s) left)",
            self.instance,
            self.peers.count()
        );
        true
    }
}

/// Holds the `Dispatching` state; dropping it returns the dispatcher to idle.
struct Flight<'a>(&'a AtomicBool);

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Process-local end of the event bus.
///
/// Clones share the same registries and in-flight state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let instance = Uuid::new_v4();
        tracing::debug!("dispatcher {instance} created");
        Self {
            inner: Arc::new(Inner {
                instance,
                listeners: LocalRegistry::new(config.subscription_prefix),
                peers: PeerRegistry::new(config.peer_prefix),
                tracker: AckTracker::new(),
                dispatching: AtomicBool::new(false),
                count_gate: tokio::sync::Mutex::new(()),
                close_watches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance
    }

    // -----------------------------------------------------------------------
    // Local listeners
    // -----------------------------------------------------------------------

    pub fn register<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.listeners.register(Arc::new(callback))
    }

    /// No-op for ids that are not registered.
    pub fn unregister(&self, id: &SubscriptionId) -> bool {
        self.inner.listeners.unregister(id)
    }

    pub fn get_num_local_listeners(&self) -> usize {
        self.inner.listeners.count()
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Attach a peer and arrange for it to be detached once its link closes.
    ///
    /// The close watch needs a tokio runtime; outside one the caller is
    /// responsible for calling [`Dispatcher::detach_peer`].
    pub fn attach_peer(&self, link: Arc<dyn PeerLink>) -> PeerId {
        let id = self.inner.peers.attach(link.clone());
        tracing::info!(
            "[{}] peer {id} attached ({}), {} peer(s) total",
            self.inner.instance,
            link.label(),
            self.inner.peers.count()
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                let peer = id.clone();
                let watch = handle.spawn(async move {
                    link.closed().await;
                    if let Some(inner) = weak.upgrade() {
                        inner.detach(&peer);
                    }
                });
                self.inner
                    .close_watches
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.clone(), watch.abort_handle());
            }
            Err(_) => {
                tracing::warn!("no tokio runtime: peer {id} will not be detached automatically");
            }
        }
        id
    }

    /// Remove a peer and vacate anything still waiting on it. Idempotent.
    pub fn detach_peer(&self, id: &PeerId) -> bool {
        self.inner.detach(id)
    }

    pub fn num_peers(&self) -> usize {
        self.inner.peers.count()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.list().into_iter().map(|(id, _)| id).collect()
    }

    // -----------------------------------------------------------------------
    // Bus operations
    // -----------------------------------------------------------------------

    pub fn is_dispatching(&self) -> bool {
        self.inner.dispatching.load(Ordering::Acquire)
    }

    fn begin_flight(&self) -> Option<Flight<'_>> {
        self.inner
            .dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Flight(&self.inner.dispatching))
    }

    /// Deliver `payload` to every local listener, then to every peer.
    ///
    /// Completes once every peer has acknowledged or gone away. Returns
    /// [`DispatchOutcome::Dropped`] without doing anything if another dispatch
    /// or clear is still in flight. Listener panics, local or remote, are
    /// reported as [`DispatchError::ListenerFaults`] after the round trip.
    pub async fn dispatch(&self, payload: Value) -> Result<DispatchOutcome, DispatchError> {
        let Some(_flight) = self.begin_flight() else {
            tracing::warn!(
                "[{}] dispatch dropped: round trip already in flight",
                self.inner.instance
            );
            return Ok(DispatchOutcome::Dropped);
        };

        let local = self.inner.listeners.invoke_all(&payload);

        let targets = self.inner.peers.list();
        let replies = if targets.is_empty() {
            Vec::new()
        } else {
            self.inner
                .tracker
                .broadcast(EventKind::Dispatch, Some(&payload), targets, &self.inner.peers)
                .wait()
                .await?
        };

        let mut faults = FaultReport {
            local: local.faults,
            remote: Vec::new(),
            delivery: tally(local.invoked, &replies),
        };
        for reply in replies {
            if let ReplyOutcome::Faulted(messages) = reply.outcome {
                faults.remote.push(RemoteFault {
                    peer: reply.peer,
                    messages,
                });
            }
        }

        if faults.is_empty() {
            Ok(DispatchOutcome::Completed(faults.delivery))
        } else {
            Err(DispatchError::ListenerFaults(faults))
        }
    }

    /// Empty the local registry and every peer's registry.
    ///
    /// Shares the single-flight guard with [`Dispatcher::dispatch`].
    pub async fn clear(&self) -> Result<DispatchOutcome, DispatchError> {
        let Some(_flight) = self.begin_flight() else {
            tracing::warn!(
                "[{}] clear dropped: round trip already in flight",
                self.inner.instance
            );
            return Ok(DispatchOutcome::Dropped);
        };

        let removed = self.inner.listeners.count();
        self.inner.listeners.clear();

        let targets = self.inner.peers.list();
        let replies = if targets.is_empty() {
            Vec::new()
        } else {
            self.inner
                .tracker
                .broadcast(EventKind::Clear, None, targets, &self.inner.peers)
                .wait()
                .await?
        };

        Ok(DispatchOutcome::Completed(tally(removed, &replies)))
    }

    /// Total listeners on the bus: every peer's local count plus ours.
    ///
    /// Not subject to the single-flight guard. Concurrent calls queue on the
    /// count-query slot. A peer that goes away before answering counts as 0.
    pub async fn get_num_listeners(&self) -> Result<usize, DispatchError> {
        let _gate = self.inner.count_gate.lock().await;

        let targets = self.inner.peers.list();
        let replies = if targets.is_empty() {
            Vec::new()
        } else {
            self.inner
                .tracker
                .broadcast(EventKind::CountQuery, None, targets, &self.inner.peers)
                .wait()
                .await?
        };

        let remote: usize = replies.iter().map(reported_count).sum();
        Ok(remote + self.inner.listeners.count())
    }

    // -----------------------------------------------------------------------
    // Inbound traffic
    // -----------------------------------------------------------------------

    /// Handle a message received from `from`.
    ///
    /// Requests are served regardless of the single-flight guard and answered
    /// on the sender's link; acknowledgments resolve the matching entry of the
    /// broadcast they belong to.
    pub fn handle_message(&self, from: &PeerId, message: WireMessage) {
        tracing::debug!(
            "[{}] {} from {from} idx={} round={}",
            self.inner.instance,
            message.channel,
            message.args.idx,
            message.args.round
        );

        match message.channel.phase {
            Phase::Request => self.serve_request(from, message),
            Phase::Success => {
                self.inner.tracker.resolve(
                    message.channel.kind,
                    message.args.round,
                    message.args.idx,
                    from,
                    ReplyOutcome::Acked(message.args.data),
                );
            }
            Phase::Failure => {
                let messages = fault_messages(message.args.data);
                self.inner.tracker.resolve(
                    message.channel.kind,
                    message.args.round,
                    message.args.idx,
                    from,
                    ReplyOutcome::Faulted(messages),
                );
            }
        }
    }

    fn serve_request(&self, from: &PeerId, request: WireMessage) {
        let reply = match request.channel.kind {
            EventKind::Dispatch => {
                let payload = request.args.data.clone().unwrap_or(Value::Null);
                let report = self.inner.listeners.invoke_all(&payload);
                if report.faults.is_empty() {
                    WireMessage::reply_to(&request, Phase::Success, None)
                } else {
                    let messages: Vec<String> =
                        report.faults.iter().map(|fault| fault.to_string()).collect();
                    WireMessage::reply_to(&request, Phase::Failure, Some(json!(messages)))
                }
            }
            EventKind::Clear => {
                self.inner.listeners.clear();
                WireMessage::reply_to(&request, Phase::Success, None)
            }
            EventKind::CountQuery => {
                let count = self.inner.listeners.count();
                WireMessage::reply_to(&request, Phase::Success, Some(json!(count)))
            }
        };

        let Some(link) = self.inner.peers.get(from) else {
            tracing::debug!("[{}] {from} detached before {} could be acknowledged", self.inner.instance, request.channel);
            return;
        };
        if let Err(e) = link.send(reply) {
            tracing::warn!("[{}] failed to acknowledge {} to {from}: {e}", self.inner.instance, request.channel);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("instance", &self.inner.instance)
            .field("listeners", &self.inner.listeners)
            .field("peers", &self.inner.peers)
            .field("dispatching", &self.is_dispatching())
            .finish()
    }
}

fn tally(local_listeners: usize, replies: &[PeerReply]) -> DeliveryReport {
    let peers_vacated = replies
        .iter()
        .filter(|reply| reply.outcome == ReplyOutcome::Vacated)
        .count();
    DeliveryReport {
        local_listeners,
        peers_acknowledged: replies.len() - peers_vacated,
        peers_vacated,
    }
}

fn reported_count(reply: &PeerReply) -> usize {
    match &reply.outcome {
        ReplyOutcome::Acked(Some(value)) => match value.as_u64().map(usize::try_from) {
            Some(Ok(count)) => count,
            Some(Err(_)) => {
                tracing::warn!("peer {} reported an out-of-range listener count: {value}", reply.peer);
                0
            }
            None => {
                tracing::warn!("peer {} reported a non-numeric listener count: {value}", reply.peer);
                0
            }
        },
        ReplyOutcome::Acked(None) => {
            tracing::warn!("peer {} acknowledged a count query without a count", reply.peer);
            0
        }
        ReplyOutcome::Faulted(_) | ReplyOutcome::Vacated => 0,
    }
}

fn fault_messages(data: Option<Value>) -> Vec<String> {
    match data {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => vec![s],
        Some(other) => vec![other.to_string()],
        None => vec!["peer reported a listener fault".to_string()],
    }
}
