use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::wire::WireMessage;
use crate::bus::{Dispatcher, PeerId};

/// Traffic delivered by transports to the owning process.
#[derive(Debug)]
pub enum Inbound {
    Message { from: PeerId, message: WireMessage },
    /// The peer's inbound stream ended; queued after its last message.
    Closed { peer: PeerId },
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

pub struct MessagePump;

impl MessagePump {
    /// Spawn the task that feeds inbound traffic to `dispatcher` one item at a
    /// time, in arrival order.
    ///
    /// The task ends once every [`InboundSender`] has been dropped and the
    /// queue is drained.
    pub fn start(dispatcher: Dispatcher, mut rx: InboundReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Inbound::Message { from, message } => dispatcher.handle_message(&from, message),
                    Inbound::Closed { peer } => {
                        dispatcher.detach_peer(&peer);
                    }
                }
            }
            tracing::debug!("[{}] inbound queue closed, pump exiting", dispatcher.instance_id());
        })
    }
}
