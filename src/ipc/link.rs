use std::fmt;

use async_trait::async_trait;

use super::wire::WireMessage;

/// Errors raised by a transport while talking to one peer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("link to {0} is closed")]
    Closed(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("process error: {0}")]
    Process(String),
}

impl TransportError {
    pub fn io<E: fmt::Display>(err: E) -> Self {
        TransportError::Io(err.to_string())
    }

    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        TransportError::Serialization(err.to_string())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed(_))
    }
}

/// Handle to one remote peer.
///
/// `send` must not block: implementations queue the message and return, so a
/// broadcast can address every peer before any acknowledgment is processed.
/// `closed` resolves once the peer is gone for good; the dispatcher awaits it
/// to detach the peer automatically.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Queue a message for delivery to the peer.
    fn send(&self, message: WireMessage) -> Result<(), TransportError>;

    /// Human-readable name used in logs.
    fn label(&self) -> &str;

    /// Resolves when the underlying channel has closed.
    async fn closed(&self);
}

impl fmt::Debug for dyn PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("label", &self.label())
            .finish_non_exhaustive()
    }
}
