//! Shared helpers for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::ipc::{PeerLink, TransportError, WireMessage};

/// Link that records outbound messages instead of delivering them.
///
/// Nothing is ever acknowledged on its own; tests feed replies back through
/// `Dispatcher::handle_message`.
pub struct RecordingLink {
    label: String,
    sent: Mutex<Vec<WireMessage>>,
    closed: watch::Sender<bool>,
}

impl RecordingLink {
    pub fn new(label: &str) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed,
        })
    }

    pub fn take_sent(&self) -> Vec<WireMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Make further sends fail and resolve `closed`.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl PeerLink for RecordingLink {
    fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed(self.label.clone()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
