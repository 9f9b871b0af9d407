//! Outbound messages fanned out to connected clients

use super::traits::{BackendError, Notifier};
use crate::identity::Identity;
use crate::state_machine::Control;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// One message for one identity, as streamed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub identity: Identity,
    pub text: String,
    pub controls: Vec<Control>,
}

/// Publishes every message on a broadcast channel; subscribers filter by identity
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<OutboundMessage>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn send(
        &self,
        identity: Identity,
        text: &str,
        controls: &[Control],
    ) -> Result<(), BackendError> {
        let message = OutboundMessage {
            identity,
            text: text.to_string(),
            controls: controls.to_vec(),
        };
        self.tx
            .send(message)
            .map(|_| ())
            .map_err(|_| BackendError::Unavailable(format!("no client connected for {identity}")))
    }
}
