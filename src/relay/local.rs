//! In-process relay hub

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

use super::SignalingRelay;
use crate::error::{Error, Result};
use crate::rendezvous::Envelope;

/// Routes envelopes between participants in the same process
#[derive(Clone, Default)]
pub struct LocalRelayHub {
    participants: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
}

impl LocalRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client_id` and return its relay handle and inbox
    pub fn join(&self, client_id: &str) -> (LocalRelay, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut participants) = self.participants.lock() {
            participants.insert(client_id.to_string(), tx);
        }
        (
            LocalRelay {
                hub: self.clone(),
                client_id: client_id.to_string(),
            },
            rx,
        )
    }

    pub fn leave(&self, client_id: &str) {
        if let Ok(mut participants) = self.participants.lock() {
            participants.remove(client_id);
        }
    }

    fn route(&self, sender: &str, envelope: Envelope) -> Result<()> {
        let participants = self
            .participants
            .lock()
            .map_err(|_| Error::Relay("hub lock poisoned".to_string()))?;

        match envelope.to.as_deref() {
            Some(to) => {
                if let Some(tx) = participants.get(to) {
                    let _ = tx.send(envelope);
                } else {
                    trace!("No participant {} for {}", to, envelope.kind);
                }
            }
            None => {
                for (id, tx) in participants.iter() {
                    if id != sender {
                        let _ = tx.send(envelope.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

/// One participant's handle on a [`LocalRelayHub`]
pub struct LocalRelay {
    hub: LocalRelayHub,
    client_id: String,
}

#[async_trait]
impl SignalingRelay for LocalRelay {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.hub.route(&self.client_id, envelope)
    }
}
