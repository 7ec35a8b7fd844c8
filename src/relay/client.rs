//! WebSocket connection to a relay server

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::SignalingRelay;
use crate::error::{Error, Result};
use crate::rendezvous::Envelope;

/// Relay handle backed by a WebSocket. Writes go through a queue drained by
/// a background task.
pub struct WebSocketRelay {
    outbound: mpsc::Sender<Envelope>,
}

impl WebSocketRelay {
    /// Connect as `client_id` and return the handle plus the inbound stream
    pub async fn connect(
        url: &str,
        client_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let url = format!("{}/?id={}", url.trim_end_matches('/'), client_id);
        info!("Connecting to relay: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Envelope>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let json = match envelope.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        debug!("Skipping unserializable envelope: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    error!("Relay write failed: {}", e);
                    break;
                }
                debug!("Sent {} to relay", envelope.kind);
            }
            // Every handle is gone; tell the relay we are leaving
            let _ = write.send(Message::Close(None)).await;
        });

        let relay_url = url.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Envelope::from_json(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Malformed envelope from {}: {}", relay_url, e),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        error!("WebSocket error from {}: {}", relay_url, e);
                        break;
                    }
                    _ => {}
                }
            }
            warn!("WebSocket closed: {}", relay_url);
        });

        Ok((Self { outbound }, inbound_rx))
    }
}

#[async_trait]
impl SignalingRelay for WebSocketRelay {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| Error::Relay("relay connection closed".to_string()))
    }
}
