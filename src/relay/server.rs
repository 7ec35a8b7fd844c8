//! Fan-out relay server
//!
//! Clients connect to `ws://<addr>/?id=<client id>`. Each text frame is an
//! envelope; addressed envelopes go to `to`, the rest to every other client.
//! `from` is rewritten to the connection's id.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::rendezvous::types::short;
use crate::rendezvous::Envelope;

/// Connected clients by id
#[derive(Clone, Default)]
pub struct RelayState {
    clients: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<String>>>>,
}

impl RelayState {
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn route(&self, sender: &str, text: &str) {
        let mut envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping malformed envelope from {}: {}", short(sender), e);
                return;
            }
        };
        envelope.from = sender.to_string();
        let Ok(json) = envelope.to_json() else {
            return;
        };

        let clients = self.clients.read().await;
        match envelope.to.as_deref() {
            Some(to) => match clients.get(to) {
                Some(tx) => {
                    let _ = tx.send(json);
                }
                None => trace!("No client {} for {}", short(to), envelope.kind),
            },
            None => {
                for (id, tx) in clients.iter() {
                    if id != sender {
                        let _ = tx.send(json.clone());
                    }
                }
            }
        }
    }
}

#[derive(Deserialize)]
pub struct ConnectParams {
    id: String,
}

pub fn router(state: RelayState) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params.id, state))
}

async fn handle_socket(socket: WebSocket, client_id: String, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // A reconnect under the same id takes over routing from the old socket
    let replaced = state
        .clients
        .write()
        .await
        .insert(client_id.clone(), tx.clone());
    if replaced.is_some() {
        debug!("Client {} reconnected", short(&client_id));
    }
    info!("Client {} joined the relay", short(&client_id));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => state.route(&client_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Only drop the entry if a newer socket has not replaced it
    let mut clients = state.clients.write().await;
    if clients
        .get(&client_id)
        .is_some_and(|current| current.same_channel(&tx))
    {
        clients.remove(&client_id);
    }
    drop(clients);
    send_task.abort();
    info!("Client {} left the relay", short(&client_id));
}

/// Serve the relay on an already bound listener until the task is aborted
pub fn spawn(
    listener: TcpListener,
    state: RelayState,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            tracing::error!("Relay server error: {}", e);
        }
    });
    info!("Relay listening on ws://{}", addr);
    Ok((addr, handle))
}

/// Bind `addr` and serve until the process exits
pub async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let (_, handle) = spawn(listener, RelayState::default())?;
    handle.await?;
    Ok(())
}
