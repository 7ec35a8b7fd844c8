//! Per-peer session lifecycle for the active group

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::envelope::Envelope;
use super::registry::PeerRegistry;
use super::types::{short, ChatMessage, Client, Group};
use crate::error::Error;
use crate::relay::SignalingRelay;
use crate::webrtc::{
    NegotiationState, PeerEvent, SessionDescription, SessionFactory, SessionNegotiator,
};

/// A negotiated (or negotiating) session with one group member
pub struct Connection {
    pub client: Client,
    pub group: Option<Group>,
    pub negotiator: SessionNegotiator,
}

/// Local application message log
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
}

impl MessageStore {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn list(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub struct ConnectionOrchestrator {
    local_id: String,
    relay: Arc<dyn SignalingRelay>,
    sessions: Arc<dyn SessionFactory>,
    gather_timeout: Duration,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    connections: HashMap<String, Connection>,
    messages: MessageStore,
}

impl ConnectionOrchestrator {
    pub fn new(
        local_id: impl Into<String>,
        relay: Arc<dyn SignalingRelay>,
        sessions: Arc<dyn SessionFactory>,
        gather_timeout: Duration,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            relay,
            sessions,
            gather_timeout,
            peer_events,
            connections: HashMap::new(),
            messages: MessageStore::default(),
        }
    }

    pub fn connection(&self, peer_id: &str) -> Option<&Connection> {
        self.connections.get(peer_id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Clients we hold a connection with
    pub fn members(&self) -> Vec<Client> {
        self.connections.values().map(|c| c.client.clone()).collect()
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn record(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Offer a session to every fresh peer advertising `group`.
    ///
    /// Connections are registered before this returns; each offer is
    /// generated and sent from its own task once gathering completes.
    /// Sessions that are up or being answered are kept. Any other
    /// negotiator for the peer (typically an offer that was never answered)
    /// is closed and replaced by a fresh offer. Returns the number of peers
    /// offered to.
    pub async fn connect(
        &mut self,
        group: &Group,
        registry: &PeerRegistry,
        window: Duration,
    ) -> usize {
        let now = Instant::now();
        let mut offered = 0;

        for peer in registry.in_group(&group.id) {
            if now.saturating_duration_since(peer.last_seen) >= window {
                continue;
            }
            if let Some(existing) = self.connections.get(&peer.client.id) {
                if keeps_session(existing.negotiator.state()) {
                    continue;
                }
            }
            if let Some(stalled) = self.connections.remove(&peer.client.id) {
                debug!(
                    "Replacing {} negotiation with {}",
                    stalled.negotiator.state(),
                    short(&peer.client.id)
                );
                stalled.negotiator.close().await;
            }

            let negotiator = self.negotiator(&peer.client.id);
            self.connections.insert(
                peer.client.id.clone(),
                Connection {
                    client: peer.client.clone(),
                    group: peer.group.clone(),
                    negotiator: negotiator.clone(),
                },
            );

            info!("Offering session to {} ({})", short(&peer.client.id), peer.client.name);
            tokio::spawn(send_offer(
                negotiator,
                self.relay.clone(),
                self.local_id.clone(),
                self.peer_events.clone(),
            ));
            offered += 1;
        }

        offered
    }

    /// Answer an offer from a member of the local group.
    ///
    /// When both sides offered to each other, the lower client id stays the
    /// offering side: the lower side ignores the remote offer while its own
    /// session is live, the higher side drops its own negotiator and answers.
    pub async fn handle_offer(
        &mut self,
        from: &str,
        offer: SessionDescription,
        group: Option<&Group>,
        registry: &PeerRegistry,
    ) -> bool {
        let Some(group) = group else {
            debug!("Ignoring offer from {}: not in a group", short(from));
            return false;
        };
        let Some(peer) = registry
            .get(from)
            .filter(|p| p.group.as_ref().is_some_and(|g| g.id == group.id))
        else {
            debug!("Ignoring offer from {}: not a member of '{}'", short(from), group.name);
            return false;
        };

        if let Some(existing) = self.connections.get(from) {
            let live = existing.negotiator.state() != NegotiationState::Closed;
            if live && self.local_id.as_str() < from {
                debug!("Glare with {}: keeping our session", short(from));
                return false;
            }
            if let Some(old) = self.connections.remove(from) {
                old.negotiator.close().await;
            }
        }

        let negotiator = self.negotiator(from);
        self.connections.insert(
            from.to_string(),
            Connection {
                client: peer.client.clone(),
                group: peer.group.clone(),
                negotiator: negotiator.clone(),
            },
        );

        info!("Answering offer from {} ({})", short(from), peer.client.name);
        tokio::spawn(send_answer(
            negotiator,
            offer,
            self.relay.clone(),
            self.local_id.clone(),
            self.peer_events.clone(),
        ));
        true
    }

    /// Commit an answer to one of our offers
    pub fn handle_answer(&self, from: &str, answer: SessionDescription) -> bool {
        let Some(connection) = self.connections.get(from) else {
            debug!("Ignoring answer from {}: no pending offer", short(from));
            return false;
        };
        // Duplicates and late answers must not tear down a working session
        let state = connection.negotiator.state();
        if state != NegotiationState::LocalOfferReady {
            debug!("Ignoring answer from {}: session is {}", short(from), state);
            return false;
        }

        let negotiator = connection.negotiator.clone();
        let peer_events = self.peer_events.clone();
        tokio::spawn(async move {
            if let Err(e) = negotiator.accept_answer(answer).await {
                report_failure(&negotiator, &peer_events, e);
            }
        });
        true
    }

    /// Send to every connection. Returns how many negotiators took the
    /// payload; peers without an established channel drop it silently.
    pub async fn send(&self, envelope: &Envelope) -> usize {
        if self.connections.is_empty() {
            return 0;
        }
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", envelope.kind, e);
                return 0;
            }
        };

        let mut delivered = 0;
        for connection in self.connections.values() {
            if connection.negotiator.send(&text).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop connections to the given peers
    pub async fn remove_peers(&mut self, peer_ids: &[String]) {
        for id in peer_ids {
            if let Some(connection) = self.connections.remove(id) {
                info!("Dropping connection to departed peer {}", short(id));
                connection.negotiator.close().await;
            }
        }
    }

    /// Close every negotiator and clear connections and messages. Idempotent.
    pub async fn disconnect(&mut self) {
        let connections: Vec<Connection> = self.connections.drain().map(|(_, c)| c).collect();
        self.messages.clear();

        if !connections.is_empty() {
            info!("Disconnecting from {} peers", connections.len());
        }
        for connection in connections {
            connection.negotiator.close().await;
        }
    }

    fn negotiator(&self, peer_id: &str) -> SessionNegotiator {
        SessionNegotiator::new(
            peer_id,
            self.sessions.clone(),
            self.gather_timeout,
            self.peer_events.clone(),
        )
    }
}

/// States `connect` leaves alone: the session is up, or the remote side is
/// the offerer and the answer is under way
fn keeps_session(state: NegotiationState) -> bool {
    matches!(
        state,
        NegotiationState::Connected
            | NegotiationState::RemoteSet
            | NegotiationState::RemoteOfferSet
            | NegotiationState::LocalAnswerPending
            | NegotiationState::LocalAnswerReady
    )
}

async fn send_offer(
    negotiator: SessionNegotiator,
    relay: Arc<dyn SignalingRelay>,
    local_id: String,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
) {
    let result = async {
        let offer = negotiator.create_offer().await?;
        relay
            .send(Envelope::offer(&offer, &local_id, negotiator.peer_id())?)
            .await?;
        debug!("Sent offer to {}", short(negotiator.peer_id()));
        Ok::<_, Error>(())
    }
    .await;

    if let Err(e) = result {
        report_failure(&negotiator, &peer_events, e);
    }
}

async fn send_answer(
    negotiator: SessionNegotiator,
    offer: SessionDescription,
    relay: Arc<dyn SignalingRelay>,
    local_id: String,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
) {
    let result = async {
        let answer = negotiator.create_answer(offer).await?;
        relay
            .send(Envelope::answer(&answer, &local_id, negotiator.peer_id())?)
            .await?;
        debug!("Sent answer to {}", short(negotiator.peer_id()));
        Ok::<_, Error>(())
    }
    .await;

    if let Err(e) = result {
        report_failure(&negotiator, &peer_events, e);
    }
}

fn report_failure(
    negotiator: &SessionNegotiator,
    peer_events: &mpsc::UnboundedSender<PeerEvent>,
    error: Error,
) {
    // Closing mid-negotiation is a teardown, not a failure
    if matches!(error, Error::Closed) {
        return;
    }
    warn!("Negotiation with {} failed: {}", short(negotiator.peer_id()), error);
    let _ = peer_events.send(PeerEvent::Failed {
        peer: negotiator.peer_id().to_string(),
        reason: error.to_string(),
    });
}
