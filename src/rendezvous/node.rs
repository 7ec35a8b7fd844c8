//! The rendezvous node: one task owning client, group, registry and
//! connections, fed by a heartbeat timer, relay envelopes, negotiator events
//! and a command mailbox

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::envelope::{Envelope, EnvelopeKind};
use super::group::GroupCoordinator;
use super::orchestrator::ConnectionOrchestrator;
use super::registry::PeerRegistry;
use super::types::{short, ChatMessage, Client, ClientStatus, Group, GroupStatus, Presence};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::relay::SignalingRelay;
use crate::webrtc::{PeerEvent, SessionDescription, SessionFactory, DEFAULT_CHANNEL};

/// Point-in-time view of a node
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub client: Client,
    pub group: Option<Group>,
    pub peers: usize,
    pub groups: Vec<Group>,
    pub members: Vec<Client>,
    pub messages: Vec<ChatMessage>,
}

pub enum Command {
    SetName {
        name: String,
        reply: oneshot::Sender<Client>,
    },
    CreateGroup {
        name: String,
        is_public: bool,
        reply: oneshot::Sender<String>,
    },
    JoinGroup {
        token: String,
        reply: oneshot::Sender<Option<Group>>,
    },
    LeaveGroup {
        reply: oneshot::Sender<()>,
    },
    Connect {
        reply: oneshot::Sender<usize>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<NodeSnapshot>,
    },
    Shutdown,
}

pub struct RendezvousNode {
    config: NodeConfig,
    coordinator: GroupCoordinator,
    registry: PeerRegistry,
    orchestrator: ConnectionOrchestrator,
    relay: Arc<dyn SignalingRelay>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl RendezvousNode {
    pub fn new(
        client: Client,
        config: NodeConfig,
        relay: Arc<dyn SignalingRelay>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let orchestrator = ConnectionOrchestrator::new(
            client.id.clone(),
            relay.clone(),
            sessions,
            config.gather_timeout(),
            events_tx,
        );

        Self {
            registry: PeerRegistry::new(client.id.clone()),
            coordinator: GroupCoordinator::new(client),
            orchestrator,
            relay,
            config,
            peer_events: Some(events_rx),
        }
    }

    pub fn client(&self) -> &Client {
        self.coordinator.client()
    }

    pub fn group(&self) -> Option<&Group> {
        self.coordinator.group()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &ConnectionOrchestrator {
        &self.orchestrator
    }

    pub fn set_name(&mut self, name: &str) -> Client {
        self.coordinator.set_name(name).clone()
    }

    pub fn create_group(&mut self, name: &str, is_public: bool) -> String {
        self.coordinator.create_group(name, is_public)
    }

    pub fn join_group(&mut self, token: &str) -> Option<Group> {
        self.coordinator.join_group(token, &self.registry)
    }

    pub fn leave_group(&mut self) {
        self.coordinator.leave_group();
    }

    pub fn groups(&self) -> Vec<Group> {
        GroupCoordinator::groups(&self.registry)
    }

    /// Offer sessions to every fresh peer in the current group
    pub async fn connect(&mut self) -> usize {
        let Some(group) = self.coordinator.group().cloned() else {
            debug!("Connect requested outside a group");
            return 0;
        };

        let offered = self
            .orchestrator
            .connect(&group, &self.registry, self.config.freshness_window())
            .await;
        self.coordinator.set_group_status(GroupStatus::Active);
        offered
    }

    pub async fn disconnect(&mut self) {
        if self.coordinator.group().is_some() {
            self.coordinator.set_group_status(GroupStatus::Inactive);
            self.coordinator.set_status(ClientStatus::Waiting);
        }
        self.orchestrator.disconnect().await;
    }

    /// Send a chat message to every connected member. Returns the number of
    /// peers it reached.
    pub async fn send(&mut self, text: &str) -> usize {
        if self.orchestrator.is_empty() {
            return 0;
        }

        let message = ChatMessage::new(self.coordinator.client(), text);
        let envelope = match Envelope::message(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to encode message: {}", e);
                return 0;
            }
        };

        let delivered = self.orchestrator.send(&envelope).await;
        self.orchestrator.record(message);
        delivered
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            client: self.client().clone(),
            group: self.group().cloned(),
            peers: self.registry.len(),
            groups: self.groups(),
            members: self.orchestrator.members(),
            messages: self.orchestrator.messages().list().to_vec(),
        }
    }

    /// Broadcast presence, then purge stale peers and their connections
    pub async fn heartbeat(&mut self) -> Result<()> {
        let presence = self.coordinator.presence();
        let sent = self.relay.send(Envelope::presence(&presence)?).await;

        let removed = self.registry.purge_stale(self.config.freshness_window());
        self.remove_peers(&removed).await;
        sent
    }

    /// Apply one inbound relay envelope
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        // Our own broadcasts and envelopes for someone else
        if envelope.from == self.client().id {
            return Ok(());
        }
        if let Some(to) = envelope.to.as_deref() {
            if to != self.client().id {
                return Ok(());
            }
        }

        match envelope.kind {
            EnvelopeKind::DataRequest => {
                let presence: Presence = envelope.payload_as()?;
                self.registry.upsert(presence.client, presence.group);
            }
            EnvelopeKind::OfferRequest => {
                let offer: SessionDescription = envelope.payload_as()?;
                self.orchestrator
                    .handle_offer(&envelope.from, offer, self.coordinator.group(), &self.registry)
                    .await;
            }
            EnvelopeKind::AnswerRequest => {
                let answer: SessionDescription = envelope.payload_as()?;
                self.orchestrator.handle_answer(&envelope.from, answer);
            }
            EnvelopeKind::SendMessage => {
                debug!("Ignoring relayed message from {}", short(&envelope.from));
            }
        }
        Ok(())
    }

    /// Apply one event reported by a negotiator
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer } => {
                if self.orchestrator.connection(&peer).is_some() && self.group().is_some() {
                    self.coordinator.set_status(ClientStatus::Connected);
                }
            }
            PeerEvent::Message { peer, label, text } => {
                if label != DEFAULT_CHANNEL {
                    trace!("Ignoring '{}' traffic from {}", label, short(&peer));
                    return;
                }
                let message = Envelope::from_json(&text)
                    .and_then(|e| match e.kind {
                        EnvelopeKind::SendMessage => e.payload_as::<ChatMessage>().map(Some),
                        _ => Ok(None),
                    });
                match message {
                    Ok(Some(message)) => {
                        debug!("Message from {}: {}", short(&peer), message.text);
                        self.orchestrator.record(message);
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Malformed message from {}: {}", short(&peer), e),
                }
            }
            PeerEvent::Failed { peer, reason } => {
                warn!("Dropping connection to {}: {}", short(&peer), reason);
                self.remove_peers(&[peer]).await;
            }
        }
    }

    /// Drop connections to `peer_ids`. Losing the last one takes the client
    /// back to waiting.
    async fn remove_peers(&mut self, peer_ids: &[String]) {
        self.orchestrator.remove_peers(peer_ids).await;
        if self.orchestrator.is_empty() && self.client().status == ClientStatus::Connected {
            self.coordinator.set_status(ClientStatus::Waiting);
        }
    }

    /// Run the event loop on its own task
    pub fn spawn(self, inbound: mpsc::UnboundedReceiver<Envelope>) -> (NodeHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let handle = tokio::spawn(self.run(inbound, commands_rx));
        (
            NodeHandle {
                commands: commands_tx,
            },
            handle,
        )
    }

    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let Some(mut peer_events) = self.peer_events.take() else {
            return;
        };

        info!(
            "Starting node {} ({})",
            short(&self.client().id),
            self.client().name
        );

        // First tick fires immediately so peers see us right away
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        debug!("Heartbeat failed: {}", e);
                    }
                }
                Some(envelope) = inbound.recv() => {
                    let kind = envelope.kind;
                    if let Err(e) = self.handle_envelope(envelope).await {
                        debug!("Error handling {}: {}", kind, e);
                    }
                }
                Some(event) = peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        self.disconnect().await;
        info!("Node {} stopped", short(&self.client().id));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetName { name, reply } => {
                let _ = reply.send(self.set_name(&name));
            }
            Command::CreateGroup {
                name,
                is_public,
                reply,
            } => {
                let _ = reply.send(self.create_group(&name, is_public));
            }
            Command::JoinGroup { token, reply } => {
                let _ = reply.send(self.join_group(&token));
            }
            Command::LeaveGroup { reply } => {
                self.leave_group();
                let _ = reply.send(());
            }
            Command::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Send { text, reply } => {
                let delivered = self.send(&text).await;
                let _ = reply.send(delivered);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }
}

/// Mailbox handle for a running [`RendezvousNode`]
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::NodeStopped)?;
        rx.await.map_err(|_| Error::NodeStopped)
    }

    pub async fn set_name(&self, name: &str) -> Result<Client> {
        let name = name.to_string();
        self.request(|reply| Command::SetName { name, reply }).await
    }

    pub async fn create_group(&self, name: &str, is_public: bool) -> Result<String> {
        let name = name.to_string();
        self.request(|reply| Command::CreateGroup {
            name,
            is_public,
            reply,
        })
        .await
    }

    pub async fn join_group(&self, token: &str) -> Result<Option<Group>> {
        let token = token.to_string();
        self.request(|reply| Command::JoinGroup { token, reply }).await
    }

    pub async fn leave_group(&self) -> Result<()> {
        self.request(|reply| Command::LeaveGroup { reply }).await
    }

    pub async fn connect(&self) -> Result<usize> {
        self.request(|reply| Command::Connect { reply }).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn send(&self, text: &str) -> Result<usize> {
        let text = text.to_string();
        self.request(|reply| Command::Send { text, reply }).await
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
