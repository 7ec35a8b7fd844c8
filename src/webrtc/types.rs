//! Session negotiation types and the platform traits the negotiator drives

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Label of the channel the offering side opens for application messages
pub const DEFAULT_CHANNEL: &str = "message";

/// Upper bound on the candidate-gathering barrier
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged over the relay: `{"type": "offer", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Negotiation progress of one session.
///
/// Offering: `New -> LocalOfferPending -> LocalOfferReady -> RemoteSet -> Connected`.
/// Answering: `New -> RemoteOfferSet -> LocalAnswerPending -> LocalAnswerReady -> Connected`.
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    LocalOfferPending,
    LocalOfferReady,
    RemoteSet,
    RemoteOfferSet,
    LocalAnswerPending,
    LocalAnswerReady,
    Connected,
    Closed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NegotiationState::New => "new",
            NegotiationState::LocalOfferPending => "local-offer-pending",
            NegotiationState::LocalOfferReady => "local-offer-ready",
            NegotiationState::RemoteSet => "remote-set",
            NegotiationState::RemoteOfferSet => "remote-offer-set",
            NegotiationState::LocalAnswerPending => "local-answer-pending",
            NegotiationState::LocalAnswerReady => "local-answer-ready",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Connection state reported by the platform session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a platform session pushes to its negotiator
pub enum SessionEvent {
    /// A gathered local candidate; `None` terminates gathering
    Candidate(Option<serde_json::Value>),
    StateChange(TransportState),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage { label: String, text: String },
}

pub type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

/// Events a negotiator reports upward, tagged with the remote client id
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected { peer: String },
    Message {
        peer: String,
        label: String,
        text: String,
    },
    Failed { peer: String, reason: String },
}

/// A named, ordered text channel to one peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: String) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// One platform peer session (description generation, candidate discovery,
/// data delivery)
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;

    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    /// Current local description, including candidates gathered so far
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn create_data_channel(&self, label: &str) -> anyhow::Result<Arc<dyn DataChannel>>;

    fn transport_state(&self) -> TransportState;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Opens platform sessions that report to `events`
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, events: SessionEvents) -> anyhow::Result<Arc<dyn SessionBackend>>;
}
