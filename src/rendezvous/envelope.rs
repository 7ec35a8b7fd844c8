//! Relay envelopes: `{type, payload, to?, from}`

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{ChatMessage, Presence};
use crate::error::Result;
use crate::webrtc::SessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// Presence heartbeat, broadcast
    DataRequest,
    /// Session offer, addressed
    OfferRequest,
    /// Session answer, addressed
    AnswerRequest,
    /// Application message, sent over peer channels rather than the relay
    SendMessage,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::DataRequest => write!(f, "DATA_REQUEST"),
            EnvelopeKind::OfferRequest => write!(f, "OFFER_REQUEST"),
            EnvelopeKind::AnswerRequest => write!(f, "ANSWER_REQUEST"),
            EnvelopeKind::SendMessage => write!(f, "SEND_MESSAGE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Recipient client id; `None` broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Sender client id
    pub from: String,
}

impl Envelope {
    pub fn new<T: Serialize>(
        kind: EnvelopeKind,
        payload: &T,
        from: &str,
        to: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
            to: to.map(str::to_string),
            from: from.to_string(),
        })
    }

    pub fn presence(presence: &Presence) -> Result<Self> {
        Self::new(EnvelopeKind::DataRequest, presence, &presence.client.id, None)
    }

    pub fn offer(offer: &SessionDescription, from: &str, to: &str) -> Result<Self> {
        Self::new(EnvelopeKind::OfferRequest, offer, from, Some(to))
    }

    pub fn answer(answer: &SessionDescription, from: &str, to: &str) -> Result<Self> {
        Self::new(EnvelopeKind::AnswerRequest, answer, from, Some(to))
    }

    pub fn message(message: &ChatMessage) -> Result<Self> {
        Self::new(EnvelopeKind::SendMessage, message, &message.from, None)
    }

    /// Decode the payload into a concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
