//! Error types for the rendezvous core

use std::time::Duration;
use thiserror::Error;

use crate::webrtc::NegotiationState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Candidate gathering did not finish within {0:?}")]
    GatheringTimeout(Duration),

    #[error("Negotiator closed")]
    Closed,

    #[error("Node stopped")]
    NodeStopped,

    #[error("Invalid negotiation state: expected {expected}, found {found}")]
    InvalidState {
        expected: NegotiationState,
        found: NegotiationState,
    },

    #[error("Session error: {0}")]
    Session(#[from] anyhow::Error),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
