//! Envelope delivery between nodes before a direct channel exists
//!
//! - [`client::WebSocketRelay`]: connects to a relay server
//! - [`server`]: a fan-out relay that routes envelopes by `to`
//! - [`local::LocalRelayHub`]: in-process relay for tests and demos

pub mod client;
pub mod local;
pub mod server;

use async_trait::async_trait;

use crate::error::Result;
use crate::rendezvous::Envelope;

pub use client::WebSocketRelay;
pub use local::{LocalRelay, LocalRelayHub};

/// Outbound half of a relay connection. Inbound envelopes arrive on the
/// receiver handed out when the connection is made.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Deliver to `envelope.to`, or to every other participant when unset
    async fn send(&self, envelope: Envelope) -> Result<()>;
}
