//! Discovery, rendezvous groups and per-peer session orchestration
//!
//! Nodes broadcast a presence envelope (`DATA_REQUEST`) on every heartbeat.
//! Peers seen within the freshness window form the registry, and the groups
//! they advertise can be joined by token. `connect` offers a direct session
//! to every member of the local group (`OFFER_REQUEST` / `ANSWER_REQUEST`);
//! application messages (`SEND_MESSAGE`) then travel over data channels.

mod envelope;
mod group;
mod node;
mod orchestrator;
mod registry;
pub mod types;

pub use envelope::{Envelope, EnvelopeKind};
pub use group::GroupCoordinator;
pub use node::{Command, NodeHandle, NodeSnapshot, RendezvousNode};
pub use orchestrator::{Connection, ConnectionOrchestrator, MessageStore};
pub use registry::{PeerRecord, PeerRegistry};
pub use types::{
    generate_id, hash_token, ChatMessage, Client, ClientStatus, Group, GroupStatus, Presence,
};
