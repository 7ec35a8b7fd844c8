//! Client, group and presence types shared between nodes

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Alphabet used for client ids, default names and group tokens
pub const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub const CLIENT_ID_LEN: usize = 10;
pub const CLIENT_NAME_LEN: usize = 6;
pub const GROUP_TOKEN_LEN: usize = 8;

/// Heartbeat period for presence broadcasts
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3000);

/// Shared by the stale purge and connect-time matching
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_millis(10000);

/// Generate a random id over [`ID_ALPHABET`]. Not cryptographically secure.
pub fn generate_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// One-way hash used to derive private group ids from tokens
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Short form of an id for log lines
pub fn short(id: &str) -> &str {
    match id.char_indices().nth(6) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    Idling,
    Waiting,
    Connected,
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::Idling => write!(f, "idling"),
            ClientStatus::Waiting => write!(f, "waiting"),
            ClientStatus::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub status: ClientStatus,
}

impl Client {
    /// Create a client with a random id and, unless given, a random name
    pub fn new(name: Option<String>) -> Self {
        Self {
            id: generate_id(CLIENT_ID_LEN),
            name: name.unwrap_or_else(|| generate_id(CLIENT_NAME_LEN)),
            status: ClientStatus::Idling,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    Inactive,
    Active,
}

/// A rendezvous group as advertised in presence broadcasts.
///
/// `id` is the plaintext token for public groups and `hash_token(token)`
/// for private ones. Equality covers every field, which is what group
/// listing deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub id: String,
    #[serde(rename = "isPublic")]
    pub is_public: bool,
    pub status: GroupStatus,
}

impl Group {
    /// Whether `token` opens this group
    pub fn matches_token(&self, token: &str) -> bool {
        if self.is_public {
            self.id == token
        } else {
            self.id == hash_token(token)
        }
    }
}

/// Payload of a presence broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub client: Client,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
}

/// Application message carried over peer channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub name: String,
    pub text: String,
    #[serde(rename = "sentAt")]
    pub sent_at: u64,
}

impl ChatMessage {
    pub fn new(from: &Client, text: impl Into<String>) -> Self {
        let sent_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            from: from.id.clone(),
            name: from.name.clone(),
            text: text.into(),
            sent_at,
        }
    }
}
