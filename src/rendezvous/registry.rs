//! Remote presence records, refreshed by heartbeats and purged when stale

use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::types::{short, Client, Group};

/// Presence record for one remote client
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub client: Client,
    pub group: Option<Group>,
    pub last_seen: Instant,
}

/// Known remote peers in insertion order. Never holds the local client.
pub struct PeerRegistry {
    local_id: String,
    peers: Vec<PeerRecord>,
}

impl PeerRegistry {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            peers: Vec::new(),
        }
    }

    pub fn upsert(&mut self, client: Client, group: Option<Group>) {
        self.upsert_at(client, group, Instant::now());
    }

    /// Insert or replace the record for `client.id`. A replaced record keeps
    /// its position.
    pub fn upsert_at(&mut self, client: Client, group: Option<Group>, seen: Instant) {
        if client.id == self.local_id {
            return;
        }

        if let Some(record) = self.peers.iter_mut().find(|p| p.client.id == client.id) {
            trace!("Refreshed peer {}", short(&client.id));
            record.client = client;
            record.group = group;
            record.last_seen = seen;
        } else {
            debug!("Discovered peer {} ({})", short(&client.id), client.name);
            self.peers.push(PeerRecord {
                client,
                group,
                last_seen: seen,
            });
        }
    }

    pub fn purge_stale(&mut self, window: Duration) -> Vec<String> {
        self.purge_stale_at(Instant::now(), window)
    }

    /// Remove every peer last seen `window` or more before `now`.
    /// Returns the ids that were removed.
    pub fn purge_stale_at(&mut self, now: Instant, window: Duration) -> Vec<String> {
        let mut removed = Vec::new();
        self.peers.retain(|p| {
            let fresh = now.saturating_duration_since(p.last_seen) < window;
            if !fresh {
                removed.push(p.client.id.clone());
            }
            fresh
        });
        for id in &removed {
            debug!("Purged stale peer {}", short(id));
        }
        removed
    }

    pub fn list(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.client.id == id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers currently advertising `group_id`
    pub fn in_group<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a PeerRecord> + 'a {
        self.peers
            .iter()
            .filter(move |p| p.group.as_ref().is_some_and(|g| g.id == group_id))
    }
}
