//! Local client identity and rendezvous group membership

use tracing::info;

use super::registry::PeerRegistry;
use super::types::{
    generate_id, hash_token, Client, ClientStatus, Group, GroupStatus, Presence, GROUP_TOKEN_LEN,
};

/// Owns the local client and the group it currently belongs to
pub struct GroupCoordinator {
    client: Client,
    group: Option<Group>,
}

impl GroupCoordinator {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            group: None,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    /// What the next heartbeat advertises
    pub fn presence(&self) -> Presence {
        Presence {
            client: self.client.clone(),
            group: self.group.clone(),
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &Client {
        self.client.name = name.into();
        &self.client
    }

    pub fn set_status(&mut self, status: ClientStatus) {
        self.client.status = status;
    }

    pub fn set_group_status(&mut self, status: GroupStatus) {
        if let Some(group) = self.group.as_mut() {
            group.status = status;
        }
    }

    /// Create a group and return its plaintext token.
    ///
    /// Public groups advertise the token itself; private groups advertise
    /// only its hash, so the token has to be shared out of band.
    pub fn create_group(&mut self, name: &str, is_public: bool) -> String {
        let token = generate_id(GROUP_TOKEN_LEN);
        let id = if is_public {
            token.clone()
        } else {
            hash_token(&token)
        };

        self.client.status = ClientStatus::Waiting;
        self.group = Some(Group {
            name: name.to_string(),
            id,
            is_public,
            status: GroupStatus::Inactive,
        });

        info!(
            "Created {} group '{}'",
            if is_public { "public" } else { "private" },
            name
        );
        token
    }

    /// Join the first visible group opened by `token`. `None` if no peer
    /// advertises a matching group.
    pub fn join_group(&mut self, token: &str, registry: &PeerRegistry) -> Option<Group> {
        let group = Self::groups(registry)
            .into_iter()
            .find(|g| g.matches_token(token))?;

        self.client.status = ClientStatus::Waiting;
        self.group = Some(group.clone());
        info!("Joined group '{}'", group.name);
        Some(group)
    }

    pub fn leave_group(&mut self) {
        if let Some(group) = self.group.take() {
            info!("Left group '{}'", group.name);
        }
        self.client.status = ClientStatus::Idling;
    }

    /// Distinct groups advertised by peers, in first-seen order.
    ///
    /// Dedup is by full value, so the same group seen as both active and
    /// inactive is listed twice. Private groups are listed as well; their
    /// token is still required to join.
    pub fn groups(registry: &PeerRegistry) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for group in registry.list().iter().filter_map(|p| p.group.as_ref()) {
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }
        groups
    }
}
