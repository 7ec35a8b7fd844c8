//! In-memory session backend shared by the integration tests.
//!
//! Sessions on one [`MockNetwork`] find each other through their descriptions
//! (`mock:<session>`). Once both ends have committed a local and a remote
//! description the pair is linked: each side sees its transport connect and
//! a channel open, and text sent on either channel arrives at the other.

#![allow(dead_code)]

use async_trait::async_trait;
use peerlink::rendezvous::{Client, ClientStatus, NodeHandle, NodeSnapshot};
use peerlink::webrtc::{
    DataChannel, SessionBackend, SessionDescription, SessionEvent, SessionEvents, SessionFactory,
    TransportState, DEFAULT_CHANNEL,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    sessions: HashMap<u64, Arc<MockSession>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions opened so far
    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Sessions that have been closed
    pub fn closed_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.state() == TransportState::Closed)
            .count()
    }

    fn session(&self, id: u64) -> Option<Arc<MockSession>> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    /// Connect `id` with its remote end if both have finished their exchange
    fn try_link(&self, id: u64) {
        let state = self.inner.lock().unwrap();
        let Some(local) = state.sessions.get(&id) else {
            return;
        };
        let Some(remote_id) = local.linkable() else {
            return;
        };
        let Some(remote) = state.sessions.get(&remote_id) else {
            return;
        };
        if remote.linkable() != Some(id) {
            return;
        }
        if local.state() == TransportState::Connected || remote.state() == TransportState::Connected
        {
            return;
        }

        for session in [local, remote] {
            session.set_state(TransportState::Connected);
            let _ = session
                .events
                .send(SessionEvent::StateChange(TransportState::Connected));
            let _ = session.events.send(SessionEvent::ChannelOpen(Arc::new(MockChannel {
                label: DEFAULT_CHANNEL.to_string(),
                owner: session.id,
                network: self.clone(),
            })));
        }
    }
}

#[async_trait]
impl SessionFactory for MockNetwork {
    async fn open(&self, events: SessionEvents) -> anyhow::Result<Arc<dyn SessionBackend>> {
        let mut state = self.inner.lock().unwrap();
        state.next_id += 1;
        let session = Arc::new(MockSession {
            id: state.next_id,
            network: self.clone(),
            events,
            local: Mutex::new(None),
            remote_peer: Mutex::new(None),
            state: Mutex::new(TransportState::New),
        });
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }
}

pub struct MockSession {
    id: u64,
    network: MockNetwork,
    events: SessionEvents,
    local: Mutex<Option<SessionDescription>>,
    remote_peer: Mutex<Option<u64>>,
    state: Mutex<TransportState>,
}

impl MockSession {
    fn description(&self) -> String {
        format!("mock:{}", self.id)
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().unwrap() = state;
    }

    /// Remote session id, once both descriptions are committed
    fn linkable(&self) -> Option<u64> {
        if self.local.lock().unwrap().is_none() || self.state() == TransportState::Closed {
            return None;
        }
        *self.remote_peer.lock().unwrap()
    }
}

#[async_trait]
impl SessionBackend for MockSession {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer(self.description()))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        if self.remote_peer.lock().unwrap().is_none() {
            anyhow::bail!("No remote offer");
        }
        Ok(SessionDescription::answer(self.description()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        *self.local.lock().unwrap() = Some(desc);

        let _ = self.events.send(SessionEvent::Candidate(Some(serde_json::json!({
            "candidate": format!(
                "candidate:{} 1 UDP 2130706431 127.0.0.1 {} typ host",
                self.id,
                50000 + self.id
            ),
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))));
        let _ = self.events.send(SessionEvent::Candidate(None));

        self.network.try_link(self.id);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        let peer = desc
            .sdp
            .strip_prefix("mock:")
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| anyhow::anyhow!("Not a mock description: {}", desc.sdp))?;
        *self.remote_peer.lock().unwrap() = Some(peer);

        self.network.try_link(self.id);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn create_data_channel(&self, label: &str) -> anyhow::Result<Arc<dyn DataChannel>> {
        // On a linked pair the remote end learns about the channel right away
        if self.state() == TransportState::Connected {
            let remote_id = *self.remote_peer.lock().unwrap();
            let remote = remote_id.and_then(|id| self.network.session(id));
            if let Some(remote) = remote {
                let _ = remote.events.send(SessionEvent::ChannelOpen(Arc::new(MockChannel {
                    label: label.to_string(),
                    owner: remote.id,
                    network: self.network.clone(),
                })));
            }
        }

        Ok(Arc::new(MockChannel {
            label: label.to_string(),
            owner: self.id,
            network: self.network.clone(),
        }))
    }

    fn transport_state(&self) -> TransportState {
        self.state()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.set_state(TransportState::Closed);
        Ok(())
    }
}

/// Channel that hands text to whichever session its owner is linked with
pub struct MockChannel {
    label: String,
    owner: u64,
    network: MockNetwork,
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        let owner = self
            .network
            .session(self.owner)
            .ok_or_else(|| anyhow::anyhow!("Unknown session"))?;
        let remote_id = (*owner.remote_peer.lock().unwrap())
            .ok_or_else(|| anyhow::anyhow!("Channel not linked"))?;
        let remote = self
            .network
            .session(remote_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown remote session"))?;
        if remote.state() != TransportState::Connected {
            anyhow::bail!("Remote session is {:?}", remote.state());
        }

        remote
            .events
            .send(SessionEvent::ChannelMessage {
                label: self.label.clone(),
                text,
            })
            .map_err(|_| anyhow::anyhow!("Remote session gone"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Client with a fixed id, so tie-breaks are predictable
pub fn client(id: &str, name: &str) -> Client {
    Client {
        id: id.to_string(),
        name: name.to_string(),
        status: ClientStatus::Idling,
    }
}

/// Poll the node until `check` holds on its snapshot
pub async fn wait_for_snapshot(
    node: &NodeHandle,
    what: &str,
    check: impl Fn(&NodeSnapshot) -> bool,
) -> NodeSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = node.snapshot().await.expect("node stopped");
        if check(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {}: {:?}", what, snapshot);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
