//! Platform session backed by the `webrtc` crate

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::types::{
    DataChannel, SdpKind, SessionBackend, SessionDescription, SessionEvent, SessionEvents,
    SessionFactory, TransportState,
};

/// Opens `RTCPeerConnection`s configured with the given STUN servers
pub struct WebRtcSessionFactory {
    stun_servers: Vec<String>,
}

impl WebRtcSessionFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn open(&self, events: SessionEvents) -> Result<Arc<dyn SessionBackend>> {
        // Create a MediaEngine and register default codecs
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        // Create peer connection
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let session = WebRtcSession { pc, events };
        session.setup_handlers();

        Ok(Arc::new(session))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: SessionEvents,
}

impl WebRtcSession {
    fn setup_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let candidate = match candidate {
                        Some(c) => match c.to_json() {
                            Ok(init) => Some(serde_json::to_value(&init).unwrap_or_default()),
                            Err(e) => {
                                debug!("Dropping unserializable candidate: {}", e);
                                return;
                            }
                        },
                        None => None,
                    };
                    let _ = events.send(SessionEvent::Candidate(candidate));
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let _ = events.send(SessionEvent::StateChange(transport_state(state)));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    debug!("Received data channel: {}", dc.label());
                    setup_channel_handlers(dc, events);
                })
            }));
    }
}

/// Report open and text messages of `dc` as session events
fn setup_channel_handlers(dc: Arc<RTCDataChannel>, events: SessionEvents) {
    let label = dc.label().to_string();

    let dc_for_open = dc.clone();
    let events_open = events.clone();
    dc.on_open(Box::new(move || {
        let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel {
            label: dc_for_open.label().to_string(),
            dc: dc_for_open.clone(),
        });
        let _ = events_open.send(SessionEvent::ChannelOpen(channel));
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        let label = label.clone();
        Box::pin(async move {
            if !msg.is_string {
                trace!("Ignoring {} binary bytes on '{}'", msg.data.len(), label);
                return;
            }
            if let Ok(text) = String::from_utf8(msg.data.to_vec()) {
                let _ = events.send(SessionEvent::ChannelMessage { label, text });
            }
        })
    }));
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn from_rtc(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        _ => SdpKind::Answer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

#[async_trait]
impl SessionBackend for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(from_rtc(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc(&answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(|d| from_rtc(&d))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self.pc.create_data_channel(label, None).await?;
        setup_channel_handlers(dc.clone(), self.events.clone());
        Ok(Arc::new(WebRtcChannel {
            label: label.to_string(),
            dc,
        }))
    }

    fn transport_state(&self) -> TransportState {
        transport_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
