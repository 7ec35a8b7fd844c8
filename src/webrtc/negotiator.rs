//! Offer/answer negotiation over one platform session

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tracing::{debug, info, trace, warn};

use super::types::{
    DataChannel, NegotiationState, PeerEvent, SdpKind, SessionBackend, SessionDescription,
    SessionEvent, SessionFactory, TransportState, DEFAULT_CHANNEL,
};
use crate::error::{Error, Result};
use crate::rendezvous::types::short;

struct Inner {
    peer_id: String,
    factory: Arc<dyn SessionFactory>,
    backend: OnceCell<Arc<dyn SessionBackend>>,
    state: watch::Sender<NegotiationState>,
    gathered: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    channels: Mutex<HashMap<String, Arc<dyn DataChannel>>>,
    transport_connected: AtomicBool,
    channel_open: AtomicBool,
    local_candidates: AtomicUsize,
    gather_timeout: Duration,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
}

/// Drives one peer session through offer/answer and the candidate-gathering
/// barrier. Cheap to clone; clones share the session.
///
/// The platform session is opened lazily by the first `create_offer`,
/// `create_answer` or `create_channel`.
#[derive(Clone)]
pub struct SessionNegotiator {
    inner: Arc<Inner>,
}

impl SessionNegotiator {
    pub fn new(
        peer_id: impl Into<String>,
        factory: Arc<dyn SessionFactory>,
        gather_timeout: Duration,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::New);
        let (gathered, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                peer_id: peer_id.into(),
                factory,
                backend: OnceCell::new(),
                state,
                gathered,
                closed,
                channels: Mutex::new(HashMap::new()),
                transport_connected: AtomicBool::new(false),
                channel_open: AtomicBool::new(false),
                local_candidates: AtomicUsize::new(0),
                gather_timeout,
                peer_events,
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn state(&self) -> NegotiationState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NegotiationState::Connected
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Whether the "no more candidates" terminator has been seen
    pub fn gathering_complete(&self) -> bool {
        *self.inner.gathered.borrow()
    }

    pub fn local_candidates(&self) -> usize {
        self.inner.local_candidates.load(Ordering::Relaxed)
    }

    /// Create and commit a local offer, then wait for candidate gathering to
    /// finish before handing the description out.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.transition(&[NegotiationState::New], NegotiationState::LocalOfferPending)?;
        // The default channel has to exist before the offer so it is negotiated
        self.create_channel(DEFAULT_CHANNEL).await?;
        let backend = self.backend().await?;

        let offer = backend.create_offer().await?;
        // Committing the offer starts candidate gathering
        backend.set_local_description(offer.clone()).await?;
        self.wait_for_candidates().await?;

        // Prefer the committed description, which now lists the candidates
        let local = backend.local_description().await.unwrap_or(offer);
        self.transition(
            &[NegotiationState::LocalOfferPending],
            NegotiationState::LocalOfferReady,
        )?;

        debug!(
            "Offer for {} ready with {} candidates",
            short(self.peer_id()),
            self.local_candidates()
        );
        Ok(local)
    }

    /// Commit a remote offer and produce the local answer. The answer is
    /// returned only after candidate gathering has finished.
    pub async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(Error::Session(anyhow::anyhow!(
                "Expected an offer, got {:?}",
                offer.kind
            )));
        }
        self.expect(&[NegotiationState::New])?;
        let backend = self.backend().await?;

        backend.set_remote_description(offer).await?;
        self.transition(&[NegotiationState::New], NegotiationState::RemoteOfferSet)?;
        self.transition(
            &[NegotiationState::RemoteOfferSet],
            NegotiationState::LocalAnswerPending,
        )?;

        // Gathering only starts once the answer is committed
        let answer = backend.create_answer().await?;
        backend.set_local_description(answer.clone()).await?;
        self.wait_for_candidates().await?;

        let local = backend.local_description().await.unwrap_or(answer);
        self.transition(
            &[NegotiationState::LocalAnswerPending],
            NegotiationState::LocalAnswerReady,
        )?;
        self.inner.promote_if_connected();

        debug!(
            "Answer for {} ready with {} candidates",
            short(self.peer_id()),
            self.local_candidates()
        );
        Ok(local)
    }

    /// Commit the remote answer on the offering side
    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.kind != SdpKind::Answer {
            return Err(Error::Session(anyhow::anyhow!(
                "Expected an answer, got {:?}",
                answer.kind
            )));
        }
        self.expect(&[NegotiationState::LocalOfferReady])?;
        let backend = self.backend().await?;

        backend.set_remote_description(answer).await?;
        self.transition(&[NegotiationState::LocalOfferReady], NegotiationState::RemoteSet)?;
        self.inner.promote_if_connected();
        Ok(())
    }

    /// Open a named data channel on this session. Replaces a channel of the
    /// same label.
    pub async fn create_channel(&self, label: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let backend = self.backend().await?;
        let channel = backend.create_data_channel(label).await?;

        let previous = self
            .inner
            .channels
            .lock()
            .await
            .insert(label.to_string(), channel);
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }
        debug!("[Peer {}] Created channel '{}'", short(self.peer_id()), label);
        Ok(())
    }

    /// Labels of the channels currently held, sorted
    pub async fn channels(&self) -> Vec<String> {
        let mut labels: Vec<String> =
            self.inner.channels.lock().await.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Send on the default channel. Returns whether the text went out; a
    /// missing channel or unconnected session drops it silently.
    pub async fn send(&self, text: &str) -> bool {
        self.send_on(DEFAULT_CHANNEL, text).await
    }

    pub async fn send_on(&self, label: &str, text: &str) -> bool {
        let Some(backend) = self.inner.backend.get() else {
            return false;
        };
        if self.is_closed() || backend.transport_state() != TransportState::Connected {
            return false;
        }

        let channel = self.inner.channels.lock().await.get(label).cloned();
        let Some(channel) = channel else {
            return false;
        };

        match channel.send_text(text.to_string()).await {
            Ok(()) => true,
            Err(e) => {
                debug!("[Peer {}] Send on '{}' failed: {}", short(self.peer_id()), label, e);
                false
            }
        }
    }

    /// Close every channel, then the session. Cancels a pending gathering
    /// wait. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        self.inner.state.send_replace(NegotiationState::Closed);

        // Channels first, then the session

        let channels: Vec<_> = self
            .inner
            .channels
            .lock()
            .await
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            if let Err(e) = channel.close().await {
                debug!(
                    "[Peer {}] Channel '{}' close: {}",
                    short(self.peer_id()),
                    channel.label(),
                    e
                );
            }
        }

        if let Some(backend) = self.inner.backend.get() {
            if let Err(e) = backend.close().await {
                debug!("[Peer {}] Session close: {}", short(self.peer_id()), e);
            }
        }

        info!("Closed session with {}", short(self.peer_id()));
    }

    async fn backend(&self) -> Result<Arc<dyn SessionBackend>> {
        let inner = &self.inner;
        let backend = inner
            .backend
            .get_or_try_init(|| async {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let backend = inner.factory.open(events_tx).await?;
                tokio::spawn(pump(Arc::downgrade(inner), events_rx, inner.closed.subscribe()));
                Ok::<_, Error>(backend)
            })
            .await?
            .clone();

        // Closed while the session was opening
        if self.is_closed() {
            let _ = backend.close().await;
            return Err(Error::Closed);
        }
        Ok(backend)
    }

    async fn wait_for_candidates(&self) -> Result<()> {
        let mut gathered = self.inner.gathered.subscribe();
        let mut closed = self.inner.closed.subscribe();

        let barrier = async {
            tokio::select! {
                _ = closed.wait_for(|c| *c) => Err(Error::Closed),
                done = gathered.wait_for(|g| *g) => {
                    if done.is_ok() { Ok(()) } else { Err(Error::Closed) }
                }
            }
        };

        match tokio::time::timeout(self.inner.gather_timeout, barrier).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "[Peer {}] Candidate gathering timed out after {:?}",
                    short(self.peer_id()),
                    self.inner.gather_timeout
                );
                Err(Error::GatheringTimeout(self.inner.gather_timeout))
            }
        }
    }

    fn expect(&self, allowed: &[NegotiationState]) -> Result<()> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else if current == NegotiationState::Closed {
            Err(Error::Closed)
        } else {
            Err(Error::InvalidState {
                expected: allowed[0],
                found: current,
            })
        }
    }

    fn transition(&self, from: &[NegotiationState], to: NegotiationState) -> Result<()> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                result = Err(if *state == NegotiationState::Closed {
                    Error::Closed
                } else {
                    Error::InvalidState {
                        expected: from[0],
                        found: *state,
                    }
                });
                false
            }
        });
        if result.is_ok() {
            trace!("[Peer {}] -> {}", short(self.peer_id()), to);
        }
        result
    }
}

impl Inner {
    fn handle_event(&self, event: SessionEvent) -> Option<Arc<dyn DataChannel>> {
        match event {
            SessionEvent::Candidate(Some(_)) => {
                self.local_candidates.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::Candidate(None) => {
                trace!("[Peer {}] Candidate gathering complete", short(&self.peer_id));
                self.gathered.send_replace(true);
            }
            SessionEvent::StateChange(state) => {
                debug!("[Peer {}] Transport state: {:?}", short(&self.peer_id), state);
                self.transport_connected
                    .store(state == TransportState::Connected, Ordering::Relaxed);
                if state == TransportState::Failed {
                    let _ = self.peer_events.send(PeerEvent::Failed {
                        peer: self.peer_id.clone(),
                        reason: "transport failed".to_string(),
                    });
                }
                self.promote_if_connected();
            }
            SessionEvent::ChannelOpen(channel) => {
                info!("[Peer {}] Data channel '{}' open", short(&self.peer_id), channel.label());
                return Some(channel);
            }
            SessionEvent::ChannelMessage { label, text } => {
                trace!("[Peer {}] Received on '{}': {}", short(&self.peer_id), label, text);
                let _ = self.peer_events.send(PeerEvent::Message {
                    peer: self.peer_id.clone(),
                    label,
                    text,
                });
            }
        }
        None
    }

    /// Enter `Connected` once the transport is up and a channel is open,
    /// but only after the local side has finished its half of the exchange
    fn promote_if_connected(&self) {
        if !self.transport_connected.load(Ordering::Relaxed)
            || !self.channel_open.load(Ordering::Relaxed)
        {
            return;
        }

        let promoted = self.state.send_if_modified(|state| {
            if matches!(
                state,
                NegotiationState::RemoteSet | NegotiationState::LocalAnswerReady
            ) {
                *state = NegotiationState::Connected;
                true
            } else {
                false
            }
        });

        if promoted {
            info!("Session with {} connected", short(&self.peer_id));
            let _ = self.peer_events.send(PeerEvent::Connected {
                peer: self.peer_id.clone(),
            });
        }
    }
}

/// Feed platform events into the negotiator until it closes or is dropped
async fn pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Some(channel) = inner.handle_event(event) {
            inner
                .channels
                .lock()
                .await
                .insert(channel.label().to_string(), channel);
            inner.channel_open.store(true, Ordering::Relaxed);
            inner.promote_if_connected();
        }
    }
}
