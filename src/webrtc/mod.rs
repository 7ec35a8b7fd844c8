//! Direct peer sessions
//!
//! [`SessionNegotiator`] runs the offer/answer exchange and the
//! candidate-gathering barrier over any [`SessionFactory`];
//! [`WebRtcSessionFactory`] provides sessions from the `webrtc` crate.

mod negotiator;
mod peer;
mod types;


pub use negotiator::SessionNegotiator;
pub use peer::WebRtcSessionFactory;
pub use types::{
    DataChannel, NegotiationState, PeerEvent, SdpKind, SessionBackend, SessionDescription,
    SessionEvent, SessionEvents, SessionFactory, TransportState, DEFAULT_CHANNEL,
    DEFAULT_GATHER_TIMEOUT,
};
