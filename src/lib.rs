pub mod config;
pub mod error;
pub mod relay;
pub mod rendezvous;
pub mod webrtc;

pub use config::Config;
pub use error::{Error, Result};
pub use rendezvous::{NodeHandle, RendezvousNode};
