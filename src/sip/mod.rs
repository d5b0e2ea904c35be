//! SIP signaling layer for the softphone
//!
//! This module owns everything that talks to the signaling server:
//! - Registration of the extension and the process-wide agent lifecycle
//! - The transport seam (`SignalingTransport`) the call core drives
//! - An rsipstack-backed transport with RTP media
//! - G.711 codec support (PCMU/PCMA)

mod agent;
mod codec;
mod config;
mod rtp;
mod transport;
mod user_agent;

pub use agent::{ListenerBinding, RegistrationStatus, SignalingAgent};
pub use codec::G711Codec;
pub use config::{Credentials, SipCodec, SipConfig, SipTransport};
pub use rtp::{AudioFrame, RtpPortAllocator, RtpSession};
pub use transport::{
    CallHandle, ConnectivityState, EndReason, MediaTrack, SessionEvent, SessionState,
    SignalingEvent, SignalingTransport, TrackDirection, TransportFactory,
};
pub use user_agent::{RsipTransport, RsipTransportFactory};

use thiserror::Error;

/// SIP-related errors
#[derive(Error, Debug, Clone)]
pub enum SipError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Call failed: {0}")]
    CallFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not registered")]
    NotRegistered,

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::Io(err.to_string())
    }
}
