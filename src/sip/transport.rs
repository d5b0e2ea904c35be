//! Signaling transport seam
//!
//! The call core never talks SIP directly. It drives a `SignalingTransport`
//! and consumes the typed `SignalingEvent`s the transport publishes. Session
//! state is exposed as an explicit tagged union so the reconciliation loop
//! can ask "what does the network think" directly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::config::Credentials;
use super::rtp::AudioFrame;
use super::SipError;
use crate::media::LocalMedia;

/// Opaque handle of one signaling session (one call attempt)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle(String);

impl CallHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CallHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a session ended, as reported by the signaling library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Graceful BYE from either side
    Bye,
    /// INVITE cancelled before answer
    Cancelled,
    /// Final non-2xx response to our INVITE (busy, decline, not found...)
    Rejected(u16),
    /// Generic end of dialog without more detail
    Ended,
    /// Protocol or negotiation failure
    Failed(String),
    /// Transport-level teardown (connection / ICE loss)
    Terminated(String),
}

impl EndReason {
    /// Cause string carried into the call-detail record
    pub fn cause(&self) -> String {
        match self {
            EndReason::Bye => "bye".to_string(),
            EndReason::Cancelled => "cancel".to_string(),
            EndReason::Rejected(code) => format!("rejected:{}", code),
            EndReason::Ended => "ended".to_string(),
            EndReason::Failed(reason) => format!("failed:{}", reason),
            EndReason::Terminated(reason) => format!("terminated:{}", reason),
        }
    }
}

/// Connectivity of the media path underneath a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    /// Temporarily lost; the library is expected to recover on its own
    Disconnected,
    /// Negotiation or connection failed for good
    Failed,
}

/// Which way audio flows on a track, from the local party's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackDirection {
    /// Audio we send (microphone side)
    Local,
    /// Audio we receive from the peer
    Remote,
}

/// A decoded audio track of a session
#[derive(Debug)]
pub struct MediaTrack {
    pub id: String,
    pub direction: TrackDirection,
    pub frames: mpsc::Receiver<AudioFrame>,
}

impl MediaTrack {
    pub fn new(
        id: impl Into<String>,
        direction: TrackDirection,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            frames,
        }
    }
}

/// Per-session event published by the transport
#[derive(Debug)]
pub enum SessionEvent {
    /// Provisional response (180 Ringing / 183 Session Progress)
    Progress,
    /// The INVITE was answered (2xx) or our answer was sent
    Accepted,
    /// The dialog is confirmed (ACK exchanged)
    Confirmed,
    /// A media track became available
    TrackAdded(MediaTrack),
    /// Media path connectivity changed
    Connectivity(ConnectivityState),
    /// The session ended
    Ended(EndReason),
}

/// Event published by the transport to the agent
#[derive(Debug)]
pub enum SignalingEvent {
    Registered,
    RegistrationFailed(String),
    Unregistered,
    IncomingCall {
        handle: CallHandle,
        from: String,
        display_name: Option<String>,
    },
    Session {
        handle: CallHandle,
        event: SessionEvent,
    },
}

/// Authoritative session state as the signaling library sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The transport has no record of the handle
    Unknown,
    /// INVITE sent or received, no provisional response yet
    Pending,
    /// Provisional response seen / ringing
    Ringing,
    /// Answered and not yet ended
    Established,
    /// Ended for the given reason
    Ended(EndReason),
}

/// The black-box signaling library as the call core needs it
#[async_trait::async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Register the extension the transport was built for
    async fn register(&self) -> Result<(), SipError>;

    /// Drop the registration
    async fn unregister(&self) -> Result<(), SipError>;

    /// Place an INVITE to `target` (digits only) under the caller-chosen handle
    async fn invite(&self, handle: &CallHandle, target: &str, media: &LocalMedia)
        -> Result<(), SipError>;

    /// Answer a ringing inbound session
    async fn answer(&self, handle: &CallHandle, media: &LocalMedia) -> Result<(), SipError>;

    /// Decline a ringing inbound session
    async fn reject(&self, handle: &CallHandle) -> Result<(), SipError>;

    /// End the session whatever its phase (CANCEL before answer, BYE after)
    async fn terminate(&self, handle: &CallHandle) -> Result<(), SipError>;

    /// Put the session on / off hold
    async fn set_hold(&self, handle: &CallHandle, on_hold: bool) -> Result<(), SipError>;

    /// Current session state
    fn session_state(&self, handle: &CallHandle) -> SessionState;

    /// Hand over the session's audio tracks; each track is handed out once
    fn take_tracks(&self, handle: &CallHandle) -> Vec<MediaTrack>;

    /// Forget the session and free its media. A session that has not ended
    /// yet is torn down first. Unknown handles are ignored.
    async fn release(&self, handle: &CallHandle);

    /// Hang up everything and stop the stack
    async fn shutdown(&self);
}

/// Builds a transport for a credential set
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        credentials: &Credentials,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Arc<dyn SignalingTransport>;
}
