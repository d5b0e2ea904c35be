//! Local audio and call recording
//!
//! - `MediaDevices` hands out the local audio endpoint of a call
//! - `RecordingSession` mixes the call's tracks into PCM chunks
//! - `AudioConverter` turns the chunks into the uploaded WAV artifact

mod audio_converter;
mod audio_mixer;
mod recorder;

pub use audio_converter::AudioConverter;
pub use audio_mixer::{AudioMixer, MixMode};
pub use recorder::{RecorderState, RecordingSession};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::sip::{G711Codec, RtpPortAllocator, RtpSession, SipConfig};

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media acquisition failed: {0}")]
    Acquisition(String),

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// The local audio endpoint of one call.
///
/// Cloning shares the underlying session; `release` stops it for everyone.
#[derive(Clone, Default)]
pub struct LocalMedia {
    rtp: Option<Arc<RtpSession>>,
}

impl LocalMedia {
    pub fn with_rtp(rtp: Arc<RtpSession>) -> Self {
        Self { rtp: Some(rtp) }
    }

    /// Media with no network endpoint, used by transports that carry their own
    pub fn detached() -> Self {
        Self { rtp: None }
    }

    pub fn rtp(&self) -> Option<Arc<RtpSession>> {
        self.rtp.clone()
    }

    /// Where the caller's microphone frames go; none for detached media
    pub fn audio_input(&self) -> Option<mpsc::Sender<Vec<i16>>> {
        self.rtp.as_ref().map(|rtp| rtp.audio_input())
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(rtp) = &self.rtp {
            rtp.set_muted(muted);
        }
    }

    pub fn release(&self) {
        if let Some(rtp) = &self.rtp {
            rtp.stop();
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("rtp_port", &self.rtp.as_ref().map(|rtp| rtp.local_port()))
            .finish()
    }
}

/// Source of local audio for new calls
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;
}

/// Binds one RTP session per call from the configured port range
pub struct RtpMediaDevices {
    ports: RtpPortAllocator,
    codec: G711Codec,
}

impl RtpMediaDevices {
    pub fn new(config: &SipConfig) -> Self {
        Self {
            ports: RtpPortAllocator::new(config.rtp_port_start, config.rtp_port_end),
            codec: G711Codec::new(config.codec),
        }
    }
}

#[async_trait::async_trait]
impl MediaDevices for RtpMediaDevices {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        let port = self.ports.allocate();
        let rtp = RtpSession::bind(port, self.codec)
            .await
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;
        tracing::debug!("Local audio bound on RTP port {}", rtp.local_port());
        Ok(LocalMedia::with_rtp(Arc::new(rtp)))
    }
}
