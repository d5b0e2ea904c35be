//! Call-detail records and the finalization pipeline
//!
//! Exactly one `CallDetailRecord` is produced per call. The record store and
//! identity lookup are external HTTP collaborators reached through
//! `ApiClient`.

mod client;
mod finalize;

pub use client::{ApiClient, ApiError};
pub use finalize::{Finalizer, NameResolver};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{Direction, TerminalState};

/// Outcome reported to the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Completed,
    Failed,
    Terminated,
}

impl FinalStatus {
    /// Answered calls that ended or were torn down count as completed;
    /// failures and no-answers are failed; anything else unanswered is
    /// terminated.
    pub fn for_call(terminal: TerminalState, answered: bool) -> Self {
        match (terminal, answered) {
            (TerminalState::Failed | TerminalState::NoAnswer, _) => FinalStatus::Failed,
            (TerminalState::Ended | TerminalState::Terminated, true) => FinalStatus::Completed,
            (TerminalState::Ended | TerminalState::Terminated, false) => FinalStatus::Terminated,
        }
    }
}

/// Where the local display name came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameSource {
    Explicit,
    Cache,
    Remote,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrMetadata {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "displayNameSource")]
    pub display_name_source: NameSource,
    #[serde(rename = "peerDisplayName")]
    pub peer_display_name: Option<String>,
    #[serde(rename = "recordingChunks")]
    pub recording_chunks: usize,
    #[serde(rename = "recordingError")]
    pub recording_error: Option<String>,
}

/// Finalized record of one call; write-once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDetailRecord {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub extension: String,
    pub peer: String,
    pub direction: Direction,
    #[serde(rename = "finalStatus")]
    pub final_status: FinalStatus,
    /// Terminal state label, keeps no-answer distinct from other failures
    #[serde(rename = "terminalState")]
    pub terminal_state: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "answerTime")]
    pub answer_time: Option<DateTime<Utc>>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: Option<i64>,
    pub cause: Option<String>,
    #[serde(rename = "recordingUrl")]
    pub recording_url: Option<String>,
    pub metadata: CdrMetadata,
}

/// Write side of the record-storage backend
#[async_trait::async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Upload a WAV artifact, returning its URL
    async fn upload_recording(&self, call_id: &str, wav: Vec<u8>) -> Result<String, ApiError>;

    async fn submit_cdr(&self, cdr: &CallDetailRecord) -> Result<(), ApiError>;
}

/// Remote directory of extension display names
#[async_trait::async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn lookup_display_name(&self, extension: &str) -> Result<Option<String>, ApiError>;
}
