//! Finalization pipeline
//!
//! Runs once per call after it reached a terminal state. Every step is
//! best-effort: a failed upload or name lookup degrades the record, it never
//! prevents it from being emitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    CallDetailRecord, CallRecordStore, CdrMetadata, FinalStatus, IdentityLookup, NameSource,
};
use crate::call::{Call, CallState, TerminalState};
use crate::media::{AudioConverter, RecordingSession};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves the local party's display name: explicit, cached, remote, unknown
pub struct NameResolver {
    explicit: Option<String>,
    cache: Mutex<HashMap<String, String>>,
    lookup: Option<Arc<dyn IdentityLookup>>,
}

impl NameResolver {
    pub fn new(explicit: Option<String>, lookup: Option<Arc<dyn IdentityLookup>>) -> Self {
        Self {
            explicit: explicit.filter(|name| !name.trim().is_empty()),
            cache: Mutex::new(HashMap::new()),
            lookup,
        }
    }

    pub async fn resolve(&self, extension: &str) -> (String, NameSource) {
        if let Some(name) = &self.explicit {
            return (name.clone(), NameSource::Explicit);
        }

        let cached = self
            .cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(extension).cloned());
        if let Some(name) = cached {
            return (name, NameSource::Cache);
        }

        if let Some(lookup) = &self.lookup {
            match tokio::time::timeout(LOOKUP_TIMEOUT, lookup.lookup_display_name(extension)).await
            {
                Ok(Ok(Some(name))) => {
                    if let Ok(mut cache) = self.cache.lock() {
                        cache.insert(extension.to_string(), name.clone());
                    }
                    return (name, NameSource::Remote);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::warn!("Display name lookup for {} failed: {}", extension, e),
                Err(_) => tracing::warn!("Display name lookup for {} timed out", extension),
            }
        }

        ("unknown".to_string(), NameSource::Unknown)
    }
}

/// Builds the record of a finished call. The extension is passed per call
/// since credentials can change between calls.
pub struct Finalizer {
    store: Arc<dyn CallRecordStore>,
    names: NameResolver,
}

impl Finalizer {
    pub fn new(store: Arc<dyn CallRecordStore>, names: NameResolver) -> Self {
        Self {
            store,
            names,
        }
    }

    /// Stop the recorder, upload the artifact, build and post the record
    pub async fn finalize(
        &self,
        extension: &str,
        call: Call,
        recorder: Option<RecordingSession>,
    ) -> CallDetailRecord {
        let call_id = call.handle.to_string();

        let (chunks, sample_rate, channels) = match recorder {
            Some(mut recorder) => {
                let chunks = recorder.stop().await;
                let mixer = recorder.mixer();
                (chunks, mixer.sample_rate(), mixer.channels())
            }
            None => (Vec::new(), 8000, 1),
        };

        let mut recording_error = None;
        let recording_url = if chunks.is_empty() {
            None
        } else {
            let uploaded = match AudioConverter::chunks_to_wav(&chunks, sample_rate, channels) {
                Ok(wav) => self
                    .store
                    .upload_recording(&call_id, wav)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match uploaded {
                Ok(url) => {
                    tracing::info!("Recording for call {} uploaded: {}", call_id, url);
                    Some(url)
                }
                Err(e) => {
                    tracing::warn!("Recording for call {} not uploaded: {}", call_id, e);
                    recording_error = Some(e);
                    None
                }
            }
        };

        let (display_name, display_name_source) = self.names.resolve(extension).await;

        let terminal = match call.state() {
            CallState::Terminal(terminal) => terminal,
            other => {
                tracing::warn!("Finalizing call {} in non-terminal state {}", call_id, other);
                TerminalState::Terminated
            }
        };
        let end_time = call.end_time.unwrap_or(call.start_time);

        let cdr = CallDetailRecord {
            call_id: call_id.clone(),
            extension: extension.to_string(),
            peer: call.peer.clone(),
            direction: call.direction,
            final_status: FinalStatus::for_call(terminal, call.answer_time.is_some()),
            terminal_state: terminal.label().to_string(),
            start_time: call.start_time,
            answer_time: call.answer_time,
            end_time,
            duration_seconds: call.duration_seconds(),
            cause: call.cause.clone(),
            recording_url,
            metadata: CdrMetadata {
                display_name,
                display_name_source,
                peer_display_name: call.peer_display_name.clone(),
                recording_chunks: chunks.len(),
                recording_error,
            },
        };

        match self.store.submit_cdr(&cdr).await {
            Ok(()) => tracing::info!(
                "CDR for call {} submitted ({:?}, {}s)",
                call_id,
                cdr.final_status,
                cdr.duration_seconds.unwrap_or(0)
            ),
            Err(e) => tracing::error!("CDR for call {} not submitted: {}", call_id, e),
        }

        cdr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::ApiError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        calls: AtomicUsize,
        answer: Result<Option<String>, ApiError>,
    }

    #[async_trait::async_trait]
    impl IdentityLookup for CountingLookup {
        async fn lookup_display_name(&self, _: &str) -> Result<Option<String>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn lookup(answer: Result<Option<String>, ApiError>) -> Arc<CountingLookup> {
        Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            answer,
        })
    }

    #[tokio::test]
    async fn test_explicit_name_wins() {
        let remote = lookup(Ok(Some("Remote Name".into())));
        let names = NameResolver::new(Some("Front Desk".into()), Some(remote.clone()));
        assert_eq!(
            names.resolve("1001").await,
            ("Front Desk".to_string(), NameSource::Explicit)
        );
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_name_is_cached() {
        let remote = lookup(Ok(Some("Front Desk".into())));
        let names = NameResolver::new(Some("  ".into()), Some(remote.clone()));

        assert_eq!(names.resolve("1001").await.1, NameSource::Remote);
        assert_eq!(
            names.resolve("1001").await,
            ("Front Desk".to_string(), NameSource::Cache)
        );
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_through_to_unknown() {
        let names = NameResolver::new(None, Some(lookup(Err(ApiError::Unauthorized))));
        assert_eq!(
            names.resolve("1001").await,
            ("unknown".to_string(), NameSource::Unknown)
        );

        let names = NameResolver::new(None, None);
        assert_eq!(names.resolve("1001").await.1, NameSource::Unknown);
    }
}
