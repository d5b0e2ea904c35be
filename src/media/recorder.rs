//! Chunking call recorder
//!
//! Merges every track of a call into one stream and, on a fixed interval,
//! mixes what was buffered into a PCM chunk (16-bit little endian). Chunks
//! are append-only; `stop` drains whatever is still queued and returns them.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use super::audio_mixer::AudioMixer;
use super::MediaError;
use crate::sip::{AudioFrame, MediaTrack, TrackDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
}

pub struct RecordingSession {
    chunk_interval: Duration,
    mixer: AudioMixer,
    state: RecorderState,
    new_tracks: Option<mpsc::UnboundedSender<MediaTrack>>,
    task: Option<JoinHandle<Vec<Bytes>>>,
    cancel_token: CancellationToken,
}

impl RecordingSession {
    pub fn new(chunk_interval: Duration, mixer: AudioMixer) -> Self {
        Self {
            chunk_interval,
            mixer,
            state: RecorderState::Idle,
            new_tracks: None,
            task: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn mixer(&self) -> &AudioMixer {
        &self.mixer
    }

    /// Start recording `tracks`.
    ///
    /// Returns `Ok(false)` when there is nothing to record or the recorder
    /// already ran; a recorder never starts twice.
    pub fn start(&mut self, tracks: Vec<MediaTrack>) -> Result<bool, MediaError> {
        if self.state != RecorderState::Idle {
            return Ok(false);
        }
        if tracks.is_empty() {
            tracing::debug!("No media tracks yet, recorder not started");
            return Ok(false);
        }
        if self.chunk_interval.is_zero() {
            return Err(MediaError::Recorder("chunk interval must be non-zero".to_string()));
        }

        let (new_tracks_tx, new_tracks_rx) = mpsc::unbounded_channel();
        tracing::info!("Recorder started with {} track(s)", tracks.len());
        self.task = Some(tokio::spawn(record(
            tracks,
            new_tracks_rx,
            self.chunk_interval,
            self.mixer.clone(),
            self.cancel_token.clone(),
        )));
        self.new_tracks = Some(new_tracks_tx);
        self.state = RecorderState::Recording;
        Ok(true)
    }

    /// Feed a track that showed up after recording started
    pub fn add_track(&self, track: MediaTrack) -> bool {
        match (&self.new_tracks, self.state) {
            (Some(tx), RecorderState::Recording) => tx.send(track).is_ok(),
            _ => false,
        }
    }

    /// Stop recording and return every chunk, in order
    pub async fn stop(&mut self) -> Vec<Bytes> {
        self.state = RecorderState::Stopped;
        self.new_tracks = None;
        self.cancel_token.cancel();
        let Some(task) = self.task.take() else {
            return Vec::new();
        };
        match task.await {
            Ok(chunks) => {
                tracing::info!("Recorder stopped with {} chunk(s)", chunks.len());
                chunks
            }
            Err(e) => {
                tracing::error!("Recorder task failed: {}", e);
                Vec::new()
            }
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct TrackBuffer {
    direction: TrackDirection,
    frames: Vec<AudioFrame>,
}

#[derive(Default)]
struct ChunkBuilder {
    buffers: HashMap<String, TrackBuffer>,
    chunks: Vec<Bytes>,
}

impl ChunkBuilder {
    fn register(&mut self, track: &MediaTrack) {
        self.buffers.insert(
            track.id.clone(),
            TrackBuffer {
                direction: track.direction,
                frames: Vec::new(),
            },
        );
    }

    fn push(&mut self, track_id: &str, frame: AudioFrame) {
        if let Some(buffer) = self.buffers.get_mut(track_id) {
            buffer.frames.push(frame);
        }
    }

    fn flush(&mut self, mixer: &AudioMixer) {
        let tracks: Vec<(TrackDirection, Vec<i16>)> = self
            .buffers
            .values_mut()
            .filter(|b| !b.frames.is_empty())
            .map(|b| {
                let mut frames = std::mem::take(&mut b.frames);
                let first = frames[0].sequence;
                frames.sort_by_key(|f| f.sequence.wrapping_sub(first));
                let samples = frames.into_iter().flat_map(|f| f.samples).collect();
                (b.direction, samples)
            })
            .collect();

        let mixed = mixer.mix(&tracks);
        if mixed.is_empty() {
            return;
        }
        let bytes: Vec<u8> = mixed.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.chunks.push(Bytes::from(bytes));
    }
}

async fn record(
    tracks: Vec<MediaTrack>,
    mut new_tracks: mpsc::UnboundedReceiver<MediaTrack>,
    chunk_interval: Duration,
    mixer: AudioMixer,
    token: CancellationToken,
) -> Vec<Bytes> {
    let mut streams = StreamMap::new();
    let mut builder = ChunkBuilder::default();
    for track in tracks {
        builder.register(&track);
        streams.insert(track.id, ReceiverStream::new(track.frames));
    }

    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + chunk_interval, chunk_interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => builder.flush(&mixer),
            Some(track) = new_tracks.recv() => {
                tracing::debug!("Recorder picked up track {}", track.id);
                builder.register(&track);
                streams.insert(track.id, ReceiverStream::new(track.frames));
            }
            Some((track_id, frame)) = streams.next(), if !streams.is_empty() => {
                builder.push(&track_id, frame);
            }
        }
    }

    // Drain what is already queued, then flush the partial chunk
    while let Ok(Some((track_id, frame))) =
        tokio::time::timeout(Duration::ZERO, streams.next()).await
    {
        builder.push(&track_id, frame);
    }
    builder.flush(&mixer);
    builder.chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, direction: TrackDirection) -> (mpsc::Sender<AudioFrame>, MediaTrack) {
        let (tx, rx) = mpsc::channel(64);
        (tx, MediaTrack::new(id, direction, rx))
    }

    fn frame(value: i16, sequence: u16) -> AudioFrame {
        AudioFrame::new(vec![value; 160], sequence as u32 * 160, sequence)
    }

    fn samples(chunk: &Bytes) -> Vec<i16> {
        chunk
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect()
    }

    #[tokio::test]
    async fn test_no_tracks_does_not_start() {
        let mut recorder = RecordingSession::new(Duration::from_secs(1), AudioMixer::default());
        assert!(!recorder.start(Vec::new()).unwrap());
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.stop().await.is_empty());
        assert_eq!(recorder.state(), RecorderState::Stopped);
    }

    #[tokio::test]
    async fn test_starts_at_most_once() {
        let mut recorder = RecordingSession::new(Duration::from_secs(1), AudioMixer::default());
        let (_tx1, first) = track("a", TrackDirection::Remote);
        let (_tx2, second) = track("b", TrackDirection::Remote);

        assert!(recorder.start(vec![first]).unwrap());
        assert!(!recorder.start(vec![second]).unwrap());
        assert_eq!(recorder.state(), RecorderState::Recording);
        recorder.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_every_interval_and_drains_on_stop() {
        let mut recorder = RecordingSession::new(Duration::from_secs(1), AudioMixer::default());
        let (remote_tx, remote) = track("remote", TrackDirection::Remote);
        let (local_tx, local) = track("local", TrackDirection::Local);
        recorder.start(vec![remote, local]).unwrap();

        remote_tx.send(frame(100, 1)).await.unwrap();
        local_tx.send(frame(300, 7)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // Queued right before stop; still lands in the final chunk
        remote_tx.send(frame(1000, 2)).await.unwrap();
        let chunks = recorder.stop().await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(samples(&chunks[0]), vec![200; 160]);
        assert_eq!(samples(&chunks[1]), vec![1000; 160]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_track_is_recorded() {
        let mut recorder = RecordingSession::new(Duration::from_secs(1), AudioMixer::default());
        let (_remote_tx, remote) = track("remote", TrackDirection::Remote);
        recorder.start(vec![remote]).unwrap();

        let (local_tx, local) = track("local", TrackDirection::Local);
        assert!(recorder.add_track(local));
        tokio::task::yield_now().await;
        local_tx.send(frame(42, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let chunks = recorder.stop().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(samples(&chunks[0]), vec![42; 160]);
    }

    #[test]
    fn test_flush_orders_frames_across_sequence_wrap() {
        let mut builder = ChunkBuilder::default();
        let (_tx, t) = track("remote", TrackDirection::Remote);
        builder.register(&t);
        builder.push("remote", AudioFrame::new(vec![1], 0, u16::MAX));
        builder.push("remote", AudioFrame::new(vec![3], 0, 1));
        builder.push("remote", AudioFrame::new(vec![2], 0, 0));
        builder.flush(&AudioMixer::default());
        assert_eq!(samples(&builder.chunks[0]), vec![1, 2, 3]);

        // Nothing buffered, nothing appended
        builder.flush(&AudioMixer::default());
        assert_eq!(builder.chunks.len(), 1);
    }
}
