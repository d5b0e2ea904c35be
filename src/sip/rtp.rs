//! RTP audio session
//!
//! One UDP socket per call. Inbound packets are decoded into the remote
//! track. Local audio is pushed through `audio_input` and paced out by the
//! send loop; everything we send is mirrored into the local track so the
//! recorder sees both sides of the conversation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::codec::G711Codec;
use super::transport::{MediaTrack, TrackDirection};
use super::SipError;

/// Frames buffered per track before the receive loop starts dropping
const TRACK_CAPACITY: usize = 256;

/// Samples in one 20ms frame at 8kHz
pub const FRAME_SAMPLES: usize = 160;

/// Local frames queued for sending before producers are pushed back
const INPUT_CAPACITY: usize = 50;

/// Fixed 12-byte RTP header (RFC 3550), CSRCs skipped on parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        // V=2, no padding, no extension, no CSRC
        buf.put_u8(0x80);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Parse a header, returning it with the offset of the payload
    pub fn parse(data: &[u8]) -> Result<(Self, usize), SipError> {
        if data.len() < 12 {
            return Err(SipError::Rtp("RTP packet too short".to_string()));
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(SipError::Rtp(format!("Invalid RTP version: {}", version)));
        }

        let csrc_count = (data[0] & 0x0F) as usize;
        let offset = 12 + csrc_count * 4;
        if data.len() < offset {
            return Err(SipError::Rtp("RTP CSRC list truncated".to_string()));
        }

        Ok((
            Self {
                marker: data[1] & 0x80 != 0,
                payload_type: data[1] & 0x7F,
                sequence: u16::from_be_bytes([data[2], data[3]]),
                timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            },
            offset,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.payload.len());
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SipError> {
        let (header, offset) = RtpHeader::parse(data)?;
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[offset..]),
        })
    }
}

/// Decoded PCM audio with its RTP timing
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM audio samples (16-bit signed, 8kHz mono)
    pub samples: Vec<i16>,
    pub timestamp: u32,
    pub sequence: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, timestamp: u32, sequence: u16) -> Self {
        Self {
            samples,
            timestamp,
            sequence,
        }
    }
}

struct Tracks {
    remote: Option<mpsc::Receiver<AudioFrame>>,
    local: Option<mpsc::Receiver<AudioFrame>>,
}

/// RTP session of one call
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    remote_addr: RwLock<Option<SocketAddr>>,
    codec: G711Codec,
    ssrc: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    muted: AtomicBool,
    on_hold: AtomicBool,
    remote_tx: mpsc::Sender<AudioFrame>,
    local_tx: mpsc::Sender<AudioFrame>,
    tracks: Mutex<Tracks>,
    input_tx: mpsc::Sender<Vec<i16>>,
    input_rx: Mutex<Option<mpsc::Receiver<Vec<i16>>>>,
    cancel_token: CancellationToken,
    /// Cancelled when the receive loop dies on a socket error
    failure: CancellationToken,
}

impl RtpSession {
    /// Bind a session on `port` (or the next free even port above it)
    pub async fn bind(port: u16, codec: G711Codec) -> Result<Self, SipError> {
        let socket = Self::bind_even_port(port, 50).await?;
        let (remote_tx, remote_rx) = mpsc::channel(TRACK_CAPACITY);
        let (local_tx, local_rx) = mpsc::channel(TRACK_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);

        Ok(Self {
            socket: Arc::new(socket),
            remote_addr: RwLock::new(None),
            codec,
            ssrc: rand::random::<u32>(),
            sequence: AtomicU16::new(rand::random::<u16>()),
            timestamp: AtomicU32::new(rand::random::<u32>()),
            muted: AtomicBool::new(false),
            on_hold: AtomicBool::new(false),
            remote_tx,
            local_tx,
            tracks: Mutex::new(Tracks {
                remote: Some(remote_rx),
                local: Some(local_rx),
            }),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            cancel_token: CancellationToken::new(),
            failure: CancellationToken::new(),
        })
    }

    async fn bind_even_port(start_port: u16, max_attempts: u16) -> Result<UdpSocket, SipError> {
        let mut port = start_port + start_port % 2;
        for _ in 0..max_attempts {
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    port = port.checked_add(2).unwrap_or(10000);
                }
                Err(e) => return Err(SipError::Rtp(format!("Failed to bind RTP socket: {}", e))),
            }
        }
        Err(SipError::Rtp(format!(
            "No free RTP port after {} attempts from {}",
            max_attempts, start_port
        )))
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn payload_type(&self) -> u8 {
        self.codec.payload_type()
    }

    pub async fn set_remote(&self, addr: SocketAddr) {
        *self.remote_addr.write().await = Some(addr);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// While held nothing is sent at all
    pub fn set_on_hold(&self, on_hold: bool) {
        self.on_hold.store(on_hold, Ordering::SeqCst);
    }

    /// Sink for local audio frames (8kHz mono PCM). Frames queue until
    /// `start` and are sent in order afterwards.
    pub fn audio_input(&self) -> mpsc::Sender<Vec<i16>> {
        self.input_tx.clone()
    }

    /// Resolves to true if the receive loop failed, false once stopped
    pub fn receive_failure(&self) -> impl Future<Output = bool> + Send + 'static {
        let failure = self.failure.clone();
        let stopped = self.cancel_token.clone();
        async move {
            tokio::select! {
                _ = failure.cancelled() => true,
                _ = stopped.cancelled() => false,
            }
        }
    }

    /// Hand over the remote and local tracks, once
    pub fn take_tracks(&self, session_id: &str) -> Vec<MediaTrack> {
        let Ok(mut tracks) = self.tracks.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(rx) = tracks.remote.take() {
            out.push(MediaTrack::new(
                format!("{}-remote", session_id),
                TrackDirection::Remote,
                rx,
            ));
        }
        if let Some(rx) = tracks.local.take() {
            out.push(MediaTrack::new(
                format!("{}-local", session_id),
                TrackDirection::Local,
                rx,
            ));
        }
        out
    }

    /// Start the receive and send loops; they run until `stop()`
    pub fn start(self: &Arc<Self>) {
        self.spawn_sender();

        let socket = self.socket.clone();
        let remote_tx = self.remote_tx.clone();
        let token = self.cancel_token.clone();
        let failure = self.failure.clone();
        let expected_pt = self.codec.payload_type();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    r = socket.recv_from(&mut buf) => r,
                };
                let len = match received {
                    Ok((len, _)) => len,
                    Err(e) => {
                        tracing::warn!("RTP receive error: {}", e);
                        failure.cancel();
                        break;
                    }
                };
                let Ok(packet) = RtpPacket::from_bytes(&buf[..len]) else {
                    continue;
                };
                // Telephone-events and comfort noise are not audio
                if packet.header.payload_type != expected_pt {
                    continue;
                }
                let Some(codec) = G711Codec::for_payload_type(packet.header.payload_type) else {
                    continue;
                };
                let frame = AudioFrame::new(
                    codec.decode(&packet.payload),
                    packet.header.timestamp,
                    packet.header.sequence,
                );
                // Full or closed: nobody is recording, keep draining the socket
                let _ = remote_tx.try_send(frame);
            }
            tracing::debug!("RTP receive loop stopped");
        });
    }

    /// Drain `audio_input` into the socket
    fn spawn_sender(self: &Arc<Self>) {
        let input = match self.input_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut input) = input else {
            return;
        };
        // Weak: the session owns the input sender, a strong ref would keep it alive
        let session = Arc::downgrade(self);
        let token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                let samples = tokio::select! {
                    _ = token.cancelled() => break,
                    samples = input.recv() => match samples {
                        Some(samples) => samples,
                        None => break,
                    },
                };
                let Some(session) = session.upgrade() else {
                    break;
                };
                if let Err(e) = session.send_audio(&samples).await {
                    tracing::trace!("RTP send skipped: {}", e);
                }
            }
            tracing::debug!("RTP send loop stopped");
        });
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Send one frame of microphone audio; muted sessions send silence
    pub async fn send_audio(&self, samples: &[i16]) -> Result<(), SipError> {
        if self.on_hold.load(Ordering::SeqCst) {
            return Ok(());
        }
        let remote_addr = (*self.remote_addr.read().await)
            .ok_or_else(|| SipError::Rtp("No remote address set".to_string()))?;

        let silence;
        let samples = if self.is_muted() {
            silence = vec![0i16; samples.len()];
            &silence[..]
        } else {
            samples
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = self
            .timestamp
            .fetch_add(samples.len() as u32, Ordering::SeqCst);

        let packet = RtpPacket {
            header: RtpHeader::new(self.codec.payload_type(), sequence, timestamp, self.ssrc),
            payload: Bytes::from(self.codec.encode(samples)),
        };
        self.socket.send_to(&packet.to_bytes(), remote_addr).await?;

        // Mirror into the local track; dropped when the recorder lags
        let _ = self
            .local_tx
            .try_send(AudioFrame::new(samples.to_vec(), timestamp, sequence));
        Ok(())
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Hands out even RTP ports round-robin inside a range
pub struct RtpPortAllocator {
    start: u16,
    end: u16,
    next: Mutex<u16>,
}

impl RtpPortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        let start = start + start % 2;
        Self {
            start,
            end,
            next: Mutex::new(start),
        }
    }

    pub fn allocate(&self) -> u16 {
        let mut next = match self.next.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let port = *next;
        *next = if port.saturating_add(2) >= self.end {
            self.start
        } else {
            port + 2
        };
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse_skips_csrcs() {
        let mut data = vec![0x82, 0x80 | 8, 0x00, 0x07, 0, 0, 0, 160, 0, 0, 0, 42];
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&[0xD5; 4]);

        let packet = RtpPacket::from_bytes(&data).unwrap();
        assert!(packet.header.marker);
        assert_eq!(packet.header.payload_type, 8);
        assert_eq!(packet.header.sequence, 7);
        assert_eq!(packet.header.timestamp, 160);
        assert_eq!(packet.header.ssrc, 42);
        assert_eq!(packet.payload.len(), 4);
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert!(RtpHeader::parse(&[0x80; 4]).is_err());
        assert!(RtpHeader::parse(&[0x40; 12]).is_err());
        // CSRC count says 15 but the packet ends after the fixed header
        assert!(RtpHeader::parse(&[0x8F; 12]).is_err());
    }

    #[test]
    fn test_packet_bytes_layout() {
        let packet = RtpPacket {
            header: RtpHeader::new(0, 1, 2, 3),
            payload: Bytes::from_static(&[0xFF; 160]),
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 172);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0);
    }

    #[test]
    fn test_port_allocator_wraps_on_even_ports() {
        let allocator = RtpPortAllocator::new(20001, 20008);
        assert_eq!(allocator.allocate(), 20002);
        assert_eq!(allocator.allocate(), 20004);
        assert_eq!(allocator.allocate(), 20006);
        assert_eq!(allocator.allocate(), 20002);
    }

    #[tokio::test]
    async fn test_audio_input_is_sent_after_start_and_paused_on_hold() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = Arc::new(RtpSession::bind(0, G711Codec::pcmu()).await.unwrap());
        session.set_remote(receiver.local_addr().unwrap()).await;
        let mut local = session.take_tracks("abc").pop().unwrap();
        let input = session.audio_input();

        // Queued before start, sent once the loop runs
        input.send(vec![800; FRAME_SAMPLES]).await.unwrap();
        session.start();

        let mut buf = [0u8; 256];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 12 + FRAME_SAMPLES);
        let sent = local.frames.recv().await.unwrap();
        assert!(sent.samples.iter().all(|&s| s == 800));

        session.set_on_hold(true);
        input.send(vec![800; FRAME_SAMPLES]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(local.frames.try_recv().is_err());

        session.stop();
        assert!(!session.receive_failure().await);
    }

    #[tokio::test]
    async fn test_tracks_are_handed_out_once() {
        let session = RtpSession::bind(0, G711Codec::pcmu()).await.unwrap();
        let tracks = session.take_tracks("abc");
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].direction, TrackDirection::Remote);
        assert_eq!(tracks[1].id, "abc-local");
        assert!(session.take_tracks("abc").is_empty());
    }

    #[tokio::test]
    async fn test_send_mirrors_into_local_track_and_honors_mute() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = RtpSession::bind(0, G711Codec::pcmu()).await.unwrap();
        session.set_remote(receiver.local_addr().unwrap()).await;
        let mut tracks = session.take_tracks("abc");
        let mut local = tracks.pop().unwrap();

        session.send_audio(&[1000; FRAME_SAMPLES]).await.unwrap();
        session.set_muted(true);
        session.send_audio(&[1000; FRAME_SAMPLES]).await.unwrap();

        let first = local.frames.recv().await.unwrap();
        assert!(first.samples.iter().all(|&s| s == 1000));
        let second = local.frames.recv().await.unwrap();
        assert!(second.samples.iter().all(|&s| s == 0));
        assert_eq!(second.sequence, first.sequence.wrapping_add(1));

        let mut buf = [0u8; 256];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 12 + FRAME_SAMPLES);
    }
}
