//! Media transport abstraction
//!
//! A call owns exactly one transport to the SFU. The session layer only sees
//! this trait, so the WebRTC peer connection can be replaced by an in-memory
//! transport in tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rtp::packet::Packet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use super::signaling::{IceCandidate, SignalingCommand, TrackKind};
use crate::error::Result;
use crate::session::StreamKind;

/// Transport connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// No further transitions are expected without a new transport
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::New => write!(f, "new"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Disconnected => write!(f, "disconnected"),
            TransportState::Failed => write!(f, "failed"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

/// Media type of a received track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One RTP packet received from the SFU
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub media: MediaKind,
    pub packet: Packet,
}

/// Connection to the SFU carrying all local and remote media
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Apply the SFU's offer and return the local answer SDP
    async fn handle_offer(&self, sdp: String) -> Result<String>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send the packets of one access unit on the camera or screen track
    async fn send_video(&self, kind: StreamKind, packets: Vec<Packet>) -> Result<()>;

    /// Send one encoded audio packet covering `duration`
    async fn send_audio(&self, payload: Bytes, duration: Duration) -> Result<()>;

    /// SSRC of a local track, known once the transport has connected
    fn local_ssrc(&self, kind: TrackKind) -> Option<u32>;

    fn state(&self) -> TransportState;

    fn subscribe_state(&self) -> watch::Receiver<TransportState>;

    async fn close(&self) -> Result<()>;
}

/// Channels a new transport reports into
#[derive(Clone)]
pub struct TransportContext {
    pub channel_id: String,
    /// Received RTP, in arrival order per track
    pub inbound: mpsc::Sender<InboundPacket>,
    /// Locally gathered ICE candidates go out here
    pub signaling: mpsc::Sender<SignalingCommand>,
}

/// Creates one transport per joined call
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, ctx: TransportContext) -> Result<Arc<dyn MediaTransport>>;
}

/// SSRCs of the local tracks, captured once per connection
#[derive(Debug, Default)]
pub struct LocalSsrcs {
    captured: AtomicBool,
    ssrcs: Mutex<HashMap<TrackKind, u32>>,
}

impl LocalSsrcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the SSRCs reported by the stack
    ///
    /// Only the first call per connection has an effect. A zero or duplicate
    /// SSRC is replaced by a random value unique among the local tracks.
    /// Returns whether this call performed the capture.
    pub fn capture(&self, reported: &[(TrackKind, u32)]) -> bool {
        if self.captured.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut ssrcs = self.ssrcs.lock();
        ssrcs.clear();
        for &(kind, ssrc) in reported {
            let taken = ssrcs.values().any(|&v| v == ssrc);
            let ssrc = if ssrc == 0 || taken {
                let synthesized = Self::synthesize(&ssrcs);
                warn!(
                    "No usable SSRC for local {:?} track, using {}",
                    kind,
                    synthesized
                );
                synthesized
            } else {
                ssrc
            };
            ssrcs.insert(kind, ssrc);
        }
        true
    }

    fn synthesize(existing: &HashMap<TrackKind, u32>) -> u32 {
        loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && !existing.values().any(|&v| v == candidate) {
                return candidate;
            }
        }
    }

    pub fn get(&self, kind: TrackKind) -> Option<u32> {
        self.ssrcs.lock().get(&kind).copied()
    }

    pub fn is_captured(&self) -> bool {
        self.captured.load(Ordering::Acquire)
    }

    /// Forget captured values so the next connection captures again
    pub fn reset(&self) {
        self.ssrcs.lock().clear();
        self.captured.store(false, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Transport that records outbound media and lets tests drive its state
    pub struct MemoryTransport {
        pub channel_id: String,
        pub inbound: mpsc::Sender<InboundPacket>,
        state_tx: watch::Sender<TransportState>,
        state_rx: watch::Receiver<TransportState>,
        ssrcs: LocalSsrcs,
        pub offers: Mutex<Vec<String>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub video: Mutex<Vec<(StreamKind, Packet)>>,
        pub audio: Mutex<Vec<Bytes>>,
        /// Answer offers but stay in `Connecting`
        pub hold_connecting: bool,
        pub fail_negotiation: bool,
    }

    impl MemoryTransport {
        pub fn new(ctx: TransportContext) -> Self {
            let (state_tx, state_rx) = watch::channel(TransportState::New);
            Self {
                channel_id: ctx.channel_id,
                inbound: ctx.inbound,
                state_tx,
                state_rx,
                ssrcs: LocalSsrcs::new(),
                offers: Mutex::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
                video: Mutex::new(Vec::new()),
                audio: Mutex::new(Vec::new()),
                hold_connecting: false,
                fail_negotiation: false,
            }
        }

        pub fn set_state(&self, state: TransportState) {
            if state == TransportState::Connected {
                self.ssrcs.capture(&[
                    (TrackKind::Audio, 1000),
                    (TrackKind::Camera, 2000),
                    (TrackKind::Screen, 3000),
                ]);
            }
            let _ = self.state_tx.send(state);
        }

        /// Inject a packet as if it arrived from the SFU
        pub async fn receive(&self, media: MediaKind, packet: Packet) {
            let _ = self.inbound.send(InboundPacket { media, packet }).await;
        }
    }

    #[async_trait]
    impl MediaTransport for MemoryTransport {
        async fn handle_offer(&self, sdp: String) -> Result<String> {
            self.offers.lock().push(sdp.clone());
            if self.fail_negotiation {
                self.set_state(TransportState::Failed);
                return Err(crate::error::AppError::WebRtcError(
                    "negotiation failed".to_string(),
                ));
            }
            self.set_state(TransportState::Connecting);
            if !self.hold_connecting {
                self.set_state(TransportState::Connected);
            }
            Ok(format!("answer for {}", sdp))
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        async fn send_video(&self, kind: StreamKind, packets: Vec<Packet>) -> Result<()> {
            self.video.lock().extend(packets.into_iter().map(|p| (kind, p)));
            Ok(())
        }

        async fn send_audio(&self, payload: Bytes, _duration: Duration) -> Result<()> {
            self.audio.lock().push(payload);
            Ok(())
        }

        fn local_ssrc(&self, kind: TrackKind) -> Option<u32> {
            self.ssrcs.get(kind)
        }

        fn state(&self) -> TransportState {
            *self.state_rx.borrow()
        }

        fn subscribe_state(&self) -> watch::Receiver<TransportState> {
            self.state_rx.clone()
        }

        async fn close(&self) -> Result<()> {
            self.set_state(TransportState::Closed);
            Ok(())
        }
    }

    /// Factory handing out [`MemoryTransport`]s and remembering them
    #[derive(Default)]
    pub struct MemoryTransportFactory {
        pub created: Mutex<Vec<Arc<MemoryTransport>>>,
        pub hold_connecting: bool,
        pub fail_negotiation: bool,
    }

    impl MemoryTransportFactory {
        pub fn last(&self) -> Option<Arc<MemoryTransport>> {
            self.created.lock().last().cloned()
        }

        pub fn count(&self) -> usize {
            self.created.lock().len()
        }
    }

    #[async_trait]
    impl TransportFactory for MemoryTransportFactory {
        async fn create(&self, ctx: TransportContext) -> Result<Arc<dyn MediaTransport>> {
            let mut transport = MemoryTransport::new(ctx);
            transport.hold_connecting = self.hold_connecting;
            transport.fail_negotiation = self.fail_negotiation;
            let transport = Arc::new(transport);
            self.created.lock().push(transport.clone());
            Ok(transport)
        }
    }

    #[test]
    fn test_capture_once() {
        let ssrcs = LocalSsrcs::new();
        assert!(ssrcs.capture(&[(TrackKind::Camera, 11), (TrackKind::Screen, 22)]));
        assert!(!ssrcs.capture(&[(TrackKind::Camera, 99)]));
        assert_eq!(ssrcs.get(TrackKind::Camera), Some(11));
        assert_eq!(ssrcs.get(TrackKind::Screen), Some(22));
        assert_eq!(ssrcs.get(TrackKind::Audio), None);

        ssrcs.reset();
        assert!(!ssrcs.is_captured());
        assert!(ssrcs.capture(&[(TrackKind::Camera, 99)]));
        assert_eq!(ssrcs.get(TrackKind::Camera), Some(99));
    }

    #[test]
    fn test_synthesizes_missing_and_duplicate_ssrcs() {
        let ssrcs = LocalSsrcs::new();
        ssrcs.capture(&[
            (TrackKind::Audio, 0),
            (TrackKind::Camera, 5),
            (TrackKind::Screen, 5),
        ]);
        let audio = ssrcs.get(TrackKind::Audio).unwrap();
        let camera = ssrcs.get(TrackKind::Camera).unwrap();
        let screen = ssrcs.get(TrackKind::Screen).unwrap();
        assert_ne!(audio, 0);
        assert_eq!(camera, 5);
        assert_ne!(screen, 5);
        assert_ne!(screen, 0);
        assert_ne!(audio, screen);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransportState::Connecting.is_terminal());
        assert!(TransportState::Failed.is_terminal());
        assert_eq!(TransportState::Connected.to_string(), "connected");
    }
}
