//! Media transport to the SFU
//!
//! ```text
//! camera/screen encoder ──> H264Packetizer (PT 96/97) ──┐
//! microphone ──> G.711 ─────────────────────────────────┤
//!                                                        v
//!                                   WebRtcTransport (one peer connection)
//!                                                        │
//!                      InboundPacket (audio | video) <───┘
//!                                 │
//!                        StreamRouter / AudioMixer
//! ```
//!
//! Signaling (offer/answer/ICE) travels over the channel in [`signaling`].

pub mod config;
pub mod peer;
pub mod rtp;
pub mod signaling;
pub mod transport;

pub use peer::{WebRtcTransport, WebRtcTransportFactory};
pub use rtp::{H264Depacketizer, H264Packetizer, H264_CLOCK_RATE, RTP_MTU};
pub use signaling::{
    signaling_channel, IceCandidate, SignalingCommand, SignalingEvent, SignalingLink,
    SignalingRemote, SsrcMapping, TrackKind, VoiceStatePatch,
};
pub use transport::{
    InboundPacket, LocalSsrcs, MediaKind, MediaTransport, TransportContext, TransportFactory,
    TransportState,
};
