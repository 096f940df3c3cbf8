//! Voice/video call session
//!
//! - [`participant`]: participant and stream identifiers
//! - [`state`]: call phase, connection status and local media flags
//! - [`router`]: SSRC resolution and per-stream decode pipelines
//! - [`controller`]: join/leave, local media toggles and signaling handling

pub mod controller;
pub mod participant;
pub mod router;
pub mod state;

pub use controller::{CallController, CallServices};
pub use participant::{
    ParticipantInfo, StreamKind, UserId, CAMERA_PAYLOAD_TYPE, SCREEN_PAYLOAD_TYPE,
};
pub use router::{RouterHandle, SsrcEntry, SsrcTable, StreamPipeline, StreamRouter};
pub use state::{CallPhase, CallSession, LocalMedia, VoiceConnectionStatus};
