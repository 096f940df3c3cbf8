//! Signaling messages exchanged with the chat server
//!
//! The transport carrying these (SignalR, WebSocket, ...) lives outside this
//! crate; here the channel is a pair of tokio mpsc queues delivering messages
//! in order.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::{ParticipantInfo, StreamKind, UserId};

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Which of a participant's tracks an SSRC belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Camera,
    Screen,
}

impl TrackKind {
    pub fn stream_kind(self) -> Option<StreamKind> {
        match self {
            TrackKind::Audio => None,
            TrackKind::Camera => Some(StreamKind::Camera),
            TrackKind::Screen => Some(StreamKind::Screen),
        }
    }
}

impl From<StreamKind> for TrackKind {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Camera => TrackKind::Camera,
            StreamKind::Screen => TrackKind::Screen,
        }
    }
}

/// SFU-assigned SSRC for one participant track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsrcMapping {
    pub user_id: UserId,
    pub ssrc: u32,
    /// Absent when the server only reports the owner; the payload type of
    /// the first packet then decides
    #[serde(default)]
    pub kind: Option<TrackKind>,
}

/// Partial voice state; absent fields are unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deafened: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_sharing: Option<bool>,
}

impl VoiceStatePatch {
    /// Stream kinds switched on or off by this patch
    pub fn stream_changes(&self) -> Vec<(StreamKind, bool)> {
        let mut changes = Vec::new();
        if let Some(on) = self.camera_on {
            changes.push((StreamKind::Camera, on));
        }
        if let Some(on) = self.screen_sharing {
            changes.push((StreamKind::Screen, on));
        }
        changes
    }
}

/// Events delivered to the media core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingEvent {
    #[serde(rename_all = "camelCase")]
    OfferReceived { channel_id: String, sdp: String },

    #[serde(rename_all = "camelCase")]
    IceCandidateReceived {
        channel_id: String,
        candidate: IceCandidate,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant: ParticipantInfo },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    VoiceStateChanged {
        user_id: UserId,
        state: VoiceStatePatch,
    },

    SsrcMapped(SsrcMapping),

    #[serde(rename_all = "camelCase")]
    SsrcMappingsBatch { mappings: Vec<SsrcMapping> },
}

/// Messages the media core sends back through signaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingCommand {
    #[serde(rename_all = "camelCase")]
    AnswerReady { channel_id: String, sdp: String },

    #[serde(rename_all = "camelCase")]
    IceCandidateGenerated {
        channel_id: String,
        candidate: IceCandidate,
    },

    /// Local mute/deafen/camera/screen change for other participants' UIs
    #[serde(rename_all = "camelCase")]
    UpdateVoiceState {
        channel_id: String,
        state: VoiceStatePatch,
    },
}

/// Core-side end of the signaling channel
pub struct SignalingLink {
    pub events: mpsc::Receiver<SignalingEvent>,
    pub commands: mpsc::Sender<SignalingCommand>,
}

/// Server-side end of the signaling channel
pub struct SignalingRemote {
    pub events: mpsc::Sender<SignalingEvent>,
    pub commands: mpsc::Receiver<SignalingCommand>,
}

/// Create a connected pair of signaling endpoints
pub fn signaling_channel(capacity: usize) -> (SignalingLink, SignalingRemote) {
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (command_tx, command_rx) = mpsc::channel(capacity);
    (
        SignalingLink {
            events: event_rx,
            commands: command_tx,
        },
        SignalingRemote {
            events: event_tx,
            commands: command_rx,
        },
    )
}
