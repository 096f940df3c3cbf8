//! Call event types
//!
//! Serialized as `{"event": "<name>", "data": {...}}` so a UI layer can
//! forward them unchanged.

use serde::{Deserialize, Serialize};

use crate::session::{CallPhase, StreamKind, UserId, VoiceConnectionStatus};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CallEvent {
    /// Media transport status as shown in the connection indicator
    #[serde(rename = "call.connection_status")]
    ConnectionStatusChanged {
        channel_id: String,
        status: VoiceConnectionStatus,
    },

    #[serde(rename = "call.phase")]
    SessionPhaseChanged { phase: CallPhase },

    /// Speaking indicator flip; `user_id` is the local user for the microphone
    #[serde(rename = "call.speaking")]
    SpeakingChanged { user_id: UserId, speaking: bool },

    #[serde(rename = "participant.added")]
    ParticipantAdded { user_id: UserId },

    #[serde(rename = "participant.removed")]
    ParticipantRemoved { user_id: UserId },

    /// A decoder slot now exists for this remote stream
    #[serde(rename = "stream.started")]
    StreamStarted { user_id: UserId, kind: StreamKind },

    #[serde(rename = "stream.stopped")]
    StreamStopped { user_id: UserId, kind: StreamKind },

    /// Hardware decoding failed to initialize; stream now uses software
    #[serde(rename = "stream.decoder_fallback")]
    DecoderFallback { user_id: UserId, kind: StreamKind },

    #[serde(rename = "local.media_changed")]
    LocalMediaChanged {
        muted: bool,
        deafened: bool,
        camera: bool,
        screen_sharing: bool,
    },

    /// A capture/encode or decode pipeline stopped on its own
    #[serde(rename = "pipeline.failed")]
    PipelineFailed { pipeline: String, reason: String },
}

impl CallEvent {
    /// Event name as it appears in the serialized `event` field
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::ConnectionStatusChanged { .. } => "call.connection_status",
            CallEvent::SessionPhaseChanged { .. } => "call.phase",
            CallEvent::SpeakingChanged { .. } => "call.speaking",
            CallEvent::ParticipantAdded { .. } => "participant.added",
            CallEvent::ParticipantRemoved { .. } => "participant.removed",
            CallEvent::StreamStarted { .. } => "stream.started",
            CallEvent::StreamStopped { .. } => "stream.stopped",
            CallEvent::DecoderFallback { .. } => "stream.decoder_fallback",
            CallEvent::LocalMediaChanged { .. } => "local.media_changed",
            CallEvent::PipelineFailed { .. } => "pipeline.failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_shape() {
        let event = CallEvent::SpeakingChanged {
            user_id: "u1".to_string(),
            speaking: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "call.speaking");
        assert_eq!(json["data"]["user_id"], "u1");
        assert_eq!(json["data"]["speaking"], true);
        assert_eq!(event.name(), "call.speaking");
    }

    #[test]
    fn test_stream_kind_serialized_lowercase() {
        let event = CallEvent::StreamStarted {
            user_id: "u2".to_string(),
            kind: StreamKind::Screen,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"screen\""));
        let back: CallEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
