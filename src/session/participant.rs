//! Participant and logical stream identifiers

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// RTP payload type carrying camera video
pub const CAMERA_PAYLOAD_TYPE: u8 = 96;
/// RTP payload type carrying screen-share video
pub const SCREEN_PAYLOAD_TYPE: u8 = 97;

/// Participant identifier as issued by the signaling server
pub type UserId = String;

/// Video stream kind; each kind maps to exactly one payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Camera,
    Screen,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Camera, StreamKind::Screen];

    pub fn payload_type(self) -> u8 {
        match self {
            StreamKind::Camera => CAMERA_PAYLOAD_TYPE,
            StreamKind::Screen => SCREEN_PAYLOAD_TYPE,
        }
    }

    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            CAMERA_PAYLOAD_TYPE => Some(StreamKind::Camera),
            SCREEN_PAYLOAD_TYPE => Some(StreamKind::Screen),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Camera => "camera",
            StreamKind::Screen => "screen",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant as announced by signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    /// Video streams the participant is currently sending
    #[serde(default)]
    pub streams: BTreeSet<StreamKind>,
}

impl ParticipantInfo {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: String::new(),
            muted: false,
            deafened: false,
            streams: BTreeSet::new(),
        }
    }

    pub fn with_stream(mut self, kind: StreamKind) -> Self {
        self.streams.insert(kind);
        self
    }

    pub fn is_sending(&self, kind: StreamKind) -> bool {
        self.streams.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_type_mapping() {
        for kind in StreamKind::ALL {
            assert_eq!(StreamKind::from_payload_type(kind.payload_type()), Some(kind));
        }
        assert_eq!(StreamKind::from_payload_type(0), None);
        assert_eq!(StreamKind::from_payload_type(111), None);
    }

    #[test]
    fn test_participant_info_serde() {
        let json = r#"{"userId":"u1","displayName":"Ann","streams":["screen"]}"#;
        let info: ParticipantInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.user_id, "u1");
        assert!(info.is_sending(StreamKind::Screen));
        assert!(!info.is_sending(StreamKind::Camera));
        assert!(!info.muted);
    }
}
