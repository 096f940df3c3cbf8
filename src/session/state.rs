//! Call lifecycle state

use serde::{Deserialize, Serialize};

use super::participant::UserId;
use crate::events::CallEvent;
use crate::webrtc::{TransportState, VoiceStatePatch};

/// Lifecycle of the (single) call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    Joining,
    Active,
    Leaving,
}

/// Connection indicator shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl From<TransportState> for VoiceConnectionStatus {
    fn from(state: TransportState) -> Self {
        match state {
            TransportState::New | TransportState::Connecting => VoiceConnectionStatus::Connecting,
            TransportState::Connected => VoiceConnectionStatus::Connected,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed => {
                VoiceConnectionStatus::Disconnected
            }
        }
    }
}

/// Local user's media flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMedia {
    pub muted: bool,
    pub deafened: bool,
    pub camera: bool,
    pub screen_sharing: bool,
}

impl LocalMedia {
    pub fn event(&self) -> CallEvent {
        CallEvent::LocalMediaChanged {
            muted: self.muted,
            deafened: self.deafened,
            camera: self.camera,
            screen_sharing: self.screen_sharing,
        }
    }

    /// Full state as sent to other participants
    pub fn voice_state(&self) -> VoiceStatePatch {
        VoiceStatePatch {
            muted: Some(self.muted),
            deafened: Some(self.deafened),
            camera_on: Some(self.camera),
            screen_sharing: Some(self.screen_sharing),
        }
    }
}

/// Snapshot of the active call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSession {
    /// Unique per join, for correlating logs
    pub call_id: String,
    pub channel_id: String,
    pub local_user_id: UserId,
    pub phase: CallPhase,
    pub status: VoiceConnectionStatus,
    pub media: LocalMedia,
    pub participants: Vec<UserId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_transport_state() {
        assert_eq!(
            VoiceConnectionStatus::from(TransportState::New),
            VoiceConnectionStatus::Connecting
        );
        assert_eq!(
            VoiceConnectionStatus::from(TransportState::Connected),
            VoiceConnectionStatus::Connected
        );
        for state in [
            TransportState::Disconnected,
            TransportState::Failed,
            TransportState::Closed,
        ] {
            assert_eq!(
                VoiceConnectionStatus::from(state),
                VoiceConnectionStatus::Disconnected
            );
        }
    }

    #[test]
    fn test_local_media_voice_state() {
        let media = LocalMedia {
            muted: true,
            camera: true,
            ..Default::default()
        };
        let patch = media.voice_state();
        assert_eq!(patch.muted, Some(true));
        assert_eq!(patch.deafened, Some(false));
        assert_eq!(patch.camera_on, Some(true));
        assert_eq!(patch.screen_sharing, Some(false));
        assert_eq!(serde_json::to_value(CallPhase::Active).unwrap(), "active");
    }
}
