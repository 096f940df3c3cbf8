//! Peer connection configuration and codec registration

use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_PCMA, MIME_TYPE_PCMU};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::codec::{G711Variant, G711_SAMPLE_RATE};
use crate::config::WebRtcSettings;
use crate::error::{AppError, Result};
use crate::session::StreamKind;
use crate::webrtc::rtp::H264_CLOCK_RATE;

/// fmtp for the camera track (constrained baseline 3.1)
pub const CAMERA_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// fmtp for the screen track (baseline 3.1); differs from the camera line so
/// each track is bound to its own payload type
pub const SCREEN_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f";

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

/// Codec capability of the outbound track for `kind`
pub fn video_capability(kind: StreamKind) -> RTCRtpCodecCapability {
    let fmtp = match kind {
        StreamKind::Camera => CAMERA_FMTP,
        StreamKind::Screen => SCREEN_FMTP,
    };
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: fmtp.to_owned(),
        rtcp_feedback: video_rtcp_feedback(),
    }
}

pub fn audio_capability(variant: G711Variant) -> RTCRtpCodecCapability {
    let mime_type = match variant {
        G711Variant::Pcmu => MIME_TYPE_PCMU,
        G711Variant::Pcma => MIME_TYPE_PCMA,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        clock_rate: G711_SAMPLE_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Register H264 at PT 96/97 and both G.711 variants
pub fn register_codecs(media_engine: &mut MediaEngine) -> Result<()> {
    for kind in StreamKind::ALL {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: video_capability(kind),
                    payload_type: kind.payload_type(),
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| {
                AppError::WebRtcError(format!("Failed to register {} H264 codec: {}", kind, e))
            })?;
    }

    for variant in [G711Variant::Pcmu, G711Variant::Pcma] {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: audio_capability(variant),
                    payload_type: variant.payload_type(),
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| {
                AppError::WebRtcError(format!("Failed to register {} codec: {}", variant.mime_type(), e))
            })?;
    }

    Ok(())
}

/// ICE server list for the peer connection
pub fn ice_servers(settings: &WebRtcSettings) -> Vec<RTCIceServer> {
    let mut servers: Vec<RTCIceServer> = settings
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    for turn in &settings.turn_servers {
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    servers
}

pub fn rtc_configuration(settings: &WebRtcSettings) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(settings),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;

    #[test]
    fn test_ice_servers() {
        let settings = WebRtcSettings {
            stun_servers: vec!["stun:a:3478".to_string(), "stun:b:3478".to_string()],
            turn_servers: vec![TurnServerConfig {
                urls: vec!["turn:t:3478".to_string()],
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            ..Default::default()
        };
        let servers = ice_servers(&settings);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].urls, vec!["stun:a:3478"]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[2].username, "user");
        assert_eq!(servers[2].credential, "secret");
    }

    #[test]
    fn test_video_tracks_have_distinct_codec_lines() {
        let camera = video_capability(StreamKind::Camera);
        let screen = video_capability(StreamKind::Screen);
        assert_eq!(camera.mime_type, screen.mime_type);
        assert_eq!(camera.clock_rate, 90000);
        assert_ne!(camera.sdp_fmtp_line, screen.sdp_fmtp_line);
    }

    #[test]
    fn test_register_codecs() {
        let mut engine = MediaEngine::default();
        register_codecs(&mut engine).unwrap();
    }
}
