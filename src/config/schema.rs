use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::AudioFraming;
use crate::codec::G711Variant;
use crate::video::capture::VideoCaptureSettings;
use crate::video::format::{PixelFormat, Resolution};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Peer connection settings
    pub webrtc: WebRtcSettings,
    /// Outbound camera/screen encoding
    pub video: VideoConfig,
    /// Inbound software decoding
    pub decoder: DecoderConfig,
    /// Microphone processing and audio codec
    pub audio: AudioConfig,
    /// Raw device capture commands
    pub capture: CaptureConfig,
    /// Call-level timers
    pub session: SessionConfig,
}

/// TURN server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServerConfig>,
    /// Largest RTP payload produced by the packetizer
    pub max_rtp_payload: usize,
    /// Pause after setting the local description before answering
    pub ice_gather_wait_ms: u64,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_rtp_payload: 1200,
            ice_gather_wait_ms: 100,
        }
    }
}

/// One outbound video stream's capture/encode parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamEncodeConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Raw pixel layout delivered by the capture device
    pub input_format: PixelFormat,
}

impl StreamEncodeConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Capture request with the configured device input
    pub fn capture_settings(&self) -> VideoCaptureSettings {
        VideoCaptureSettings {
            resolution: self.resolution(),
            fps: self.fps,
            bitrate_kbps: self.bitrate_kbps,
            format: self.input_format,
            input: None,
        }
    }
}

impl Default for StreamEncodeConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            bitrate_kbps: 800,
            input_format: PixelFormat::Bgr24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub camera: StreamEncodeConfig,
    pub screen: StreamEncodeConfig,
    /// Encoder executable
    pub encoder_program: String,
    /// Extra encoder options inserted before the output arguments
    pub encoder_extra_args: Vec<String>,
    /// Replaces the generated encoder arguments when set
    pub encoder_args: Option<Vec<String>>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            camera: StreamEncodeConfig::default(),
            screen: StreamEncodeConfig {
                width: 1920,
                height: 1080,
                fps: 30,
                bitrate_kbps: 2500,
                input_format: PixelFormat::Bgr24,
            },
            encoder_program: "ffmpeg".to_string(),
            encoder_extra_args: Vec::new(),
            encoder_args: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Software decoder executable
    pub program: String,
    /// Raw output layout, `rgb24` or `nv12`
    pub output_format: PixelFormat,
    /// Frame size used when the SPS cannot be parsed
    pub fallback_width: u32,
    pub fallback_height: u32,
    /// Access units queued for a decoder process before frames are dropped
    pub queue_frames: usize,
    /// A decoder whose queue stays full this long is abandoned
    pub stall_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl DecoderConfig {
    pub fn fallback_resolution(&self) -> Resolution {
        Resolution::new(self.fallback_width, self.fallback_height)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            output_format: PixelFormat::Rgb24,
            fallback_width: 1280,
            fallback_height: 720,
            queue_frames: 4,
            stall_timeout_ms: 3000,
            stop_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Zero microphone buffers whose RMS is below `gate_threshold`
    pub gate_enabled: bool,
    /// Normalized RMS (0.0-1.0)
    pub gate_threshold: f32,
    /// Normalized RMS that counts as speech
    pub speaking_threshold: f32,
    pub codec: G711Variant,
    pub packet_ms: u32,
    /// Rate requested from the microphone
    pub capture_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            gate_enabled: true,
            gate_threshold: 0.01,
            speaking_threshold: 0.02,
            codec: G711Variant::Pcmu,
            packet_ms: 20,
            capture_sample_rate: 48000,
        }
    }
}

/// Device capture is delegated to a capture program writing raw samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub program: String,
    /// Input options selecting the camera
    pub camera_input: Vec<String>,
    /// Input options selecting the screen
    pub screen_input: Vec<String>,
    /// Input options selecting the microphone
    pub microphone_input: Vec<String>,
    /// Wire format of the microphone capture output
    pub microphone_framing: AudioFraming,
    /// Replaces the generated microphone arguments when set
    pub microphone_args: Option<Vec<String>>,
    /// The program encodes camera/screen itself and writes AVCC H.264
    pub video_encoded: bool,
    /// Arguments making the program print its sources as JSON
    pub list_args: Vec<String>,
    /// A video device that yields no frame within this is unavailable
    pub startup_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl CaptureConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect();
        Self {
            program: "ffmpeg".to_string(),
            camera_input: args(&["-f", "v4l2", "-i", "/dev/video0"]),
            screen_input: args(&["-f", "x11grab", "-i", ":0.0"]),
            microphone_input: args(&["-f", "pulse", "-i", "default"]),
            microphone_framing: AudioFraming::Raw,
            microphone_args: None,
            video_encoded: false,
            list_args: args(&["list", "--json"]),
            startup_timeout_ms: 5000,
            stop_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Speaking indicator poll interval
    pub vad_poll_ms: u64,
    /// Speaking turns off after this long without qualifying energy
    pub speaking_hold_ms: u64,
    /// Wait for an authoritative SSRC mapping before guessing
    pub ssrc_grace_ms: u64,
    /// Bound on waiting for background loops to exit
    pub stop_timeout_ms: u64,
}

impl SessionConfig {
    pub fn vad_poll(&self) -> Duration {
        Duration::from_millis(self.vad_poll_ms)
    }

    pub fn speaking_hold(&self) -> Duration {
        Duration::from_millis(self.speaking_hold_ms)
    }

    pub fn ssrc_grace(&self) -> Duration {
        Duration::from_millis(self.ssrc_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vad_poll_ms: 50,
            speaking_hold_ms: 200,
            ssrc_grace_ms: 250,
            stop_timeout_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.webrtc.max_rtp_payload, 1200);
        assert_eq!(config.video.camera.resolution(), Resolution::VGA);
        assert_eq!(config.video.screen.fps, 30);
        assert_eq!(config.session.vad_poll(), Duration::from_millis(50));
        assert_eq!(config.session.speaking_hold(), Duration::from_millis(200));
        assert_eq!(config.audio.codec, G711Variant::Pcmu);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"audio": {"codec": "pcma", "gate_enabled": false}, "decoder": {"output_format": "nv12"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.audio.codec, G711Variant::Pcma);
        assert!(!config.audio.gate_enabled);
        assert_eq!(config.audio.packet_ms, 20);
        assert_eq!(config.decoder.output_format, PixelFormat::Nv12);
        assert_eq!(config.decoder.program, "ffmpeg");
        assert_eq!(config.webrtc, WebRtcSettings::default());
    }

    #[test]
    fn test_capture_settings_from_stream_config() {
        let config = AppConfig::default();
        let settings = config.video.screen.capture_settings();
        assert_eq!(settings.resolution, Resolution::HD1080);
        assert_eq!(settings.fps, 30);
        assert!(settings.input.is_none());

        let json = r#"{"capture": {"microphone_framing": "mcap"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.capture.microphone_framing, AudioFraming::Mcap);
        assert!(!config.capture.video_encoded);
        assert_eq!(config.capture.list_args, ["list", "--json"]);
        assert_eq!(config.capture.startup_timeout(), Duration::from_secs(5));
    }
}
