//! Local capture devices
//!
//! The call controller opens cameras, screens and microphones through
//! [`CaptureDevices`] so tests and embedders can substitute their own sources.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::audio::{AudioSource, MicrophoneConfig, ProcessAudioSource};
use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::session::StreamKind;
use crate::video::capture::{
    ProcessCaptureConfig, ProcessEncodedSource, ProcessVideoSource, VideoCaptureSettings, VideoInput,
};

#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn open_camera(&self, settings: &VideoCaptureSettings) -> Result<VideoInput>;

    async fn open_screen(&self, settings: &VideoCaptureSettings) -> Result<VideoInput>;

    async fn open_microphone(&self) -> Result<Box<dyn AudioSource>>;
}

/// Devices captured through the configured capture program
#[derive(Clone)]
pub struct ProcessCaptureDevices {
    config: ConfigStore,
}

impl ProcessCaptureDevices {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    fn video_config(&self, kind: StreamKind, settings: &VideoCaptureSettings) -> ProcessCaptureConfig {
        let config = self.config.get();
        let capture = &config.capture;
        let default_input = match kind {
            StreamKind::Camera => &capture.camera_input,
            StreamKind::Screen => &capture.screen_input,
        };
        ProcessCaptureConfig {
            program: capture.program.clone(),
            input: settings.input.clone().unwrap_or_else(|| default_input.clone()),
            args: None,
            startup_timeout: capture.startup_timeout(),
            stop_timeout: capture.stop_timeout(),
        }
    }

    async fn open_video(&self, kind: StreamKind, settings: &VideoCaptureSettings) -> Result<VideoInput> {
        let config = self.video_config(kind, settings);
        let device = kind.as_str();
        if self.config.get().capture.video_encoded {
            debug!("Opening {} (device encoded) with {:?}", device, config.input);
            let source = ProcessEncodedSource::open(device, &config, settings).await?;
            Ok(VideoInput::Encoded(Box::new(source)))
        } else {
            debug!("Opening {} with {:?}", device, config.input);
            let source = ProcessVideoSource::open(device, &config, settings).await?;
            Ok(VideoInput::Raw(Box::new(source)))
        }
    }

    /// Ask the capture program for its cameras, displays and microphones
    pub async fn list_sources(&self) -> Result<serde_json::Value> {
        let config = self.config.get();
        let capture = &config.capture;
        let mut command = Command::new(&capture.program);
        command
            .args(&capture.list_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(capture.startup_timeout(), command.output())
            .await
            .map_err(|_| {
                AppError::subprocess(
                    &capture.program,
                    format!("source listing took longer than {:?}", capture.startup_timeout()),
                )
            })?
            .map_err(|e| AppError::subprocess(&capture.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::subprocess(
                &capture.program,
                format!("source listing failed ({}): {}", output.status, stderr.trim()),
            ));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    pub fn microphone_config(&self) -> MicrophoneConfig {
        let config = self.config.get();
        MicrophoneConfig {
            program: config.capture.program.clone(),
            input: config.capture.microphone_input.clone(),
            args: config.capture.microphone_args.clone(),
            framing: config.capture.microphone_framing,
            sample_rate: config.audio.capture_sample_rate,
            packet_ms: config.audio.packet_ms,
            stop_timeout: config.capture.stop_timeout(),
        }
    }
}

#[async_trait]
impl CaptureDevices for ProcessCaptureDevices {
    async fn open_camera(&self, settings: &VideoCaptureSettings) -> Result<VideoInput> {
        self.open_video(StreamKind::Camera, settings).await
    }

    async fn open_screen(&self, settings: &VideoCaptureSettings) -> Result<VideoInput> {
        self.open_video(StreamKind::Screen, settings).await
    }

    async fn open_microphone(&self) -> Result<Box<dyn AudioSource>> {
        let source = ProcessAudioSource::open(self.microphone_config())?;
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFraming;
    use crate::config::AppConfig;
    use crate::video::capture::EncodedVideoSource;

    #[test]
    fn test_microphone_config_follows_store() {
        let mut config = AppConfig::default();
        config.capture.microphone_framing = AudioFraming::Mcap;
        config.audio.capture_sample_rate = 16000;
        let devices = ProcessCaptureDevices::new(ConfigStore::in_memory(config));

        let mic = devices.microphone_config();
        assert_eq!(mic.framing, AudioFraming::Mcap);
        assert_eq!(mic.sample_rate, 16000);
        assert_eq!(mic.input, vec!["-f", "pulse", "-i", "default"]);
    }

    #[test]
    fn test_settings_input_overrides_default() {
        let devices = ProcessCaptureDevices::new(ConfigStore::in_memory(AppConfig::default()));
        let mut settings = AppConfig::default().video.screen.capture_settings();
        let config = devices.video_config(StreamKind::Screen, &settings);
        assert_eq!(config.input, vec!["-f", "x11grab", "-i", ":0.0"]);

        settings.input = Some(vec!["-i".to_string(), ":1.0".to_string()]);
        let config = devices.video_config(StreamKind::Screen, &settings);
        assert_eq!(config.input, vec!["-i", ":1.0"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_device_unavailable() {
        let mut config = AppConfig::default();
        config.capture.program = "/nonexistent/capture".to_string();
        let devices = ProcessCaptureDevices::new(ConfigStore::in_memory(config));
        let settings = AppConfig::default().video.camera.capture_settings();

        let err = devices.open_camera(&settings).await.err().unwrap();
        assert!(matches!(err, AppError::DeviceUnavailable { .. }));
        let err = devices.open_microphone().await.err().unwrap();
        assert!(matches!(err, AppError::DeviceUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoded_mode_opens_encoded_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.h264");
        // SPS, then an IDR slice
        std::fs::write(&path, [0, 0, 0, 2, 0x67, 0x42, 0, 0, 0, 2, 0x65, 0x88]).unwrap();

        let mut config = AppConfig::default();
        config.capture.program = "sh".to_string();
        config.capture.video_encoded = true;
        let devices = ProcessCaptureDevices::new(ConfigStore::in_memory(config));
        let mut settings = AppConfig::default().video.camera.capture_settings();
        // The generated --width/--encode flags land in the script's positional args
        settings.input = Some(vec![
            "-c".to_string(),
            format!("cat '{}'", path.display()),
            "capture".to_string(),
        ]);

        let Ok(VideoInput::Encoded(mut source)) = devices.open_camera(&settings).await else {
            panic!("expected a device-encoded camera");
        };
        let access_unit = source.next_access_unit().await.unwrap();
        assert!(crate::video::nal::is_keyframe(&access_unit));
        assert!(access_unit.starts_with(&crate::video::nal::START_CODE));
        source.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_sources_parses_program_output() {
        let mut config = AppConfig::default();
        config.capture.program = "echo".to_string();
        config.capture.list_args = vec![r#"{"displays":[{"index":0,"name":"Built-in"}],"cameras":[]}"#.to_string()];
        let devices = ProcessCaptureDevices::new(ConfigStore::in_memory(config));

        let sources = devices.list_sources().await.unwrap();
        assert_eq!(sources["displays"][0]["name"], "Built-in");
        assert!(sources["cameras"].as_array().unwrap().is_empty());

        let mut config = AppConfig::default();
        config.capture.program = "false".to_string();
        let devices = ProcessCaptureDevices::new(ConfigStore::in_memory(config));
        assert!(matches!(devices.list_sources().await, Err(AppError::Subprocess { .. })));
    }
}
