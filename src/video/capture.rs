//! Camera and screen capture
//!
//! Capture is delegated to a capture program writing to stdout. In raw mode
//! frames are cut at exactly `frame_size` bytes and handed out in order. In
//! encoded mode the program writes length-prefixed (AVCC) H.264 and the
//! stream is regrouped into Annex-B access units for the packetizer.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use super::nal::{self, NalType};
use crate::codec::{CodecProcess, CodecProcessConfig, FrameAccumulator, Framer};
use crate::error::{AppError, Result};

/// Largest NAL unit accepted from an encoding capture program
const MAX_AVCC_NAL_SIZE: usize = 16 * 1024 * 1024;

/// Producer of raw frames for one outbound stream
#[async_trait]
pub trait VideoSource: Send {
    fn resolution(&self) -> Resolution;

    fn format(&self) -> PixelFormat;

    /// Next captured frame; `None` once the device has stopped
    async fn next_frame(&mut self) -> Option<VideoFrame>;

    async fn close(&mut self);
}

/// Producer of H.264 access units encoded by the capture device itself
#[async_trait]
pub trait EncodedVideoSource: Send {
    fn resolution(&self) -> Resolution;

    /// Next Annex-B access unit; `None` once the device has stopped
    async fn next_access_unit(&mut self) -> Option<Bytes>;

    async fn close(&mut self);
}

/// An opened camera or screen
pub enum VideoInput {
    /// Raw frames, encoded by the pipeline's encoder process
    Raw(Box<dyn VideoSource>),
    /// Access units ready for packetization
    Encoded(Box<dyn EncodedVideoSource>),
}

/// Parameters for one capture request
#[derive(Debug, Clone, PartialEq)]
pub struct VideoCaptureSettings {
    pub resolution: Resolution,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub format: PixelFormat,
    /// Capture program input options; the configured default when `None`
    pub input: Option<Vec<String>>,
}

impl VideoCaptureSettings {
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.resolution)
    }

    /// Frame interval at the requested rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }

    /// Bitrate in whole Mbps, as taken by encoding capture programs
    pub fn bitrate_mbps(&self) -> u32 {
        (self.bitrate_kbps.saturating_add(500) / 1000).clamp(1, 100)
    }
}

/// Capture program invocation for a video device
#[derive(Debug, Clone)]
pub struct ProcessCaptureConfig {
    pub program: String,
    /// Options selecting the device
    pub input: Vec<String>,
    /// Replaces the generated arguments when set
    pub args: Option<Vec<String>>,
    /// Wait for the first frame before reporting the device unavailable
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
}

impl ProcessCaptureConfig {
    fn process_args(&self, settings: &VideoCaptureSettings) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.input.iter().cloned());
        args.extend([
            "-an".to_string(),
            "-s".to_string(),
            settings.resolution.to_string(),
            "-r".to_string(),
            settings.fps.to_string(),
            "-pix_fmt".to_string(),
            settings.format.ffmpeg_name().to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }

    /// Arguments asking the capture program for H.264 output
    fn encoded_args(&self, settings: &VideoCaptureSettings) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        let mut args = self.input.clone();
        args.extend([
            "--width".to_string(),
            settings.resolution.width.to_string(),
            "--height".to_string(),
            settings.resolution.height.to_string(),
            "--fps".to_string(),
            settings.fps.to_string(),
            "--encode".to_string(),
            "--bitrate".to_string(),
            settings.bitrate_mbps().to_string(),
        ]);
        args
    }
}

/// Wait for the first unit a capture process produces
async fn first_output(
    device: &str,
    process: &CodecProcess,
    output: &mut mpsc::Receiver<Bytes>,
    timeout: Duration,
) -> Result<Bytes> {
    match tokio::time::timeout(timeout, output.recv()).await {
        Ok(Some(unit)) => Ok(unit),
        Ok(None) => {
            process.stop().await;
            Err(AppError::device_unavailable(
                device,
                "capture exited before producing a frame",
            ))
        }
        Err(_) => {
            process.stop().await;
            Err(AppError::device_unavailable(
                device,
                format!("no frame within {:?}", timeout),
            ))
        }
    }
}

/// Video source backed by a capture subprocess
pub struct ProcessVideoSource {
    device: String,
    process: CodecProcess,
    output: mpsc::Receiver<Bytes>,
    /// First frame, read while probing the device
    pending: Option<Bytes>,
    resolution: Resolution,
    format: PixelFormat,
    sequence: u64,
}

impl ProcessVideoSource {
    /// Start capturing; fails with `DeviceUnavailable` if no frame arrives
    pub async fn open(
        device: &str,
        config: &ProcessCaptureConfig,
        settings: &VideoCaptureSettings,
    ) -> Result<Self> {
        let process_config = CodecProcessConfig::new(&config.program)
            .args(config.process_args(settings))
            .stop_timeout(config.stop_timeout);

        let (process, mut output) = CodecProcess::spawn(
            format!("{} capture", device),
            &process_config,
            FrameAccumulator::new(settings.frame_size()),
        )
        .map_err(|e| AppError::device_unavailable(device, e))?;

        let first = first_output(device, &process, &mut output, config.startup_timeout).await?;

        info!(
            "{} capture started: {} {} @ {}fps",
            device, settings.resolution, settings.format, settings.fps
        );

        Ok(Self {
            device: device.to_string(),
            process,
            output,
            pending: Some(first),
            resolution: settings.resolution,
            format: settings.format,
            sequence: 0,
        })
    }
}

#[async_trait]
impl VideoSource for ProcessVideoSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    async fn next_frame(&mut self) -> Option<VideoFrame> {
        let data = match self.pending.take() {
            Some(data) => data,
            None => self.output.recv().await?,
        };
        let frame = VideoFrame::new(data, self.resolution, self.format, self.sequence);
        self.sequence += 1;
        Some(frame)
    }

    async fn close(&mut self) {
        debug!("Closing {} capture after {} frames", self.device, self.sequence);
        self.process.stop().await;
    }
}

/// Regroups a length-prefixed H.264 stream into Annex-B access units
///
/// A unit is emitted once the first NAL of the next picture arrives: an AUD,
/// SPS, PPS or SEI after a slice, or a slice with `first_mb_in_slice == 0`.
#[derive(Debug, Default)]
pub struct AvccAccessUnitFramer {
    buffer: BytesMut,
    /// Length-prefixed NAL units of the access unit being collected
    current: BytesMut,
    has_slice: bool,
}

impl AvccAccessUnitFramer {
    pub fn new() -> Self {
        Self::default()
    }

    fn starts_access_unit(&self, unit: &[u8]) -> bool {
        if !self.has_slice {
            return false;
        }
        match NalType::from_header(unit[0]) {
            NalType::Aud | NalType::Sps | NalType::Pps | NalType::Sei => true,
            // first_mb_in_slice is ue(v); a leading 1 bit encodes zero
            t if t.is_vcl() => unit.get(1).is_some_and(|b| b & 0x80 != 0),
            _ => false,
        }
    }

    fn take_access_unit(&mut self) -> Option<Bytes> {
        let avcc = self.current.split();
        self.has_slice = false;
        if avcc.is_empty() {
            return None;
        }
        match nal::avcc_to_annexb(&avcc) {
            Ok(access_unit) => Some(access_unit),
            Err(e) => {
                warn!("Dropping malformed access unit: {}", e);
                None
            }
        }
    }
}

impl Framer for AvccAccessUnitFramer {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) {
        self.buffer.extend_from_slice(chunk);
        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
            if len == 0 {
                self.buffer.advance(4);
                continue;
            }
            if len > MAX_AVCC_NAL_SIZE {
                warn!("AVCC length {} out of range, discarding buffered stream", len);
                self.buffer.clear();
                self.current.clear();
                self.has_slice = false;
                return;
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let unit = self.buffer.split_to(4 + len);
            if self.starts_access_unit(&unit[4..]) {
                out.extend(self.take_access_unit());
            }
            if NalType::from_header(unit[4]).is_vcl() {
                self.has_slice = true;
            }
            self.current.extend_from_slice(&unit);
        }
    }

    fn finish(&mut self) -> Option<Bytes> {
        self.take_access_unit()
    }
}

/// Encoded video source backed by a capture subprocess
pub struct ProcessEncodedSource {
    device: String,
    process: CodecProcess,
    output: mpsc::Receiver<Bytes>,
    pending: Option<Bytes>,
    resolution: Resolution,
    access_units: u64,
    keyframes: u64,
}

impl ProcessEncodedSource {
    /// Start capturing; fails with `DeviceUnavailable` if no access unit arrives
    pub async fn open(
        device: &str,
        config: &ProcessCaptureConfig,
        settings: &VideoCaptureSettings,
    ) -> Result<Self> {
        let process_config = CodecProcessConfig::new(&config.program)
            .args(config.encoded_args(settings))
            .stop_timeout(config.stop_timeout);

        let (process, mut output) = CodecProcess::spawn(
            format!("{} capture", device),
            &process_config,
            AvccAccessUnitFramer::new(),
        )
        .map_err(|e| AppError::device_unavailable(device, e))?;

        let first = first_output(device, &process, &mut output, config.startup_timeout).await?;

        info!(
            "{} capture started: {} H.264 @ {}fps, {} Mbps",
            device,
            settings.resolution,
            settings.fps,
            settings.bitrate_mbps()
        );

        Ok(Self {
            device: device.to_string(),
            process,
            output,
            pending: Some(first),
            resolution: settings.resolution,
            access_units: 0,
            keyframes: 0,
        })
    }
}

#[async_trait]
impl EncodedVideoSource for ProcessEncodedSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    async fn next_access_unit(&mut self) -> Option<Bytes> {
        let access_unit = match self.pending.take() {
            Some(access_unit) => access_unit,
            None => self.output.recv().await?,
        };
        self.access_units += 1;
        if nal::is_keyframe(&access_unit) {
            self.keyframes += 1;
        }
        Some(access_unit)
    }

    async fn close(&mut self) {
        debug!(
            "Closing {} capture after {} access units ({} keyframes)",
            self.device, self.access_units, self.keyframes
        );
        self.process.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VideoCaptureSettings {
        VideoCaptureSettings {
            resolution: Resolution::new(4, 2),
            fps: 10,
            bitrate_kbps: 100,
            format: PixelFormat::Bgr24,
            input: None,
        }
    }

    #[test]
    fn test_capture_args() {
        let config = ProcessCaptureConfig {
            program: "ffmpeg".to_string(),
            input: vec!["-f".into(), "v4l2".into(), "-i".into(), "/dev/video0".into()],
            args: None,
            startup_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
        };
        let args = config.process_args(&settings());
        let input_pos = args.iter().position(|a| a == "/dev/video0").unwrap();
        let size_pos = args.iter().position(|a| a == "4x2").unwrap();
        assert!(input_pos < size_pos);
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "bgr24"));
        assert_eq!(settings().frame_interval(), Duration::from_millis(100));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_source_yields_exact_frames() {
        let config = ProcessCaptureConfig {
            program: "cat".to_string(),
            input: vec![],
            args: Some(vec!["/dev/zero".to_string()]),
            startup_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(500),
        };
        let mut source = ProcessVideoSource::open("camera", &config, &settings())
            .await
            .unwrap();

        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();
        assert_eq!(first.len(), 24);
        assert!(first.is_complete());
        assert_eq!(second.sequence, 1);
        source.close().await;
    }

    fn avcc(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out
    }

    const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1e];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
    const IDR_FIRST: &[u8] = &[0x65, 0x88, 0x84, 0x21];
    const IDR_SECOND: &[u8] = &[0x65, 0x20, 0x11, 0x22];
    const P_SLICE: &[u8] = &[0x41, 0x9a, 0x02, 0x03];

    #[test]
    fn test_avcc_framer_groups_slices_into_access_units() {
        let stream = avcc(&[SPS, PPS, IDR_FIRST, IDR_SECOND, P_SLICE]);
        let mut framer = AvccAccessUnitFramer::new();
        let mut out = Vec::new();
        for byte in &stream {
            framer.push(std::slice::from_ref(byte), &mut out);
        }

        assert_eq!(out.len(), 1);
        let units = nal::find_nal_units(&out[0]);
        assert_eq!(units.len(), 4);
        assert!(out[0].starts_with(&nal::START_CODE));
        assert!(nal::is_keyframe(&out[0]));
        assert!(nal::extract_parameter_sets(&out[0]).is_complete());

        let last = framer.finish().unwrap();
        assert_eq!(nal::find_nal_units(&last).len(), 1);
        assert!(!nal::is_keyframe(&last));
        assert!(framer.finish().is_none());
    }

    #[test]
    fn test_avcc_framer_discards_absurd_length() {
        let mut framer = AvccAccessUnitFramer::new();
        let mut out = Vec::new();
        framer.push(&[0xff, 0xff, 0xff, 0xff, 0x65, 0x88], &mut out);
        assert!(out.is_empty());
        assert!(framer.finish().is_none());

        framer.push(&avcc(&[IDR_FIRST, P_SLICE, P_SLICE]), &mut out);
        assert_eq!(out.len(), 2);
        assert!(nal::is_keyframe(&out[0]));
    }

    #[test]
    fn test_encoded_capture_args() {
        let config = ProcessCaptureConfig {
            program: "capture-tool".to_string(),
            input: vec!["--camera".into(), "/dev/video0".into()],
            args: None,
            startup_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
        };
        let mut settings = settings();
        settings.bitrate_kbps = 2000;
        let args = config.encoded_args(&settings);
        assert_eq!(&args[..2], ["--camera", "/dev/video0"]);
        assert!(args.windows(2).any(|w| w[0] == "--width" && w[1] == "4"));
        assert!(args.windows(2).any(|w| w[0] == "--bitrate" && w[1] == "2"));
        assert!(args.iter().any(|a| a == "--encode"));

        settings.bitrate_kbps = 100;
        assert_eq!(settings.bitrate_mbps(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoded_source_yields_annexb_access_units() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.h264");
        std::fs::write(&path, avcc(&[SPS, PPS, IDR_FIRST, P_SLICE])).unwrap();

        let config = ProcessCaptureConfig {
            program: "cat".to_string(),
            input: vec![],
            args: Some(vec![path.to_string_lossy().into_owned()]),
            startup_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(500),
        };
        let mut source = ProcessEncodedSource::open("screen", &config, &settings())
            .await
            .unwrap();

        let first = source.next_access_unit().await.unwrap();
        assert!(nal::is_keyframe(&first));
        assert_eq!(nal::find_nal_units(&first).len(), 3);
        let second = source.next_access_unit().await.unwrap();
        assert_eq!(nal::nal_type(&nal::find_nal_units(&second)[0]), Some(NalType::NonIdrSlice));
        assert!(source.next_access_unit().await.is_none());
        source.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_device_that_exits_is_unavailable() {
        let config = ProcessCaptureConfig {
            program: "true".to_string(),
            input: vec![],
            args: Some(vec![]),
            startup_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(200),
        };
        let err = ProcessVideoSource::open("camera", &config, &settings())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::DeviceUnavailable { .. }));

        let config = ProcessCaptureConfig {
            program: "/nonexistent/capture-tool".to_string(),
            ..config
        };
        let err = ProcessVideoSource::open("screen", &config, &settings())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::DeviceUnavailable { .. }));
    }
}
