//! H.264 encoding through an external encoder process
//!
//! Raw BGR24/NV12 frames are written to the encoder's stdin. Its stdout is an
//! Annex-B elementary stream with an access unit delimiter in front of every
//! picture, which [`AccessUnitSplitter`] uses to cut it back into frames.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use crate::codec::{CodecProcess, CodecProcessConfig, Framer};
use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::VideoFrame;
use crate::video::nal::{self, NalType};

/// Splits an Annex-B byte stream into access units at AUD NAL units
#[derive(Debug)]
pub struct AccessUnitSplitter {
    buffer: BytesMut,
    /// Resume point for the start code scan
    scan_from: usize,
}

impl AccessUnitSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            scan_from: 1,
        }
    }

    /// Offset of the next AUD start code after the current unit's beginning
    fn next_boundary(&self) -> Option<usize> {
        let mut from = self.scan_from;
        while let Some((pos, len)) = nal::find_start_code(&self.buffer, from) {
            let header = pos + len;
            if header >= self.buffer.len() {
                return None;
            }
            if pos > 0 && NalType::from_header(self.buffer[header]) == NalType::Aud {
                return Some(pos);
            }
            from = header;
        }
        None
    }
}

impl Default for AccessUnitSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer for AccessUnitSplitter {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) {
        self.buffer.extend_from_slice(chunk);
        while let Some(boundary) = self.next_boundary() {
            out.push(self.buffer.split_to(boundary).freeze());
            self.scan_from = 1;
        }
        // A start code may straddle the next chunk
        self.scan_from = self.buffer.len().saturating_sub(4).max(1);
    }

    fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }
}

/// Encoder process settings
#[derive(Debug, Clone)]
pub struct H264EncoderConfig {
    pub program: String,
    /// Replaces the generated ffmpeg arguments when set
    pub args: Option<Vec<String>>,
    /// Appended to the generated codec options
    pub extra_args: Vec<String>,
    pub resolution: Resolution,
    pub input_format: PixelFormat,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames
    pub gop_size: u32,
    pub stop_timeout: Duration,
}

impl H264EncoderConfig {
    pub fn new(resolution: Resolution, input_format: PixelFormat, fps: u32, bitrate_kbps: u32) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: None,
            extra_args: Vec::new(),
            resolution,
            input_format,
            fps,
            bitrate_kbps,
            gop_size: fps.max(1) * 2,
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn process_args(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        let size = format!("{}x{}", self.resolution.width, self.resolution.height);
        let bitrate = format!("{}k", self.bitrate_kbps);
        let fps = self.fps.to_string();
        let gop = self.gop_size.to_string();
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            self.input_format.ffmpeg_name(),
            "-s",
            size.as_str(),
            "-r",
            fps.as_str(),
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-profile:v",
            "baseline",
            "-b:v",
            bitrate.as_str(),
            "-g",
            gop.as_str(),
            "-bf",
            "0",
            "-bsf:v",
            "h264_metadata=aud=insert",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(self.extra_args.iter().cloned());
        args.extend(["-f", "h264", "pipe:1"].iter().map(|s| s.to_string()));
        args
    }
}

/// Running encoder process for one outbound stream
pub struct SubprocessEncoder {
    process: CodecProcess,
    frame_size: usize,
    sequence: AtomicU64,
}

impl SubprocessEncoder {
    /// Start the encoder; encoded access units arrive on the returned receiver
    pub fn start(label: &str, config: &H264EncoderConfig) -> Result<(Self, mpsc::Receiver<Bytes>)> {
        let process_config = CodecProcessConfig::new(&config.program)
            .args(config.process_args())
            .stop_timeout(config.stop_timeout);
        let (process, output) =
            CodecProcess::spawn(format!("encoder {}", label), &process_config, AccessUnitSplitter::new())?;

        info!(
            "H264 encoder for {} started: {} {} @ {}fps, {}kbps",
            label, config.resolution, config.input_format, config.fps, config.bitrate_kbps
        );

        Ok((
            Self {
                process,
                frame_size: config.input_format.frame_size(config.resolution),
                sequence: AtomicU64::new(0),
            },
            output,
        ))
    }

    /// Submit one raw frame, waiting if the encoder is backed up
    pub async fn encode(&self, frame: &VideoFrame) -> Result<()> {
        if frame.len() != self.frame_size {
            return Err(AppError::VideoError(format!(
                "Frame #{} is {} bytes, encoder expects {}",
                frame.sequence,
                frame.len(),
                self.frame_size
            )));
        }
        self.process.feed(frame.data_bytes()).await?;
        self.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn frames_encoded(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub async fn stop(&self) {
        self.process.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for u in units {
            out.extend_from_slice(&nal::START_CODE);
            out.extend_from_slice(u);
        }
        out
    }

    #[test]
    fn test_splits_on_aud_across_chunk_boundaries() {
        let aud: &[u8] = &[0x09, 0xf0];
        let first = stream(&[aud, &[0x67, 0x42, 0x00, 0x1f], &[0x68, 0xce], &[0x65, 1, 2, 3]]);
        let second = stream(&[aud, &[0x41, 4, 5, 6, 7]]);
        let third = stream(&[aud, &[0x41, 8, 9]]);
        let all = [first.clone(), second.clone(), third.clone()].concat();

        for chunk_size in [1, 3, 7, 64] {
            let mut splitter = AccessUnitSplitter::new();
            let mut out = Vec::new();
            for chunk in all.chunks(chunk_size) {
                splitter.push(chunk, &mut out);
            }
            assert_eq!(out.len(), 2, "chunk size {}", chunk_size);
            assert_eq!(&out[0][..], &first[..]);
            assert_eq!(&out[1][..], &second[..]);
            assert_eq!(splitter.finish().as_deref(), Some(&third[..]));
            assert!(splitter.finish().is_none());
        }
    }

    #[test]
    fn test_default_args() {
        let config = H264EncoderConfig::new(Resolution::VGA, PixelFormat::Bgr24, 15, 800);
        let args = config.process_args();
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "640x480"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "bgr24"));
        assert!(args.contains(&"h264_metadata=aud=insert".to_string()));
        assert_eq!(config.gop_size, 30);
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));

        let mut tuned = config.clone();
        tuned.extra_args = vec!["-threads".to_string(), "2".to_string()];
        let args = tuned.process_args();
        let pos = args.iter().position(|a| a == "-threads").unwrap();
        assert_eq!(&args[pos + 2..], &["-f", "h264", "pipe:1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejects_wrong_frame_size() {
        let mut config = H264EncoderConfig::new(Resolution::new(4, 4), PixelFormat::Bgr24, 15, 100);
        config.program = "cat".to_string();
        config.args = Some(vec![]);
        let (encoder, _output) = SubprocessEncoder::start("test", &config).unwrap();

        let bad = VideoFrame::new(Bytes::from(vec![0u8; 10]), config.resolution, PixelFormat::Bgr24, 0);
        assert!(encoder.encode(&bad).await.is_err());
        assert_eq!(encoder.frames_encoded(), 0);
        encoder.stop().await;
    }
}
