//! Software H264 decoding through an external decoder process
//!
//! Whole Annex-B access units go in on stdin; fixed-size raw frames come back
//! on stdout and are published as [`RemoteVideoFrame`]s.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::{CodecProcess, CodecProcessConfig, FrameAccumulator};
use crate::error::Result;
use crate::events::{CallEvent, EventBus};
use crate::session::{StreamKind, UserId};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::{RemoteVideoFrame, VideoFrame};

/// Decoder process settings
#[derive(Debug, Clone)]
pub struct SoftwareDecoderConfig {
    pub program: String,
    /// Replaces the generated ffmpeg arguments when set
    pub args: Option<Vec<String>>,
    pub output_format: PixelFormat,
    /// Access units queued ahead of the process before new ones are refused
    pub queue_frames: usize,
    /// How long the queue may stay full before the decoder counts as stalled
    pub stall_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for SoftwareDecoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: None,
            output_format: PixelFormat::Rgb24,
            queue_frames: 4,
            stall_timeout: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl SoftwareDecoderConfig {
    fn process_args(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-f",
            "h264",
            "-i",
            "pipe:0",
            "-f",
            "rawvideo",
            "-pix_fmt",
            self.output_format.ffmpeg_name(),
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Result of handing an access unit to the decoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full; the access unit was not taken
    Full,
    /// Queue has been full for longer than the stall timeout
    Stalled,
    /// Process has exited or was stopped
    Stopped,
}

/// One running software decoder for a remote stream
///
/// Submitting never waits: a decoder that stops reading only loses its own
/// frames.
pub struct SoftwareDecoder {
    process: CodecProcess,
    forwarder: Option<JoinHandle<()>>,
    resolution: Resolution,
    format: PixelFormat,
    stall_timeout: Duration,
    full_since: Option<Instant>,
}

impl SoftwareDecoder {
    /// Start the decoder process; decoded frames go to `events`
    pub fn start(
        config: &SoftwareDecoderConfig,
        resolution: Resolution,
        user_id: UserId,
        kind: StreamKind,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let format = config.output_format;
        let frame_size = format.frame_size(resolution);
        let process_config = CodecProcessConfig::new(&config.program)
            .args(config.process_args())
            .input_capacity(config.queue_frames)
            .stop_timeout(config.stop_timeout);

        let label = format!("decoder {}/{}", user_id, kind);
        let (process, mut frames) =
            CodecProcess::spawn(label.clone(), &process_config, FrameAccumulator::new(frame_size))?;

        info!(
            "Software decoder for {}/{} started: {} {} ({} bytes/frame)",
            user_id, kind, resolution, format, frame_size
        );

        let forwarder = tokio::spawn(async move {
            let mut sequence = 0u64;
            while let Some(data) = frames.recv().await {
                events.publish_frame(RemoteVideoFrame {
                    user_id: user_id.clone(),
                    kind,
                    frame: VideoFrame::new(data, resolution, format, sequence),
                });
                sequence += 1;
            }
            debug!("{} output ended after {} frames", label, sequence);
            if sequence == 0 {
                events.publish(CallEvent::PipelineFailed {
                    pipeline: label,
                    reason: "decoder produced no frames".to_string(),
                });
            }
        });

        Ok(Self {
            process,
            forwarder: Some(forwarder),
            resolution,
            format,
            stall_timeout: config.stall_timeout,
            full_since: None,
        })
    }

    /// Queue one complete access unit for the process
    pub fn submit(&mut self, access_unit: Bytes) -> SubmitOutcome {
        if !self.process.is_running() {
            return SubmitOutcome::Stopped;
        }
        match self.process.try_feed(access_unit) {
            Ok(true) => {
                self.full_since = None;
                SubmitOutcome::Queued
            }
            Ok(false) => {
                let since = *self.full_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.stall_timeout {
                    SubmitOutcome::Stalled
                } else {
                    SubmitOutcome::Full
                }
            }
            Err(_) => SubmitOutcome::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Stop the process (bounded wait, then kill)
    pub async fn dispose(&mut self) {
        self.process.stop().await;
        if let Some(forwarder) = self.forwarder.take() {
            // The reader is gone, so the output channel is closed or about to be
            let _ = tokio::time::timeout(Duration::from_millis(200), forwarder).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args_request_raw_output() {
        let config = SoftwareDecoderConfig {
            output_format: PixelFormat::Nv12,
            ..Default::default()
        };
        let args = config.process_args();
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "nv12"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_frames_published_at_exact_size() {
        let events = Arc::new(EventBus::new());
        let mut frames = events.subscribe_frames();
        let config = SoftwareDecoderConfig {
            program: "cat".to_string(),
            args: Some(vec![]),
            stop_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let resolution = Resolution::new(4, 2);
        let mut decoder =
            SoftwareDecoder::start(&config, resolution, "u1".to_string(), StreamKind::Camera, events)
                .unwrap();

        // 24 bytes per frame, delivered in uneven pieces
        assert_eq!(decoder.submit(Bytes::from(vec![7u8; 10])), SubmitOutcome::Queued);
        assert_eq!(decoder.submit(Bytes::from(vec![7u8; 20])), SubmitOutcome::Queued);
        assert_eq!(decoder.submit(Bytes::from(vec![9u8; 18])), SubmitOutcome::Queued);

        let first = frames.recv().await.unwrap();
        let second = frames.recv().await.unwrap();
        assert_eq!(first.user_id, "u1");
        assert_eq!(first.kind, StreamKind::Camera);
        assert!(first.frame.is_complete());
        assert_eq!(first.frame.sequence, 0);
        assert_eq!(second.frame.sequence, 1);
        assert_eq!(&second.frame.data()[18..], &[9u8; 6]);

        decoder.dispose().await;
        assert!(!decoder.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unread_input_reports_full_then_stalled() {
        let events = Arc::new(EventBus::new());
        let config = SoftwareDecoderConfig {
            program: "sleep".to_string(),
            args: Some(vec!["30".to_string()]),
            queue_frames: 1,
            stall_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let mut decoder = SoftwareDecoder::start(
            &config,
            Resolution::new(16, 16),
            "u1".to_string(),
            StreamKind::Screen,
            events,
        )
        .unwrap();

        let unit = Bytes::from(vec![0u8; 256 * 1024]);
        let mut outcome = SubmitOutcome::Queued;
        for _ in 0..16 {
            outcome = decoder.submit(unit.clone());
            if outcome != SubmitOutcome::Queued {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outcome, SubmitOutcome::Full);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(decoder.submit(unit), SubmitOutcome::Stalled);
        decoder.dispose().await;
    }
}
