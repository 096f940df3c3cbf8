//! Outbound camera / screen pipeline
//!
//! ```text
//! VideoSource ──> SubprocessEncoder ──> H264Packetizer ──> MediaTransport
//!   (capture task)            (send task, PT 96 or 97)
//!
//! EncodedVideoSource ─────────────────> H264Packetizer ──> MediaTransport
//!   (relay task)
//! ```
//!
//! Each stream kind runs its own pipeline; camera and screen may run together.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{EncodedVideoSource, VideoSource};
use super::encoder::{H264EncoderConfig, SubprocessEncoder};
use super::nal;
use crate::error::Result;
use crate::events::{CallEvent, EventBus};
use crate::session::StreamKind;
use crate::utils::LogThrottler;
use crate::webrtc::{H264Packetizer, MediaTransport, TransportState};

/// Counters shared with the pipeline tasks
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub access_units_sent: AtomicU64,
    pub packets_sent: AtomicU64,
    pub keyframes_sent: AtomicU64,
    /// Access units produced before the transport was connected
    pub access_units_dropped: AtomicU64,
}

/// Access units buffered between an encoding capture device and the sender
const ENCODED_QUEUE_DEPTH: usize = 8;

/// Running capture + encode + send pipeline for one stream kind
pub struct OutboundVideoPipeline {
    kind: StreamKind,
    /// Absent when the capture device encodes
    encoder: Option<Arc<SubprocessEncoder>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PipelineStats>,
    stop_timeout: Duration,
}

impl OutboundVideoPipeline {
    pub fn start(
        kind: StreamKind,
        source: Box<dyn VideoSource>,
        encoder_config: &H264EncoderConfig,
        transport: Arc<dyn MediaTransport>,
        max_payload: usize,
        events: Arc<EventBus>,
        stop_timeout: Duration,
    ) -> Result<Self> {
        let (encoder, access_units) = SubprocessEncoder::start(kind.as_str(), encoder_config)?;
        let encoder = Arc::new(encoder);
        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());

        let capture = tokio::spawn(capture_loop(
            kind,
            source,
            encoder.clone(),
            events.clone(),
            stats.clone(),
            cancel.clone(),
        ));

        let packetizer = H264Packetizer::new(kind, 0, encoder_config.fps, max_payload);
        let send = tokio::spawn(send_loop(
            kind,
            access_units,
            packetizer,
            transport,
            events,
            stats.clone(),
            cancel.clone(),
        ));

        info!(
            "{} pipeline started: {} @ {}fps",
            kind, encoder_config.resolution, encoder_config.fps
        );

        Ok(Self {
            kind,
            encoder: Some(encoder),
            cancel,
            tasks: Mutex::new(vec![capture, send]),
            stats,
            stop_timeout,
        })
    }

    /// Packetize access units from a device that encodes on its own
    pub fn start_encoded(
        kind: StreamKind,
        source: Box<dyn EncodedVideoSource>,
        fps: u32,
        transport: Arc<dyn MediaTransport>,
        max_payload: usize,
        events: Arc<EventBus>,
        stop_timeout: Duration,
    ) -> Self {
        let (tx, access_units) = tokio::sync::mpsc::channel(ENCODED_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());
        let resolution = source.resolution();

        let relay = tokio::spawn(relay_loop(
            kind,
            source,
            tx,
            events.clone(),
            stats.clone(),
            cancel.clone(),
        ));

        let packetizer = H264Packetizer::new(kind, 0, fps, max_payload);
        let send = tokio::spawn(send_loop(
            kind,
            access_units,
            packetizer,
            transport,
            events,
            stats.clone(),
            cancel.clone(),
        ));

        info!("{} pipeline started: {} @ {}fps, encoded by device", kind, resolution, fps);

        Self {
            kind,
            encoder: None,
            cancel,
            tasks: Mutex::new(vec![relay, send]),
            stats,
            stop_timeout,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.encoder.as_ref().map_or(true, |e| e.is_running())
    }

    /// Signal both tasks, wait for them (bounded), then stop any encoder
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
                warn!("{} pipeline task did not stop in {:?}, aborting", self.kind, self.stop_timeout);
                task.abort();
            }
        }
        if let Some(encoder) = &self.encoder {
            encoder.stop().await;
        }
        info!(
            "{} pipeline stopped ({} frames, {} access units sent)",
            self.kind,
            self.stats.frames_captured.load(Ordering::Relaxed),
            self.stats.access_units_sent.load(Ordering::Relaxed)
        );
    }
}

impl Drop for OutboundVideoPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn capture_loop(
    kind: StreamKind,
    mut source: Box<dyn VideoSource>,
    encoder: Arc<SubprocessEncoder>,
    events: Arc<EventBus>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    let throttler = LogThrottler::with_secs(5);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => frame,
        };

        let Some(frame) = frame else {
            warn!("{} capture ended", kind);
            events.publish(CallEvent::PipelineFailed {
                pipeline: format!("{} capture", kind),
                reason: "capture device stopped".to_string(),
            });
            break;
        };
        stats.frames_captured.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = encoder.encode(&frame).await {
            if !encoder.is_running() {
                if !cancel.is_cancelled() {
                    warn!("{} encoder stopped: {}", kind, e);
                }
                break;
            }
            if let Some(suppressed) = throttler.check("encode") {
                debug!(suppressed, "{} frame #{} rejected: {}", kind, frame.sequence, e);
            }
        }
    }

    source.close().await;
}

/// Forward device-encoded access units to the send task
async fn relay_loop(
    kind: StreamKind,
    mut source: Box<dyn EncodedVideoSource>,
    tx: tokio::sync::mpsc::Sender<bytes::Bytes>,
    events: Arc<EventBus>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    loop {
        let access_unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            au = source.next_access_unit() => au,
        };

        let Some(access_unit) = access_unit else {
            warn!("{} capture ended", kind);
            events.publish(CallEvent::PipelineFailed {
                pipeline: format!("{} capture", kind),
                reason: "capture device stopped".to_string(),
            });
            // The send task has nothing left to report
            cancel.cancel();
            break;
        };
        stats.frames_captured.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(access_unit) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    source.close().await;
}

async fn send_loop(
    kind: StreamKind,
    mut access_units: tokio::sync::mpsc::Receiver<bytes::Bytes>,
    mut packetizer: H264Packetizer,
    transport: Arc<dyn MediaTransport>,
    events: Arc<EventBus>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    let throttler = LogThrottler::with_secs(5);

    loop {
        let access_unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            au = access_units.recv() => au,
        };

        let Some(access_unit) = access_unit else {
            if !cancel.is_cancelled() {
                warn!("{} encoder output ended", kind);
                events.publish(CallEvent::PipelineFailed {
                    pipeline: format!("{} encoder", kind),
                    reason: "encoder process exited".to_string(),
                });
            }
            break;
        };

        if transport.state() != TransportState::Connected {
            stats.access_units_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if let Some(ssrc) = transport.local_ssrc(kind.into()) {
            if ssrc != packetizer.ssrc() {
                packetizer.set_ssrc(ssrc);
            }
        }

        let keyframe = nal::is_keyframe(&access_unit);
        let packets = packetizer.packetize(&access_unit);
        let count = packets.len() as u64;
        match transport.send_video(kind, packets).await {
            Ok(()) => {
                stats.access_units_sent.fetch_add(1, Ordering::Relaxed);
                if keyframe {
                    stats.keyframes_sent.fetch_add(1, Ordering::Relaxed);
                }
                stats.packets_sent.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                if let Some(suppressed) = throttler.check("send") {
                    debug!(suppressed, "{} send failed: {}", kind, e);
                }
            }
        }
    }
}
