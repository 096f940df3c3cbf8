//! Outbound microphone pipeline
//!
//! capture -> noise gate / VAD -> decimate to 8 kHz -> G.711 -> transport

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{AudioChunk, AudioSource};
use super::vad::{SpeakingMonitor, VoiceActivityDetector};
use crate::codec::{G711Codec, G711_SAMPLE_RATE};
use crate::events::{CallEvent, EventBus};
use crate::session::UserId;
use crate::utils::LogThrottler;
use crate::webrtc::{MediaTransport, TransportState};

/// Resample by picking the nearest source sample
pub fn decimate(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as u64 * from_rate as u64 / to_rate as u64) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}

enum MicCommand {
    Pause,
    Resume,
}

/// Settings for one microphone pipeline
#[derive(Clone)]
pub struct MicrophonePipelineConfig {
    pub local_user: UserId,
    pub codec: G711Codec,
    pub packet_ms: u32,
    pub vad: VoiceActivityDetector,
    pub stop_timeout: Duration,
}

/// Running microphone pipeline
pub struct MicrophonePipeline {
    commands: mpsc::Sender<MicCommand>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    paused: AtomicBool,
    stop_timeout: Duration,
}

impl MicrophonePipeline {
    pub fn start(
        source: Box<dyn AudioSource>,
        config: MicrophonePipelineConfig,
        transport: Arc<dyn MediaTransport>,
        speaking: Arc<SpeakingMonitor>,
        events: Arc<EventBus>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let paused = source.is_paused();
        let stop_timeout = config.stop_timeout;

        let task = tokio::spawn(mic_loop(
            source,
            config,
            transport,
            speaking,
            events,
            command_rx,
            cancel.clone(),
        ));

        Self {
            commands,
            cancel,
            task: Mutex::new(Some(task)),
            paused: AtomicBool::new(paused),
            stop_timeout,
        }
    }

    /// Pause or resume the capture device
    pub async fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::AcqRel) == paused {
            return;
        }
        let cmd = if paused { MicCommand::Pause } else { MicCommand::Resume };
        if self.commands.send(cmd).await.is_err() {
            warn!("Microphone pipeline has exited, {} ignored", if paused { "pause" } else { "resume" });
            self.paused.store(!paused, Ordering::Release);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
                warn!("Microphone pipeline did not stop in {:?}, aborting", self.stop_timeout);
                task.abort();
            }
        }
    }
}

impl Drop for MicrophonePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn mic_loop(
    mut source: Box<dyn AudioSource>,
    config: MicrophonePipelineConfig,
    transport: Arc<dyn MediaTransport>,
    speaking: Arc<SpeakingMonitor>,
    events: Arc<EventBus>,
    mut commands: mpsc::Receiver<MicCommand>,
    cancel: CancellationToken,
) {
    let samples_per_packet = (G711_SAMPLE_RATE * config.packet_ms / 1000).max(1) as usize;
    let packet_duration = Duration::from_millis(config.packet_ms as u64);
    let mut pending: Vec<i16> = Vec::with_capacity(samples_per_packet * 2);
    let mut paused = source.is_paused();
    let throttler = LogThrottler::with_secs(5);
    let mut packets_sent = 0u64;

    info!("Microphone pipeline started ({}ms packets)", config.packet_ms);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(cmd) = commands.recv() => {
                let result = match cmd {
                    MicCommand::Pause => {
                        pending.clear();
                        paused = true;
                        source.pause().await
                    }
                    MicCommand::Resume => {
                        paused = false;
                        source.resume().await
                    }
                };
                if let Err(e) = result {
                    warn!("Microphone state change failed: {}", e);
                    events.publish(CallEvent::PipelineFailed {
                        pipeline: "microphone".to_string(),
                        reason: e.to_string(),
                    });
                    paused = true;
                }
            }

            chunk = source.next_chunk(), if !paused => {
                let Some(AudioChunk { sample_rate, mut samples, .. }) = chunk else {
                    warn!("Microphone capture ended");
                    events.publish(CallEvent::PipelineFailed {
                        pipeline: "microphone".to_string(),
                        reason: "capture ended".to_string(),
                    });
                    break;
                };

                let decision = config.vad.process(&mut samples);
                if decision.voiced {
                    speaking.voice(&config.local_user, Instant::now());
                }

                pending.extend(decimate(&samples, sample_rate, G711_SAMPLE_RATE));
                while pending.len() >= samples_per_packet {
                    let packet: Vec<i16> = pending.drain(..samples_per_packet).collect();
                    if transport.state() != TransportState::Connected {
                        continue;
                    }
                    let payload: Bytes = config.codec.encode(&packet);
                    match transport.send_audio(payload, packet_duration).await {
                        Ok(()) => packets_sent += 1,
                        Err(e) => {
                            if let Some(suppressed) = throttler.check("mic_send") {
                                debug!(suppressed, "Audio send failed: {}", e);
                            }
                        }
                    }
                }
            }
        }
    }

    source.close().await;
    debug!("Microphone pipeline stopped after {} packets", packets_sent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::vad::VoiceActivityDetector;
    use crate::codec::G711Variant;
    use crate::error::Result;
    use crate::webrtc::transport::tests::MemoryTransport;
    use crate::webrtc::TransportContext;
    use async_trait::async_trait;

    /// Endless 48 kHz tone; counts pause/resume calls
    struct ToneSource {
        amplitude: i16,
        paused: bool,
        pauses: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl AudioSource for ToneSource {
        async fn next_chunk(&mut self) -> Option<AudioChunk> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let samples = (0..960)
                .map(|i| if i % 2 == 0 { self.amplitude } else { -self.amplitude })
                .collect();
            Some(AudioChunk::new(48000, samples))
        }

        async fn pause(&mut self) -> Result<()> {
            self.paused = true;
            *self.pauses.lock() += 1;
            Ok(())
        }

        async fn resume(&mut self) -> Result<()> {
            self.paused = false;
            Ok(())
        }

        fn is_paused(&self) -> bool {
            self.paused
        }

        async fn close(&mut self) {}
    }

    fn memory_transport() -> Arc<MemoryTransport> {
        let (inbound, _) = mpsc::channel(4);
        let (signaling, _) = mpsc::channel(4);
        Arc::new(MemoryTransport::new(TransportContext {
            channel_id: "c".to_string(),
            inbound,
            signaling,
        }))
    }

    fn config() -> MicrophonePipelineConfig {
        MicrophonePipelineConfig {
            local_user: "me".to_string(),
            codec: G711Codec::new(G711Variant::Pcmu),
            packet_ms: 20,
            vad: VoiceActivityDetector::new(true, 0.01, 0.02),
            stop_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_decimate() {
        let samples: Vec<i16> = (0..48).collect();
        let out = decimate(&samples, 48000, 8000);
        assert_eq!(out, vec![0, 6, 12, 18, 24, 30, 36, 42]);
        assert_eq!(decimate(&samples, 8000, 8000), samples);
        assert!(decimate(&[], 48000, 8000).is_empty());
    }

    #[tokio::test]
    async fn test_sends_packets_when_connected() {
        let transport = memory_transport();
        transport.set_state(TransportState::Connected);
        let speaking = Arc::new(SpeakingMonitor::new(Duration::from_millis(200)));
        let source = ToneSource {
            amplitude: 8000,
            paused: false,
            pauses: Arc::new(Mutex::new(0)),
        };

        let pipeline = MicrophonePipeline::start(
            Box::new(source),
            config(),
            transport.clone(),
            speaking.clone(),
            Arc::new(EventBus::new()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.stop().await;

        let audio = transport.audio.lock();
        assert!(!audio.is_empty());
        assert!(audio.iter().all(|p| p.len() == 160));
        assert_eq!(speaking.poll(Instant::now()), vec![("me".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_pause_after_stop_keeps_state() {
        let source = ToneSource {
            amplitude: 50,
            paused: false,
            pauses: Arc::new(Mutex::new(0)),
        };
        let pipeline = MicrophonePipeline::start(
            Box::new(source),
            config(),
            memory_transport(),
            Arc::new(SpeakingMonitor::new(Duration::from_millis(200))),
            Arc::new(EventBus::new()),
        );
        pipeline.stop().await;

        pipeline.set_paused(true).await;
        assert!(!pipeline.is_paused());
    }

    #[tokio::test]
    async fn test_pause_stops_capture() {
        let transport = memory_transport();
        transport.set_state(TransportState::Connected);
        let pauses = Arc::new(Mutex::new(0));
        let source = ToneSource {
            amplitude: 50,
            paused: false,
            pauses: pauses.clone(),
        };

        let pipeline = MicrophonePipeline::start(
            Box::new(source),
            config(),
            transport.clone(),
            Arc::new(SpeakingMonitor::new(Duration::from_millis(200))),
            Arc::new(EventBus::new()),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        pipeline.set_paused(true).await;
        pipeline.set_paused(true).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*pauses.lock(), 1);
        assert!(pipeline.is_paused());

        // Quiet input is gated to digital silence
        let sent = transport.audio.lock().clone();
        assert!(sent.iter().flat_map(|p| p.iter()).all(|&b| b == 0xff));

        let count = sent.len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.audio.lock().len(), count);
        pipeline.stop().await;
    }
}
