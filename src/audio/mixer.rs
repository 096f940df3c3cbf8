//! Inbound audio mixing
//!
//! Each remote source gets a short queue of decoded G.711 frames. A playout
//! tick pops one frame per source, scales it by that participant's volume and
//! sums with saturation. While deafened the mix is computed and discarded so
//! queues stay short and speaking indicators keep working.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::vad::{rms, SpeakingMonitor};
use crate::codec::{G711Codec, G711Variant, G711_SAMPLE_RATE};
use crate::session::UserId;

/// Frames kept per source before the oldest is dropped
const MAX_QUEUED_FRAMES: usize = 10;

pub const MIN_VOLUME: f32 = 0.0;
pub const MAX_VOLUME: f32 = 2.0;

/// Playback device
pub trait AudioSink: Send + Sync {
    fn play(&self, samples: &[i16], sample_rate: u32);
}

/// Sink that discards audio
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, _samples: &[i16], _sample_rate: u32) {}
}

/// Scale samples by `volume`, clamping to the 16-bit range
pub fn apply_volume(samples: &mut [i16], volume: f32) {
    if (volume - 1.0).abs() < f32::EPSILON {
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s as f32 * volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Add `frame` into `mix` with saturation, growing `mix` as needed
pub fn mix_into(mix: &mut Vec<i16>, frame: &[i16]) {
    if mix.len() < frame.len() {
        mix.resize(frame.len(), 0);
    }
    for (m, &s) in mix.iter_mut().zip(frame) {
        *m = m.saturating_add(s);
    }
}

pub struct AudioMixer {
    volumes: DashMap<UserId, f32>,
    queues: Mutex<HashMap<String, VecDeque<Vec<i16>>>>,
    deafened: AtomicBool,
    speaking: Arc<SpeakingMonitor>,
    speaking_threshold: f32,
    sink: Arc<dyn AudioSink>,
    dropped_frames: AtomicU64,
}

impl AudioMixer {
    pub fn new(sink: Arc<dyn AudioSink>, speaking: Arc<SpeakingMonitor>, speaking_threshold: f32) -> Self {
        Self {
            volumes: DashMap::new(),
            queues: Mutex::new(HashMap::new()),
            deafened: AtomicBool::new(false),
            speaking,
            speaking_threshold,
            sink,
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Set a participant's playback volume (clamped to 0.0 - 2.0)
    pub fn set_volume(&self, user_id: &str, volume: f32) {
        let volume = volume.clamp(MIN_VOLUME, MAX_VOLUME);
        debug!("Volume for {} set to {:.2}", user_id, volume);
        self.volumes.insert(user_id.to_string(), volume);
    }

    pub fn volume(&self, user_id: &str) -> f32 {
        self.volumes.get(user_id).map(|v| *v).unwrap_or(1.0)
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::Relaxed);
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Queue one received audio packet
    ///
    /// `user_id` is `None` while the SSRC is unmapped; such audio is still
    /// played at unit volume but drives no speaking indicator.
    pub fn push_packet(&self, ssrc: u32, user_id: Option<&str>, payload_type: u8, payload: &[u8]) {
        let Some(variant) = G711Variant::from_payload_type(payload_type) else {
            trace!("Ignoring audio with payload type {}", payload_type);
            return;
        };
        if payload.is_empty() {
            return;
        }

        let mut samples = G711Codec::new(variant).decode(payload);
        if let Some(user_id) = user_id {
            if rms(&samples) >= self.speaking_threshold {
                self.speaking.voice(user_id, Instant::now());
            }
            apply_volume(&mut samples, self.volume(user_id));
        }

        let key = match user_id {
            Some(user_id) => user_id.to_string(),
            None => format!("ssrc:{}", ssrc),
        };
        let mut queues = self.queues.lock();
        let queue = queues.entry(key).or_default();
        if queue.len() >= MAX_QUEUED_FRAMES {
            queue.pop_front();
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(samples);
    }

    /// Pop one frame from every source and sum them
    pub fn mix_frame(&self) -> Option<Vec<i16>> {
        let mut queues = self.queues.lock();
        let mut mix: Option<Vec<i16>> = None;
        for queue in queues.values_mut() {
            if let Some(frame) = queue.pop_front() {
                mix_into(mix.get_or_insert_with(Vec::new), &frame);
            }
        }
        queues.retain(|_, q| !q.is_empty());
        mix
    }

    /// One playout step
    pub fn tick(&self) {
        let Some(mix) = self.mix_frame() else { return };
        if !self.is_deafened() {
            self.sink.play(&mix, G711_SAMPLE_RATE);
        }
    }

    /// Drop queued audio and volume for a participant who left
    pub fn remove_participant(&self, user_id: &str) {
        self.queues.lock().remove(user_id);
        self.volumes.remove(user_id);
    }

    pub fn clear(&self) {
        self.queues.lock().clear();
        self.volumes.clear();
        self.deafened.store(false, Ordering::Relaxed);
    }

    /// Run `tick` every `interval` until cancelled
    pub fn spawn_playout(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let mixer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Audio playout started ({:?} frames)", interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => mixer.tick(),
                }
            }
            debug!("Audio playout stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::g711::linear_to_ulaw;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Vec<i16>>>);

    impl AudioSink for RecordingSink {
        fn play(&self, samples: &[i16], _sample_rate: u32) {
            self.0.lock().push(samples.to_vec());
        }
    }

    fn ulaw(samples: &[i16]) -> Vec<u8> {
        samples.iter().map(|&s| linear_to_ulaw(s)).collect()
    }

    fn mixer(sink: Arc<RecordingSink>) -> AudioMixer {
        let speaking = Arc::new(SpeakingMonitor::new(Duration::from_millis(200)));
        AudioMixer::new(sink, speaking, 0.02)
    }

    #[test]
    fn test_saturating_mix() {
        let mut mix = vec![30000i16, -30000, 5];
        mix_into(&mut mix, &[10000, -10000, 5, 7]);
        assert_eq!(mix, vec![i16::MAX, i16::MIN, 10, 7]);

        let mut samples = vec![20000i16, -100];
        apply_volume(&mut samples, 2.0);
        assert_eq!(samples, vec![i16::MAX, -200]);
    }

    #[test]
    fn test_volume_is_clamped() {
        let m = mixer(Arc::new(RecordingSink::default()));
        m.set_volume("u1", 5.0);
        assert_eq!(m.volume("u1"), MAX_VOLUME);
        m.set_volume("u1", -1.0);
        assert_eq!(m.volume("u1"), MIN_VOLUME);
        assert_eq!(m.volume("nobody"), 1.0);
    }

    #[test]
    fn test_mutes_participant_at_zero_volume() {
        let sink = Arc::new(RecordingSink::default());
        let m = mixer(sink.clone());
        m.set_volume("u1", 0.0);
        m.push_packet(1, Some("u1"), 0, &ulaw(&[8000; 160]));
        m.push_packet(2, Some("u2"), 0, &ulaw(&[1000; 160]));
        m.tick();

        let played = sink.0.lock();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].len(), 160);
        // Only u2 is audible
        assert!(played[0].iter().all(|&s| (s - 1000).abs() < 80));
    }

    #[test]
    fn test_deafen_suppresses_playback_only() {
        let sink = Arc::new(RecordingSink::default());
        let m = mixer(sink.clone());
        m.set_deafened(true);
        m.push_packet(1, Some("u1"), 0, &ulaw(&[8000; 160]));
        m.tick();
        assert!(sink.0.lock().is_empty());
        // Queue was drained, speaking still tracked
        assert!(m.mix_frame().is_none());
        let changes = m.speaking.poll(Instant::now());
        assert_eq!(changes, vec![("u1".to_string(), true)]);

        m.set_deafened(false);
        m.push_packet(1, Some("u1"), 0, &ulaw(&[8000; 160]));
        m.tick();
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn test_queue_is_bounded_and_unknown_pt_ignored() {
        let m = mixer(Arc::new(RecordingSink::default()));
        for _ in 0..(MAX_QUEUED_FRAMES + 3) {
            m.push_packet(9, None, 8, &[0xd5; 160]);
        }
        m.push_packet(9, None, 111, &[1, 2, 3]);
        assert_eq!(m.dropped_frames(), 3);

        let mut frames = 0;
        while m.mix_frame().is_some() {
            frames += 1;
        }
        assert_eq!(frames, MAX_QUEUED_FRAMES);
    }
}
