//! Voice activity detection
//!
//! Energy is the normalized RMS of a buffer. Buffers under the gate threshold
//! are zeroed before encoding; buffers over the speaking threshold count as
//! voice. Speaking state is debounced: it turns off only once no voice has been
//! seen for the hold window.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::session::UserId;

/// Normalized RMS of 16-bit samples (0.0 - 1.0)
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Outcome of processing one microphone buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub level: f32,
    /// Samples were zeroed by the gate
    pub gated: bool,
    /// Counts as speech for the speaking indicator
    pub voiced: bool,
}

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    gate_enabled: bool,
    gate_threshold: f32,
    speaking_threshold: f32,
}

impl VoiceActivityDetector {
    pub fn new(gate_enabled: bool, gate_threshold: f32, speaking_threshold: f32) -> Self {
        Self {
            gate_enabled,
            gate_threshold,
            speaking_threshold,
        }
    }

    pub fn set_gate_enabled(&mut self, enabled: bool) {
        self.gate_enabled = enabled;
    }

    /// Measure `samples`, zeroing them if the gate closes
    pub fn process(&self, samples: &mut [i16]) -> VadDecision {
        let level = rms(samples);
        let gated = self.gate_enabled && level < self.gate_threshold;
        if gated {
            samples.fill(0);
        }
        VadDecision {
            level,
            gated,
            voiced: !gated && level >= self.speaking_threshold,
        }
    }
}

/// Debounced speaking state for one participant
#[derive(Debug, Clone)]
pub struct SpeakingTracker {
    hold: Duration,
    last_voice: Option<Instant>,
    speaking: bool,
}

impl SpeakingTracker {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            last_voice: None,
            speaking: false,
        }
    }

    /// Record qualifying energy at `now`
    pub fn voice(&mut self, now: Instant) {
        self.last_voice = Some(now);
    }

    /// Re-evaluate at `now`; returns the new state if it changed
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        let speaking = self
            .last_voice
            .is_some_and(|t| now.saturating_duration_since(t) < self.hold);
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}

/// Speaking trackers for the local user and every remote participant
///
/// Written from the audio paths, polled by the call's VAD timer.
#[derive(Debug)]
pub struct SpeakingMonitor {
    hold: Duration,
    trackers: DashMap<UserId, SpeakingTracker>,
}

impl SpeakingMonitor {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            trackers: DashMap::new(),
        }
    }

    pub fn voice(&self, user_id: &str, now: Instant) {
        if let Some(mut tracker) = self.trackers.get_mut(user_id) {
            tracker.voice(now);
            return;
        }
        let mut tracker = SpeakingTracker::new(self.hold);
        tracker.voice(now);
        self.trackers.insert(user_id.to_string(), tracker);
    }

    /// Evaluate every tracker; returns the participants whose state flipped
    pub fn poll(&self, now: Instant) -> Vec<(UserId, bool)> {
        let mut changes = Vec::new();
        for mut entry in self.trackers.iter_mut() {
            if let Some(speaking) = entry.value_mut().poll(now) {
                changes.push((entry.key().clone(), speaking));
            }
        }
        changes
    }

    pub fn is_speaking(&self, user_id: &str) -> bool {
        self.trackers
            .get(user_id)
            .is_some_and(|t| t.is_speaking())
    }

    /// Forget a participant; returns whether they were shown as speaking
    pub fn remove(&self, user_id: &str) -> bool {
        self.trackers
            .remove(user_id)
            .is_some_and(|(_, t)| t.is_speaking())
    }

    /// Forget everyone; returns who was shown as speaking
    pub fn clear(&self) -> Vec<UserId> {
        let speaking = self
            .trackers
            .iter()
            .filter(|entry| entry.value().is_speaking())
            .map(|entry| entry.key().clone())
            .collect();
        self.trackers.clear();
        speaking
    }
}
