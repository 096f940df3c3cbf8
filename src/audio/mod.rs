//! Audio capture, voice activity and mixing
//!
//! This module provides:
//! - Microphone capture through a capture subprocess (raw or `MCAP` framing)
//! - Noise gate and debounced speaking detection
//! - The outbound microphone pipeline (G.711 over the transport)
//! - The inbound mixer with per-participant volume and deafen

pub mod capture;
pub mod mixer;
pub mod pipeline;
pub mod vad;

pub use capture::{
    AudioChunk, AudioFraming, AudioSource, McapFramer, McapHeader, MicrophoneConfig,
    ProcessAudioSource,
};
pub use mixer::{AudioMixer, AudioSink, NullSink, MAX_VOLUME, MIN_VOLUME};
pub use pipeline::{MicrophonePipeline, MicrophonePipelineConfig};
pub use vad::{rms, SpeakingMonitor, SpeakingTracker, VadDecision, VoiceActivityDetector};
