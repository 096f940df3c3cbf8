//! Codec plumbing: external codec subprocesses and G.711 audio

pub mod g711;
pub mod process;

pub use g711::{G711Codec, G711Variant, G711_SAMPLE_RATE};
pub use process::{CodecProcess, CodecProcessConfig, FrameAccumulator, Framer, PassThrough};
