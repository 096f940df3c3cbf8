//! vcall - media session layer for SFU-based voice/video chat
//!
//! This crate joins a voice channel through a single WebRTC peer connection
//! to a Selective Forwarding Unit, sends the local microphone, camera and
//! screen, and demultiplexes the remote participants' streams into per-stream
//! H264 decoders and an audio mix.

pub mod audio;
pub mod codec;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod session;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
