//! Outbound video encoding

pub mod h264;

pub use h264::{AccessUnitSplitter, H264EncoderConfig, SubprocessEncoder};
