//! Video capture, encoding and remote stream decoding
//!
//! Outbound: raw capture -> H264 encoder subprocess -> RTP packetizer, or
//! device-encoded capture -> RTP packetizer.
//! Inbound: RTP payloads -> [`FrameAssembler`] -> [`decoder::DecoderState`].

pub mod assembler;
pub mod capture;
pub mod decoder;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod nal;
pub mod pipeline;

pub use assembler::FrameAssembler;
pub use capture::{
    AvccAccessUnitFramer, EncodedVideoSource, ProcessCaptureConfig, ProcessEncodedSource,
    ProcessVideoSource, VideoCaptureSettings, VideoInput, VideoSource,
};
pub use decoder::{DecoderContext, DecoderState, HardwareDecoderBackend, NoHardwareBackend};
pub use encoder::{H264EncoderConfig, SubprocessEncoder};
pub use format::{PixelFormat, Resolution};
pub use frame::{RemoteVideoFrame, VideoFrame};
pub use pipeline::{OutboundVideoPipeline, PipelineStats};
