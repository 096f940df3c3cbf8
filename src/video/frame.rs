//! Video frame data structures

use bytes::Bytes;
use std::time::Instant;

use super::format::{PixelFormat, Resolution};
use crate::session::{StreamKind, UserId};

/// An uncompressed frame with metadata
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Bytes,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Frame sequence number within its stream
    pub sequence: u64,
    /// When the frame was captured or decoded
    pub timestamp: Instant,
}

impl VideoFrame {
    pub fn new(data: Bytes, resolution: Resolution, format: PixelFormat, sequence: u64) -> Self {
        Self {
            data,
            resolution,
            format,
            sequence,
            timestamp: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Whether the buffer holds exactly one frame of the declared format
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.format.frame_size(self.resolution)
    }
}

/// A decoded frame from a remote participant, as handed to the UI
#[derive(Debug, Clone)]
pub struct RemoteVideoFrame {
    pub user_id: UserId,
    pub kind: StreamKind,
    pub frame: VideoFrame,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_complete() {
        let res = Resolution::new(2, 2);
        let full = VideoFrame::new(Bytes::from(vec![0u8; 6]), res, PixelFormat::Nv12, 0);
        assert!(full.is_complete());
        let short = VideoFrame::new(Bytes::from(vec![0u8; 5]), res, PixelFormat::Nv12, 1);
        assert!(!short.is_complete());
    }
}
