//! Raw pixel formats and resolutions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uncompressed pixel layouts exchanged with capture devices and codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 3 bytes per pixel, B-G-R order (desktop capture path)
    Bgr24,
    /// 3 bytes per pixel, R-G-B order
    Rgb24,
    /// Y plane followed by interleaved UV at quarter resolution
    Nv12,
}

impl PixelFormat {
    /// Bytes per frame of the given resolution
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Nv12 => "nv12",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let res = Resolution::new(4, 2);
        assert_eq!(PixelFormat::Rgb24.frame_size(res), 24);
        assert_eq!(PixelFormat::Bgr24.frame_size(res), 24);
        assert_eq!(PixelFormat::Nv12.frame_size(res), 12);
        assert_eq!(PixelFormat::Nv12.frame_size(Resolution::HD1080), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&PixelFormat::Nv12).unwrap(), "\"nv12\"");
        let f: PixelFormat = serde_json::from_str("\"rgb24\"").unwrap();
        assert_eq!(f, PixelFormat::Rgb24);
    }
}
