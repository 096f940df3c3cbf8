use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("Decoder error: {0}")]
    DecoderError(String),

    #[error("Subprocess {program} failed: {reason}")]
    Subprocess { program: String, reason: String },

    #[error("Device unavailable [{device}]: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Shorthand for a failed external codec process
    pub fn subprocess(program: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        AppError::Subprocess {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a capture device that could not be opened
    pub fn device_unavailable(device: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        AppError::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::subprocess("ffmpeg", "broken pipe");
        assert_eq!(err.to_string(), "Subprocess ffmpeg failed: broken pipe");

        let err = AppError::device_unavailable("camera", "no device found");
        assert_eq!(
            err.to_string(),
            "Device unavailable [camera]: no device found"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: AppError = io.into();
        assert!(matches!(err, AppError::Io(_)));
    }
}
