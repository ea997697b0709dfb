use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Capture engine error type
///
/// Setup-phase variants (`OpenFailed` through `BufferSetupFailed`) abort
/// startup. `DequeueFailed` and `RequeueFailed` end a running capture loop.
/// `SinkWriteFailed` is logged by the frame pipeline and never stops capture.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to open device {device}: {source}")]
    OpenFailed {
        device: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Device {device} is not a video capture device")]
    NotACaptureDevice { device: PathBuf },

    #[error("Format negotiation failed ({op}): {source}")]
    FormatNegotiationFailed {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Encoder negotiation failed at {step}: {source}")]
    EncoderNegotiationFailed {
        step: &'static str,
        #[source]
        source: Box<AppError>,
    },

    #[error("Invalid control length for selector {selector:#04x}: device reported {expected} bytes, buffer has {actual}")]
    InvalidControlLength {
        selector: u8,
        expected: u16,
        actual: usize,
    },

    #[error("Control query {query} on selector {selector:#04x} failed: {source}")]
    ControlQueryFailed {
        selector: u8,
        query: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Buffer setup failed ({op}): {reason}")]
    BufferSetupFailed { op: &'static str, reason: String },

    #[error("Failed to start capture stream: {0}")]
    StreamStartFailed(#[source] io::Error),

    #[error("Failed to dequeue buffer: {0}")]
    DequeueFailed(String),

    #[error("Failed to requeue buffer {index}: {reason}")]
    RequeueFailed { index: u32, reason: String },

    #[error("Failed to open sink {path}: {source}")]
    SinkOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Sink write to {path} failed: {source}")]
    SinkWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AppError {
    /// Whether the error belongs to the setup phase (before streaming starts)
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AppError::OpenFailed { .. }
                | AppError::NotACaptureDevice { .. }
                | AppError::FormatNegotiationFailed { .. }
                | AppError::EncoderNegotiationFailed { .. }
                | AppError::InvalidControlLength { .. }
                | AppError::ControlQueryFailed { .. }
                | AppError::BufferSetupFailed { .. }
                | AppError::SinkOpenFailed { .. }
                | AppError::Config(_)
        )
    }

    /// Underlying OS error code, when the failure came from a system call
    pub fn os_error(&self) -> Option<i32> {
        match self {
            AppError::OpenFailed { source, .. }
            | AppError::FormatNegotiationFailed { source, .. }
            | AppError::ControlQueryFailed { source, .. }
            | AppError::SinkOpenFailed { source, .. }
            | AppError::SinkWriteFailed { source, .. }
            | AppError::StreamStartFailed(source)
            | AppError::Io(source) => source.raw_os_error(),
            AppError::EncoderNegotiationFailed { source, .. } => source.os_error(),
            _ => None,
        }
    }
}

/// Result type alias for the capture engine
pub type Result<T> = std::result::Result<T, AppError>;
