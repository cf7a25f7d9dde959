use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device already open: {0}")]
    AlreadyOpen(String),

    #[error("Device not open")]
    NotOpen,

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Capability query failed: {0}")]
    QueryFailed(String),

    #[error("Format unsupported: {0}")]
    FormatUnsupported(String),

    #[error("Frame rate unsupported: {0}")]
    RateUnsupported(String),

    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Failed to map buffer {index}: {reason}")]
    MapFailed { index: u32, reason: String },

    #[error("Failed to queue buffer {index}: {reason}")]
    QueueFailed { index: u32, reason: String },

    #[error("Failed to dequeue buffer: {0}")]
    DequeueFailed(String),

    #[error("Failed to requeue buffer {index}: {reason}")]
    RequeueFailed { index: u32, reason: String },

    #[error("Failed to unmap buffer {index}: {reason}")]
    UnmapFailed { index: u32, reason: String },

    #[error("Stream error: {0}")]
    StreamFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Control {0:#010x} unsupported")]
    ControlUnsupported(u32),

    #[error("Control {0:#010x} disabled")]
    ControlDisabled(u32),

    #[error("Control {id:#010x} query failed: {reason}")]
    ControlQuery { id: u32, reason: String },

    #[error("Control {id:#010x} value {value} outside [{min}, {max}]")]
    ControlOutOfRange {
        id: u32,
        value: i32,
        min: i32,
        max: i32,
    },

    #[error("Control {0:#010x} is not a boolean control")]
    ControlWrongKind(u32),

    #[error("Reconfigure failed: {0}")]
    Reconfigure(Box<AppError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error classes used to decide how far a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Setup failures: fatal to the current `init` attempt, no retry
    ResourceUnavailable,
    /// Single-frame failures inside the acquisition loop
    TransientCapture,
    /// Per-call control failures, never fatal to the stream
    Control,
    /// Failure during reconfigure; the engine is left idle
    Reconfigure,
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::DequeueFailed(_)
            | AppError::RequeueFailed { .. }
            | AppError::DecodeError(_) => ErrorCategory::TransientCapture,
            AppError::ControlUnsupported(_)
            | AppError::ControlDisabled(_)
            | AppError::ControlQuery { .. }
            | AppError::ControlOutOfRange { .. }
            | AppError::ControlWrongKind(_) => ErrorCategory::Control,
            AppError::Reconfigure(_) => ErrorCategory::Reconfigure,
            _ => ErrorCategory::ResourceUnavailable,
        }
    }

    /// Map an `open(2)` failure onto the device error variants
    pub fn from_open(path: &std::path::Path, err: std::io::Error) -> Self {
        let path = path.display().to_string();
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => AppError::PermissionDenied(path),
            _ => AppError::ResourceUnavailable(format!("Failed to open {}: {}", path, err)),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
