use enough::StopReason;

use crate::metadata::{Chroma, Colorspace};

/// Errors from HEIC decoding.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HeicError {
    #[error("failed to read input: {0}")]
    InputRead(#[from] std::io::Error),

    /// Foreign allocate, read, or write failed. This is a contract violation
    /// between the marshaler and the backend, not a property of the input.
    #[error("foreign memory fault: {0}")]
    MemoryFault(String),

    #[error("decode failed")]
    DecodeFailed,

    #[error("sandboxed decoder trapped: {0}")]
    SandboxTrap(String),

    #[error("unsupported layout: colorspace {colorspace:?} with chroma {chroma:?}")]
    UnsupportedLayout {
        colorspace: Colorspace,
        chroma: Chroma,
    },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("dimensions too large: {width}x{height}")]
    DimensionsTooLarge { width: u32, height: u32 },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("decoder output size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("corrupt decoder output: {0}")]
    Corrupt(String),

    #[error("operation cancelled")]
    Cancelled(StopReason),
}

impl From<StopReason> for HeicError {
    fn from(r: StopReason) -> Self {
        HeicError::Cancelled(r)
    }
}
