use std::fmt::{Display, Formatter};

/// Result code returned across the pool's RPC-facing boundary.
///
/// The pool never propagates errors to its callers; every public operation
/// resolves to one of these codes (or a plain `bool` for the memory
/// reservation calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Operation completed.
    Success,
    /// Admission refused: the write budget is exhausted and the data was not
    /// pre-allocated. The caller retries later.
    NoBuffer,
    /// No registered partition range covers the request, or the target buffer
    /// has been evicted. Not retriable without re-registration.
    NoRegister,
    /// Unexpected internal fault.
    InternalError,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Success => write!(f, "success"),
            StatusCode::NoBuffer => write!(f, "no buffer"),
            StatusCode::NoRegister => write!(f, "no register"),
            StatusCode::InternalError => write!(f, "internal error"),
        }
    }
}

/// A specialized error type for buffer pool construction and internal faults.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal error (accounting drift, broken worker channel, etc.).
    #[error("internal error: {0}")]
    InternalError(String),
}

impl BufferError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InternalError(msg.to_string())
    }
}

/// A Result type alias for buffer pool operations.
pub type BufferResult<T> = Result<T, BufferError>;
