//! Error types for device operations

use std::fmt;

/// Result type for device operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while talking to a device
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Invalid buffer handle
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Invalid program handle
    #[error("invalid program handle: {0}")]
    InvalidProgramHandle(u64),

    /// Invalid kernel handle
    #[error("invalid kernel handle: {0}")]
    InvalidKernelHandle(u64),

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Device memory could not be reserved
    #[error("device allocation of {requested} bytes failed: {reason}")]
    AllocationFailed { requested: usize, reason: String },

    /// Program source failed to compile
    #[error("compilation of program '{program}' failed: {reason}")]
    CompileFailed { program: String, reason: String },

    /// Requested entry point is not exported by the program
    #[error("entry point '{entry}' not found in program '{program}'")]
    EntryPointNotFound { program: String, entry: String },

    /// Unsupported operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create an allocation failure
    pub fn allocation_failed(requested: usize, reason: impl fmt::Display) -> Self {
        Self::AllocationFailed {
            requested,
            reason: reason.to_string(),
        }
    }

    /// Create a compile failure
    pub fn compile_failed(program: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::CompileFailed {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }
}
