//! Error types for the pair potential's device state

use gb_backends::BackendError;

/// Result type for resource pool operations
pub type Result<T> = std::result::Result<T, GbError>;

/// Errors raised while building, owning or tearing down device state
#[derive(Debug, thiserror::Error)]
pub enum GbError {
    /// Mixed interaction forms cannot be combined with on-device neighbor
    /// construction while the host also processes atoms. The caller must abort.
    #[error("Cannot use Gayberne with multiple forms and GPU neighbor (host atoms: {host_atoms})")]
    FormConflict { host_atoms: usize },

    /// `init` called on a pool that is still allocated
    #[error("resource pool already initialized; call clear first")]
    AlreadyInitialized,

    /// The device cannot run the compile-time precision mode
    #[error("device '{device}' does not support {mode} precision")]
    UnsupportedPrecision { device: String, mode: &'static str },

    /// The atom/neighbor collaborator could not reserve its storage
    #[error("atom/neighbor storage reservation failed for {nlocal} local atoms")]
    ReservationFailed { nlocal: usize },

    /// Host tables are inconsistent with the declared type count
    #[error("invalid host tables: {0}")]
    InvalidTables(String),

    /// Device allocation, transfer or compilation failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Writing the diagnostic report failed
    #[error("report output failed: {0}")]
    Report(#[from] std::io::Error),
}

impl GbError {
    /// Whether the caller must terminate instead of continuing without the device
    pub fn is_fatal(&self) -> bool {
        matches!(self, GbError::FormConflict { .. })
    }
}
