//! Error types for the Lattice metadata server.
//!
//! All fallible controller paths return [`LatticeError`] through the
//! crate-wide [`Result`] alias. The admin surfaces reply with POSIX-style
//! `(errno, message)` pairs, so every error maps to an errno via
//! [`LatticeError::to_errno`].

use std::io;
use thiserror::Error;

/// Main error type for MDS operations.
#[derive(Error, Debug)]
pub enum LatticeError {
    // Monitor / authentication errors
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Rotating service keys unavailable: {0}")]
    KeysUnavailable(String),

    #[error("Monitor unavailable: {0}")]
    MonitorUnavailable(String),

    // Membership errors
    #[error("Cluster map not writeable with daemon features: {0}")]
    IncompatibleMap(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // Admin command errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File system is read-only")]
    ReadOnlyFs,

    #[error("Command already registered: {0}")]
    CommandExists(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // Runtime errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LatticeError {
    /// Map to a POSIX errno for the `(code, message)` admin reply contract.
    pub fn to_errno(&self) -> i32 {
        match self {
            LatticeError::NotFound(_) => libc::ENOENT,
            LatticeError::InvalidArgument(_) => libc::EINVAL,
            LatticeError::InvalidConfig { .. } | LatticeError::Config(_) => libc::EINVAL,
            LatticeError::PermissionDenied(_) => libc::EPERM,
            LatticeError::AuthFailed(_) => libc::EACCES,
            LatticeError::ReadOnlyFs => libc::EROFS,
            LatticeError::CommandExists(_) => libc::EEXIST,
            LatticeError::Unsupported(_) => libc::EOPNOTSUPP,
            LatticeError::Timeout(_) => libc::ETIMEDOUT,
            LatticeError::ShuttingDown => libc::ESHUTDOWN,
            LatticeError::MonitorUnavailable(_) | LatticeError::Network(_) => libc::EAGAIN,
            LatticeError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Check if the error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LatticeError::KeysUnavailable(_)
                | LatticeError::MonitorUnavailable(_)
                | LatticeError::Timeout(_)
                | LatticeError::Network(_)
        )
    }
}

impl From<serde_json::Error> for LatticeError {
    fn from(e: serde_json::Error) -> Self {
        LatticeError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for LatticeError {
    fn from(e: bincode::Error) -> Self {
        LatticeError::Serialization(e.to_string())
    }
}

/// Result type alias for MDS operations.
pub type Result<T> = std::result::Result<T, LatticeError>;
