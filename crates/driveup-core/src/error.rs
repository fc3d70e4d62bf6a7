//! Error taxonomy shared by every component of the core.
//!
//! Transport failures arrive as [`ApiError`]; the scheduler turns the ones it
//! cannot absorb into a [`TransferError`], and everything surfaces to callers
//! as [`Error`].

use std::path::PathBuf;

use thiserror::Error;

use crate::api::ApiError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Credential acquisition, refresh or revocation failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A persisted session or token record could not be read back.
    #[error("Persisted state at {} is unreadable: {reason}", .path.display())]
    StateCorrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("A transfer for session {0} is already running")]
    SessionBusy(String),

    /// The transfer stopped between chunks at the caller's request.
    #[error("Transfer paused at {committed} of {total} bytes")]
    Cancelled { committed: u64, total: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::StateCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Chunk-level failure that survived the scheduler's own retries.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Chunk at offset {offset} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        offset: u64,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("Credential was rejected mid-transfer")]
    CredentialExpired,

    #[error("Remote session invalidated: {0}")]
    SessionInvalidated(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Content of {} changed since the transfer started", .0.display())]
    FingerprintMismatch(PathBuf),

    #[error("Remote reported {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Local file error: {0}")]
    LocalIo(#[source] std::io::Error),

    #[error("Remote rejected the transfer: {0}")]
    Rejected(#[source] ApiError),
}

impl TransferError {
    /// Retryable failures keep the persisted session so a later run can resume it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::RetriesExhausted { .. } | TransferError::CredentialExpired
        )
    }

    /// Map a non-transient transport error onto the transfer taxonomy.
    pub(crate) fn from_api(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => TransferError::CredentialExpired,
            ApiError::NotFound(msg) | ApiError::SessionGone(msg) => {
                TransferError::SessionInvalidated(msg)
            }
            ApiError::AccessDenied(msg) => TransferError::PermissionDenied(msg),
            other => TransferError::Rejected(other),
        }
    }
}
