use crate::shortcode::ShortCode;
use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised while validating domain values.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
}

/// Errors returned by the storage backends and the storage facade.
///
/// Only [`NotFound`](StorageError::NotFound), [`AlreadyExists`](StorageError::AlreadyExists)
/// and [`Deleted`](StorageError::Deleted) are meant to be matched on by callers.
/// Everything else is a backend failure and should be surfaced as an internal error.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    /// The user already owns a link for this original URL.
    ///
    /// Carries the pre-existing code so callers can still hand it out.
    #[error("link already exists: {0}")]
    AlreadyExists(ShortCode),
    /// The link exists but has been soft-deleted for the requesting user.
    #[error("link deleted: {0}")]
    Deleted(ShortCode),
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
    /// The database could not be reached.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    /// The operation did not finish in time and nothing was applied.
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    /// Every drawn short code was already taken.
    #[error("no unused short code found after {attempts} attempts")]
    GenerationExhausted { attempts: usize },
    #[error("snapshot failed: {0}")]
    Snapshot(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, StorageError::Deleted(_))
    }
}

impl From<CoreError> for StorageError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::InvalidShortCode(message) => Self::InvalidShortCode(message),
        }
    }
}
