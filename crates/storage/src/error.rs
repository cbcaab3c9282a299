//! Storage error taxonomy (spec §7 "Storage" / "Multipart").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key is empty, '.', or '..'")]
    InvalidKey,

    #[error("key is too long")]
    KeyTooLong,

    #[error("value is too large")]
    ValueTooLarge,

    #[error("metadata is too large")]
    MetadataTooLarge,

    #[error("expiration must be strictly in the future")]
    ExpirationNotInFuture,

    #[error("the specified key does not exist")]
    NotFound,

    #[error("a hash was provided that did not match the computed value")]
    ChecksumMismatch,

    #[error("the specified multipart upload does not exist")]
    MultipartNotFound,

    #[error("one or more of the specified parts could not be found")]
    MultipartPartsNotFound,

    #[error("upload is smaller than minimum")]
    MultipartTooSmall,

    #[error("there was a problem with the multipart upload")]
    MultipartSizeMismatch,

    #[error("operation was aborted")]
    Aborted,

    #[error("metadata row is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    /// HTTP status this error is rendered as, mirroring
    /// `config_encryption::encrypt::handler::Error::status` (spec §7).
    pub fn status_code(&self) -> u16 {
        match self {
            StorageError::InvalidKey | StorageError::ExpirationNotInFuture => 400,
            StorageError::KeyTooLong => 414,
            StorageError::ValueTooLarge | StorageError::MetadataTooLarge => 413,
            StorageError::NotFound
            | StorageError::MultipartNotFound
            | StorageError::MultipartPartsNotFound => 404,
            StorageError::ChecksumMismatch => 400,
            StorageError::MultipartTooSmall | StorageError::MultipartSizeMismatch => 400,
            StorageError::Aborted => 499,
            StorageError::Io(_) | StorageError::Sqlite(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
