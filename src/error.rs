use thiserror::Error;

use crate::db::CheckpointMode;

#[derive(Error, Debug)]
pub enum ShadowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checkpoint refused ({mode}): {reason}")]
    CheckpointRefused { mode: CheckpointMode, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("WAL segment {0} is sealed")]
    SegmentSealed(String),

    #[error("Database has no generation yet")]
    NoGeneration,

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ShadowResult<T> = Result<T, ShadowError>;

impl ShadowError {
    /// True when the destination or local file simply does not exist, as
    /// opposed to failing to read it.
    pub fn is_not_found(&self) -> bool {
        match self {
            ShadowError::NotFound(_) => true,
            ShadowError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Errors the sync engine retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShadowError::Io(_) | ShadowError::Sqlite(_) | ShadowError::Internal(_)
        )
    }

    /// Errors that stop a replica's loop for good. Nothing else does.
    pub fn is_fatal_for_replica(&self) -> bool {
        matches!(self, ShadowError::Configuration(_))
    }

    pub fn is_checkpoint_refused(&self) -> bool {
        matches!(self, ShadowError::CheckpointRefused { .. })
    }
}

impl From<tokio::task::JoinError> for ShadowError {
    fn from(err: tokio::task::JoinError) -> Self {
        ShadowError::Internal(format!("background task failed: {}", err))
    }
}
