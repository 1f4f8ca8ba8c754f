//! Error types for the cairn-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Uses `thiserror` for ergonomic, zero-cost error definitions.

use cairn_kernel::KernelError;
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration step failed.  The manager that ran it is unusable.
    #[error("migration of `{schema}` to v{version} failed: {message}")]
    Migration {
        schema: &'static str,
        version: u32,
        message: String,
    },

    /// A snapshot was merged into a record with a different identity.
    #[error("identity mismatch: expected id {expected}, got {actual}")]
    IdentityMismatch { expected: i64, actual: i64 },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// A kernel primitive failed.
    #[error(transparent)]
    Kernel(KernelError),
}

impl StoreError {
    /// `true` if this error is cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Kernel(KernelError::Cancelled))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl From<KernelError> for StoreError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Cancelled => Self::Cancelled,
            other => Self::Kernel(other),
        }
    }
}
