//! Server error types.
//!
//! [`ServerError`] wraps the errors of every layer the server wires together
//! (store, vault, kernel) plus its own configuration and protocol failures.

use cairn_kernel::KernelError;
use cairn_store::StoreError;
use cairn_vault::VaultError;

/// Unified error type for the Cairn server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    // -- Setup errors -------------------------------------------------------
    /// The configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading a file failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation needed the wired services before `init` ran.
    #[error("server not initialized")]
    NotInitialized,

    /// An operation needed the resource managers while the resource
    /// service was not running.
    #[error("resource service is not running")]
    NotRunning,

    // -- Protocol errors ----------------------------------------------------
    /// The protocol hub a wrapper belongs to has been dropped.
    #[error("protocol hub is gone")]
    HubClosed,

    /// Cooperative cancellation.  Never treated as a fault.
    #[error("operation cancelled")]
    Cancelled,

    // -- Wrapped layers -----------------------------------------------------
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Kernel(KernelError),
}

impl ServerError {
    /// `true` if this error is (or wraps) cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::Vault(VaultError::Cancelled) => true,
            Self::Store(err) => err.is_cancelled(),
            Self::Kernel(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

impl From<KernelError> for ServerError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Cancelled => Self::Cancelled,
            other => Self::Kernel(other),
        }
    }
}

/// Convenience alias used throughout the server crate.
pub type Result<T> = std::result::Result<T, ServerError>;
