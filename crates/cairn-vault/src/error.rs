//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

/// Unified error type for Cairn key material.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// Generating a key pair failed (e.g. the system random source failed).
    #[error("key generation failed: {reason}")]
    KeyGenerationFailed { reason: String },

    /// A key pair is malformed or its halves do not belong together.
    #[error("invalid key pair: {reason}")]
    InvalidKeyPair { reason: String },

    // -- Runtime errors -----------------------------------------------------
    /// Cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// A blocking generation task panicked or was aborted.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
