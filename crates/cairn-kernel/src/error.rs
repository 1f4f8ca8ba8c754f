//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

use std::sync::Arc;

/// Boxed error returned by service hooks.
///
/// Hooks may fail with any crate's error type; the lifetime wraps whatever
/// escapes into [`KernelError::Faulted`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the Cairn service kernel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KernelError {
    // -- Lifecycle errors ---------------------------------------------------
    /// `start` was called on a service that is not `Created` or `Stopped`.
    #[error("service `{service}` already started (state: {state})")]
    AlreadyStarted { service: String, state: String },

    /// The requested operation is not valid in the service's current state.
    #[error("invalid lifecycle transition for `{service}`: {reason}")]
    InvalidTransition { service: String, reason: String },

    /// An unhandled error escaped a service hook.  The cause is shared so
    /// the same fault can be recorded on the lifetime and re-raised to the
    /// supervisor.
    #[error("service `{service}` faulted: {cause}")]
    Faulted {
        service: String,
        cause: Arc<BoxError>,
    },

    /// Cooperative cancellation.  Never treated as a fault.
    #[error("operation cancelled")]
    Cancelled,

    // -- Registry errors ----------------------------------------------------
    /// The system random source failed while drawing a registry key.
    #[error("random source unavailable: {reason}")]
    RandomUnavailable { reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// `true` if this error is cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
