//! Cancellation helpers on top of [`CancellationToken`].
//!
//! Tokens form a tree: cancelling a parent cancels every child.  Some call
//! sites need the opposite shape as well, a token that fires when *either*
//! of two unrelated parents fires.  [`link`] builds that composite scope.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{KernelError, Result};

/// A token cancelled by either of two parents, see [`link`].
///
/// Clones share one forwarding watcher.  Dropping the last clone stops the
/// watcher without cancelling anything.
#[derive(Debug, Clone)]
pub struct LinkedToken {
    token: CancellationToken,
    _alive: Option<Arc<DropGuard>>,
}

impl LinkedToken {
    /// The composite token.  Clones of it do not keep the link alive.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait until either parent (or [`cancel`](Self::cancel)) fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Return a token that is cancelled as soon as `primary` or `secondary` is.
///
/// The token is a child of `primary`; a watcher task forwards `secondary`'s
/// cancellation.  The watcher exits when either side fires or when the last
/// [`LinkedToken`] handle is dropped.
pub fn link(primary: &CancellationToken, secondary: &CancellationToken) -> LinkedToken {
    let token = primary.child_token();
    if secondary.is_cancelled() {
        token.cancel();
        return LinkedToken {
            token,
            _alive: None,
        };
    }

    let alive = CancellationToken::new();
    let released = alive.clone();
    let watcher = token.clone();
    let secondary = secondary.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = secondary.cancelled() => watcher.cancel(),
            _ = watcher.cancelled() => {}
            _ = released.cancelled() => {}
        }
    });
    LinkedToken {
        token,
        _alive: Some(Arc::new(alive.drop_guard())),
    }
}

/// Drive `fut` to completion unless `token` fires first.
///
/// Returns [`KernelError::Cancelled`] when the token wins.  The token is
/// checked before polling so an already-cancelled scope never starts work.
pub async fn until_cancelled<F, T>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return Err(KernelError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(KernelError::Cancelled),
        out = fut => Ok(out),
    }
}
