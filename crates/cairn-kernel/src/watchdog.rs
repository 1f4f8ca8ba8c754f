//! WatchDog supervision.
//!
//! [`watch_dog`] runs a set of child lifetimes concurrently and reacts to the
//! first one that terminates, normally or by fault, by cancelling the rest.
//! The aggregate result is the first fault encountered, or `Ok(())` if every
//! child ended cleanly.  Children are always stopped in reverse order before
//! the call returns, so a crashing subsystem tears the whole tree down
//! deterministically.
//!
//! [`WatchDog`] wraps the same logic as a [`Service`] so supervision trees can
//! nest (a manager supervising its own sub-services under the server).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, KernelError, Result};
use crate::lifetime::{Lifetime, Service};

/// Start `children` in order, run them concurrently, and propagate the first
/// termination to the rest.
///
/// A start failure unwinds the already-started children in reverse order and
/// is returned immediately.
pub async fn watch_dog(children: &[Arc<Lifetime>], token: &CancellationToken) -> Result<()> {
    let group = token.child_token();

    for (index, child) in children.iter().enumerate() {
        if let Err(err) = child.start(&group).await {
            error!(service = child.name(), error = %err, "supervised start failed, unwinding");
            group.cancel();
            let _ = child.stop().await;
            for started in children[..index].iter().rev() {
                if let Err(stop_err) = started.stop().await {
                    warn!(service = started.name(), error = %stop_err, "stop during unwind failed");
                }
            }
            return Err(err);
        }
    }

    info!(children = children.len(), "watchdog supervising");

    let mut runs = JoinSet::new();
    for child in children {
        let child = Arc::clone(child);
        runs.spawn(async move {
            let outcome = child.run().await;
            (child, outcome)
        });
    }

    let mut first_fault: Option<KernelError> = None;
    let mut siblings_cancelled = false;

    while let Some(joined) = runs.join_next().await {
        let outcome = match joined {
            Ok((child, outcome)) => {
                match &outcome {
                    Ok(()) => info!(service = child.name(), "supervised service terminated"),
                    Err(err) => error!(service = child.name(), error = %err, "supervised service faulted"),
                }
                outcome
            }
            Err(join_err) => Err(KernelError::Internal(format!(
                "supervised task panicked: {join_err}"
            ))),
        };

        if !siblings_cancelled {
            debug!("first supervised termination, cancelling siblings");
            group.cancel();
            siblings_cancelled = true;
        }

        if let Err(err) = outcome {
            first_fault.get_or_insert(err);
        }
    }

    for child in children.iter().rev() {
        if let Err(err) = child.stop().await {
            warn!(service = child.name(), error = %err, "supervised stop failed");
            first_fault.get_or_insert(err);
        }
    }

    match first_fault {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// A [`Service`] that supervises child lifetimes with [`watch_dog`].
pub struct WatchDog {
    name: String,
    children: Vec<Arc<Lifetime>>,
}

impl WatchDog {
    /// Build a supervisor named `name` over `children` (started in order).
    pub fn new(name: impl Into<String>, children: Vec<Arc<Lifetime>>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }

    /// The supervised lifetimes.
    pub fn children(&self) -> &[Arc<Lifetime>] {
        &self.children
    }
}

#[async_trait]
impl Service for WatchDog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_run(&self, token: CancellationToken) -> std::result::Result<(), BoxError> {
        watch_dog(&self.children, &token).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
