//! Cairn service kernel.
//!
//! This crate provides the foundational building blocks every Cairn
//! subsystem is layered on:
//!
//! - **[`lifetime`]** -- the [`Service`] trait and the [`Lifetime`] state
//!   machine driving start/run/stop with fault containment.
//! - **[`watchdog`]** -- [`watch_dog`] supervision: run children
//!   concurrently, cancel siblings on the first termination, surface the
//!   first fault.
//! - **[`registry`]** -- [`WeakRegistry`], a [`dashmap::DashMap`]-backed
//!   table of weak references keyed by random, collision-free `u64`s.
//! - **[`wait_queue`]** -- a strictly bounded FIFO [`WaitQueue`] whose
//!   waiters honour cancellation and can withdraw their own entries.
//! - **[`cancel`]** -- token linking and `select!`-based cancellation helpers.
//! - **[`error`]** -- unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod cancel;
pub mod error;
pub mod lifetime;
pub mod registry;
pub mod wait_queue;
pub mod watchdog;

// Re-export the most commonly used types at the crate root for convenience.
pub use cancel::LinkedToken;
pub use error::{BoxError, KernelError, Result};
pub use lifetime::{Lifetime, Service, ServiceState};
pub use registry::WeakRegistry;
pub use tokio_util::sync::CancellationToken;
pub use wait_queue::{Ticket, WaitQueue};
pub use watchdog::{WatchDog, watch_dog};
