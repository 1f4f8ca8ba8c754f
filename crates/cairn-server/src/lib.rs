//! # cairn-server
//!
//! Wires the Cairn subsystems into one supervised process:
//!
//! - **[`config`]** -- [`ServerConfig`], loaded from TOML with per-section
//!   defaults.
//! - **[`services`]** -- the [`ResourceService`] owning the resource managers
//!   and the [`ProtocolService`] running the accept loop.
//! - **[`protocol`]** -- [`ProtocolHub`]: the weak registry of
//!   [`ProtocolWrapper`]s and the rendezvous pairing context requests with
//!   the accept loop.
//! - **[`server`]** -- [`Server`]: `init` opens the database and builds the
//!   services, `listen` supervises them until cancelled.
//! - **[`error`]** -- [`ServerError`].

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod services;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use protocol::{DispatchContext, ProtocolHub, ProtocolWrapper};
pub use server::Server;
pub use services::{Managers, ProtocolService, ResourceService};
