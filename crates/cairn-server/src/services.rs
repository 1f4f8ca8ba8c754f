//! The server's supervised services.
//!
//! - [`ResourceService`] migrates and owns the resource managers while it
//!   runs.
//! - [`ProtocolService`] drives the protocol hub's accept loop.
//!
//! The key pool is supervised directly; [`cairn_vault::KeyGenerator`] is
//! itself a [`Service`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cairn_kernel::{BoxError, CancellationToken, KernelError, Service};
use cairn_store::{Database, Keys, ManagerRegistry, ResourceManager, Users};
use tracing::info;

use crate::protocol::ProtocolHub;

// ---------------------------------------------------------------------------
// ResourceService
// ---------------------------------------------------------------------------

/// Handles to the managers created by a running [`ResourceService`].
#[derive(Debug, Clone)]
pub struct Managers {
    pub users: Arc<ResourceManager<Users>>,
    pub keys: Arc<ResourceManager<Keys>>,
}

/// Creates every resource manager at start and releases them at stop.
///
/// The managers register themselves in the shared [`ManagerRegistry`]; once
/// the service drops its handles (and nobody else holds one) they leave the
/// registry again.
pub struct ResourceService {
    db: Database,
    registry: Arc<ManagerRegistry>,
    managers: Mutex<Option<Managers>>,
}

impl ResourceService {
    pub fn new(db: Database, registry: Arc<ManagerRegistry>) -> Self {
        Self {
            db,
            registry,
            managers: Mutex::new(None),
        }
    }

    /// The live managers, or `None` while the service is not running.
    pub fn managers(&self) -> Option<Managers> {
        self.slot().clone()
    }

    pub fn registry(&self) -> &Arc<ManagerRegistry> {
        &self.registry
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn slot(&self) -> MutexGuard<'_, Option<Managers>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Service for ResourceService {
    fn name(&self) -> &str {
        "resources"
    }

    async fn on_start(&self, token: &CancellationToken) -> Result<(), BoxError> {
        let users = ResourceManager::<Users>::init(self.db.clone(), &self.registry, token).await?;
        let keys = ResourceManager::<Keys>::init(self.db.clone(), &self.registry, token).await?;
        info!(managers = self.registry.len(), "resource managers ready");
        *self.slot() = Some(Managers { users, keys });
        Ok(())
    }

    async fn on_run(&self, token: CancellationToken) -> Result<(), BoxError> {
        token.cancelled().await;
        Ok(())
    }

    async fn on_stop(&self, _cause: Option<&KernelError>) -> Result<(), BoxError> {
        if let Some(managers) = self.slot().take() {
            info!(
                users_cached = managers.users.cached_count(),
                keys_cached = managers.keys.cached_count(),
                "releasing resource managers"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProtocolService
// ---------------------------------------------------------------------------

/// Runs [`ProtocolHub::listen`] for as long as the service runs.
pub struct ProtocolService {
    hub: Arc<ProtocolHub>,
}

impl ProtocolService {
    pub fn new(hub: Arc<ProtocolHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<ProtocolHub> {
        &self.hub
    }
}

#[async_trait]
impl Service for ProtocolService {
    fn name(&self) -> &str {
        "protocol"
    }

    async fn on_run(&self, token: CancellationToken) -> Result<(), BoxError> {
        self.hub.listen(&token).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
