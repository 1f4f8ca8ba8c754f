//! Server assembly and startup.
//!
//! [`Server`] owns the configuration and the long-lived shared pieces (key
//! pool, manager registry, protocol hub).  [`Server::init`] opens the
//! database and wires the services; [`Server::listen`] supervises them with
//! [`watch_dog`] until the token fires or a service faults.
//!
//! Services start in dependency order and stop in reverse:
//!
//! ```text
//! key-generator → resources → protocol
//! ```

use std::sync::Arc;

use cairn_kernel::{CancellationToken, KernelError, Lifetime, watch_dog};
use cairn_store::{Database, KeyFields, Keys, ManagerRegistry, Resource, StoreError};
use cairn_vault::KeyGenerator;
use tracing::{error, info, instrument};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::protocol::ProtocolHub;
use crate::services::{Managers, ProtocolService, ResourceService};

/// Services built by [`Server::init`].
struct Wiring {
    resources: Arc<ResourceService>,
    services: Vec<Arc<Lifetime>>,
}

/// The Cairn server.
pub struct Server {
    config: ServerConfig,
    keys: Arc<KeyGenerator>,
    registry: Arc<ManagerRegistry>,
    protocol: Arc<ProtocolHub>,
    wiring: Option<Wiring>,
}

impl Server {
    /// Build a server from `config`.  Nothing is opened until [`init`](Self::init).
    pub fn new(config: ServerConfig) -> Self {
        let keys = Arc::new(KeyGenerator::new(config.keys.pool_config()));
        let protocol = ProtocolHub::new(config.protocol.wait_queue_capacity);
        Self {
            config,
            keys,
            registry: Arc::new(ManagerRegistry::new()),
            protocol,
            wiring: None,
        }
    }

    /// Open the database and build the service lifetimes.
    ///
    /// Calling `init` again rebuilds the wiring against a freshly opened
    /// database.
    pub fn init(&mut self) -> Result<()> {
        let db = if self.config.database.in_memory {
            Database::open_in_memory()?
        } else {
            Database::open(&self.config.database.path)?
        };
        info!(
            path = %self.config.database.path.display(),
            in_memory = self.config.database.in_memory,
            "database opened"
        );

        let resources = Arc::new(ResourceService::new(db, Arc::clone(&self.registry)));
        let services = vec![
            Lifetime::new(self.keys.clone()),
            Lifetime::new(resources.clone()),
            Lifetime::new(Arc::new(ProtocolService::new(Arc::clone(&self.protocol)))),
        ];
        self.wiring = Some(Wiring {
            resources,
            services,
        });
        Ok(())
    }

    /// Run every service until `token` fires or one of them terminates.
    ///
    /// Returns the first fault, if any.  Cancellation is a clean shutdown.
    pub async fn listen(&self, token: &CancellationToken) -> Result<()> {
        let wiring = self.wiring.as_ref().ok_or(ServerError::NotInitialized)?;
        info!(services = wiring.services.len(), "server listening");
        match watch_dog(&wiring.services, token).await {
            Ok(()) | Err(KernelError::Cancelled) => {
                info!("server stopped");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "server stopped on fault");
                Err(err.into())
            }
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The key pregeneration pool.
    pub fn keys(&self) -> &Arc<KeyGenerator> {
        &self.keys
    }

    /// The registry every resource manager joins while alive.
    pub fn registry(&self) -> &Arc<ManagerRegistry> {
        &self.registry
    }

    pub fn protocol(&self) -> &Arc<ProtocolHub> {
        &self.protocol
    }

    /// The running resource managers.
    pub fn resources(&self) -> Result<Managers> {
        self.wiring
            .as_ref()
            .ok_or(ServerError::NotInitialized)?
            .resources
            .managers()
            .ok_or(ServerError::NotRunning)
    }

    /// The supervised lifetimes, in start order.
    pub fn services(&self) -> &[Arc<Lifetime>] {
        match &self.wiring {
            Some(wiring) => &wiring.services,
            None => &[],
        }
    }

    /// Issue a fresh key pair from the pool to user `owner_id` and persist
    /// it as a key resource.
    #[instrument(skip(self, token))]
    pub async fn issue_key(
        &self,
        owner_id: i64,
        token: &CancellationToken,
    ) -> Result<Arc<Resource<Keys>>> {
        let managers = self.resources()?;
        if managers.users.load(owner_id, token).await?.is_none() {
            return Err(StoreError::NotFound {
                entity: "user",
                id: owner_id,
            }
            .into());
        }

        let pair = self.keys.acquire().await?;
        let key = managers
            .keys
            .create(
                KeyFields {
                    owner_id,
                    private_key: pair.private_key,
                    public_key: pair.public_key,
                },
                token,
            )
            .await?;
        info!(key = key.id(), owner_id, "key issued");
        Ok(key)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("initialized", &self.wiring.is_some())
            .field("keys", &self.keys.stats())
            .field("protocol", &self.protocol)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listen_before_init_is_rejected() {
        let server = Server::new(ServerConfig::default().with_in_memory_database());
        assert!(matches!(
            server.listen(&CancellationToken::new()).await,
            Err(ServerError::NotInitialized)
        ));
        assert!(server.services().is_empty());
    }

    #[test]
    fn resources_need_a_running_service() {
        let mut server = Server::new(ServerConfig::default().with_in_memory_database());
        assert!(matches!(server.resources(), Err(ServerError::NotInitialized)));
        server.init().unwrap();
        assert!(matches!(server.resources(), Err(ServerError::NotRunning)));
        let names: Vec<&str> = server.services().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["key-generator", "resources", "protocol"]);
    }

    #[tokio::test]
    async fn cancelled_token_shuts_down_cleanly() {
        let mut server = Server::new(ServerConfig::default().with_in_memory_database());
        server.init().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        server.listen(&token).await.unwrap();
        assert!(server.registry().is_empty());
    }
}
