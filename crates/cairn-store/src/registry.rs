//! Process-wide registry of live resource managers.
//!
//! Managers register here when they are initialised and unregister when they
//! are dropped.  The registry holds only weak references, so an idle manager
//! is reclaimed as soon as its owning service lets go of it.

use std::any::Any;
use std::sync::Arc;

use cairn_kernel::WeakRegistry;

use crate::resource::{ResourceKind, ResourceManager};

/// Type-erased view of a resource manager.
pub trait ManagedSchema: Send + Sync + 'static {
    /// Schema (table) name.
    fn name(&self) -> &'static str;

    /// Declared schema version.
    fn version(&self) -> u32;

    /// Key under which the manager is registered.
    fn registry_id(&self) -> u64;

    /// Number of resources currently live in the manager's identity cache.
    fn cached_count(&self) -> usize;

    /// Upcast for downcasting back to the concrete manager.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Registry of live managers keyed by random `u64` identifiers.
pub struct ManagerRegistry {
    managers: WeakRegistry<dyn ManagedSchema>,
}

impl ManagerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            managers: WeakRegistry::new("resource-managers"),
        }
    }

    /// Live managers, in no particular order.
    pub fn list(&self) -> Vec<Arc<dyn ManagedSchema>> {
        self.managers
            .live()
            .into_iter()
            .map(|(_, manager)| manager)
            .collect()
    }

    /// Look up a live manager by registry id.
    pub fn get(&self, id: u64) -> Option<Arc<dyn ManagedSchema>> {
        self.managers.get(id)
    }

    /// Find the live manager for kind `K`, if any.
    pub fn find<K: ResourceKind>(&self) -> Option<Arc<ResourceManager<K>>> {
        self.managers
            .live()
            .into_iter()
            .filter(|(_, manager)| manager.name() == K::NAME)
            .find_map(|(_, manager)| manager.into_any().downcast::<ResourceManager<K>>().ok())
    }

    /// Number of entries, including managers still being constructed.
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    /// `true` if no manager is registered.
    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub(crate) fn entries(&self) -> &WeakRegistry<dyn ManagedSchema> {
        &self.managers
    }
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
