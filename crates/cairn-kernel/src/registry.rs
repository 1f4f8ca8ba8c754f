//! Weak-reference registries keyed by random 64-bit identifiers.
//!
//! A [`WeakRegistry`] tracks live objects without keeping them alive.  Keys
//! are drawn from the system random source and inserted with an atomic
//! insert-if-absent, retrying on collision, so every registered object owns a
//! strictly unique key for as long as its entry exists.
//!
//! Registration is two-phase so that an object can learn its own key while
//! it is being constructed:
//!
//! ```rust
//! # use std::sync::Arc;
//! # use cairn_kernel::registry::WeakRegistry;
//! struct Widget { key: u64 }
//!
//! let registry: WeakRegistry<Widget> = WeakRegistry::new("widgets");
//! let key = registry.reserve().unwrap();
//! let widget = Arc::new(Widget { key });
//! registry.bind(key, Arc::downgrade(&widget));
//!
//! assert!(registry.get(key).is_some());
//! drop(widget);
//! assert!(registry.get(key).is_none());
//! ```
//!
//! Entries are removed by the owner (typically from its `Drop` impl) via
//! [`WeakRegistry::unregister`]; dead entries are never handed out.
//!
//! Internally the registry is backed by [`DashMap`], whose entry API provides
//! the atomic insert-if-absent the retry loop relies on.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent weak-reference table keyed by random `u64` identifiers.
///
/// `None` marks a reserved key whose object is still being built.
pub struct WeakRegistry<T: ?Sized> {
    name: &'static str,
    entries: DashMap<u64, Option<Weak<T>>>,
    rng: SystemRandom,
}

impl<T: ?Sized> WeakRegistry<T> {
    /// Create an empty registry.  `name` is used in log output only.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            rng: SystemRandom::new(),
        }
    }

    /// Reserve a fresh, strictly unused key.
    ///
    /// Loops until the random draw lands on a free slot.  The slot stays
    /// reserved (and invisible to lookups) until [`bind`](Self::bind) or
    /// [`unregister`](Self::unregister) is called.
    pub fn reserve(&self) -> Result<u64> {
        loop {
            let key = self.draw()?;
            match self.entries.entry(key) {
                Entry::Occupied(_) => {
                    tracing::debug!(registry = self.name, key, "registry key collision, retrying");
                }
                Entry::Vacant(slot) => {
                    slot.insert(None);
                    return Ok(key);
                }
            }
        }
    }

    /// Attach a live object to a previously reserved key.
    pub fn bind(&self, key: u64, object: Weak<T>) {
        self.entries.insert(key, Some(object));
        tracing::trace!(registry = self.name, key, "registry entry bound");
    }

    /// Reserve a key and bind `object` to it in one step.
    pub fn register(&self, object: Weak<T>) -> Result<u64> {
        let key = self.reserve()?;
        self.bind(key, object);
        Ok(key)
    }

    /// Remove the entry for `key`.  Returns `true` if an entry existed.
    pub fn unregister(&self, key: u64) -> bool {
        let removed = self.entries.remove(&key).is_some();
        if removed {
            tracing::trace!(registry = self.name, key, "registry entry removed");
        }
        removed
    }

    /// Look up a live object by key.
    pub fn get(&self, key: u64) -> Option<Arc<T>> {
        self.entries
            .get(&key)
            .and_then(|entry| entry.value().as_ref().and_then(Weak::upgrade))
    }

    /// `true` if `key` is currently reserved or bound.
    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    /// Snapshot of every live object together with its key.
    pub fn live(&self) -> Vec<(u64, Arc<T>)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .map(|object| (*entry.key(), object))
            })
            .collect()
    }

    /// Number of entries, including reservations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn draw(&self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| KernelError::RandomUnavailable {
                reason: format!("failed to draw a key for registry `{}`", self.name),
            })?;
        Ok(u64::from_le_bytes(bytes))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Thing(&'static str);

    impl Named for Thing {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry: WeakRegistry<Thing> = WeakRegistry::new("test");
        let thing = Arc::new(Thing("a"));
        let key = registry.register(Arc::downgrade(&thing)).unwrap();

        let found = registry.get(key).expect("entry should be live");
        assert!(Arc::ptr_eq(&found, &thing));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dead_entries_are_not_returned() {
        let registry: WeakRegistry<Thing> = WeakRegistry::new("test");
        let thing = Arc::new(Thing("gone"));
        let key = registry.register(Arc::downgrade(&thing)).unwrap();
        drop(thing);

        assert!(registry.get(key).is_none());
        assert!(registry.live().is_empty());
        // The entry itself stays until the owner unregisters it.
        assert!(registry.contains(key));
        assert!(registry.unregister(key));
        assert!(registry.is_empty());
    }

    #[test]
    fn reserved_keys_are_unique_and_hidden() {
        let registry: WeakRegistry<Thing> = WeakRegistry::new("test");
        let mut keys = std::collections::HashSet::new();
        for _ in 0..256 {
            let key = registry.reserve().unwrap();
            assert!(keys.insert(key), "duplicate key handed out");
            assert!(registry.get(key).is_none());
        }
        assert_eq!(registry.len(), 256);
        assert!(registry.live().is_empty());
    }

    #[test]
    fn trait_objects_can_be_registered() {
        let registry: WeakRegistry<dyn Named> = WeakRegistry::new("dyn");
        let thing: Arc<dyn Named> = Arc::new(Thing("erased"));
        let key = registry.register(Arc::downgrade(&thing)).unwrap();

        let live = registry.live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, key);
        assert_eq!(live[0].1.name(), "erased");
    }

    #[test]
    fn unregister_missing_key_is_false() {
        let registry: WeakRegistry<Thing> = WeakRegistry::new("test");
        assert!(!registry.unregister(42));
    }
}
