//! Object registry and service table
//!
//! [`ObjectRegistry`] maps correlation ids to live statuses, keeps retired
//! ones in a time-bounded cache, and deduplicates creation requests.
//! [`ServiceTable`] locates singleton collaborators (state managers,
//! persistence modules) by type and name.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::activity::Activity;
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::state::StateManager;

/// Field equality between a live entry and a creation request
pub trait Deduplicate<C: ?Sized> {
    /// Whether `candidate` describes the same logical unit of work
    fn same_work(&self, candidate: &C) -> bool;
}

/// Live entities by id plus a cache of retired ones
pub struct ObjectRegistry<S> {
    live: HashMap<ObjectId, S>,
    cache: HashMap<ObjectId, S>,
}

impl<S> Default for ObjectRegistry<S> {
    fn default() -> Self {
        Self {
            live: HashMap::new(),
            cache: HashMap::new(),
        }
    }
}

impl<S> ObjectRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live entry, returning the one it replaced
    pub fn register(&mut self, id: ObjectId, status: S) -> Option<S> {
        self.live.insert(id, status)
    }

    /// Live entry first, then the cache
    #[must_use]
    pub fn lookup(&self, id: &ObjectId) -> Option<&S> {
        self.live.get(id).or_else(|| self.cache.get(id))
    }

    /// Mutable lookup over live and cached entries
    pub fn lookup_mut(&mut self, id: &ObjectId) -> Option<&mut S> {
        match self.live.get_mut(id) {
            Some(status) => Some(status),
            None => self.cache.get_mut(id),
        }
    }

    /// Mutable access to a live entry only
    pub fn live_mut(&mut self, id: &ObjectId) -> Option<&mut S> {
        self.live.get_mut(id)
    }

    #[must_use]
    pub fn is_live(&self, id: &ObjectId) -> bool {
        self.live.contains_key(id)
    }

    #[must_use]
    pub fn is_cached(&self, id: &ObjectId) -> bool {
        self.cache.contains_key(id)
    }

    /// Live entry describing the same work as `candidate`
    ///
    /// Linear scan; only used at creation time over the open entries.
    pub fn deduplicate<C: ?Sized>(&self, candidate: &C) -> Option<ObjectId>
    where
        S: Deduplicate<C>,
    {
        self.live
            .iter()
            .find(|(_, status)| status.same_work(candidate))
            .map(|(id, _)| *id)
    }

    /// Move a live entry into the cache
    ///
    /// The caller schedules [`ObjectRegistry::evict`] after the retention window.
    pub fn retire(&mut self, id: &ObjectId) -> bool {
        match self.live.remove(id) {
            Some(status) => {
                debug!(id = %id, "retired to cache");
                self.cache.entry(*id).or_insert(status);
                true
            }
            None => false,
        }
    }

    /// Drop a cached entry
    pub fn evict(&mut self, id: &ObjectId) -> Option<S> {
        let evicted = self.cache.remove(id);
        if evicted.is_some() {
            debug!(id = %id, "evicted from cache");
        }
        evicted
    }

    #[must_use]
    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

/// Singleton collaborators keyed by type and name
#[derive(Default, Clone)]
pub struct ServiceTable {
    entries: HashMap<(TypeId, &'static str), Arc<dyn Any + Send + Sync>>,
}

impl ServiceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under `name`, replacing any previous one
    pub fn insert<T: Any + Send + Sync>(&mut self, name: &'static str, service: Arc<T>) {
        self.entries.insert((TypeId::of::<T>(), name), service);
    }

    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &'static str) -> Option<Arc<T>> {
        self.entries
            .get(&(TypeId::of::<T>(), name))
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    /// Like [`ServiceTable::get`], failing when the service is missing
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if nothing is registered under `name`.
    pub fn require<T: Any + Send + Sync>(&self, name: &'static str) -> Result<Arc<T>, CoreError> {
        self.get(name).ok_or_else(|| {
            CoreError::ConfigError(format!(
                "no {} registered as {name}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// State manager of activity kind `A`
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if the manager was never registered.
    pub fn manager<A: Activity>(&self) -> Result<Arc<StateManager<A>>, CoreError> {
        self.require(A::KIND.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Entry {
        hosts: Vec<&'static str>,
        retry: u32,
    }

    impl Deduplicate<Entry> for Entry {
        fn same_work(&self, candidate: &Entry) -> bool {
            self == candidate
        }
    }

    #[test]
    fn test_lookup_falls_back_to_cache() {
        let mut registry = ObjectRegistry::new();
        let id = ObjectId::new();
        registry.register(
            id,
            Entry {
                hosts: vec!["a"],
                retry: 3,
            },
        );

        assert!(registry.is_live(&id));
        assert!(registry.retire(&id));
        assert!(!registry.retire(&id));
        assert!(!registry.is_live(&id));
        assert!(registry.lookup(&id).is_some());
        assert!(registry.lookup_mut(&id).is_some());
        assert!(registry.live_mut(&id).is_none());

        assert!(registry.evict(&id).is_some());
        assert!(registry.lookup(&id).is_none());
    }

    #[test]
    fn test_deduplicate_ignores_cached_entries() {
        let mut registry = ObjectRegistry::new();
        let id = ObjectId::new();
        registry.register(
            id,
            Entry {
                hosts: vec!["a", "b"],
                retry: 3,
            },
        );

        let same = Entry {
            hosts: vec!["a", "b"],
            retry: 3,
        };
        let other = Entry {
            hosts: vec!["a", "b"],
            retry: 1,
        };
        assert_eq!(registry.deduplicate(&same), Some(id));
        assert_eq!(registry.deduplicate(&other), None);

        registry.retire(&id);
        assert_eq!(registry.deduplicate(&same), None);
    }

    #[test]
    fn test_service_table_by_type_and_name() {
        let mut services = ServiceTable::new();
        services.insert("primary", Arc::new(7u32));
        services.insert("secondary", Arc::new(9u32));
        services.insert("primary", Arc::new(String::from("text")));

        assert_eq!(services.get::<u32>("primary").as_deref(), Some(&7));
        assert_eq!(services.get::<u32>("secondary").as_deref(), Some(&9));
        assert_eq!(
            services.get::<String>("primary").as_deref().map(String::as_str),
            Some("text")
        );
        assert!(services.get::<u64>("primary").is_none());
        assert!(services.require::<u64>("primary").is_err());
    }
}
