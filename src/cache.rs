//! Injected cache services
//!
//! Process-wide caches keyed by tenant (container) + identifier, constructed
//! at startup and injected into the services that consult them. Writes never
//! patch cached entries in place; they evict the whole key and let the next
//! read reload.

use crate::properties::descriptor::Domain;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Cache of loaded domain snapshots keyed by (container, domain URI).
#[derive(Default)]
pub struct DomainCache {
    entries: RwLock<HashMap<(Uuid, String), Arc<Domain>>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, container: Uuid, domain_uri: &str) -> Option<Arc<Domain>> {
        self.entries
            .read()
            .expect("domain cache lock poisoned")
            .get(&(container, domain_uri.to_string()))
            .cloned()
    }

    pub fn put(&self, domain: Arc<Domain>) {
        let key = (
            domain.descriptor.container,
            domain.descriptor.domain_uri.clone(),
        );
        self.entries
            .write()
            .expect("domain cache lock poisoned")
            .insert(key, domain);
    }

    pub fn invalidate(&self, container: Uuid, domain_uri: &str) {
        self.entries
            .write()
            .expect("domain cache lock poisoned")
            .remove(&(container, domain_uri.to_string()));
    }

    pub fn invalidate_container(&self, container: Uuid) {
        self.entries
            .write()
            .expect("domain cache lock poisoned")
            .retain(|(c, _), _| *c != container);
    }
}

/// Generic container-swept cache: one entry per container holding the whole
/// per-container load. Eviction is always container-granular.
pub struct ContainerCache<V> {
    entries: RwLock<HashMap<Uuid, Arc<V>>>,
}

impl<V> ContainerCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, container: Uuid) -> Option<Arc<V>> {
        self.entries
            .read()
            .expect("container cache lock poisoned")
            .get(&container)
            .cloned()
    }

    pub fn put(&self, container: Uuid, value: Arc<V>) {
        self.entries
            .write()
            .expect("container cache lock poisoned")
            .insert(container, value);
    }

    pub fn invalidate(&self, container: Uuid) {
        self.entries
            .write()
            .expect("container cache lock poisoned")
            .remove(&container);
    }
}

impl<V> Default for ContainerCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::domain_models::DomainDescriptorRow;
    use crate::properties::descriptor::DomainDescriptor;

    fn snapshot(container: Uuid, uri: &str) -> Arc<Domain> {
        Arc::new(Domain {
            descriptor: DomainDescriptor::from(DomainDescriptorRow {
                domain_id: 1,
                domain_uri: uri.to_string(),
                name: "d".to_string(),
                container,
                kind: "test".to_string(),
                storage_schema_name: None,
                storage_table_name: None,
                modified: chrono::Utc::now(),
            }),
            properties: Vec::new(),
        })
    }

    #[test]
    fn eviction_is_whole_key() {
        let cache = DomainCache::new();
        let container = Uuid::new_v4();
        cache.put(snapshot(container, "urn:a"));
        cache.put(snapshot(container, "urn:b"));

        cache.invalidate(container, "urn:a");
        assert!(cache.get(container, "urn:a").is_none());
        assert!(cache.get(container, "urn:b").is_some());

        cache.invalidate_container(container);
        assert!(cache.get(container, "urn:b").is_none());
    }

    #[test]
    fn container_cache_round_trip() {
        let cache: ContainerCache<Vec<i32>> = ContainerCache::new();
        let container = Uuid::new_v4();
        assert!(cache.get(container).is_none());
        cache.put(container, Arc::new(vec![1, 2]));
        assert_eq!(*cache.get(container).unwrap(), vec![1, 2]);
        cache.invalidate(container);
        assert!(cache.get(container).is_none());
    }
}
