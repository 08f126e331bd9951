//! URI to resource mapping.

use crate::resource::Resource;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Names a tracked resource either by URI or by instance.
#[derive(Debug, Clone, Copy)]
pub enum ResourceKey<'a> {
    /// Any resource registered under this URI.
    Uri(&'a str),
    /// This exact instance.
    Instance(&'a Resource),
}

impl ResourceKey<'_> {
    /// The URI the key refers to.
    pub fn uri(&self) -> &str {
        match self {
            ResourceKey::Uri(uri) => uri,
            ResourceKey::Instance(resource) => resource.uri(),
        }
    }

    fn matches(&self, resource: &Resource) -> bool {
        match self {
            ResourceKey::Uri(_) => true,
            ResourceKey::Instance(instance) => Resource::ptr_eq(instance, resource),
        }
    }
}

impl<'a> From<&'a str> for ResourceKey<'a> {
    fn from(uri: &'a str) -> Self {
        ResourceKey::Uri(uri)
    }
}

impl<'a> From<&'a String> for ResourceKey<'a> {
    fn from(uri: &'a String) -> Self {
        ResourceKey::Uri(uri)
    }
}

impl<'a> From<&'a Resource> for ResourceKey<'a> {
    fn from(resource: &'a Resource) -> Self {
        ResourceKey::Instance(resource)
    }
}

/// At most one resource per URI.
#[derive(Debug, Default)]
pub(crate) struct ResourceRegistry {
    resources: RwLock<BTreeMap<String, Resource>>,
}

impl ResourceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Exact-match lookup.
    pub(crate) fn get(&self, uri: &str) -> Option<Resource> {
        self.resources.read().get(uri).cloned()
    }

    /// Returns the resource registered under `uri`, creating it with `create`
    /// if there is none. The flag is true if `create` ran.
    pub(crate) fn get_or_insert_with<F>(&self, uri: &str, create: F) -> (Resource, bool)
    where
        F: FnOnce() -> Resource,
    {
        if let Some(existing) = self.get(uri) {
            return (existing, false);
        }
        let mut resources = self.resources.write();
        if let Some(existing) = resources.get(uri) {
            return (existing.clone(), false);
        }
        let resource = create();
        resources.insert(uri.to_string(), resource.clone());
        (resource, true)
    }

    /// Registers `resource` under its URI unless the URI is taken.
    pub(crate) fn insert(&self, resource: &Resource) -> bool {
        let mut resources = self.resources.write();
        if resources.contains_key(resource.uri()) {
            return false;
        }
        resources.insert(resource.uri().to_string(), resource.clone());
        true
    }

    /// Looks up the resource a key refers to.
    pub(crate) fn find(&self, key: ResourceKey<'_>) -> Option<Resource> {
        self.get(key.uri()).filter(|r| key.matches(r))
    }

    /// Removes the resource a key refers to.
    pub(crate) fn remove(&self, key: ResourceKey<'_>) -> Option<Resource> {
        let mut resources = self.resources.write();
        match resources.get(key.uri()) {
            Some(existing) if key.matches(existing) => resources.remove(key.uri()),
            _ => None,
        }
    }

    /// All tracked resources, ordered by URI.
    pub(crate) fn snapshot(&self) -> Vec<Resource> {
        self.resources.read().values().cloned().collect()
    }

    pub(crate) fn uris(&self) -> Vec<String> {
        self.resources.read().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.resources.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientStats;
    use crate::decode::PayloadDecoder;
    use crate::fetch::MockFetcher;
    use std::sync::Arc;

    fn resource(uri: &str) -> Resource {
        Resource::new(
            format!("/api{}", uri),
            uri.to_string(),
            None,
            PayloadDecoder::Raw,
            Arc::new(MockFetcher::new()),
            Arc::new(RwLock::new(ClientStats::default())),
        )
    }

    #[test]
    fn get_or_insert_dedups() {
        let registry = ResourceRegistry::new();
        let (first, created) = registry.get_or_insert_with("/a", || resource("/a"));
        assert!(created);
        let (second, created) = registry.get_or_insert_with("/a", || resource("/a"));
        assert!(!created);
        assert!(Resource::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn insert_refuses_taken_uri() {
        let registry = ResourceRegistry::new();
        assert!(registry.insert(&resource("/a")));
        assert!(!registry.insert(&resource("/a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn instance_key_requires_identity() {
        let registry = ResourceRegistry::new();
        let tracked = resource("/a");
        registry.insert(&tracked);
        let impostor = resource("/a");

        assert!(registry.find(ResourceKey::from(&impostor)).is_none());
        assert!(registry.remove(ResourceKey::from(&impostor)).is_none());
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(ResourceKey::from(&tracked)).unwrap();
        assert!(Resource::ptr_eq(&removed, &tracked));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn uri_key_matches_any_instance() {
        let registry = ResourceRegistry::new();
        registry.insert(&resource("/a"));
        assert!(registry.find("/a".into()).is_some());
        assert!(registry.remove("/a".into()).is_some());
        assert!(registry.remove("/a".into()).is_none());
    }

    #[test]
    fn snapshot_is_sorted_by_uri() {
        let registry = ResourceRegistry::new();
        for uri in ["/c", "/a", "/b"] {
            registry.insert(&resource(uri));
        }
        assert_eq!(registry.uris(), vec!["/a", "/b", "/c"]);
        let order: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|r| r.uri().to_string())
            .collect();
        assert_eq!(order, registry.uris());
    }
}
