use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::sidecar::SidecarStore;

/// Project id -> derivative store, shared by the engine and the server.
#[derive(Clone, Default)]
pub struct ProjectRegistry {
    stores: Arc<RwLock<HashMap<String, Arc<SidecarStore>>>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store, keeping an already registered one for the same id.
    pub fn register(&self, project_id: &str, store: SidecarStore) -> Arc<SidecarStore> {
        let Ok(mut stores) = self.stores.write() else {
            return Arc::new(store);
        };
        stores
            .entry(project_id.to_string())
            .or_insert_with(|| {
                debug!("Registered project {}", project_id);
                Arc::new(store)
            })
            .clone()
    }

    pub fn unregister(&self, project_id: &str) -> Option<Arc<SidecarStore>> {
        self.stores.write().ok()?.remove(project_id)
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<SidecarStore>> {
        self.stores.read().ok()?.get(project_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.stores.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DerivativeConfig;

    #[test]
    fn test_register_keeps_existing_handle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::new();
        let config = DerivativeConfig::default();

        let first = registry.register("p", SidecarStore::open(dir.path(), &config).unwrap());
        let second = registry.register("p", SidecarStore::open(dir.path(), &config).unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister("p").is_some());
        assert!(registry.get("p").is_none());
        assert!(registry.is_empty());
    }
}
