//! Reverse lookup from aggregate objects to the credentials owning them.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::ConfigMap;
use parking_lot::RwLock;

use crate::owners;
use crate::reconciler::ReconcileKey;

/// Maps config maps to the reconcile keys of their credential owners, so
/// an aggregate event can be routed back to its contributors without
/// listing every credential, and a listed config map can be recognized as
/// credential-owned without schema knowledge.
///
/// The cache is populated by the config map watch stream and only read
/// during reconciliation.
#[derive(Default)]
pub struct CredentialIndex {
    owners: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl CredentialIndex {
    /// Records the ownership markers of a live config map and returns the
    /// reconcile keys of its credential owners.
    pub fn apply(&self, config_map: &ConfigMap) -> Vec<ReconcileKey> {
        let names = owners::credential_owner_names(&config_map.metadata);
        self.owners
            .write()
            .insert(cache_key(config_map), names.clone());
        owner_keys(config_map, names)
    }

    /// Drops a deleted config map from the cache. The owners recorded for
    /// it are still returned so they get a chance to re-converge.
    pub fn forget(&self, config_map: &ConfigMap) -> Vec<ReconcileKey> {
        let cached = self.owners.write().remove(&cache_key(config_map));
        let mut names = owners::credential_owner_names(&config_map.metadata);
        for name in cached.unwrap_or_default() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        owner_keys(config_map, names)
    }

    /// Rebuilds the cache from a full listing, as delivered when the
    /// watch (re)starts.
    pub fn replace_all(&self, config_maps: &[ConfigMap]) -> Vec<ReconcileKey> {
        self.owners.write().clear();
        config_maps
            .iter()
            .flat_map(|config_map| self.apply(config_map))
            .collect()
    }

    /// Whether this config map is an aggregate owned by credentials.
    ///
    /// Falls back to the object's own markers when the cache has no
    /// record yet: a freshly created aggregate can show up in a listing
    /// before its watch event has been delivered.
    pub fn is_credential_owned(&self, config_map: &ConfigMap) -> bool {
        if let Some(names) = self.owners.read().get(&cache_key(config_map)) {
            return !names.is_empty();
        }
        !owners::credential_owner_names(&config_map.metadata).is_empty()
    }
}

fn cache_key(config_map: &ConfigMap) -> (String, String) {
    (
        config_map.metadata.namespace.clone().unwrap_or_default(),
        config_map.metadata.name.clone().unwrap_or_default(),
    )
}

fn owner_keys(config_map: &ConfigMap, names: Vec<String>) -> Vec<ReconcileKey> {
    let namespace = config_map.metadata.namespace.clone().unwrap_or_default();
    names
        .into_iter()
        .map(|name| ReconcileKey {
            namespace: namespace.clone(),
            name,
        })
        .collect()
}
