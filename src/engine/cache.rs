//! Per-entity result cache.

use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::engine::types::Entity;
use crate::engine::variables::VariableMap;
use crate::error::StoreError;
use crate::store::KeyValueStore;

/// Caches each entity's variable map in an injected key-value store.
///
/// Store failures are logged and treated as misses: the cache can only
/// save work, never fail an entity.
pub struct ResultCache {
    store: Arc<dyn KeyValueStore>,
    /// One async lock per entity key, so concurrent workers on the same
    /// entity run the capabilities once. An entry lives only while some
    /// worker holds or awaits it.
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one entity key. Dropping it releases the key and
/// forgets the lock once nobody else is waiting on it.
pub struct EntityLock<'a> {
    cache: &'a ResultCache,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityLock<'_> {
    fn drop(&mut self) {
        // The guard holds a reference to the lock itself; release it first.
        drop(self.guard.take());
        let mut locks = self.cache.locks();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hold the per-entity lock for the duration of the entity's pipeline.
    pub async fn lock(&self, entity: &Entity) -> EntityLock<'_> {
        let key = entity.identity_key();
        let lock = Arc::clone(self.locks().entry(key.clone()).or_default());
        let guard = lock.lock_owned().await;
        EntityLock {
            cache: self,
            key,
            guard: Some(guard),
        }
    }

    /// Entity keys currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks().len()
    }

    /// Cached variable map for the entity, if any.
    pub async fn get(&self, entity: &Entity) -> Option<VariableMap> {
        let key = entity.identity_key();
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str::<VariableMap>(&raw) {
            Ok(map) => {
                debug!(key = %key, variables = map.len(), "Cache hit");
                Some(map)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cached entry is corrupt, treating as miss");
                None
            }
        }
    }

    /// Store the entity's variable map.
    pub async fn put(&self, entity: &Entity, variables: &VariableMap) {
        let key = entity.identity_key();
        if let Err(e) = self.write(&key, variables).await {
            warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    async fn write(&self, key: &str, variables: &VariableMap) -> Result<(), StoreError> {
        let raw = serde_json::to_string(variables)?;
        self.store.set(key, &raw).await
    }
}
