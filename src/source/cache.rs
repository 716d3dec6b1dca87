//! Client cache shared across tasks
//!
//! Clients are keyed by [`ClientCacheKey`]. A client that drew a forbidden
//! response is tainted rather than removed, so tasks sharing it can choose to
//! re-derive it.

use super::{ClientCacheKey, ClientProvider, CredentialSource};
use crate::error::CredsyncResult;
use crate::task::SyncTask;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

struct CachedClient {
    client: Arc<dyn CredentialSource>,
    tainted: bool,
}

/// Keyed store of credential source clients
#[derive(Default)]
pub struct ClientCache {
    entries: RwLock<HashMap<ClientCacheKey, CachedClient>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached client and whether it is tainted
    pub fn get(&self, key: &ClientCacheKey) -> Option<(Arc<dyn CredentialSource>, bool)> {
        self.read()
            .get(key)
            .map(|c| (Arc::clone(&c.client), c.tainted))
    }

    /// Store a client, replacing (and untainting) any previous one
    pub fn insert(&self, key: ClientCacheKey, client: Arc<dyn CredentialSource>) {
        self.write().insert(
            key,
            CachedClient {
                client,
                tainted: false,
            },
        );
    }

    /// Mark a client as suspect; returns false if it isn't cached
    pub fn taint(&self, key: &ClientCacheKey) -> bool {
        match self.write().get_mut(key) {
            Some(entry) => {
                entry.tainted = true;
                true
            }
            None => false,
        }
    }

    pub fn is_tainted(&self, key: &ClientCacheKey) -> bool {
        self.read().get(key).is_some_and(|c| c.tainted)
    }

    pub fn remove(&self, key: &ClientCacheKey) -> bool {
        self.write().remove(key).is_some()
    }

    /// Evict every client sharing `key`'s parent identity.
    ///
    /// Returns the evicted keys.
    pub fn evict_family(&self, key: &ClientCacheKey) -> Vec<ClientCacheKey> {
        let mut entries = self.write();
        let family: Vec<ClientCacheKey> = entries
            .keys()
            .filter(|k| k.same_parent(key))
            .cloned()
            .collect();
        for k in &family {
            entries.remove(k);
        }
        family
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ClientCacheKey, CachedClient>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ClientCacheKey, CachedClient>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds clients for tasks; the auth and connection details live here
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Key the task's client is cached under
    fn cache_key(&self, task: &SyncTask) -> CredsyncResult<ClientCacheKey>;

    /// Authenticate a new client
    async fn create(
        &self,
        task: &SyncTask,
        key: &ClientCacheKey,
    ) -> CredsyncResult<Arc<dyn CredentialSource>>;
}

/// [`ClientProvider`] that reuses cached clients and re-derives tainted ones
pub struct CachingClientProvider<F> {
    factory: F,
    cache: ClientCache,
}

impl<F: ClientFactory> CachingClientProvider<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            cache: ClientCache::new(),
        }
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[async_trait]
impl<F: ClientFactory> ClientProvider for CachingClientProvider<F> {
    async fn client(&self, task: &SyncTask) -> CredsyncResult<Arc<dyn CredentialSource>> {
        let key = self.factory.cache_key(task)?;
        match self.cache.get(&key) {
            Some((client, false)) => {
                debug!(task = %task.key, cache_key = %key, "Reusing cached client");
                return Ok(client);
            }
            Some((_, true)) => {
                info!(task = %task.key, cache_key = %key, "Re-deriving tainted client");
            }
            None => {
                debug!(task = %task.key, cache_key = %key, "Creating client");
            }
        }

        let client = self.factory.create(task, &key).await?;
        self.cache.insert(key, Arc::clone(&client));
        Ok(client)
    }

    fn taint(&self, key: &ClientCacheKey) {
        if self.cache.taint(key) {
            info!(cache_key = %key, "Tainted cached client");
        }
    }
}
