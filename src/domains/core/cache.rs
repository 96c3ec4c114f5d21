use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::DomainResult;

/// Process-wide read-through cache keyed by container id.
///
/// Values are populated lazily on first access and invalidated explicitly
/// by mutating operations; there is no TTL or LRU eviction. The value is
/// fully built before it is published into the map, so readers never see a
/// partially-populated entry. Reads outside a transaction may observe
/// stale data until the owning mutator calls `clear`.
pub struct ContainerCache<T> {
    map: RwLock<HashMap<Uuid, Arc<T>>>,
}

impl<T> ContainerCache<T> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the cached value for a container, running `loader` to build it
    /// on a miss. Concurrent loaders may race; the first published value
    /// wins and the losers' results are dropped.
    pub async fn get_or_load<F, Fut>(&self, container_id: Uuid, loader: F) -> DomainResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        if let Some(cached) = self.map.read().await.get(&container_id) {
            return Ok(Arc::clone(cached));
        }

        let value = Arc::new(loader().await?);

        let mut map = self.map.write().await;
        Ok(Arc::clone(map.entry(container_id).or_insert(value)))
    }

    /// Current cached value, if any, without triggering a load.
    pub async fn peek(&self, container_id: Uuid) -> Option<Arc<T>> {
        self.map.read().await.get(&container_id).map(Arc::clone)
    }

    /// Drop the cached value for one container.
    pub async fn clear(&self, container_id: Uuid) {
        self.map.write().await.remove(&container_id);
    }

    /// Drop every cached value.
    pub async fn clear_all(&self) {
        self.map.write().await.clear();
    }
}

impl<T> Default for ContainerCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
