use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use log::trace;
use tokio::sync::RwLock;

use super::Store;
use super::StoreError;

type ValueT<V> = (Option<SystemTime>, V);

#[derive(Debug)]
struct MemoryStore<K, V> {
    store: Arc<RwLock<HashMap<K, ValueT<V>>>>,
}

pub(super) fn initialize<K, V>() -> Result<Box<dyn Store<K, V>>, StoreError>
where
    K: std::string::ToString + Eq + std::hash::Hash + Send + Sync + 'static,
    V: Send + Sync + Clone + 'static,
{
    Ok(Box::new(MemoryStore {
        store: Arc::new(RwLock::new(HashMap::new())),
    }))
}

fn is_expired(ttl: &Option<SystemTime>, now: SystemTime) -> bool {
    matches!(ttl, Some(ttl) if *ttl <= now)
}

#[async_trait]
impl<K, V> Store<K, V> for MemoryStore<K, V>
where
    K: std::string::ToString + Eq + std::hash::Hash + Send + Sync,
    V: Send + Sync + Clone,
{
    async fn load_data(&self, key: &K) -> Result<Option<V>, StoreError> {
        trace!("Looking for entry {}", key.to_string());
        let store = self.store.read().await;

        match store.get(key) {
            None => {
                trace!("Entry not found");
                Ok(None)
            }
            Some((ttl, _)) if is_expired(ttl, SystemTime::now()) => {
                trace!("Entry had expired");
                Ok(None)
            }
            Some((_, data)) => Ok(Some(data.clone())),
        }
    }

    async fn store_data(&self, key: K, ttl: Option<Duration>, value: V) -> Result<(), StoreError> {
        trace!("Storing entry, key {}, TTL {:?}", key.to_string(), ttl);

        let ttl = ttl.map(|d| SystemTime::now() + d);

        self.store.write().await.insert(key, (ttl, value));
        Ok(())
    }

    async fn destroy_data(&self, key: &K) -> Result<(), StoreError> {
        trace!("Destroying entry {}", key.to_string());

        self.store.write().await.remove(key);
        Ok(())
    }

    async fn perform_maintenance(&self) -> Result<(), StoreError> {
        let now = SystemTime::now();
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, (ttl, _)| !is_expired(ttl, now));
        trace!("Maintenance removed {} entries", before - store.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::initialize;
    use crate::Store;

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store: Box<dyn Store<String, u32>> = initialize().unwrap();
        store
            .store_data("forever".to_string(), None, 1)
            .await
            .unwrap();
        store
            .store_data("short".to_string(), Some(Duration::from_millis(10)), 2)
            .await
            .unwrap();
        assert_eq!(store.load_data(&"short".to_string()).await.unwrap(), Some(2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.load_data(&"short".to_string()).await.unwrap(), None);
        store.perform_maintenance().await.unwrap();
        assert_eq!(
            store.load_data(&"forever".to_string()).await.unwrap(),
            Some(1)
        );

        store.destroy_data(&"forever".to_string()).await.unwrap();
        assert_eq!(store.load_data(&"forever".to_string()).await.unwrap(), None);
    }
}
