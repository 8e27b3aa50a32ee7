//! Typed views over a [`Store`], each with its own key prefix.

use std::time::Duration;

use fdo_data_formats::{ownershipvoucher::VoucherDBEntry, types::Guid, Serializable};

use crate::{Store, StoreError};

/// Lifetime of a protocol session, refreshed on every update
pub const SESSION_TTL: Duration = Duration::from_secs(10 * 60);

const SESSION_PREFIX: &str = "session-";
const VOUCHER_PREFIX: &str = "voucher-";
const OWNER_SIGN_PREFIX: &str = "to1osstorage-";

pub struct SessionStore<V> {
    store: Box<dyn Store<String, V>>,
}

impl<V> SessionStore<V>
where
    V: Send + Sync + Clone + Serializable + 'static,
{
    pub fn new(store: Box<dyn Store<String, V>>) -> Self {
        SessionStore { store }
    }

    fn key(token: &str) -> String {
        format!("{}{}", SESSION_PREFIX, token)
    }

    /// Stores a new session and returns its bearer token
    pub async fn new_session(&self, value: V) -> Result<String, StoreError> {
        let token = uuid::Uuid::new_v4().to_string();
        self.store
            .store_data(Self::key(&token), Some(SESSION_TTL), value)
            .await?;
        Ok(token)
    }

    pub async fn get(&self, token: &str) -> Result<Option<V>, StoreError> {
        self.store.load_data(&Self::key(token)).await
    }

    pub async fn update(&self, token: &str, value: V) -> Result<(), StoreError> {
        self.store
            .store_data(Self::key(token), Some(SESSION_TTL), value)
            .await
    }

    pub async fn destroy(&self, token: &str) -> Result<(), StoreError> {
        self.store.destroy_data(&Self::key(token)).await
    }

    pub async fn perform_maintenance(&self) -> Result<(), StoreError> {
        self.store.perform_maintenance().await
    }
}

pub struct VoucherStore {
    store: Box<dyn Store<String, VoucherDBEntry>>,
}

impl VoucherStore {
    pub fn new(store: Box<dyn Store<String, VoucherDBEntry>>) -> Self {
        VoucherStore { store }
    }

    fn key(guid: &Guid) -> String {
        format!("{}{}", VOUCHER_PREFIX, guid)
    }

    pub async fn get(&self, guid: &Guid) -> Result<Option<VoucherDBEntry>, StoreError> {
        self.store.load_data(&Self::key(guid)).await
    }

    pub async fn save(&self, entry: VoucherDBEntry) -> Result<Guid, StoreError> {
        let guid = entry.voucher().header()?.guid().clone();
        self.store.store_data(Self::key(&guid), None, entry).await?;
        Ok(guid)
    }

    pub async fn remove(&self, guid: &Guid) -> Result<(), StoreError> {
        self.store.destroy_data(&Self::key(guid)).await
    }
}

pub struct OwnerSignStore<V> {
    store: Box<dyn Store<String, V>>,
}

impl<V> OwnerSignStore<V>
where
    V: Send + Sync + Clone + Serializable + 'static,
{
    pub fn new(store: Box<dyn Store<String, V>>) -> Self {
        OwnerSignStore { store }
    }

    fn key(guid: &Guid) -> String {
        format!("{}{}", OWNER_SIGN_PREFIX, guid)
    }

    pub async fn save(&self, guid: &Guid, value: V, ttl_seconds: u32) -> Result<(), StoreError> {
        self.store
            .store_data(
                Self::key(guid),
                Some(Duration::from_secs(ttl_seconds.into())),
                value,
            )
            .await
    }

    pub async fn get(&self, guid: &Guid) -> Result<Option<V>, StoreError> {
        self.store.load_data(&Self::key(guid)).await
    }

    pub async fn perform_maintenance(&self) -> Result<(), StoreError> {
        self.store.perform_maintenance().await
    }
}

#[cfg(test)]
mod test {
    use fdo_data_formats::types::Guid;
    use maplit::hashmap;

    use super::{OwnerSignStore, SessionStore};
    use crate::StoreConfig;

    #[tokio::test]
    async fn test_sessions() {
        let sessions: SessionStore<Vec<u8>> =
            SessionStore::new(StoreConfig::InMemory.initialize().unwrap());
        let token = sessions.new_session(vec![1]).await.unwrap();
        let other = sessions.new_session(vec![2]).await.unwrap();
        assert_ne!(token, other);

        sessions.update(&token, vec![1, 2]).await.unwrap();
        let expected = hashmap! {
            token.clone() => Some(vec![1, 2]),
            other.clone() => Some(vec![2]),
            "unknown".to_string() => None,
        };
        for (token, value) in expected {
            assert_eq!(sessions.get(&token).await.unwrap(), value);
        }

        sessions.destroy(&token).await.unwrap();
        assert_eq!(sessions.get(&token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_owner_sign_expiry() {
        let store: OwnerSignStore<String> =
            OwnerSignStore::new(StoreConfig::InMemory.initialize().unwrap());
        let guid = Guid::new().unwrap();
        store.save(&guid, "blob".to_string(), 0).await.unwrap();
        assert_eq!(store.get(&guid).await.unwrap(), None);

        store.save(&guid, "blob".to_string(), 60).await.unwrap();
        assert_eq!(store.get(&guid).await.unwrap(), Some("blob".to_string()));
        assert_eq!(store.get(&Guid::new().unwrap()).await.unwrap(), None);
    }
}
