use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fdo_data_formats::Serializable;

mod in_memory;

mod adapters;
pub use adapters::{OwnerSignStore, SessionStore, VoucherStore, SESSION_TTL};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unspecified error occurred: {0}")]
    Unspecified(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Method not available")]
    MethodNotAvailable,
    #[error("Error encoding stored value: {0}")]
    Encoding(#[from] fdo_data_formats::Error),
}

/// A key-value store with optional per-entry expiry.
///
/// Expired entries are never returned; `perform_maintenance` reclaims them.
#[async_trait]
pub trait Store<K, V>: Send + Sync {
    async fn load_data(&self, key: &K) -> Result<Option<V>, StoreError>;

    async fn store_data(&self, key: K, ttl: Option<Duration>, value: V) -> Result<(), StoreError>;

    async fn destroy_data(&self, key: &K) -> Result<(), StoreError>;

    async fn perform_maintenance(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    InMemory,
}

impl StoreConfig {
    pub fn initialize<K, V>(&self) -> Result<Box<dyn Store<K, V>>, StoreError>
    where
        K: Eq + std::hash::Hash + Send + Sync + std::string::ToString + 'static,
        V: Send + Sync + Clone + Serializable + 'static,
    {
        match self {
            StoreConfig::InMemory => in_memory::initialize(),
        }
    }
}
