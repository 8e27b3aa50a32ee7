use fdo_store::StoreConfig;
use serde::{Deserialize, Serialize};

use super::Bind;

/// The longest registration the rendezvous server accepts, thirty days
pub const DEFAULT_MAX_WAIT_SECONDS: u32 = 2_592_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct RendezvousServerSettings {
    // Storage info
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub storage_driver: StoreConfig,

    // Session store info
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub session_store_driver: StoreConfig,

    // Other info
    pub max_wait_seconds: Option<u32>,

    // Bind information
    pub bind: Bind,
}

impl RendezvousServerSettings {
    pub fn max_wait_seconds(&self) -> u32 {
        self.max_wait_seconds.unwrap_or(DEFAULT_MAX_WAIT_SECONDS)
    }
}
