use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use warp::Filter;

use fdo_data_formats::{
    conformance::{ConformanceHook, NoConformanceTests},
    messages::to2,
    ownershipvoucher::VoucherDBEntry,
    types::{Guid, ServiceInfoKV, TO2AddressEntry},
};
use fdo_http_wrapper::server::{fdo_request_filter, SessionStore};
use fdo_store::{StoreConfig, VoucherStore};

mod handlers;
mod to0;

pub use to0::perform_to0;

pub struct OwnerServiceUD {
    ownership_voucher_store: VoucherStore,
    session_store: Arc<SessionStore>,

    owner_addresses: Vec<TO2AddressEntry>,
    to0_wait_seconds: u32,
    // When each voucher is next due for TO0 registration
    to0_schedule: Mutex<HashMap<Guid, Instant>>,

    reuse_credential: bool,
    service_info: Vec<ServiceInfoKV>,
    // Advertised to devices in OwnerServiceInfoReady
    max_device_service_info_size: u16,

    conformance: Box<dyn ConformanceHook>,
}

pub type OwnerServiceUDT = Arc<OwnerServiceUD>;

impl OwnerServiceUD {
    pub fn new(
        ownership_voucher_store_driver: &StoreConfig,
        session_store_driver: &StoreConfig,
        owner_addresses: Vec<TO2AddressEntry>,
    ) -> Result<Self> {
        Ok(OwnerServiceUD {
            ownership_voucher_store: VoucherStore::new(
                ownership_voucher_store_driver
                    .initialize()
                    .context("Error initializing ownership voucher store")?,
            ),
            session_store: fdo_http_wrapper::server::new_session_store(session_store_driver)
                .context("Error initializing session store")?,
            owner_addresses,
            to0_wait_seconds: fdo_util::servers::configuration::owner_onboarding_server::DEFAULT_TO0_WAIT_SECONDS,
            to0_schedule: Mutex::new(HashMap::new()),
            reuse_credential: false,
            service_info: Vec::new(),
            max_device_service_info_size: to2::DEFAULT_MAX_MESSAGE_SIZE,
            conformance: Box::new(NoConformanceTests),
        })
    }

    pub fn with_to0_wait_seconds(mut self, to0_wait_seconds: u32) -> Self {
        self.to0_wait_seconds = to0_wait_seconds;
        self
    }

    pub fn with_reuse_credential(mut self, reuse_credential: bool) -> Self {
        self.reuse_credential = reuse_credential;
        self
    }

    pub fn with_service_info(mut self, service_info: Vec<ServiceInfoKV>) -> Self {
        self.service_info = service_info;
        self
    }

    pub fn with_max_device_service_info_size(mut self, max_size: u16) -> Self {
        self.max_device_service_info_size = max_size;
        self
    }

    pub fn with_conformance(mut self, hook: Box<dyn ConformanceHook>) -> Self {
        self.conformance = hook;
        self
    }

    /// Validates and stores a voucher this service owns, scheduling its TO0
    pub async fn import_voucher(&self, entry: VoucherDBEntry) -> Result<Guid> {
        let header = entry
            .voucher()
            .validate()
            .context("Ownership voucher is invalid")?;
        let owner_key = entry.private_key().context("Unusable owner key")?;
        if !entry
            .voucher()
            .final_owner_public_key()?
            .matches_pkey(&owner_key)
        {
            bail!(
                "Ownership voucher for {} is not owned by the provided key",
                header.guid()
            );
        }

        let guid = self.ownership_voucher_store.save(entry).await?;
        self.to0_schedule
            .lock()
            .await
            .insert(guid.clone(), Instant::now());
        log::info!("Imported ownership voucher for device {}", guid);
        Ok(guid)
    }

    pub async fn voucher(&self, guid: &Guid) -> Result<Option<VoucherDBEntry>> {
        Ok(self.ownership_voucher_store.get(guid).await?)
    }

    /// Registers every voucher whose registration is due with its rendezvous servers
    pub async fn report_to_rendezvous(&self) -> Result<()> {
        let now = Instant::now();
        let due: Vec<Guid> = self
            .to0_schedule
            .lock()
            .await
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(guid, _)| guid.clone())
            .collect();

        for guid in due {
            let entry = match self.ownership_voucher_store.get(&guid).await? {
                Some(entry) => entry,
                None => {
                    self.to0_schedule.lock().await.remove(&guid);
                    continue;
                }
            };
            let next = match perform_to0(&entry, &self.owner_addresses, self.to0_wait_seconds).await
            {
                Ok(wait_seconds) => Duration::from_secs(wait_seconds.into()),
                Err(e) => {
                    log::warn!("OV({}): failed to report to rendezvous: {:?}", guid, e);
                    Duration::from_secs(MAINTENANCE_INTERVAL)
                }
            };
            self.to0_schedule.lock().await.insert(guid, now + next);
        }
        Ok(())
    }
}

/// Loads every `*.pem` voucher (voucher block followed by the owner key) in a directory
pub fn load_vouchers_from_dir(path: &Path) -> Result<Vec<VoucherDBEntry>> {
    let mut entries = Vec::new();
    for dirent in std::fs::read_dir(path)
        .with_context(|| format!("Error reading voucher directory {}", path.display()))?
    {
        let dirent = dirent?;
        let path = dirent.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pem") {
            continue;
        }
        let contents = std::fs::read(&path)
            .with_context(|| format!("Error reading voucher at {}", path.display()))?;
        entries.push(
            VoucherDBEntry::from_pem(&contents)
                .with_context(|| format!("Error parsing voucher at {}", path.display()))?,
        );
    }
    Ok(entries)
}

const MAINTENANCE_INTERVAL: u64 = 60;

pub async fn perform_maintenance(udt: OwnerServiceUDT, report_to_rendezvous: bool) {
    log::info!(
        "Scheduling maintenance every {} seconds",
        MAINTENANCE_INTERVAL
    );

    loop {
        if report_to_rendezvous {
            if let Err(e) = udt.report_to_rendezvous().await {
                log::warn!("Error during rendezvous registration: {:?}", e);
            }
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(MAINTENANCE_INTERVAL)).await;

        if let Err(e) = udt.session_store.perform_maintenance().await {
            log::warn!("Error during session store maintenance: {:?}", e);
        }
    }
}

/// All TO2 routes of the owner onboarding server
pub fn routes(
    user_data: OwnerServiceUDT,
) -> impl Filter<Extract = (impl warp::Reply,), Error = std::convert::Infallible> + Clone {
    let session_store = user_data.session_store.clone();

    let hello = warp::get()
        .and(warp::path::end())
        .map(|| warp::reply::Response::new("Hello from the owner onboarding server".into()));
    let handler_ping = fdo_http_wrapper::server::ping_handler();
    let handler_error = fdo_http_wrapper::server::error_report_filter();

    let handler_hello_device = fdo_request_filter(
        user_data.clone(),
        session_store.clone(),
        handlers::hello_device,
    );
    let handler_get_ov_next_entry = fdo_request_filter(
        user_data.clone(),
        session_store.clone(),
        handlers::get_ov_next_entry,
    );
    let handler_prove_device = fdo_request_filter(
        user_data.clone(),
        session_store.clone(),
        handlers::prove_device,
    );
    let handler_device_service_info_ready = fdo_request_filter(
        user_data.clone(),
        session_store.clone(),
        handlers::device_service_info_ready,
    );
    let handler_device_service_info = fdo_request_filter(
        user_data.clone(),
        session_store.clone(),
        handlers::device_service_info,
    );
    let handler_done = fdo_request_filter(user_data, session_store, handlers::done);

    hello
        .or(handler_ping)
        .unify()
        .or(handler_error)
        .unify()
        .or(handler_hello_device)
        .unify()
        .or(handler_get_ov_next_entry)
        .unify()
        .or(handler_prove_device)
        .unify()
        .or(handler_device_service_info_ready)
        .unify()
        .or(handler_device_service_info)
        .unify()
        .or(handler_done)
        .unify()
        .recover(fdo_http_wrapper::server::handle_rejection)
        .with(warp::log("owner-onboarding-server"))
}
