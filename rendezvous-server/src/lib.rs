use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use warp::Filter;

use fdo_data_formats::{
    conformance::{ConformanceHook, NoConformanceTests},
    cose::COSESign,
    types::TO0Data,
    Serializable,
};
use fdo_http_wrapper::server::{fdo_request_filter, SessionStore};
use fdo_store::{OwnerSignStore, StoreConfig, StoreError};

mod handlers_to0;
mod handlers_to1;

/// What an owner registered for a device during TO0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerRegistration {
    to0d: ByteBuf,
    to1d: COSESign,
}

impl OwnerRegistration {
    pub fn new(to0d: &[u8], to1d: COSESign) -> Self {
        OwnerRegistration {
            to0d: ByteBuf::from(to0d.to_vec()),
            to1d,
        }
    }

    pub fn to0d(&self) -> Result<TO0Data, fdo_data_formats::Error> {
        TO0Data::deserialize_data(&self.to0d)
    }

    pub fn to1d(&self) -> &COSESign {
        &self.to1d
    }
}

pub struct RendezvousUD {
    max_wait_seconds: u32,
    store: OwnerSignStore<OwnerRegistration>,
    session_store: Arc<SessionStore>,
    conformance: Box<dyn ConformanceHook>,
}

pub type RendezvousUDT = Arc<RendezvousUD>;

impl RendezvousUD {
    pub fn new(
        max_wait_seconds: u32,
        storage_driver: &StoreConfig,
        session_store_driver: &StoreConfig,
    ) -> Result<Self, StoreError> {
        Ok(RendezvousUD {
            max_wait_seconds,
            store: OwnerSignStore::new(storage_driver.initialize()?),
            session_store: fdo_http_wrapper::server::new_session_store(session_store_driver)?,
            conformance: Box::new(NoConformanceTests),
        })
    }

    pub fn with_conformance(mut self, hook: Box<dyn ConformanceHook>) -> Self {
        self.conformance = hook;
        self
    }

    pub fn max_wait_seconds(&self) -> u32 {
        self.max_wait_seconds
    }

    pub async fn registration(
        &self,
        guid: &fdo_data_formats::types::Guid,
    ) -> Result<Option<OwnerRegistration>, StoreError> {
        self.store.get(guid).await
    }
}

const MAINTENANCE_INTERVAL: u64 = 60;

pub async fn perform_maintenance(udt: RendezvousUDT) {
    log::info!(
        "Scheduling maintenance every {} seconds",
        MAINTENANCE_INTERVAL
    );

    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(MAINTENANCE_INTERVAL)).await;

        let store_maint = udt.store.perform_maintenance();
        let ses_maint = udt.session_store.perform_maintenance();

        let (store_res, ses_res) = tokio::join!(store_maint, ses_maint);
        if let Err(e) = store_res {
            log::warn!("Error during store maintenance: {:?}", e);
        }
        if let Err(e) = ses_res {
            log::warn!("Error during session store maintenance: {:?}", e);
        }
    }
}

/// All TO0 and TO1 routes of the rendezvous server
pub fn routes(
    user_data: RendezvousUDT,
) -> impl Filter<Extract = (impl warp::Reply,), Error = std::convert::Infallible> + Clone {
    let session_store = user_data.session_store.clone();

    let hello = warp::get()
        .and(warp::path::end())
        .map(|| warp::reply::Response::new("Hello from the rendezvous server".into()));
    let handler_ping = fdo_http_wrapper::server::ping_handler();
    let handler_error = fdo_http_wrapper::server::error_report_filter();

    // TO0
    let handler_to0_hello =
        fdo_request_filter(user_data.clone(), session_store.clone(), handlers_to0::hello);
    let handler_to0_ownersign = fdo_request_filter(
        user_data.clone(),
        session_store.clone(),
        handlers_to0::ownersign,
    );

    // TO1
    let handler_to1_hello_rv =
        fdo_request_filter(user_data.clone(), session_store.clone(), handlers_to1::hello_rv);
    let handler_to1_prove_to_rv =
        fdo_request_filter(user_data, session_store, handlers_to1::prove_to_rv);

    hello
        .or(handler_ping)
        .unify()
        .or(handler_error)
        .unify()
        // TO0
        .or(handler_to0_hello)
        .unify()
        .or(handler_to0_ownersign)
        .unify()
        // TO1
        .or(handler_to1_hello_rv)
        .unify()
        .or(handler_to1_prove_to_rv)
        .unify()
        .recover(fdo_http_wrapper::server::handle_rejection)
        .with(warp::log("rendezvous-server"))
}
