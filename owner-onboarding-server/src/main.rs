use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};

use fdo_owner_onboarding_server::{
    load_vouchers_from_dir, perform_maintenance, routes, OwnerServiceUD,
};
use fdo_util::servers::{
    configuration::owner_onboarding_server::OwnerOnboardingServerSettings, settings_for,
};

#[tokio::main]
async fn main() -> Result<()> {
    fdo_util::add_version!();
    fdo_http_wrapper::init_logging();

    let settings: OwnerOnboardingServerSettings = settings_for("owner-onboarding-server")?
        .try_deserialize()
        .context("Error parsing configuration")?;

    // Bind information
    let bind_addr: SocketAddr = settings.bind.clone().into();

    let owner_addresses = settings
        .to2_addresses()
        .context("Error parsing owner addresses")?;
    let service_info = settings
        .owner_service_info()
        .context("Error parsing owner service info")?;

    let user_data = OwnerServiceUD::new(
        &settings.ownership_voucher_store_driver,
        &settings.session_store_driver,
        owner_addresses,
    )
    .context("Error initializing stores")?
    .with_to0_wait_seconds(settings.to0_wait_seconds())
    .with_reuse_credential(settings.reuse_credential)
    .with_service_info(service_info)
    .with_max_device_service_info_size(settings.max_device_service_info_size());
    let user_data = Arc::new(user_data);

    if let Some(path) = &settings.ownership_vouchers_path {
        for entry in load_vouchers_from_dir(path.as_ref())? {
            user_data
                .import_voucher(entry)
                .await
                .context("Error importing ownership voucher")?;
        }
    }

    let routes = routes(user_data.clone());

    log::info!("Listening on {}", bind_addr);
    let server = warp::serve(routes);

    let report_to_rendezvous = settings.report_to_rendezvous_endpoint_enabled;
    let maintenance_runner =
        tokio::spawn(async move { perform_maintenance(user_data, report_to_rendezvous).await });

    let mut sigterm =
        signal(SignalKind::terminate()).context("Error installing SIGTERM handler")?;
    let server = server
        .bind_with_graceful_shutdown(bind_addr, async move {
            sigterm.recv().await;
            log::info!("Terminating");
        })
        .1;
    let server = tokio::spawn(server);
    tokio::select!(
    _ = server => {
        log::info!("Server terminated");
    },
    _ = maintenance_runner => {
        log::info!("Maintenance runner terminated");
    });

    Ok(())
}
