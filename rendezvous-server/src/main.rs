use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};

use fdo_rendezvous_server::{perform_maintenance, routes, RendezvousUD};
use fdo_util::servers::{
    configuration::rendezvous_server::RendezvousServerSettings, settings_for,
};

#[tokio::main]
async fn main() -> Result<()> {
    fdo_util::add_version!();
    fdo_http_wrapper::init_logging();

    let settings: RendezvousServerSettings = settings_for("rendezvous-server")?
        .try_deserialize()
        .context("Error parsing configuration")?;

    let max_wait_seconds = settings.max_wait_seconds();

    // Bind information
    let bind_addr: SocketAddr = settings.bind.clone().into();

    // Initialize handler stores
    let user_data = Arc::new(
        RendezvousUD::new(
            max_wait_seconds,
            &settings.storage_driver,
            &settings.session_store_driver,
        )
        .context("Error initializing stores")?,
    );

    let routes = routes(user_data.clone());

    log::info!(
        "Listening on {} (maximum wait {} seconds)",
        bind_addr,
        max_wait_seconds
    );
    let server = warp::serve(routes);

    let maintenance_runner = tokio::spawn(async move { perform_maintenance(user_data).await });

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
