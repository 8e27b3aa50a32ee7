use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;

use fdo_client_linuxapp::{onboard_via, rendezvous_directives, DeviceSettings};
use fdo_data_formats::{DeviceCredential, ProtocolVersion};

// Rendezvous delays related variables
const RV_DEFAULT_DELAY_SEC: f32 = 120.0;
const RV_DEFAULT_DELAY_OFFSET: f32 = 30.0;
const RV_USER_DEFINED_DELAY_OFFSET: f32 = 0.25;

fn get_delay_between_retries(rv_entry_delay: u32) -> u64 {
    let mut rng = rand::thread_rng();
    let rv_delay_sec = if rv_entry_delay == 0 {
        rng.gen_range(
            RV_DEFAULT_DELAY_SEC - RV_DEFAULT_DELAY_OFFSET
                ..=RV_DEFAULT_DELAY_SEC + RV_DEFAULT_DELAY_OFFSET,
        )
    } else {
        let lower_delay = rv_entry_delay as f32 * (1.0 - RV_USER_DEFINED_DELAY_OFFSET);
        let upper_delay = rv_entry_delay as f32 * (1.0 + RV_USER_DEFINED_DELAY_OFFSET);
        rng.gen_range(lower_delay..=upper_delay)
    };
    rv_delay_sec as u64
}

#[tokio::main]
async fn main() -> Result<()> {
    fdo_util::add_version!();
    fdo_http_wrapper::init_logging();

    let devcred_path = match std::env::var("DEVICE_CREDENTIAL") {
        Ok(path) => path,
        Err(_) => {
            log::info!("No DEVICE_CREDENTIAL configured, skipping Device Onboarding");
            return Ok(());
        }
    };
    let dc = DeviceCredential::read_from_path(&devcred_path)
        .with_context(|| format!("Error reading device credential at {}", devcred_path))?;
    log::trace!("Device credential: {:?}", dc);

    if !dc.is_active() {
        log::info!("Device credential deactivated, skipping Device Onboarding");
        return Ok(());
    }
    if dc.protocol_version() != ProtocolVersion::Version1_1 as u16 {
        bail!(
            "Device credential protocol version {} not supported",
            dc.protocol_version()
        );
    }

    let settings = DeviceSettings::for_credential(&dc)?.with_env_overrides()?;
    let rv_info = rendezvous_directives(&dc)?;

    loop {
        let mut rv_entry_delay = 0;
        for rv_entry in &rv_info {
            rv_entry_delay = rv_entry.delay();

            let result = match onboard_via(&dc, settings, rv_entry).await {
                Ok(result) => result,
                Err(e) => {
                    log::info!("Onboarding via {:?} failed: {:?}", rv_entry, e);
                    continue;
                }
            };

            for kv in &result.owner_service_info {
                log::info!("Owner service info {}: {} bytes", kv.key(), kv.value().len());
            }
            if result.credential_replaced {
                result
                    .credential
                    .write_to_path(&devcred_path)
                    .context("Error writing replacement device credential")?;
                log::info!(
                    "Stored replacement credential for {}",
                    result.credential.device_guid()
                );
            }
            log::info!("Secure Device Onboarding DONE");
            return Ok(());
        }

        let delay = get_delay_between_retries(rv_entry_delay);
        log::info!("Onboarding not completed, retrying in {} seconds", delay);
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }
}
