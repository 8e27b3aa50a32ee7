use anyhow::{anyhow, bail, Context, Result};

use fdo_data_formats::{
    messages::to2::{DeviceServiceInfo, OwnerServiceInfo},
    serviceinfo::{service_info_budget, split_service_info, Devmod},
    types::ServiceInfo,
    Serializable,
};
use fdo_http_wrapper::client::ServiceClient;

const MAX_SERVICE_INFO_LOOPS: u32 = 1000;

fn os_version() -> String {
    let os_release = match std::fs::read_to_string("/etc/os-release") {
        Ok(contents) => contents,
        Err(_) => return "unknown".to_string(),
    };
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The devmod module as this device reports it
pub fn device_devmod() -> Devmod {
    Devmod {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        version: os_version(),
        device: "fdo-client-linuxapp".to_string(),
        serial_number: None,
        path_separator: Some("/".to_string()),
        separator: ":".to_string(),
        newline: Some("\n".to_string()),
        tmp: Some(std::env::temp_dir().to_string_lossy().to_string()),
        dir: None,
        programming_environment: None,
        bin: std::env::consts::ARCH.to_string(),
        mud_url: None,
        modules: vec!["devmod".to_string()],
    }
}

/// Sends the devmod module, then collects everything the owner sends until it is done
///
/// `max_device_size` is the owner's limit for our messages, `max_owner_size`
/// the one we advertised for its replies.
pub(crate) async fn perform_to2_serviceinfos(
    client: &mut ServiceClient,
    max_device_size: u16,
    max_owner_size: u16,
) -> Result<ServiceInfo> {
    let devmod = device_devmod()
        .to_service_info()
        .context("Error encoding devmod")?;
    let mut chunks = split_service_info(&devmod, service_info_budget(max_device_size))
        .context("Error splitting device service info")?
        .into_iter()
        .peekable();

    let mut received = ServiceInfo::new();
    let mut loop_num = 0;

    while loop_num < MAX_SERVICE_INFO_LOOPS {
        let (is_more, send_si) = match chunks.next() {
            Some(chunk) => (chunks.peek().is_some(), chunk),
            None => (false, ServiceInfo::new()),
        };
        log::trace!("Sending ServiceInfo loop {}: {:?}", loop_num, send_si);

        let return_si: OwnerServiceInfo = client
            .send_request(DeviceServiceInfo::new(is_more, send_si))
            .await
            .with_context(|| format!("Error during ServiceInfo loop {}", loop_num))?;
        log::trace!("Got ServiceInfo loop {}: {:?}", loop_num, return_si);
        let return_size = return_si.service_info().serialize_data()?.len();
        if return_size > service_info_budget(max_owner_size) {
            bail!(
                "Owner sent {} bytes of service info, more than the {} allowed",
                return_size,
                max_owner_size
            );
        }

        if is_more {
            if return_si.is_done() || !return_si.service_info().is_empty() {
                bail!("Owner sent service info before the device was done");
            }
        } else {
            received.extend(return_si.service_info().iter().cloned());
            if return_si.is_done() {
                log::trace!("ServiceInfo loops done, number taken: {}", loop_num);
                return Ok(received);
            }
        }

        loop_num += 1;
    }
    Err(anyhow!(
        "Maximum number of ServiceInfo loops ({}) exceeded",
        MAX_SERVICE_INFO_LOOPS
    ))
}
