use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use fdo_data_formats::{
    constants::TransportProtocol,
    types::{ServiceInfoKV, TO2AddressEntry},
};
use fdo_store::StoreConfig;
use serde::{Deserialize, Serialize};

use super::{AbsolutePathBuf, Bind};
use crate::servers::yaml_to_cbor;

/// Wait time requested from the rendezvous server when none is configured
pub const DEFAULT_TO0_WAIT_SECONDS: u32 = 86_400;

#[derive(Debug, Serialize, Deserialize)]
pub struct OwnerOnboardingServerSettings {
    // Ownership Voucher storage info
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub ownership_voucher_store_driver: StoreConfig,

    // Session store info
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub session_store_driver: StoreConfig,

    // Directory of vouchers (with owner keys) to load at startup
    pub ownership_vouchers_path: Option<AbsolutePathBuf>,

    // Bind information
    pub bind: Bind,

    // Where devices reach us for TO2, registered with the rendezvous server
    pub owner_addresses: Vec<OwnerAddress>,

    #[serde(default)]
    pub report_to_rendezvous_endpoint_enabled: bool,
    pub to0_wait_seconds: Option<u32>,

    #[serde(default)]
    pub reuse_credential: bool,

    #[serde(default)]
    pub service_info: Vec<ServiceInfoSetting>,
    // Largest DeviceServiceInfo message accepted from devices
    pub max_device_service_info_size: Option<u16>,
}

impl OwnerOnboardingServerSettings {
    pub fn to0_wait_seconds(&self) -> u32 {
        self.to0_wait_seconds.unwrap_or(DEFAULT_TO0_WAIT_SECONDS)
    }

    pub fn max_device_service_info_size(&self) -> u16 {
        self.max_device_service_info_size
            .unwrap_or(fdo_data_formats::messages::to2::DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn to2_addresses(&self) -> Result<Vec<TO2AddressEntry>> {
        self.owner_addresses
            .iter()
            .map(OwnerAddress::to_address_entry)
            .collect()
    }

    pub fn owner_service_info(&self) -> Result<Vec<ServiceInfoKV>> {
        self.service_info
            .iter()
            .map(ServiceInfoSetting::to_service_info_kv)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OwnerTransport {
    Http,
    Https,
}

impl From<OwnerTransport> for TransportProtocol {
    fn from(transport: OwnerTransport) -> Self {
        match transport {
            OwnerTransport::Http => TransportProtocol::Http,
            OwnerTransport::Https => TransportProtocol::Https,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerAddress {
    pub transport: OwnerTransport,
    pub port: u16,
    pub dns_name: Option<String>,
    pub ip_address: Option<IpAddr>,
}

impl OwnerAddress {
    pub fn to_address_entry(&self) -> Result<TO2AddressEntry> {
        if self.dns_name.is_none() && self.ip_address.is_none() {
            bail!("Owner address needs a dns_name or an ip_address");
        }
        Ok(TO2AddressEntry::new(
            self.ip_address,
            self.dns_name.clone(),
            self.port,
            self.transport.into(),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfoSetting {
    pub key: String,
    pub value: serde_yaml::Value,
}

impl ServiceInfoSetting {
    pub fn to_service_info_kv(&self) -> Result<ServiceInfoKV> {
        let value = yaml_to_cbor(&self.value)
            .with_context(|| format!("Converting service info value for {}", self.key))?;
        Ok(ServiceInfoKV::new_encoded(&self.key, &value)?)
    }
}

#[cfg(test)]
mod test {
    use fdo_data_formats::constants::TransportProtocol;

    use super::OwnerOnboardingServerSettings;

    #[test]
    fn test_parse_settings() {
        let settings: OwnerOnboardingServerSettings = serde_yaml::from_str(
            r#"
ownership_voucher_store_driver: in_memory
session_store_driver: in_memory
ownership_vouchers_path: /var/lib/fdo/vouchers
bind: "0.0.0.0:8081"
owner_addresses:
  - transport: http
    port: 8081
    dns_name: owner.example.com
  - transport: https
    port: 8443
    ip_address: 192.0.2.1
reuse_credential: true
service_info:
  - key: "sshkey:pubkey"
    value: "ssh-ed25519 AAAA"
"#,
        )
        .unwrap();

        assert!(settings.reuse_credential);
        assert!(!settings.report_to_rendezvous_endpoint_enabled);
        assert_eq!(settings.to0_wait_seconds(), super::DEFAULT_TO0_WAIT_SECONDS);

        let addresses = settings.to2_addresses().unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].protocol(), TransportProtocol::Http);
        assert_eq!(
            addresses[0].urls().unwrap(),
            vec!["http://owner.example.com:8081".to_string()]
        );
        assert_eq!(
            addresses[1].urls().unwrap(),
            vec!["https://192.0.2.1:8443".to_string()]
        );

        let service_info = settings.owner_service_info().unwrap();
        assert_eq!(service_info.len(), 1);
        assert_eq!(service_info[0].key(), "sshkey:pubkey");
        assert_eq!(
            service_info[0].decode_value::<String>().unwrap(),
            "ssh-ed25519 AAAA"
        );
    }
}
