#![allow(dead_code)]

use std::{net::Ipv4Addr, sync::Arc};

use anyhow::{Context as _, Result};
use openssl::pkey::{PKey, Private, Public};

use fdo_data_formats::{
    constants::{
        header_keys, CipherSuite, ErrorCode, KexSuite, RendezvousProtocolValue, RendezvousVariable,
        TransportProtocol,
    },
    conformance::ConformanceHook,
    cose::{new_eat, COSESign, HeaderMap},
    encryption::SessionKey,
    keyexchange::{KeyDeriveSide, KeyExchange},
    messages::to2,
    ownershipvoucher::VoucherDBEntry,
    publickey::PublicKey,
    rendezvous::{RendezvousDirective, RendezvousInfo, RendezvousInstruction},
    types::{IPAddress, Nonce, SigInfo, TO2AddressEntry},
    DeviceCredential,
};
use fdo_http_wrapper::{
    client::{Error as ClientError, ServiceClient},
    EncryptionKeys,
};
use fdo_owner_onboarding_server::{OwnerServiceUD, OwnerServiceUDT};
use fdo_owner_tool::{generate_key, initialize_device, public_key_of, KeyCurve};
use fdo_rendezvous_server::{RendezvousUD, RendezvousUDT};
use fdo_store::StoreConfig;

const PORT_BASE: u16 = 5080;

lazy_static::lazy_static! {
    static ref CURRENT_PORT: std::sync::Mutex<u16> = std::sync::Mutex::new(PORT_BASE);
}

pub const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

pub fn next_port() -> u16 {
    let mut port = CURRENT_PORT.lock().unwrap();
    *port += 1;
    *port
}

pub fn rendezvous_info(port: u16) -> Result<RendezvousInfo> {
    let ip = IPAddress::V4(LOCALHOST);
    RendezvousInfo::new(vec![RendezvousDirective::new(vec![
        RendezvousInstruction::new_ip(RendezvousVariable::IPAddress, &ip)?,
        RendezvousInstruction::new(RendezvousVariable::DevicePort, &port)?,
        RendezvousInstruction::new(RendezvousVariable::OwnerPort, &port)?,
        RendezvousInstruction::new(
            RendezvousVariable::Protocol,
            &(RendezvousProtocolValue::Http as u8),
        )?,
    ])])
    .context("Error building rendezvous info")
}

pub fn bypass_rendezvous_info(owner_port: u16) -> Result<RendezvousInfo> {
    let ip = IPAddress::V4(LOCALHOST);
    RendezvousInfo::new(vec![RendezvousDirective::new(vec![
        RendezvousInstruction::new_ip(RendezvousVariable::IPAddress, &ip)?,
        RendezvousInstruction::new(RendezvousVariable::DevicePort, &owner_port)?,
        RendezvousInstruction::new(
            RendezvousVariable::Protocol,
            &(RendezvousProtocolValue::Http as u8),
        )?,
        RendezvousInstruction::new_marker(RendezvousVariable::Bypass),
    ])])
    .context("Error building rendezvous info")
}

pub fn owner_addresses(port: u16) -> Vec<TO2AddressEntry> {
    vec![TO2AddressEntry::new(
        Some(IPAddress::V4(LOCALHOST)),
        None,
        port,
        TransportProtocol::Http,
    )]
}

pub fn url_for(port: u16) -> String {
    format!("http://{}:{}", LOCALHOST, port)
}

/// A manufactured device whose voucher went through a chain of owners
pub struct TestDevice {
    pub credential: DeviceCredential,
    pub owner_entry: VoucherDBEntry,
    pub manufacturer_key: PKey<Private>,
}

/// Manufactures a device and extends its voucher `num_owners` times
pub fn manufacture_device(rendezvous_info: RendezvousInfo, num_owners: usize) -> Result<TestDevice> {
    let manufacturer_key = generate_key(KeyCurve::P256)?;
    let device = initialize_device(
        "integration-test-device",
        &manufacturer_key,
        rendezvous_info,
        KeyCurve::P256,
    )?;

    let mut voucher = device.voucher;
    let mut current_key = manufacturer_key.clone();
    for _ in 0..num_owners {
        let next_key = generate_key(KeyCurve::P256)?;
        let next_pub = public_key_of(&next_key)?;
        let next_pub = PublicKey::from_pkey(&next_pub)?;
        voucher
            .extend(&current_key, &next_pub)
            .context("Error extending voucher")?;
        current_key = next_key;
    }

    Ok(TestDevice {
        credential: device.credential,
        owner_entry: VoucherDBEntry::new(voucher, &current_key)?,
        manufacturer_key,
    })
}

pub async fn start_rendezvous_server(
    max_wait_seconds: u32,
    conformance: Option<Box<dyn ConformanceHook>>,
) -> Result<(RendezvousUDT, u16)> {
    let mut ud = RendezvousUD::new(max_wait_seconds, &StoreConfig::InMemory, &StoreConfig::InMemory)?;
    if let Some(hook) = conformance {
        ud = ud.with_conformance(hook);
    }
    let ud = Arc::new(ud);

    let port = next_port();
    let (_, server) = warp::serve(fdo_rendezvous_server::routes(ud.clone()))
        .try_bind_ephemeral((LOCALHOST, port))
        .context("Error binding rendezvous server")?;
    tokio::spawn(server);

    Ok((ud, port))
}

pub async fn start_owner_server(
    configure: impl FnOnce(OwnerServiceUD) -> OwnerServiceUD,
) -> Result<(OwnerServiceUDT, u16)> {
    let port = next_port();
    let ud = OwnerServiceUD::new(
        &StoreConfig::InMemory,
        &StoreConfig::InMemory,
        owner_addresses(port),
    )?;
    let ud = Arc::new(configure(ud));

    let (_, server) = warp::serve(fdo_owner_onboarding_server::routes(ud.clone()))
        .try_bind_ephemeral((LOCALHOST, port))
        .context("Error binding owner onboarding server")?;
    tokio::spawn(server);

    Ok((ud, port))
}

pub fn assert_error_code<T: std::fmt::Debug>(result: Result<T, ClientError>, expected: ErrorCode) {
    match result {
        Err(ClientError::Error(msg)) => assert_eq!(msg.error_code(), expected),
        other => panic!("Expected {:?} error, got {:?}", expected, other),
    }
}

/// A TO2 run driven one message at a time, stopped before ProveDevice
pub struct ManualTo2 {
    pub client: ServiceClient,
    pub nonce6: Nonce,
    b_key_exchange: Vec<u8>,
}

/// Sends HelloDevice and fetches every voucher entry, then sets up the
/// session keys the way a device would
pub async fn to2_until_prove_device(device: &TestDevice, owner_port: u16) -> Result<ManualTo2> {
    let credential = &device.credential;
    let mut client = ServiceClient::new(&url_for(owner_port))?;

    let prove_ov_hdr: to2::ProveOVHdr = client
        .send_request(to2::HelloDevice::new(
            credential.device_guid().clone(),
            Nonce::new()?,
            KexSuite::Ecdh256,
            CipherSuite::A128Gcm,
            SigInfo::new(credential.sig_info().sig_type(), Vec::new()),
        ))
        .await?;
    let token = prove_ov_hdr.into_token();
    let nonce6: Nonce = token
        .get_unprotected_value(header_keys::CUPH_NONCE)?
        .context("ProveOVHdr lacks NonceTO2ProveDv")?;
    let payload: to2::TO2ProveOVHdrPayload = token.get_payload_unverified()?.into_unverified();

    for entry_num in 0..payload.num_ov_entries() {
        let _: to2::OVNextEntry = client
            .send_request(to2::GetOVNextEntry::new(entry_num))
            .await?;
    }

    let b_key_exchange = KeyExchange::new::<Public>(KexSuite::Ecdh256, None)?;
    let key_info =
        b_key_exchange.derive_key(KeyDeriveSide::Device, payload.a_key_exchange(), None)?;
    let session_key = SessionKey::derive(CipherSuite::A128Gcm, &key_info)?;
    client.set_encryption_keys(EncryptionKeys::from_session_key(session_key));

    Ok(ManualTo2 {
        client,
        nonce6,
        b_key_exchange: b_key_exchange.exchange().to_vec(),
    })
}

impl ManualTo2 {
    /// Sends ProveDevice with `nonce` in the signed token
    pub async fn prove_device(
        &mut self,
        credential: &DeviceCredential,
        nonce: Nonce,
    ) -> Result<Result<to2::SetupDevice, ClientError>> {
        let eat = new_eat(
            Some(to2::TO2ProveDevicePayload::new(self.b_key_exchange.clone())),
            nonce,
            credential.device_guid(),
        )?;
        let mut unprotected = HeaderMap::new();
        unprotected.insert(header_keys::EUPH_NONCE, &Nonce::new()?)?;
        let device_key = credential.private_key()?;
        let token = COSESign::from_eat(eat, Some(unprotected), &device_key)?;
        Ok(self.client.send_request(to2::ProveDevice::new(token)).await)
    }
}
