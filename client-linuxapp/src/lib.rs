use anyhow::{bail, Context, Result};
use openssl::pkey::Public;

use fdo_data_formats::{
    constants::{header_keys, CipherSuite, DeviceSigType, ErrorCode, KexSuite, MessageType},
    cose::{new_eat, COSESign, HeaderMap},
    encryption::SessionKey,
    keyexchange::{KeyDeriveSide, KeyExchange},
    messages::{to1, to2, ErrorMessage},
    ownershipvoucher::{EntryChainVerifier, OwnershipVoucherHeader},
    publickey::PublicKey,
    rendezvous::{RendezvousInterpretedDirective, RendezvousInterpreterSide},
    types::{Nonce, ServiceInfo, SigInfo, TO1DataPayload},
    DeviceCredential, Serializable,
};
use fdo_http_wrapper::{client::ServiceClient, EncryptionKeys};

pub mod serviceinfo;

/// Reports a failed check to the peer, then fails the protocol run
async fn fail<T>(
    client: &ServiceClient,
    error_code: ErrorCode,
    previous_message_type: MessageType,
    reason: &str,
) -> Result<T> {
    let correlation_id = uuid::Uuid::new_v4().as_u128() as u64;
    log::error!(
        "{} (after {:?}, correlation id {})",
        reason,
        previous_message_type,
        correlation_id
    );
    client
        .send_error(ErrorMessage::new(
            error_code,
            previous_message_type,
            reason.to_string(),
            correlation_id,
        ))
        .await;
    bail!("{}", reason)
}

macro_rules! check {
    ($client:expr, $res:expr, $code:expr, $prev:expr, $reason:expr) => {
        match $res {
            Ok(val) => val,
            Err(e) => {
                log::debug!("{}: {:?}", $reason, e);
                return fail($client, $code, $prev, $reason).await;
            }
        }
    };
}

/// Suites the device proposes in HelloDevice, and the largest owner
/// service info message it accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    pub kex_suite: KexSuite,
    pub cipher_suite: CipherSuite,
    pub max_owner_service_info_size: u16,
}

impl DeviceSettings {
    /// Suites matching the strength of the device key
    pub fn for_credential(devcred: &DeviceCredential) -> Result<Self> {
        match devcred.sig_info().sig_type() {
            DeviceSigType::StSECP256R1 => Ok(DeviceSettings {
                kex_suite: KexSuite::Ecdh256,
                cipher_suite: CipherSuite::A128Gcm,
                max_owner_service_info_size: to2::DEFAULT_MAX_MESSAGE_SIZE,
            }),
            DeviceSigType::StSECP384R1 => Ok(DeviceSettings {
                kex_suite: KexSuite::Ecdh384,
                cipher_suite: CipherSuite::A256Gcm,
                max_owner_service_info_size: to2::DEFAULT_MAX_MESSAGE_SIZE,
            }),
            other => bail!("Device signature type {:?} is not supported", other),
        }
    }

    pub fn with_max_owner_service_info_size(mut self, max_size: u16) -> Self {
        self.max_owner_service_info_size = max_size;
        self
    }

    /// Applies `DEVICE_KEX_SUITE`, `DEVICE_CIPHER_SUITE` and
    /// `DEVICE_MAX_SERVICE_INFO_SIZE` overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(kex) = std::env::var("DEVICE_KEX_SUITE") {
            self.kex_suite = kex.parse().context("Invalid DEVICE_KEX_SUITE")?;
        }
        if let Ok(cipher) = std::env::var("DEVICE_CIPHER_SUITE") {
            self.cipher_suite = cipher.parse().context("Invalid DEVICE_CIPHER_SUITE")?;
        }
        if let Ok(size) = std::env::var("DEVICE_MAX_SERVICE_INFO_SIZE") {
            self.max_owner_service_info_size = size
                .parse()
                .context("Invalid DEVICE_MAX_SERVICE_INFO_SIZE")?;
        }
        Ok(self)
    }
}

/// What a completed TO2 run leaves the device with
#[derive(Debug)]
pub struct OnboardingResult {
    /// The credential to keep: unchanged when the owner reused it
    pub credential: DeviceCredential,
    pub credential_replaced: bool,
    pub owner_service_info: ServiceInfo,
    /// NonceTO2SetupDv, as echoed in Done2
    pub setup_nonce: Nonce,
}

pub fn rendezvous_directives(
    devcred: &DeviceCredential,
) -> Result<Vec<RendezvousInterpretedDirective>> {
    let rv_info = devcred
        .rendezvous_info()
        .to_interpreted(RendezvousInterpreterSide::Device)
        .context("Error parsing rendezvous directives")?;
    if rv_info.is_empty() {
        bail!("No rendezvous information found that's usable for the device");
    }
    log::trace!("Rendezvous info: {:?}", rv_info);
    Ok(rv_info)
}

/// Proves the device to a rendezvous server and returns the owner's To1d
pub async fn perform_to1(devcred: &DeviceCredential, client: &mut ServiceClient) -> Result<COSESign> {
    log::trace!("Starting TO1 against {}", client.base_url());
    let sig_info = devcred.sig_info();

    // Send: HelloRV, Receive: HelloRVAck
    let hello_rv_ack: to1::HelloRVAck = client
        .send_request(to1::HelloRV::new(
            devcred.device_guid().clone(),
            sig_info.clone(),
        ))
        .await
        .context("Error sending HelloRV")?;

    let b_sig_info = hello_rv_ack.b_signature_info();
    if b_sig_info.sig_type() != sig_info.sig_type() || !b_sig_info.info().is_empty() {
        return fail(
            client,
            ErrorCode::InvalidMessageError,
            MessageType::TO1HelloRVAck,
            "Unexpected signature info returned",
        )
        .await;
    }

    // Sign nonce4 with the device key
    let device_key = devcred
        .private_key()
        .context("Error loading device key")?;
    let eat = new_eat::<()>(
        None,
        hello_rv_ack.nonce4().clone(),
        devcred.device_guid(),
    )
    .context("Error creating EAT")?;
    let token = COSESign::from_eat(eat, None, &device_key).context("Error signing EAT")?;

    // Send: ProveToRV, Receive: RVRedirect
    let rv_redirect: to1::RVRedirect = client
        .send_request(to1::ProveToRV::new(token))
        .await
        .context("Error proving self to rendezvous server")?;

    Ok(rv_redirect.into_to1d())
}

/// Runs TO1 (unless the directive bypasses it) and TO2 for one rendezvous directive
pub async fn onboard_via(
    devcred: &DeviceCredential,
    settings: DeviceSettings,
    rv_entry: &RendezvousInterpretedDirective,
) -> Result<OnboardingResult> {
    let rv_urls = rv_entry.get_urls();
    if rv_urls.is_empty() {
        bail!("No usable URLs in rendezvous directive {:?}", rv_entry);
    }

    if rv_entry.bypass() {
        log::info!("Rendezvous bypass, contacting owner directly");
        for url in &rv_urls {
            match perform_to2(devcred, settings, url, None).await {
                Ok(result) => return Ok(result),
                Err(e) => log::info!("Error performing TO2 with {}: {:?}", url, e),
            }
        }
        bail!("No owner reachable through bypass directive");
    }

    let mut to1d = None;
    for url in &rv_urls {
        let mut client = match ServiceClient::new(url) {
            Ok(client) => client,
            Err(e) => {
                log::info!("Unusable rendezvous url {}: {:?}", url, e);
                continue;
            }
        };
        match perform_to1(devcred, &mut client).await {
            Ok(v) => {
                to1d = Some(v);
                break;
            }
            Err(e) => log::info!("Error performing TO1 with {}: {:?}", url, e),
        }
    }
    let to1d = match to1d {
        Some(to1d) => to1d,
        None => bail!("Couldn't get To1d from any rendezvous server"),
    };

    // Only the owner key, known after TO2 entry verification, can check this signature
    let to1d_payload: TO1DataPayload = to1d
        .get_payload_unverified()
        .context("Error parsing To1d")?
        .into_unverified();
    let mut to2_urls = Vec::new();
    for address in to1d_payload.to2_addresses() {
        match address.urls() {
            Ok(urls) => to2_urls.extend(urls),
            Err(e) => log::info!("Ignoring unusable TO2 address {:?}: {:?}", address, e),
        }
    }
    log::info!("Got TO2 addresses: {:?}", to2_urls);

    for url in &to2_urls {
        match perform_to2(devcred, settings, url, Some(&to1d)).await {
            Ok(result) => return Ok(result),
            Err(e) => log::info!("Error performing TO2 with {}: {:?}", url, e),
        }
    }
    bail!("No owner completed TO2")
}

/// Runs the complete TO2 exchange with the owner at `url`
pub async fn perform_to2(
    devcred: &DeviceCredential,
    settings: DeviceSettings,
    url: &str,
    to1d: Option<&COSESign>,
) -> Result<OnboardingResult> {
    log::info!("Performing TO2 protocol, URL: {:?}", url);

    let mut client = ServiceClient::new(url)?;
    let device_key = devcred
        .private_key()
        .context("Error loading device key")?;
    let sig_type = devcred.sig_info().sig_type();
    let guid = devcred.device_guid();

    // Send: HelloDevice, Receive: ProveOVHdr
    let nonce5 = Nonce::new()?;
    let hello_device = to2::HelloDevice::new(
        guid.clone(),
        nonce5.clone(),
        settings.kex_suite,
        settings.cipher_suite,
        SigInfo::new(sig_type, Vec::new()),
    );
    let hello_device_raw = hello_device.serialize_data()?;
    let prove_ov_hdr: to2::ProveOVHdr = client
        .send_request(hello_device)
        .await
        .context("Error sending HelloDevice")?;
    let prove_ov_hdr = prove_ov_hdr.into_token();

    let owner_pubkey: PublicKey = check!(
        &client,
        prove_ov_hdr
            .get_unprotected_value(header_keys::CUPH_OWNER_PUBKEY)
            .ok()
            .flatten()
            .ok_or("absent"),
        ErrorCode::MessageBodyError,
        MessageType::TO2ProveOVHdr,
        "Missing owner public key"
    );
    let nonce6: Nonce = check!(
        &client,
        prove_ov_hdr
            .get_unprotected_value(header_keys::CUPH_NONCE)
            .ok()
            .flatten()
            .ok_or("absent"),
        ErrorCode::MessageBodyError,
        MessageType::TO2ProveOVHdr,
        "Missing NonceTO2ProveDv"
    );
    let payload: to2::TO2ProveOVHdrPayload = check!(
        &client,
        prove_ov_hdr.get_payload(&owner_pubkey),
        ErrorCode::InvalidMessageError,
        MessageType::TO2ProveOVHdr,
        "Invalid ProveOVHdr signature"
    );

    check!(
        &client,
        nonce5.compare(payload.nonce5()),
        ErrorCode::InvalidMessageError,
        MessageType::TO2ProveOVHdr,
        "NonceTO2ProveOV mismatch"
    );
    check!(
        &client,
        payload.hello_device_hash().compare_data(&hello_device_raw),
        ErrorCode::InvalidMessageError,
        MessageType::TO2ProveOVHdr,
        "HelloDevice hash mismatch"
    );
    let b_sig_info = payload.b_signature_info();
    if b_sig_info.sig_type() != sig_type || !b_sig_info.info().is_empty() {
        return fail(
            &client,
            ErrorCode::InvalidMessageError,
            MessageType::TO2ProveOVHdr,
            "Unexpected signature info returned",
        )
        .await;
    }

    // The header must be the one made for this credential
    check!(
        &client,
        devcred.verify_hmac(payload.ov_header(), payload.hmac()),
        ErrorCode::InvalidMessageError,
        MessageType::TO2ProveOVHdr,
        "Ownership voucher header HMAC mismatch"
    );
    let header = check!(
        &client,
        OwnershipVoucherHeader::deserialize_data(payload.ov_header()),
        ErrorCode::MessageBodyError,
        MessageType::TO2ProveOVHdr,
        "Undecodable ownership voucher header"
    );
    check!(
        &client,
        devcred.check_voucher_header(&header),
        ErrorCode::InvalidMessageError,
        MessageType::TO2ProveOVHdr,
        "Ownership voucher header does not match the credential"
    );

    // Send: GetOVNextEntry, Receive: OVNextEntry
    let mut verifier = check!(
        &client,
        EntryChainVerifier::new(payload.ov_header(), payload.hmac()),
        ErrorCode::MessageBodyError,
        MessageType::TO2ProveOVHdr,
        "Undecodable ownership voucher header"
    );
    if payload.num_ov_entries() == 0 {
        return fail(
            &client,
            ErrorCode::InvalidMessageError,
            MessageType::TO2ProveOVHdr,
            "Ownership voucher has no entries",
        )
        .await;
    }
    for entry_num in 0..payload.num_ov_entries() {
        let next_entry: to2::OVNextEntry = client
            .send_request(to2::GetOVNextEntry::new(entry_num))
            .await
            .with_context(|| format!("Error getting OV entry num {}", entry_num))?;
        if next_entry.entry_num() != entry_num {
            return fail(
                &client,
                ErrorCode::InvalidMessageError,
                MessageType::TO2OVNextEntry,
                "Owner returned a different OV entry than requested",
            )
            .await;
        }
        check!(
            &client,
            verifier.verify_next(next_entry.entry()),
            ErrorCode::InvalidMessageError,
            MessageType::TO2OVNextEntry,
            "Invalid ownership voucher entry"
        );
    }
    if !verifier.last_public_key().matches_pkey(owner_pubkey.pkey()) {
        return fail(
            &client,
            ErrorCode::InvalidMessageError,
            MessageType::TO2OVNextEntry,
            "ProveOVHdr not signed by the final voucher owner",
        )
        .await;
    }
    if let Some(to1d) = to1d {
        check!(
            &client,
            to1d.verify(&owner_pubkey),
            ErrorCode::InvalidMessageError,
            MessageType::TO2OVNextEntry,
            "To1d not signed by the voucher owner"
        );
    }
    log::trace!("Ownership voucher verified, owner key {}", owner_pubkey);

    // Perform the key exchange
    let b_key_exchange = match settings.kex_suite {
        KexSuite::Asymkex2048 | KexSuite::Asymkex3072 => {
            KeyExchange::new(settings.kex_suite, Some(owner_pubkey.pkey()))
        }
        _ => KeyExchange::new::<Public>(settings.kex_suite, None),
    };
    let b_key_exchange = check!(
        &client,
        b_key_exchange,
        ErrorCode::InternalServerError,
        MessageType::TO2OVNextEntry,
        "Error creating device side of key exchange"
    );
    let key_info = check!(
        &client,
        b_key_exchange.derive_key(KeyDeriveSide::Device, payload.a_key_exchange(), None),
        ErrorCode::InvalidMessageError,
        MessageType::TO2OVNextEntry,
        "Error performing key derivation"
    );
    let session_key = SessionKey::derive(settings.cipher_suite, &key_info)
        .context("Error deriving session keys")?;
    client.set_encryption_keys(EncryptionKeys::from_session_key(session_key));

    // Send: ProveDevice, Receive: SetupDevice
    let nonce7 = Nonce::new()?;
    let prove_device_eat = new_eat(
        Some(to2::TO2ProveDevicePayload::new(
            b_key_exchange.exchange().to_vec(),
        )),
        nonce6.clone(),
        guid,
    )
    .context("Error building ProveDevice EAT")?;
    let mut prove_device_unprotected = HeaderMap::new();
    prove_device_unprotected.insert(header_keys::EUPH_NONCE, &nonce7)?;
    let prove_device_token =
        COSESign::from_eat(prove_device_eat, Some(prove_device_unprotected), &device_key)
            .context("Error signing ProveDevice EAT")?;
    let setup_device: to2::SetupDevice = client
        .send_request(to2::ProveDevice::new(prove_device_token))
        .await
        .context("Error proving device")?;

    let setup_payload: to2::TO2SetupDevicePayload = check!(
        &client,
        setup_device
            .token()
            .get_payload_unverified()
            .map(|v| v.into_unverified()),
        ErrorCode::MessageBodyError,
        MessageType::TO2SetupDevice,
        "Undecodable SetupDevice payload"
    );
    check!(
        &client,
        setup_device.token().verify(setup_payload.owner2_key()),
        ErrorCode::InvalidMessageError,
        MessageType::TO2SetupDevice,
        "Invalid SetupDevice signature"
    );
    check!(
        &client,
        nonce7.compare(setup_payload.nonce7()),
        ErrorCode::InvalidMessageError,
        MessageType::TO2SetupDevice,
        "NonceTO2SetupDv mismatch in SetupDevice"
    );

    // Identical replacement data means the owner reuses this credential
    let reuse = setup_payload.guid() == guid
        && setup_payload.rendezvous_info() == devcred.rendezvous_info()
        && setup_payload.owner2_key().matches_pkey(owner_pubkey.pkey());
    let (replacement_hmac, credential) = if reuse {
        log::info!("Owner reuses the device credential");
        (None, devcred.clone())
    } else {
        let replacement_header = OwnershipVoucherHeader::new(
            setup_payload.guid().clone(),
            setup_payload.rendezvous_info().clone(),
            header.device_info().to_string(),
            setup_payload.owner2_key().clone(),
            header.device_certificate_chain_hash().cloned(),
        )
        .context("Error building replacement voucher header")?;
        let replacement_hmac = devcred
            .compute_hmac(&replacement_header.serialize_data()?)
            .context("Error computing replacement HMAC")?;
        let owner2_key_hash = setup_payload
            .owner2_key()
            .hash(devcred.hash_alg())
            .context("Error hashing new owner key")?;
        log::info!("Owner assigned new device GUID {}", setup_payload.guid());
        (
            Some(replacement_hmac),
            devcred.replaced(
                setup_payload.guid().clone(),
                setup_payload.rendezvous_info().clone(),
                owner2_key_hash,
            ),
        )
    };

    // Send: DeviceServiceInfoReady, Receive: OwnerServiceInfoReady
    let owner_service_info_ready: to2::OwnerServiceInfoReady = client
        .send_request(to2::DeviceServiceInfoReady::new(
            replacement_hmac,
            Some(settings.max_owner_service_info_size),
        ))
        .await
        .context("Error getting OwnerServiceInfoReady")?;
    let max_device_service_info_size = owner_service_info_ready
        .max_device_service_info_size()
        .unwrap_or(to2::DEFAULT_MAX_MESSAGE_SIZE);

    let owner_service_info = serviceinfo::perform_to2_serviceinfos(
        &mut client,
        max_device_service_info_size,
        settings.max_owner_service_info_size,
    )
    .await?;

    // Send: Done, Receive: Done2
    let done2: to2::Done2 = client
        .send_request(to2::Done::new(nonce6))
        .await
        .context("Error sending Done")?;
    check!(
        &client,
        nonce7.compare(done2.nonce7()),
        ErrorCode::InvalidMessageError,
        MessageType::TO2Done2,
        "NonceTO2SetupDv mismatch in Done2"
    );

    Ok(OnboardingResult {
        credential,
        credential_replaced: !reuse,
        owner_service_info,
        setup_nonce: nonce7,
    })
}

#[cfg(test)]
mod test {
    use fdo_data_formats::constants::{CipherSuite, KexSuite};

    use super::DeviceSettings;

    #[test]
    fn test_env_overrides() {
        let settings = DeviceSettings {
            kex_suite: KexSuite::Ecdh256,
            cipher_suite: CipherSuite::A128Gcm,
            max_owner_service_info_size: 1300,
        };
        std::env::set_var("DEVICE_KEX_SUITE", "ECDH384");
        std::env::set_var("DEVICE_CIPHER_SUITE", "AES256/CTR");
        std::env::set_var("DEVICE_MAX_SERVICE_INFO_SIZE", "4096");
        let settings = settings.with_env_overrides().unwrap();
        std::env::remove_var("DEVICE_KEX_SUITE");
        std::env::remove_var("DEVICE_CIPHER_SUITE");
        std::env::remove_var("DEVICE_MAX_SERVICE_INFO_SIZE");

        assert_eq!(settings.kex_suite, KexSuite::Ecdh384);
        assert_eq!(settings.cipher_suite, CipherSuite::CoseAes256Ctr);
        assert_eq!(settings.max_owner_service_info_size, 4096);
    }
}
