use fdo_data_formats::{
    conformance::apply_test_mutation,
    constants::{header_keys, CipherSuite, DeviceSigType, ErrorCode, MessageType},
    cose::{sig_type_for_key, COSESign, EATokenPayload, HeaderMap},
    encryption::SessionKey,
    keyexchange::{KeyDeriveSide, KeyExchange},
    messages::{to2, Message},
    ownershipvoucher::{OwnershipVoucher, OwnershipVoucherHeader, VoucherDBEntry},
    serviceinfo::{service_info_budget, split_service_info, Devmod},
    types::{Guid, HMac, Hash, Nonce, ServiceInfo, ServiceInfoKV, SigInfo},
    Serializable,
};
use openssl::pkey::{PKeyRef, Private, Public};

use fdo_http_wrapper::server::{Error, Session, SessionWithStore};
use fdo_http_wrapper::EncryptionKeys;

const MAX_SERVICE_INFO_LOOPS: u32 = 1000;

fn session_value<M, T>(session: &Session, key: &str) -> Result<T, Error>
where
    M: Message,
    T: serde::de::DeserializeOwned,
{
    match session.get(key).map_err(Error::from_error::<M, _>)? {
        Some(v) => Ok(v),
        None => {
            log::debug!("Session lacks {} for {:?}", key, M::message_type());
            Err(Error::new(
                ErrorCode::InvalidMessageError,
                M::message_type(),
                "Request sequence failure",
            ))
        }
    }
}

fn session_insert<M, T>(session: &mut Session, key: &str, value: &T) -> Result<(), Error>
where
    M: Message,
    T: serde::Serialize,
{
    session.insert(key, value).map_err(Error::from_error::<M, _>)
}

async fn load_voucher<M: Message>(
    user_data: &super::OwnerServiceUDT,
    guid: &Guid,
) -> Result<VoucherDBEntry, Error> {
    match user_data
        .ownership_voucher_store
        .get(guid)
        .await
        .map_err(Error::from_error::<M, _>)?
    {
        Some(entry) => Ok(entry),
        None => {
            log::info!("Device {} is not known to this owner", guid);
            Err(Error::new(
                ErrorCode::ResourceNotFound,
                M::message_type(),
                "Device not found",
            ))
        }
    }
}

pub(super) async fn hello_device(
    user_data: super::OwnerServiceUDT,
    mut ses_with_store: SessionWithStore,
    msg: to2::HelloDevice,
) -> Result<(to2::ProveOVHdr, SessionWithStore), warp::Rejection> {
    // Check whether we support the specific siginfo
    let sig_type = msg.a_signature_info().sig_type();
    if matches!(sig_type, DeviceSigType::StEPID10 | DeviceSigType::StEPID11)
        || sig_type.hash_type().is_err()
        || !msg.a_signature_info().info().is_empty()
    {
        return Err(Error::new(
            ErrorCode::MessageBodyError,
            to2::HelloDevice::message_type(),
            "Invalid signature info",
        )
        .into());
    }

    // Check if we manage this device
    let entry = load_voucher::<to2::HelloDevice>(&user_data, msg.guid()).await?;
    let voucher = entry.voucher();
    let owner_key = entry
        .private_key()
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;
    let owner_pubkey = voucher
        .final_owner_public_key()
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;
    let num_entries: u8 = voucher
        .num_entries()
        .try_into()
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;

    // Build kex a
    let a_key_exchange = KeyExchange::new::<Public>(msg.kex_suite(), None).map_err(|e| {
        log::info!("Unable to start key exchange {:?}: {:?}", msg.kex_suite(), e);
        Error::new(
            ErrorCode::MessageBodyError,
            to2::HelloDevice::message_type(),
            "Unsupported key exchange",
        )
    })?;
    let nonce6 = Nonce::new().map_err(Error::from_error::<to2::HelloDevice, _>)?;

    let hash_type = sig_type_for_key(&owner_key)
        .and_then(|st| st.hash_type())
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;
    let hello_device_hash = Hash::from_data(hash_type, ses_with_store.raw_request())
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;

    let test = user_data
        .conformance
        .active_test(msg.guid(), MessageType::TO2ProveOVHdr);

    let res_payload = apply_test_mutation(
        to2::TO2ProveOVHdrPayload::new(
            voucher.header_raw().to_vec(),
            num_entries,
            voucher.header_hmac().clone(),
            msg.nonce5().clone(),
            SigInfo::new(sig_type, Vec::new()),
            a_key_exchange.exchange().to_vec(),
            hello_device_hash,
        ),
        test,
    );

    // Store data
    let session = &mut ses_with_store.session;
    session_insert::<to2::HelloDevice, _>(session, "device_guid", msg.guid())?;
    session_insert::<to2::HelloDevice, _>(session, "nonce6", &nonce6)?;
    session_insert::<to2::HelloDevice, _>(session, "cipher_suite", &msg.cipher_suite())?;
    session_insert::<to2::HelloDevice, _>(session, "a_key_exchange", &a_key_exchange)?;
    session_insert::<to2::HelloDevice, _>(session, "num_entries", &num_entries)?;
    session_insert::<to2::HelloDevice, _>(session, "next_entry", &0u8)?;

    let mut res_header = HeaderMap::new();
    res_header
        .insert(header_keys::CUPH_NONCE, &nonce6)
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;
    res_header
        .insert(header_keys::CUPH_OWNER_PUBKEY, &owner_pubkey)
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;

    let res = COSESign::new(&res_payload, Some(res_header), &owner_key)
        .map_err(Error::from_error::<to2::HelloDevice, _>)?;
    let res = apply_test_mutation(to2::ProveOVHdr::new(res), test);

    Ok((res, ses_with_store))
}

pub(super) async fn get_ov_next_entry(
    user_data: super::OwnerServiceUDT,
    mut ses_with_store: SessionWithStore,
    msg: to2::GetOVNextEntry,
) -> Result<(to2::OVNextEntry, SessionWithStore), warp::Rejection> {
    let session = &mut ses_with_store.session;
    let device_guid: Guid = session_value::<to2::GetOVNextEntry, _>(session, "device_guid")?;
    let num_entries: u8 = session_value::<to2::GetOVNextEntry, _>(session, "num_entries")?;
    let next_entry: u8 = session_value::<to2::GetOVNextEntry, _>(session, "next_entry")?;

    user_data
        .conformance
        .record_entry_request(&device_guid, msg.entry_num());

    if msg.entry_num() >= num_entries {
        return Err(Error::invalid_message::<to2::GetOVNextEntry>("entry out of bounds").into());
    }
    if msg.entry_num() != next_entry {
        return Err(Error::invalid_message::<to2::GetOVNextEntry>("entry out of order").into());
    }

    let entry = load_voucher::<to2::GetOVNextEntry>(&user_data, &device_guid).await?;
    let ov_entry = entry
        .voucher()
        .entry(msg.entry_num().into())
        .map_err(Error::from_error::<to2::GetOVNextEntry, _>)?
        .clone();

    session_insert::<to2::GetOVNextEntry, _>(session, "next_entry", &(next_entry + 1))?;

    let test = user_data
        .conformance
        .active_test(&device_guid, MessageType::TO2OVNextEntry);
    Ok((
        apply_test_mutation(to2::OVNextEntry::new(msg.entry_num(), ov_entry), test),
        ses_with_store,
    ))
}

pub(super) async fn prove_device(
    user_data: super::OwnerServiceUDT,
    mut ses_with_store: SessionWithStore,
    msg: to2::ProveDevice,
) -> Result<(to2::SetupDevice, SessionWithStore), warp::Rejection> {
    let session = &mut ses_with_store.session;
    let device_guid: Guid = session_value::<to2::ProveDevice, _>(session, "device_guid")?;
    let nonce6: Nonce = session_value::<to2::ProveDevice, _>(session, "nonce6")?;
    let num_entries: u8 = session_value::<to2::ProveDevice, _>(session, "num_entries")?;
    let next_entry: u8 = session_value::<to2::ProveDevice, _>(session, "next_entry")?;
    let a_key_exchange: KeyExchange =
        session_value::<to2::ProveDevice, _>(session, "a_key_exchange")?;
    let cipher_suite: CipherSuite = session_value::<to2::ProveDevice, _>(session, "cipher_suite")?;
    session.remove("a_key_exchange");

    if next_entry != num_entries {
        return Err(Error::invalid_message::<to2::ProveDevice>("not all entries fetched").into());
    }

    let entry = load_voucher::<to2::ProveDevice>(&user_data, &device_guid).await?;
    let voucher = entry.voucher();

    // The device proves itself with the key certified by its chain, not the voucher keys
    let token = msg.token();
    let eat: EATokenPayload<to2::TO2ProveDevicePayload> = token
        .get_eat_unverified()
        .map_err(|_| Error::invalid_message::<to2::ProveDevice>("undecodable token"))?
        .into_unverified();
    let chain = voucher
        .device_certificate_chain()
        .ok_or_else(|| Error::invalid_message::<to2::ProveDevice>("no device chain"))?;
    let leaf = chain
        .verify()
        .map_err(|_| Error::invalid_message::<to2::ProveDevice>("device chain invalid"))?;
    let device_key = leaf
        .public_key()
        .map_err(Error::from_error::<to2::ProveDevice, _>)?;
    token
        .verify_with_pkey(&device_key)
        .map_err(|_| Error::invalid_message::<to2::ProveDevice>("device signature invalid"))?;

    // Verify the nonce
    if nonce6.compare(eat.nonce()).is_err() {
        return Err(Error::invalid_message::<to2::ProveDevice>("nonce6 mismatch").into());
    }
    if !eat.matches_guid(&device_guid) {
        return Err(Error::invalid_message::<to2::ProveDevice>("ueid mismatch").into());
    }
    let eat_payload = eat
        .fdo()
        .ok_or_else(|| Error::invalid_message::<to2::ProveDevice>("missing key exchange"))?;
    let nonce7: Nonce = token
        .get_unprotected_value(header_keys::EUPH_NONCE)
        .map_err(|_| Error::invalid_message::<to2::ProveDevice>("undecodable nonce7"))?
        .ok_or_else(|| Error::invalid_message::<to2::ProveDevice>("missing nonce7"))?;

    // Derive and set the keys
    let owner_key = entry
        .private_key()
        .map_err(Error::from_error::<to2::ProveDevice, _>)?;
    let key_info = a_key_exchange
        .derive_key(
            KeyDeriveSide::OwnerService,
            eat_payload.b_key_exchange(),
            Some(&*owner_key),
        )
        .map_err(|_| Error::invalid_message::<to2::ProveDevice>("key exchange failed"))?;
    let session_key = SessionKey::derive(cipher_suite, &key_info)
        .map_err(Error::from_error::<to2::ProveDevice, _>)?;
    log::trace!("Got new keys, setting: {:?}", session_key);
    session.set_encryption_keys(EncryptionKeys::from_session_key(session_key));
    session_insert::<to2::ProveDevice, _>(session, "nonce7", &nonce7)?;

    let header = voucher
        .header()
        .map_err(Error::from_error::<to2::ProveDevice, _>)?;
    let owner2_key = voucher
        .final_owner_public_key()
        .map_err(Error::from_error::<to2::ProveDevice, _>)?;
    let new_guid = if user_data.reuse_credential {
        device_guid.clone()
    } else {
        Guid::new().map_err(Error::from_error::<to2::ProveDevice, _>)?
    };
    session_insert::<to2::ProveDevice, _>(session, "new_guid", &new_guid)?;

    let test = user_data
        .conformance
        .active_test(&device_guid, MessageType::TO2SetupDevice);
    let new_payload = apply_test_mutation(
        to2::TO2SetupDevicePayload::new(
            header.rendezvous_info().clone(),
            new_guid,
            nonce7,
            owner2_key,
        ),
        test,
    );
    let new_token = COSESign::new(&new_payload, None, &owner_key)
        .map_err(Error::from_error::<to2::ProveDevice, _>)?;

    log::info!("Device {} proved its identity", device_guid);
    Ok((to2::SetupDevice::new(new_token), ses_with_store))
}

/// The voucher the owner keeps for a device that replaced its credential
fn build_replacement_voucher(
    old: &OwnershipVoucher,
    new_guid: Guid,
    replacement_hmac: HMac,
    owner_key: &PKeyRef<Private>,
) -> Result<OwnershipVoucher, fdo_data_formats::Error> {
    let old_header = old.header()?;
    let owner2_key = old.final_owner_public_key()?;
    let header = OwnershipVoucherHeader::new(
        new_guid,
        old_header.rendezvous_info().clone(),
        old_header.device_info().to_string(),
        owner2_key.clone(),
        old_header.device_certificate_chain_hash().cloned(),
    )?;
    let mut voucher = OwnershipVoucher::new(
        &header,
        replacement_hmac,
        old.device_certificate_chain().cloned(),
    )?;
    voucher.extend(owner_key, &owner2_key)?;
    Ok(voucher)
}

pub(super) async fn device_service_info_ready(
    user_data: super::OwnerServiceUDT,
    mut ses_with_store: SessionWithStore,
    msg: to2::DeviceServiceInfoReady,
) -> Result<(to2::OwnerServiceInfoReady, SessionWithStore), warp::Rejection> {
    let session = &mut ses_with_store.session;
    let device_guid: Guid =
        session_value::<to2::DeviceServiceInfoReady, _>(session, "device_guid")?;
    let new_guid: Guid = session_value::<to2::DeviceServiceInfoReady, _>(session, "new_guid")?;

    match (user_data.reuse_credential, msg.replacement_hmac()) {
        (true, None) => {
            log::info!("Device {} keeps its credential", device_guid);
        }
        (true, Some(_)) => {
            return Err(Error::new(
                ErrorCode::CredReuseError,
                to2::DeviceServiceInfoReady::message_type(),
                "Credential reuse expected",
            )
            .into());
        }
        (false, None) => {
            return Err(Error::new(
                ErrorCode::MessageBodyError,
                to2::DeviceServiceInfoReady::message_type(),
                "Replacement HMAC missing",
            )
            .into());
        }
        (false, Some(hmac)) => {
            let entry = load_voucher::<to2::DeviceServiceInfoReady>(&user_data, &device_guid).await?;
            let owner_key = entry
                .private_key()
                .map_err(Error::from_error::<to2::DeviceServiceInfoReady, _>)?;
            let voucher =
                build_replacement_voucher(entry.voucher(), new_guid.clone(), hmac.clone(), &owner_key)
                    .map_err(Error::from_error::<to2::DeviceServiceInfoReady, _>)?;
            let replacement = VoucherDBEntry::new(voucher, &owner_key)
                .map_err(Error::from_error::<to2::DeviceServiceInfoReady, _>)?;
            session_insert::<to2::DeviceServiceInfoReady, _>(
                session,
                "replacement_voucher",
                &replacement,
            )?;
            log::info!(
                "Device {} will be replaced by credential {}",
                device_guid,
                new_guid
            );
        }
    }

    let max_owner_service_info_size = msg
        .max_owner_service_info_size()
        .unwrap_or(to2::DEFAULT_MAX_MESSAGE_SIZE);
    session_insert::<to2::DeviceServiceInfoReady, _>(
        session,
        "max_owner_service_info_size",
        &max_owner_service_info_size,
    )?;
    session_insert::<to2::DeviceServiceInfoReady, _>(
        session,
        "device_service_info",
        &Vec::<ServiceInfoKV>::new(),
    )?;
    session_insert::<to2::DeviceServiceInfoReady, _>(session, "num_service_info_loops", &0u32)?;

    Ok((
        to2::OwnerServiceInfoReady::new(Some(user_data.max_device_service_info_size)),
        ses_with_store,
    ))
}

pub(super) async fn device_service_info(
    user_data: super::OwnerServiceUDT,
    mut ses_with_store: SessionWithStore,
    msg: to2::DeviceServiceInfo,
) -> Result<(to2::OwnerServiceInfo, SessionWithStore), warp::Rejection> {
    let session = &mut ses_with_store.session;
    let device_guid: Guid = session_value::<to2::DeviceServiceInfo, _>(session, "device_guid")?;

    let num_loops: u32 =
        session_value::<to2::DeviceServiceInfo, _>(session, "num_service_info_loops")?;
    if num_loops >= MAX_SERVICE_INFO_LOOPS {
        log::warn!(
            "Device {} has attempted to perform too many ServiceInfo loops",
            device_guid
        );
        return Err(Error::new(
            ErrorCode::InvalidMessageError,
            to2::DeviceServiceInfo::message_type(),
            "Too many serviceinfo loops performed",
        )
        .into());
    }
    session_insert::<to2::DeviceServiceInfo, _>(
        session,
        "num_service_info_loops",
        &(num_loops + 1),
    )?;

    // Phase one: the device streams its service info
    let devmod_validated: Option<bool> = session
        .get("devmod_validated")
        .map_err(Error::from_error::<to2::DeviceServiceInfo, _>)?;
    if devmod_validated.is_none() {
        let incoming_size = msg
            .service_info()
            .serialize_data()
            .map_err(Error::from_error::<to2::DeviceServiceInfo, _>)?
            .len();
        if incoming_size > service_info_budget(user_data.max_device_service_info_size) {
            log::info!(
                "Device {} sent {} bytes of service info, over the advertised limit",
                device_guid,
                incoming_size
            );
            return Err(Error::new(
                ErrorCode::MessageBodyError,
                to2::DeviceServiceInfo::message_type(),
                "Service info exceeds the advertised size",
            )
            .into());
        }

        let mut received: Vec<ServiceInfoKV> =
            session_value::<to2::DeviceServiceInfo, _>(session, "device_service_info")?;
        received.extend(msg.service_info().iter().cloned());
        log::trace!(
            "Device {} sent ServiceInfo loop {}: {:?}",
            device_guid,
            num_loops,
            msg.service_info()
        );

        if msg.is_more_service_info() {
            session_insert::<to2::DeviceServiceInfo, _>(session, "device_service_info", &received)?;
            return Ok((
                to2::OwnerServiceInfo::new(false, false, Vec::new()),
                ses_with_store,
            ));
        }

        let devmod = Devmod::from_service_info(received.iter()).map_err(|e| {
            log::info!("Device {} sent invalid devmod: {:?}", device_guid, e);
            Error::new(
                ErrorCode::InvalidMessageError,
                to2::DeviceServiceInfo::message_type(),
                "Invalid devmod service info",
            )
        })?;
        log::info!(
            "Device {} runs {} {} on {} (modules: {:?})",
            device_guid,
            devmod.os,
            devmod.version,
            devmod.arch,
            devmod.modules
        );
        session.remove("device_service_info");

        let max_size: u16 =
            session_value::<to2::DeviceServiceInfo, _>(session, "max_owner_service_info_size")?;
        let owner_chunks = split_service_info(&user_data.service_info, service_info_budget(max_size))
            .map_err(|e| {
                log::warn!(
                    "Owner service info does not fit the {} bytes device {} accepts: {:?}",
                    max_size,
                    device_guid,
                    e
                );
                Error::new(
                    ErrorCode::InternalServerError,
                    to2::DeviceServiceInfo::message_type(),
                    "Owner service info exceeds the device limit",
                )
            })?;
        session_insert::<to2::DeviceServiceInfo, _>(session, "owner_service_info", &owner_chunks)?;
        session_insert::<to2::DeviceServiceInfo, _>(session, "devmod_validated", &true)?;
        session_insert::<to2::DeviceServiceInfo, _>(session, "owner_service_info_pos", &0usize)?;
    } else if msg.is_more_service_info() || !msg.service_info().is_empty() {
        return Err(Error::new(
            ErrorCode::MessageBodyError,
            to2::DeviceServiceInfo::message_type(),
            "Device service info already complete",
        )
        .into());
    }

    // Phase two: the owner sends its items, as many per round as the device accepts
    let owner_chunks: Vec<ServiceInfo> =
        session_value::<to2::DeviceServiceInfo, _>(session, "owner_service_info")?;
    let pos: usize = session_value::<to2::DeviceServiceInfo, _>(session, "owner_service_info_pos")?;
    let resp = match owner_chunks.get(pos) {
        Some(chunk) => {
            session_insert::<to2::DeviceServiceInfo, _>(
                session,
                "owner_service_info_pos",
                &(pos + 1),
            )?;
            to2::OwnerServiceInfo::new(false, false, chunk.clone())
        }
        None => {
            session_insert::<to2::DeviceServiceInfo, _>(session, "owner_service_info_done", &true)?;
            to2::OwnerServiceInfo::new(false, true, Vec::new())
        }
    };

    Ok((resp, ses_with_store))
}

pub(super) async fn done(
    user_data: super::OwnerServiceUDT,
    mut ses_with_store: SessionWithStore,
    msg: to2::Done,
) -> Result<(to2::Done2, SessionWithStore), warp::Rejection> {
    let session = &mut ses_with_store.session;
    let _: bool = session_value::<to2::Done, _>(session, "owner_service_info_done")?;
    let device_guid: Guid = session_value::<to2::Done, _>(session, "device_guid")?;
    let nonce6: Nonce = session_value::<to2::Done, _>(session, "nonce6")?;
    let nonce7: Nonce = session_value::<to2::Done, _>(session, "nonce7")?;

    if nonce6.compare(msg.nonce6()).is_err() {
        return Err(Error::invalid_message::<to2::Done>("nonce6 mismatch").into());
    }

    let replacement: Option<VoucherDBEntry> = session
        .get("replacement_voucher")
        .map_err(Error::from_error::<to2::Done, _>)?;
    if let Some(replacement) = replacement {
        let new_guid = user_data
            .import_voucher(replacement)
            .await
            .map_err(Error::from_error::<to2::Done, _>)?;
        user_data
            .ownership_voucher_store
            .remove(&device_guid)
            .await
            .map_err(Error::from_error::<to2::Done, _>)?;
        user_data.to0_schedule.lock().await.remove(&device_guid);
        log::info!(
            "Device {} has finished its onboarding as {}",
            device_guid,
            new_guid
        );
    } else {
        log::info!("Device {} has finished its onboarding", device_guid);
    }

    let test = user_data
        .conformance
        .active_test(&device_guid, MessageType::TO2Done2);
    session.mark_finished();

    Ok((
        apply_test_mutation(to2::Done2::new(nonce7), test),
        ses_with_store,
    ))
}
