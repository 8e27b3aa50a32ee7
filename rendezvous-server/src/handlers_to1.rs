use fdo_data_formats::{
    conformance::apply_test_mutation,
    constants::{DeviceSigType, ErrorCode, MessageType},
    cose::EATokenPayload,
    messages::{to1, Message},
    types::{Guid, Nonce},
};

use fdo_http_wrapper::server::Error;
use fdo_http_wrapper::server::SessionWithStore;

pub(super) async fn hello_rv(
    user_data: super::RendezvousUDT,
    mut ses_with_store: SessionWithStore,
    msg: to1::HelloRV,
) -> Result<(to1::HelloRVAck, SessionWithStore), warp::Rejection> {
    let sig_type = msg.a_signature_info().sig_type();
    if matches!(sig_type, DeviceSigType::StEPID10 | DeviceSigType::StEPID11)
        || sig_type.hash_type().is_err()
    {
        return Err(Error::new(
            ErrorCode::MessageBodyError,
            to1::HelloRV::message_type(),
            "Unsupported signature type",
        )
        .into());
    }

    let guid = msg.guid();
    match user_data
        .store
        .get(guid)
        .await
        .map_err(Error::from_error::<to1::HelloRV, _>)?
    {
        Some(_) => {}
        None => {
            log::info!("HelloRV for unregistered device {}", guid);
            return Err(Error::new(
                ErrorCode::ResourceNotFound,
                to1::HelloRV::message_type(),
                "Device not found",
            )
            .into());
        }
    }

    let nonce4 = Nonce::new().map_err(Error::from_error::<to1::HelloRV, _>)?;
    let session = &mut ses_with_store.session;
    session
        .insert("nonce4", &nonce4)
        .map_err(Error::from_error::<to1::HelloRV, _>)?;
    session
        .insert("device_guid", guid)
        .map_err(Error::from_error::<to1::HelloRV, _>)?;

    let res = to1::HelloRVAck::new(nonce4, msg.a_signature_info().clone());
    Ok((res, ses_with_store))
}

pub(super) async fn prove_to_rv(
    user_data: super::RendezvousUDT,
    mut ses_with_store: SessionWithStore,
    msg: to1::ProveToRV,
) -> Result<(to1::RVRedirect, SessionWithStore), warp::Rejection> {
    let session = &ses_with_store.session;
    let (nonce4, device_guid): (Nonce, Guid) = match (
        session
            .get("nonce4")
            .map_err(Error::from_error::<to1::ProveToRV, _>)?,
        session
            .get("device_guid")
            .map_err(Error::from_error::<to1::ProveToRV, _>)?,
    ) {
        (Some(nonce4), Some(guid)) => (nonce4, guid),
        _ => {
            return Err(Error::invalid_message::<to1::ProveToRV>("incomplete session").into());
        }
    };

    let token = msg.token();
    let eat: EATokenPayload<()> = token
        .get_eat_unverified()
        .map_err(|_| Error::invalid_message::<to1::ProveToRV>("undecodable token"))?
        .into_unverified();
    if nonce4.compare(eat.nonce()).is_err() {
        return Err(Error::invalid_message::<to1::ProveToRV>("nonce4 mismatch").into());
    }
    if !eat.matches_guid(&device_guid) {
        return Err(Error::invalid_message::<to1::ProveToRV>("ueid mismatch").into());
    }

    let registration = match user_data
        .store
        .get(&device_guid)
        .await
        .map_err(Error::from_error::<to1::ProveToRV, _>)?
    {
        Some(registration) => registration,
        None => {
            return Err(Error::new(
                ErrorCode::ResourceNotFound,
                to1::ProveToRV::message_type(),
                "Device not found",
            )
            .into());
        }
    };

    // The device proves itself with the key certified by its chain in the voucher
    let to0d = registration
        .to0d()
        .map_err(Error::from_error::<to1::ProveToRV, _>)?;
    let chain = to0d
        .ownership_voucher()
        .device_certificate_chain()
        .ok_or_else(|| Error::invalid_message::<to1::ProveToRV>("no device chain"))?;
    let leaf = chain
        .verify()
        .map_err(|_| Error::invalid_message::<to1::ProveToRV>("device chain invalid"))?;
    let device_key = leaf
        .public_key()
        .map_err(Error::from_error::<to1::ProveToRV, _>)?;
    token
        .verify_with_pkey(&device_key)
        .map_err(|_| Error::invalid_message::<to1::ProveToRV>("device signature invalid"))?;

    log::info!("Redirecting device {} to its owner", device_guid);

    let test = user_data
        .conformance
        .active_test(&device_guid, MessageType::TO1RVRedirect);
    let res = apply_test_mutation(to1::RVRedirect::new(registration.to1d().clone()), test);

    ses_with_store.session.mark_finished();
    Ok((res, ses_with_store))
}
