use fdo_data_formats::{
    constants::ErrorCode,
    messages::{to0, Message},
    types::{Nonce, TO1DataPayload},
};

use fdo_http_wrapper::server::Error;
use fdo_http_wrapper::server::SessionWithStore;

use crate::OwnerRegistration;

pub(super) async fn hello(
    _user_data: super::RendezvousUDT,
    mut ses_with_store: SessionWithStore,
    _msg: to0::Hello,
) -> Result<(to0::HelloAck, SessionWithStore), warp::Rejection> {
    let nonce3 = Nonce::new().map_err(Error::from_error::<to0::Hello, _>)?;

    ses_with_store
        .session
        .insert("nonce3", &nonce3)
        .map_err(Error::from_error::<to0::Hello, _>)?;

    Ok((to0::HelloAck::new(nonce3), ses_with_store))
}

fn invalid_voucher(reason: &str) -> Error {
    log::info!("Rejecting ownership voucher: {}", reason);
    Error::new(
        ErrorCode::InvalidOwnershipVoucher,
        to0::OwnerSign::message_type(),
        "Invalid ownership voucher",
    )
}

pub(super) async fn ownersign(
    user_data: super::RendezvousUDT,
    mut ses_with_store: SessionWithStore,
    msg: to0::OwnerSign,
) -> Result<(to0::AcceptOwner, SessionWithStore), warp::Rejection> {
    let to0d = msg.to0d().map_err(|e| {
        log::debug!("Error decoding to0d: {:?}", e);
        Error::new(
            ErrorCode::InvalidOwnerSignBody,
            to0::OwnerSign::message_type(),
            "Invalid to0d",
        )
    })?;

    // First check the easy things: whether the nonce in to0d is correct
    let correct_nonce: Nonce = match ses_with_store
        .session
        .get("nonce3")
        .map_err(Error::from_error::<to0::OwnerSign, _>)?
    {
        Some(v) => v,
        None => return Err(Error::invalid_message::<to0::OwnerSign>("no nonce3 in session").into()),
    };
    log::trace!(
        "Matching correct nonce {:?} to received {:?}",
        correct_nonce,
        to0d.nonce()
    );
    if correct_nonce.compare(to0d.nonce()).is_err() {
        return Err(Error::invalid_message::<to0::OwnerSign>("nonce3 mismatch").into());
    }

    let voucher = to0d.ownership_voucher();
    let header = voucher
        .validate()
        .map_err(|e| invalid_voucher(&e.to_string()))?;
    let owner_pubkey = voucher
        .final_owner_public_key()
        .map_err(|e| invalid_voucher(&e.to_string()))?;

    // Verify the signature on to1d
    log::trace!(
        "Checking whether to1d payload is signed by owner public key {:?}",
        owner_pubkey,
    );
    let to1d_payload: TO1DataPayload = msg
        .to1d()
        .get_payload(&owner_pubkey)
        .map_err(|e| {
            log::debug!("Error verifying to1d: {:?}", e);
            Error::invalid_message::<to0::OwnerSign>("to1d not signed by owner")
        })?;

    // Verify the to1d -> to0d hash
    log::trace!(
        "Checking whether to1d->to0d hash {:?} matches data",
        to1d_payload.to1d_to_to0d_hash(),
    );
    to1d_payload
        .to1d_to_to0d_hash()
        .compare_data(msg.to0d_raw())
        .map_err(|_| Error::invalid_message::<to0::OwnerSign>("to0d hash mismatch"))?;

    if to1d_payload.to2_addresses().is_empty() {
        return Err(Error::new(
            ErrorCode::InvalidOwnerSignBody,
            to0::OwnerSign::message_type(),
            "No owner addresses",
        )
        .into());
    }
    for address in to1d_payload.to2_addresses() {
        address.validate().map_err(|_| {
            Error::new(
                ErrorCode::InvalidIPAddress,
                to0::OwnerSign::message_type(),
                "Invalid owner address",
            )
        })?;
    }

    let wait_seconds = std::cmp::min(to0d.wait_seconds(), user_data.max_wait_seconds);
    let device_guid = header.guid();

    log::info!(
        "Storing TO1D for device with GUID {} for {} seconds",
        device_guid,
        wait_seconds
    );
    user_data
        .store
        .save(
            device_guid,
            OwnerRegistration::new(msg.to0d_raw(), msg.to1d().clone()),
            wait_seconds,
        )
        .await
        .map_err(Error::from_error::<to0::OwnerSign, _>)?;

    ses_with_store.session.mark_finished();
    Ok((to0::AcceptOwner::new(wait_seconds), ses_with_store))
}
