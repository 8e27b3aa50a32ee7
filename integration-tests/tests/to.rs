mod common;

use anyhow::{Context, Result};
use pretty_assertions::assert_eq;

use fdo_client_linuxapp::{
    onboard_via, perform_to1, perform_to2, rendezvous_directives, DeviceSettings,
};
use openssl::pkey::{PKeyRef, Private};

use fdo_data_formats::{
    conformance::{ConformanceHook, FixedConformanceTest, TestId},
    constants::{ErrorCode, HashType},
    cose::COSESign,
    messages::{to0, to1, to2},
    ownershipvoucher::OwnershipVoucher,
    types::{Hash, Nonce, ServiceInfoKV, TO0Data, TO1DataPayload},
    Serializable,
};
use fdo_http_wrapper::client::{Error as ClientError, ServiceClient};
use fdo_owner_tool::{generate_key, KeyCurve};

use common::{
    assert_error_code, bypass_rendezvous_info, manufacture_device, rendezvous_info,
    start_owner_server, start_rendezvous_server, to2_until_prove_device, url_for,
};

const NUM_OWNERS: usize = 4;
const RV_MAX_WAIT_SECONDS: u32 = 2000;
const OWNER_WAIT_SECONDS: u32 = 3600;

#[tokio::test]
async fn test_to0_to1_to2_replacement() -> Result<()> {
    let (rv, rv_port) = start_rendezvous_server(RV_MAX_WAIT_SECONDS, None).await?;
    let device = manufacture_device(rendezvous_info(rv_port)?, NUM_OWNERS)?;
    assert_eq!(device.owner_entry.voucher().num_entries(), NUM_OWNERS);

    let (owner, owner_port) = start_owner_server(|ud| {
        ud.with_to0_wait_seconds(OWNER_WAIT_SECONDS)
            .with_service_info(vec![
                ServiceInfoKV::new("sshkey:active", vec![0xf5]),
                ServiceInfoKV::new("sshkey:key", b"ssh-ed25519 AAAA test".to_vec()),
            ])
    })
    .await?;
    let old_guid = owner.import_voucher(device.owner_entry.clone()).await?;
    assert_eq!(&old_guid, device.credential.device_guid());

    // TO0: the server caps the requested wait
    let granted = fdo_owner_onboarding_server::perform_to0(
        &device.owner_entry,
        &common::owner_addresses(owner_port),
        OWNER_WAIT_SECONDS,
    )
    .await?;
    assert_eq!(granted, RV_MAX_WAIT_SECONDS);
    let registration = rv
        .registration(&old_guid)
        .await?
        .context("Device not registered")?;
    assert_eq!(registration.to0d()?.wait_seconds(), OWNER_WAIT_SECONDS);

    // TO1: the device gets back exactly the registered To1d
    let mut rv_client = ServiceClient::new(&url_for(rv_port))?;
    let to1d = perform_to1(&device.credential, &mut rv_client).await?;
    assert_eq!(
        to1d.serialize_data()?,
        registration.to1d().serialize_data()?
    );

    // TO2 through the rendezvous directive
    let settings = DeviceSettings::for_credential(&device.credential)?;
    let directives = rendezvous_directives(&device.credential)?;
    assert_eq!(directives.len(), 1);
    let result = onboard_via(&device.credential, settings, &directives[0]).await?;

    assert!(result.credential_replaced);
    let new_guid = result.credential.device_guid().clone();
    assert!(new_guid != old_guid);
    assert_eq!(
        result
            .owner_service_info
            .iter()
            .map(|kv| kv.key().to_string())
            .collect::<Vec<_>>(),
        vec!["sshkey:active".to_string(), "sshkey:key".to_string()]
    );

    // The owner now holds the replacement voucher, matching the new credential
    assert!(owner.voucher(&old_guid).await?.is_none());
    let replacement = owner
        .voucher(&new_guid)
        .await?
        .context("No replacement voucher stored")?;
    let header = replacement.voucher().validate()?;
    result.credential.check_voucher_header(&header)?;
    result.credential.verify_hmac(
        replacement.voucher().header_raw(),
        replacement.voucher().header_hmac(),
    )?;

    Ok(())
}

#[tokio::test]
async fn test_to2_credential_reuse() -> Result<()> {
    let (_rv, rv_port) = start_rendezvous_server(RV_MAX_WAIT_SECONDS, None).await?;
    let device = manufacture_device(rendezvous_info(rv_port)?, 1)?;

    let (owner, owner_port) = start_owner_server(|ud| ud.with_reuse_credential(true)).await?;
    let guid = owner.import_voucher(device.owner_entry.clone()).await?;

    let settings = DeviceSettings::for_credential(&device.credential)?;
    let result = perform_to2(&device.credential, settings, &url_for(owner_port), None).await?;

    assert!(!result.credential_replaced);
    assert_eq!(result.credential.device_guid(), &guid);
    assert!(result.owner_service_info.is_empty());
    assert!(owner.voucher(&guid).await?.is_some());

    // The same credential onboards again
    let again = perform_to2(&device.credential, settings, &url_for(owner_port), None).await?;
    assert!(!again.credential_replaced);
    assert!(again.setup_nonce.compare(&result.setup_nonce).is_err());

    Ok(())
}

#[tokio::test]
async fn test_to2_rendezvous_bypass() -> Result<()> {
    let (owner, owner_port) = start_owner_server(|ud| ud).await?;
    let device = manufacture_device(bypass_rendezvous_info(owner_port)?, 2)?;
    owner.import_voucher(device.owner_entry.clone()).await?;

    // No rendezvous server exists, the directive points straight at the owner
    let settings = DeviceSettings::for_credential(&device.credential)?;
    let directives = rendezvous_directives(&device.credential)?;
    assert!(directives[0].bypass());
    let result = onboard_via(&device.credential, settings, &directives[0]).await?;
    assert!(result.credential_replaced);

    Ok(())
}

#[tokio::test]
async fn test_to1_rejects_stale_nonce() -> Result<()> {
    let (_rv, rv_port) = start_rendezvous_server(RV_MAX_WAIT_SECONDS, None).await?;
    let device = manufacture_device(rendezvous_info(rv_port)?, 1)?;
    let (_owner, owner_port) = start_owner_server(|ud| ud).await?;
    fdo_owner_onboarding_server::perform_to0(
        &device.owner_entry,
        &common::owner_addresses(owner_port),
        OWNER_WAIT_SECONDS,
    )
    .await?;

    let devcred = &device.credential;
    let mut client = ServiceClient::new(&url_for(rv_port))?;
    let _: to1::HelloRVAck = client
        .send_request(to1::HelloRV::new(
            devcred.device_guid().clone(),
            devcred.sig_info().clone(),
        ))
        .await?;

    // Sign a nonce the server never handed out
    let eat = fdo_data_formats::cose::new_eat::<()>(None, Nonce::new()?, devcred.device_guid())?;
    let device_key = devcred.private_key()?;
    let token = COSESign::from_eat(eat, None, &device_key)?;
    let res: Result<to1::RVRedirect, ClientError> =
        client.send_request(to1::ProveToRV::new(token)).await;
    assert_error_code(res, ErrorCode::InvalidMessageError);

    Ok(())
}

#[tokio::test]
async fn test_to1_unknown_device() -> Result<()> {
    let (_rv, rv_port) = start_rendezvous_server(RV_MAX_WAIT_SECONDS, None).await?;
    let device = manufacture_device(rendezvous_info(rv_port)?, 1)?;

    let mut client = ServiceClient::new(&url_for(rv_port))?;
    match perform_to1(&device.credential, &mut client).await {
        Ok(_) => panic!("Unregistered device got redirected"),
        Err(e) => match e.downcast_ref::<ClientError>() {
            Some(ClientError::Error(msg)) => {
                assert_eq!(msg.error_code(), ErrorCode::ResourceNotFound)
            }
            other => panic!("Unexpected error: {:?}", other),
        },
    }

    Ok(())
}

/// OwnerSign for `voucher`, with the to1d hash taken over `hashed` when given
fn owner_sign(
    voucher: &OwnershipVoucher,
    nonce3: Nonce,
    owner_port: u16,
    signing_key: &PKeyRef<Private>,
    hashed: Option<&[u8]>,
) -> Result<to0::OwnerSign> {
    let to0d = TO0Data::new(voucher.clone(), OWNER_WAIT_SECONDS, nonce3);
    let to0d_raw = to0d.serialize_data()?;
    let hash = Hash::from_data(HashType::Sha256, hashed.unwrap_or(&to0d_raw))?;
    let to1d = COSESign::new(
        &TO1DataPayload::new(common::owner_addresses(owner_port), hash),
        None,
        signing_key,
    )?;
    Ok(to0::OwnerSign::new(&to0d, to1d)?)
}

async fn hello_rv(rv_port: u16) -> Result<(ServiceClient, Nonce)> {
    let mut client = ServiceClient::new(&url_for(rv_port))?;
    let ack: to0::HelloAck = client.send_request(to0::Hello::new()).await?;
    let nonce3 = ack.nonce3().clone();
    Ok((client, nonce3))
}

#[tokio::test]
async fn test_to0_rejects_bad_owner_sign() -> Result<()> {
    let (rv, rv_port) = start_rendezvous_server(RV_MAX_WAIT_SECONDS, None).await?;
    let device = manufacture_device(rendezvous_info(rv_port)?, 2)?;
    let voucher = device.owner_entry.voucher();
    let owner_key = device.owner_entry.private_key()?;
    let owner_port = common::next_port();

    // Nonce from another session
    let (mut client, _) = hello_rv(rv_port).await?;
    let msg = owner_sign(voucher, Nonce::new()?, owner_port, &owner_key, None)?;
    let res: Result<to0::AcceptOwner, ClientError> = client.send_request(msg).await;
    assert_error_code(res, ErrorCode::InvalidMessageError);

    // To1d binding some other to0d
    let (mut client, nonce3) = hello_rv(rv_port).await?;
    let msg = owner_sign(voucher, nonce3, owner_port, &owner_key, Some(&b"other to0d"[..]))?;
    let res: Result<to0::AcceptOwner, ClientError> = client.send_request(msg).await;
    assert_error_code(res, ErrorCode::InvalidMessageError);

    // To1d signed by a key that does not own the voucher
    let (mut client, nonce3) = hello_rv(rv_port).await?;
    let stranger = generate_key(KeyCurve::P256)?;
    let msg = owner_sign(voucher, nonce3, owner_port, &stranger, None)?;
    let res: Result<to0::AcceptOwner, ClientError> = client.send_request(msg).await;
    assert_error_code(res, ErrorCode::InvalidMessageError);

    // A voucher nobody was handed to yet
    let unowned = manufacture_device(rendezvous_info(rv_port)?, 0)?;
    let (mut client, nonce3) = hello_rv(rv_port).await?;
    let msg = owner_sign(
        unowned.owner_entry.voucher(),
        nonce3,
        owner_port,
        &unowned.manufacturer_key,
        None,
    )?;
    let res: Result<to0::AcceptOwner, ClientError> = client.send_request(msg).await;
    assert_error_code(res, ErrorCode::InvalidOwnershipVoucher);

    assert!(rv
        .registration(device.credential.device_guid())
        .await?
        .is_none());

    // The same voucher goes through with everything in order
    let (mut client, nonce3) = hello_rv(rv_port).await?;
    let msg = owner_sign(voucher, nonce3, owner_port, &owner_key, None)?;
    let accepted: to0::AcceptOwner = client.send_request(msg).await?;
    assert_eq!(accepted.wait_seconds(), RV_MAX_WAIT_SECONDS);
    assert!(rv
        .registration(device.credential.device_guid())
        .await?
        .is_some());

    Ok(())
}

#[tokio::test]
async fn test_to2_rejects_stale_prove_device_nonce() -> Result<()> {
    let (owner, owner_port) = start_owner_server(|ud| ud).await?;
    let device = manufacture_device(bypass_rendezvous_info(owner_port)?, 1)?;
    let guid = owner.import_voucher(device.owner_entry.clone()).await?;

    let mut session = to2_until_prove_device(&device, owner_port).await?;
    let res = session.prove_device(&device.credential, Nonce::new()?).await?;
    assert_error_code(res, ErrorCode::InvalidMessageError);
    assert!(owner.voucher(&guid).await?.is_some());

    Ok(())
}

#[tokio::test]
async fn test_to2_rejects_stale_done_nonce() -> Result<()> {
    let (owner, owner_port) = start_owner_server(|ud| ud.with_reuse_credential(true)).await?;
    let device = manufacture_device(bypass_rendezvous_info(owner_port)?, 1)?;
    let guid = owner.import_voucher(device.owner_entry.clone()).await?;

    let mut session = to2_until_prove_device(&device, owner_port).await?;
    let nonce6 = session.nonce6.clone();
    let _: to2::SetupDevice = session.prove_device(&device.credential, nonce6).await??;

    let ready: to2::OwnerServiceInfoReady = session
        .client
        .send_request(to2::DeviceServiceInfoReady::new(None, None))
        .await?;
    assert_eq!(
        ready.max_device_service_info_size(),
        Some(to2::DEFAULT_MAX_MESSAGE_SIZE)
    );
    let devmod = fdo_client_linuxapp::serviceinfo::device_devmod().to_service_info()?;
    let owner_service_info: to2::OwnerServiceInfo = session
        .client
        .send_request(to2::DeviceServiceInfo::new(false, devmod))
        .await?;
    assert!(owner_service_info.is_done());

    let res: Result<to2::Done2, ClientError> = session
        .client
        .send_request(to2::Done::new(Nonce::new()?))
        .await;
    assert_error_code(res, ErrorCode::InvalidMessageError);
    assert!(owner.voucher(&guid).await?.is_some());

    Ok(())
}

#[tokio::test]
async fn test_to2_service_info_size_limits() -> Result<()> {
    let items = vec![
        ServiceInfoKV::new("sshkey:key1", vec![b'a'; 600]),
        ServiceInfoKV::new("sshkey:key2", vec![b'b'; 600]),
        ServiceInfoKV::new("sshkey:key3", vec![b'c'; 600]),
    ];
    let (owner, owner_port) = start_owner_server(|ud| {
        ud.with_reuse_credential(true)
            .with_service_info(items.clone())
            // Devmod has to be split over several messages
            .with_max_device_service_info_size(256)
    })
    .await?;
    let device = manufacture_device(bypass_rendezvous_info(owner_port)?, 1)?;
    owner.import_voucher(device.owner_entry.clone()).await?;

    let settings = DeviceSettings::for_credential(&device.credential)?;
    let result = perform_to2(&device.credential, settings, &url_for(owner_port), None).await?;
    assert_eq!(result.owner_service_info, items);

    // One item larger than the device accepts
    let big = vec![ServiceInfoKV::new("sshkey:key", vec![b'k'; 2000])];
    let (owner, owner_port) = start_owner_server(|ud| {
        ud.with_reuse_credential(true)
            .with_service_info(big.clone())
    })
    .await?;
    let device = manufacture_device(bypass_rendezvous_info(owner_port)?, 1)?;
    owner.import_voucher(device.owner_entry.clone()).await?;

    let settings = DeviceSettings::for_credential(&device.credential)?;
    assert!(
        perform_to2(&device.credential, settings, &url_for(owner_port), None)
            .await
            .is_err()
    );
    let settings = settings.with_max_owner_service_info_size(4096);
    let result = perform_to2(&device.credential, settings, &url_for(owner_port), None).await?;
    assert_eq!(result.owner_service_info, big);

    Ok(())
}

async fn onboarding_fails_with(test: TestId) -> Result<()> {
    let rv_hook: Option<Box<dyn ConformanceHook>> = match test {
        TestId::Device32BadTo1d => Some(Box::new(FixedConformanceTest(test))),
        _ => None,
    };
    let (_rv, rv_port) = start_rendezvous_server(RV_MAX_WAIT_SECONDS, rv_hook).await?;
    let device = manufacture_device(rendezvous_info(rv_port)?, 2)?;
    let (owner, owner_port) =
        start_owner_server(|ud| ud.with_conformance(Box::new(FixedConformanceTest(test)))).await?;
    let guid = owner.import_voucher(device.owner_entry.clone()).await?;
    fdo_owner_onboarding_server::perform_to0(
        &device.owner_entry,
        &common::owner_addresses(owner_port),
        OWNER_WAIT_SECONDS,
    )
    .await?;

    let settings = DeviceSettings::for_credential(&device.credential)?;
    let directives = rendezvous_directives(&device.credential)?;
    let result = onboard_via(&device.credential, settings, &directives[0]).await;
    assert!(result.is_err(), "{} did not break onboarding", test.name());

    // Only a run the owner saw through to Done changes its vouchers
    let stored = owner.voucher(&guid).await?;
    assert_eq!(stored.is_some(), test != TestId::Device70BadNonceTO2SetupDv64);
    Ok(())
}

#[tokio::test]
async fn test_device_detects_corrupted_responses() -> Result<()> {
    for test in [
        TestId::Device32BadTo1d,
        TestId::Device60BadNonceTO2ProveOV,
        TestId::Device60BadHelloDeviceHash,
        TestId::Device60BadCoseSignature,
        TestId::Device62BadOVEntryNum,
        TestId::Device62BadOVEntryCoseSignature,
        TestId::Device64BadNonceTO2SetupDv,
        TestId::Device70BadNonceTO2SetupDv64,
    ] {
        onboarding_fails_with(test).await?;
    }
    Ok(())
}
