use anyhow::{bail, Context, Result};

use fdo_data_formats::{
    cose::{sig_type_for_key, COSESign},
    messages::to0,
    ownershipvoucher::VoucherDBEntry,
    rendezvous::RendezvousInterpreterSide,
    types::{Hash, TO0Data, TO1DataPayload, TO2AddressEntry},
    Serializable,
};
use fdo_http_wrapper::client::{RequestResult, ServiceClient};

/// Registers a voucher with the first rendezvous server that accepts it,
/// returning the wait time that server granted.
pub async fn perform_to0(
    entry: &VoucherDBEntry,
    owner_addresses: &[TO2AddressEntry],
    wait_seconds: u32,
) -> Result<u32> {
    let voucher = entry.voucher();
    let header = voucher.header().context("Error parsing voucher header")?;
    let owner_key = entry.private_key().context("Error loading owner key")?;
    let hash_type = sig_type_for_key(&owner_key)
        .and_then(|st| st.hash_type())
        .context("Unsupported owner key")?;

    if owner_addresses.is_empty() {
        bail!("No owner addresses configured to register");
    }

    let rv_info = header
        .rendezvous_info()
        .to_interpreted(RendezvousInterpreterSide::Owner)
        .context("Error parsing rendezvous directives")?;
    if rv_info.is_empty() {
        bail!("No rendezvous information found that's usable for the owner");
    }

    for rv_directive in rv_info {
        let rv_urls = rv_directive.get_urls();
        if rv_urls.is_empty() {
            log::info!(
                "No usable rendezvous URLs were found for RV directive: {:?}",
                rv_directive
            );
            continue;
        }

        for rv_url in rv_urls {
            log::info!(
                "OV({}): Using rendezvous server at url {}",
                header.guid(),
                rv_url
            );

            let mut rv_client = match ServiceClient::new(&rv_url) {
                Ok(client) => client,
                Err(e) => {
                    log::info!("Unusable rendezvous url {}: {:?}", rv_url, e);
                    continue;
                }
            };

            // Send: Hello, Receive: HelloAck
            let hello_ack: RequestResult<to0::HelloAck> =
                rv_client.send_request(to0::Hello::new()).await;
            let hello_ack = match hello_ack {
                Ok(hello_ack) => hello_ack,
                Err(e) => {
                    log::info!("Error requesting nonce from rendezvous server: {:?}", e);
                    continue;
                }
            };

            // Build to0d and to1d
            let to0d = TO0Data::new(voucher.clone(), wait_seconds, hello_ack.nonce3().clone());
            let to0d_hash = Hash::from_data(
                hash_type,
                &to0d.serialize_data().context("Error serializing TO0Data")?,
            )
            .context("Error hashing to0d")?;
            let to1d_payload = TO1DataPayload::new(owner_addresses.to_vec(), to0d_hash);
            let to1d =
                COSESign::new(&to1d_payload, None, &owner_key).context("Error signing to1d")?;

            // Send: OwnerSign, Receive: AcceptOwner
            let msg =
                to0::OwnerSign::new(&to0d, to1d).context("Error creating OwnerSign message")?;
            let accept_owner: RequestResult<to0::AcceptOwner> = rv_client.send_request(msg).await;
            let accept_owner = match accept_owner {
                Ok(accept_owner) => accept_owner,
                Err(e) => {
                    log::info!("Rendezvous server at {} refused us: {:?}", rv_url, e);
                    continue;
                }
            };

            log::info!(
                "OV({}): Rendezvous server registered us for {} seconds",
                header.guid(),
                accept_owner.wait_seconds()
            );

            return Ok(accept_owner.wait_seconds());
        }
    }
    bail!("Report to rendezvous not performed");
}
