use std::ops::Range;

use openssl::pkey::{PKey, PKeyRef, Private};
use serde_bytes::ByteBuf;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use crate::{
    constants::{HashType, ProtocolVersion},
    cose::COSESign,
    errors::Result,
    publickey::{PublicKey, X5Chain},
    rendezvous::RendezvousInfo,
    types::{Guid, HMac, Hash},
    Error, Serializable,
};

const VOUCHER_PEM_TAG: &str = "OWNERSHIP VOUCHER";
const ACCEPTABLE_ASCII_RANGE: Range<u8> = 32..127;

#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct OwnershipVoucher {
    protocol_version: u16,
    #[serde(with = "serde_bytes")]
    header: Vec<u8>,
    header_hmac: HMac,
    device_certificate_chain: Option<X5Chain>,
    entries: Vec<COSESign>,
}

impl OwnershipVoucher {
    pub fn new(
        header: &OwnershipVoucherHeader,
        header_hmac: HMac,
        device_certificate_chain: Option<X5Chain>,
    ) -> Result<Self> {
        Ok(OwnershipVoucher {
            protocol_version: ProtocolVersion::Version1_1 as u16,
            header: header.serialize_data()?,
            header_hmac,
            device_certificate_chain,
            entries: Vec::new(),
        })
    }

    pub fn from_pem(data: &[u8]) -> Result<Self> {
        let parsed = pem::parse(data)?;
        if parsed.tag() != VOUCHER_PEM_TAG {
            return Err(Error::InvalidPemTag(parsed.tag().to_string()));
        }
        Self::deserialize_data(parsed.contents())
    }

    pub fn from_pem_or_raw(data: &[u8]) -> Result<Self> {
        if data.starts_with(b"--") {
            Self::from_pem(data)
        } else {
            Self::deserialize_data(data)
        }
    }

    pub fn to_pem(&self) -> Result<String> {
        let block = pem::Pem::new(VOUCHER_PEM_TAG, self.serialize_data()?);
        Ok(pem::encode(&block))
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    fn hash_type(&self) -> HashType {
        self.header_hmac.get_type().inner_hash()
    }

    /// Decodes the header from the signed header bytes
    pub fn header(&self) -> Result<OwnershipVoucherHeader> {
        OwnershipVoucherHeader::deserialize_data(&self.header)
    }

    pub fn header_raw(&self) -> &[u8] {
        &self.header
    }

    pub fn header_hmac(&self) -> &HMac {
        &self.header_hmac
    }

    pub fn device_certificate_chain(&self) -> Option<&X5Chain> {
        self.device_certificate_chain.as_ref()
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, entry_num: usize) -> Result<&COSESign> {
        self.entries.get(entry_num).ok_or(Error::InvalidEntryNum)
    }

    pub fn entries(&self) -> &[COSESign] {
        &self.entries
    }

    /// The public key of the last entry: the party currently owning the device
    pub fn final_owner_public_key(&self) -> Result<PublicKey> {
        let last = self
            .entries
            .last()
            .ok_or(Error::InvalidVoucher("voucher has no entries"))?;
        let payload: OwnershipVoucherEntryPayload =
            last.get_payload_unverified()?.into_unverified();
        Ok(payload.public_key)
    }

    pub fn extend(
        &mut self,
        owner_private_key: &PKeyRef<Private>,
        next_party: &PublicKey,
    ) -> Result<()> {
        let header = self.header()?;
        let hash_type = self.hash_type();

        let (last_hash, current_owner_pubkey) = match self.entries.last() {
            None => (
                first_entry_hash(&self.header, &self.header_hmac, hash_type)?,
                header.public_key().clone(),
            ),
            Some(last) => {
                let payload: OwnershipVoucherEntryPayload =
                    last.get_payload_unverified()?.into_unverified();
                (
                    Hash::from_data(hash_type, &last.serialize_data()?)?,
                    payload.public_key,
                )
            }
        };

        if !current_owner_pubkey.matches_pkey(owner_private_key) {
            return Err(Error::NonOwnerKey);
        }

        let new_entry = OwnershipVoucherEntryPayload {
            hash_previous_entry: last_hash,
            hash_header_info: header.get_hdr_info_hash(hash_type)?,
            extra: None,
            public_key: next_party.clone(),
        };

        let signed_new_entry = COSESign::new(&new_entry, None, owner_private_key)?;
        self.entries.push(signed_new_entry);

        Ok(())
    }

    /// Full structural and cryptographic validation; returns the decoded header
    pub fn validate(&self) -> Result<OwnershipVoucherHeader> {
        if self.protocol_version != ProtocolVersion::Version1_1 as u16 {
            return Err(Error::InvalidVoucher("unsupported protocol version"));
        }
        let chain = self.device_certificate_chain.as_ref().ok_or(Error::InvalidVoucher(
            "no device certificate chain (EPID is not supported)",
        ))?;
        let header = self
            .header()
            .map_err(|_| Error::InvalidVoucher("header does not decode"))?;
        if header.rendezvous_info().is_empty() {
            return Err(Error::InvalidVoucher("empty rendezvous info"));
        }
        if header.device_info().is_empty() {
            return Err(Error::InvalidVoucher("empty device info"));
        }
        let chain_hash = header
            .device_certificate_chain_hash()
            .ok_or(Error::InvalidVoucher("header lacks certificate chain hash"))?;
        chain_hash
            .compare(&chain.hash(chain_hash.get_type())?)
            .map_err(|_| Error::InvalidVoucher("certificate chain hash mismatch"))?;

        if self.entries.is_empty() {
            return Err(Error::InvalidVoucher("voucher has no entries"));
        }
        for entry in self.iter_entries()? {
            entry?;
        }

        Ok(header)
    }

    pub fn iter_entries(&self) -> Result<EntryIter> {
        Ok(EntryIter {
            entries: &self.entries,
            verifier: EntryChainVerifier::new(&self.header, &self.header_hmac)?,
            errored: false,
        })
    }
}

fn first_entry_hash(header: &[u8], header_hmac: &HMac, hash_type: HashType) -> Result<Hash> {
    let mut data = header.to_vec();
    data.extend_from_slice(&header_hmac.serialize_data()?);
    Hash::from_data(hash_type, &data)
}

/// Verifies entries one at a time, in order. Used for stored vouchers and
/// by a device receiving the entries over TO2.
#[derive(Debug)]
pub struct EntryChainVerifier {
    header: OwnershipVoucherHeader,
    previous: Vec<u8>,
    last_pubkey: PublicKey,
    index: usize,
}

impl EntryChainVerifier {
    pub fn new(header_raw: &[u8], header_hmac: &HMac) -> Result<Self> {
        let header = OwnershipVoucherHeader::deserialize_data(header_raw)?;
        let mut previous = header_raw.to_vec();
        previous.extend_from_slice(&header_hmac.serialize_data()?);
        let last_pubkey = header.public_key().clone();

        Ok(EntryChainVerifier {
            header,
            previous,
            last_pubkey,
            index: 0,
        })
    }

    pub fn verify_next(&mut self, entry: &COSESign) -> Result<OwnershipVoucherEntryPayload> {
        let payload: OwnershipVoucherEntryPayload = entry.get_payload(&self.last_pubkey)?;

        // Entry 0 commits to (header || hmac), later ones to the entry before
        if let Err(e) = payload
            .hash_previous_entry
            .compare_data(&self.previous)
        {
            log::error!("Hash of previous entry mismatch at entry {}", self.index);
            return Err(e);
        }

        let hdr_info_hash = self
            .header
            .get_hdr_info_hash(payload.hash_header_info.get_type())?;
        if let Err(e) = payload.hash_header_info.compare(&hdr_info_hash) {
            log::error!("Header info hash mismatch at entry {}", self.index);
            return Err(e);
        }

        self.previous = entry.serialize_data()?;
        self.last_pubkey = payload.public_key.clone();
        self.index += 1;

        Ok(payload)
    }

    pub fn entries_verified(&self) -> usize {
        self.index
    }

    pub fn last_public_key(&self) -> &PublicKey {
        &self.last_pubkey
    }
}

#[derive(Debug)]
pub struct EntryIter<'a> {
    entries: &'a [COSESign],
    verifier: EntryChainVerifier,
    errored: bool,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<OwnershipVoucherEntryPayload>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            log::warn!("Previous entry validation failed");
            return None;
        }
        let entry = self.entries.get(self.verifier.entries_verified())?;

        let result = self.verifier.verify_next(entry);
        if let Err(e) = &result {
            log::warn!("Error validating ownership voucher: {:?}", e);
            self.errored = true;
        }
        Some(result)
    }
}

#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct OwnershipVoucherHeader {
    protocol_version: u16,
    guid: Guid,
    rendezvous_info: RendezvousInfo,
    device_info: String,
    public_key: PublicKey,
    device_certificate_chain_hash: Option<Hash>,
}

impl OwnershipVoucherHeader {
    pub fn new(
        guid: Guid,
        rendezvous_info: RendezvousInfo,
        device_info: String,
        public_key: PublicKey,
        device_certificate_chain_hash: Option<Hash>,
    ) -> Result<Self> {
        let device_info = device_info.trim().to_string();
        check_device_info(&device_info)?;

        Ok(OwnershipVoucherHeader {
            protocol_version: ProtocolVersion::Version1_1 as u16,
            guid,
            rendezvous_info,
            device_info,
            public_key,
            device_certificate_chain_hash,
        })
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn rendezvous_info(&self) -> &RendezvousInfo {
        &self.rendezvous_info
    }

    pub fn device_info(&self) -> &str {
        &self.device_info
    }

    /// The manufacturer key, or for a replacement voucher the new owner key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn manufacturer_public_key_hash(&self, hash_type: HashType) -> Result<Hash> {
        self.public_key.hash(hash_type)
    }

    pub fn device_certificate_chain_hash(&self) -> Option<&Hash> {
        self.device_certificate_chain_hash.as_ref()
    }

    fn get_hdr_info_hash(&self, hash_type: HashType) -> Result<Hash> {
        let device_info = self.device_info.as_bytes();

        let mut data = Vec::with_capacity(self.guid.len() + device_info.len());
        data.extend_from_slice(&self.guid);
        data.extend_from_slice(device_info);

        Hash::from_data(hash_type, &data)
    }
}

fn check_device_info(device_info: &str) -> Result<()> {
    if device_info
        .bytes()
        .all(|b| ACCEPTABLE_ASCII_RANGE.contains(&b))
    {
        Ok(())
    } else {
        Err(Error::InconsistentValue("Invalid values in Device Info"))
    }
}

#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct OwnershipVoucherEntryPayload {
    hash_previous_entry: Hash,
    hash_header_info: Hash,
    extra: Option<ByteBuf>,
    public_key: PublicKey,
}

impl OwnershipVoucherEntryPayload {
    pub fn hash_previous_entry(&self) -> &Hash {
        &self.hash_previous_entry
    }

    pub fn hash_header_info(&self) -> &Hash {
        &self.hash_header_info
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// A voucher as held by its owner, together with the owner's private key
#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct VoucherDBEntry {
    voucher: OwnershipVoucher,
    #[serde(with = "serde_bytes")]
    private_key: Vec<u8>,
}

impl VoucherDBEntry {
    pub fn new(voucher: OwnershipVoucher, private_key: &PKeyRef<Private>) -> Result<Self> {
        Ok(VoucherDBEntry {
            voucher,
            private_key: private_key.private_key_to_der()?,
        })
    }

    pub fn voucher(&self) -> &OwnershipVoucher {
        &self.voucher
    }

    pub fn private_key(&self) -> Result<PKey<Private>> {
        Ok(PKey::private_key_from_der(&self.private_key)?)
    }

    /// Voucher PEM block followed by the private key PEM block
    pub fn from_pem(data: &[u8]) -> Result<Self> {
        let blocks = pem::parse_many(data)?;
        let (voucher, key) = match blocks.as_slice() {
            [voucher, key] => (voucher, key),
            _ => return Err(Error::InvalidPemTag("expected voucher and key".to_string())),
        };
        if voucher.tag() != VOUCHER_PEM_TAG {
            return Err(Error::InvalidPemTag(voucher.tag().to_string()));
        }
        let private_key = PKey::private_key_from_pem(pem::encode(key).as_bytes())?;
        VoucherDBEntry::new(
            OwnershipVoucher::deserialize_data(voucher.contents())?,
            &private_key,
        )
    }

    pub fn to_pem(&self) -> Result<String> {
        let key = self.private_key()?.private_key_to_pem_pkcs8()?;
        let key = String::from_utf8(key).map_err(|_| Error::InconsistentValue("private key"))?;
        Ok(format!("{}{}", self.voucher.to_pem()?, key))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use openssl::{
        nid::Nid,
        pkey::{PKey, Private, Public},
    };

    use super::{OwnershipVoucher, OwnershipVoucherHeader, VoucherDBEntry};
    use crate::{
        constants::{HashType, RendezvousProtocolValue},
        publickey::{
            test::{build_cert, ec_key},
            PublicKey, X5Chain,
        },
        rendezvous::{RendezvousDirective, RendezvousInfo},
        types::{Guid, HMac},
        Error, Serializable,
    };

    pub(crate) fn public_of(key: &PKey<Private>) -> PublicKey {
        let public: PKey<Public> =
            PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap();
        PublicKey::from_pkey(&public).unwrap()
    }

    pub(crate) struct TestVoucher {
        pub voucher: OwnershipVoucher,
        pub hmac_secret: Vec<u8>,
        pub owner_keys: Vec<PKey<Private>>,
    }

    /// A SECP256R1 voucher with `num_entries` ownership transfers
    pub(crate) fn make_voucher(num_entries: usize) -> TestVoucher {
        let manufacturer_key = ec_key(Nid::X9_62_PRIME256V1);
        let device_ca_key = ec_key(Nid::X9_62_PRIME256V1);
        let device_key = ec_key(Nid::X9_62_PRIME256V1);
        let ca = build_cert("Device CA", &device_ca_key, None, true);
        let leaf = build_cert("Device", &device_key, Some(("Device CA", &device_ca_key)), false);
        let chain = X5Chain::new(vec![leaf, ca]).unwrap();

        let rvinfo = RendezvousInfo::new(vec![RendezvousDirective::for_host(
            "localhost",
            8082,
            RendezvousProtocolValue::Http,
        )
        .unwrap()])
        .unwrap();
        let header = OwnershipVoucherHeader::new(
            Guid::new().unwrap(),
            rvinfo,
            "test-device".to_string(),
            public_of(&manufacturer_key),
            Some(chain.hash(HashType::Sha256).unwrap()),
        )
        .unwrap();
        let hmac_secret = vec![42u8; 32];
        let hmac = HMac::hmac_from_data(
            HashType::HmacSha256,
            &hmac_secret,
            &header.serialize_data().unwrap(),
        )
        .unwrap();
        let mut voucher = OwnershipVoucher::new(&header, hmac, Some(chain)).unwrap();

        let mut owner_keys = vec![manufacturer_key];
        for _ in 0..num_entries {
            let next = ec_key(Nid::X9_62_PRIME256V1);
            voucher
                .extend(owner_keys.last().unwrap(), &public_of(&next))
                .unwrap();
            owner_keys.push(next);
        }

        TestVoucher {
            voucher,
            hmac_secret,
            owner_keys,
        }
    }

    #[test]
    fn test_voucher_chain() {
        let test = make_voucher(4);
        let voucher = OwnershipVoucher::deserialize_data(&test.voucher.serialize_data().unwrap())
            .unwrap();
        let header = voucher.validate().unwrap();
        assert_eq!(voucher.num_entries(), 4);
        assert!(voucher
            .final_owner_public_key()
            .unwrap()
            .matches_pkey(test.owner_keys.last().unwrap()));
        test.voucher
            .header_hmac()
            .verify_hmac(&test.hmac_secret, voucher.header_raw())
            .unwrap();
        assert_eq!(header.device_info(), "test-device");
    }

    #[test]
    fn test_voucher_entry_signature_flipped() {
        let test = make_voucher(4);
        for idx in 0..4 {
            let mut voucher = test.voucher.clone();
            let mut encoded = voucher.entries[idx].serialize_data().unwrap();
            let last = encoded.len() - 1;
            encoded[last] ^= 0x01;
            voucher.entries[idx] = crate::cose::COSESign::deserialize_data(&encoded).unwrap();
            assert!(voucher.validate().is_err(), "entry {} flip accepted", idx);
        }
    }

    #[test]
    fn test_voucher_reordered_and_truncated() {
        let test = make_voucher(4);

        let mut empty = test.voucher.clone();
        empty.entries.clear();
        assert!(matches!(
            empty.validate(),
            Err(Error::InvalidVoucher(_))
        ));
        assert!(empty.final_owner_public_key().is_err());

        let mut swapped = test.voucher.clone();
        swapped.entries.swap(1, 2);
        assert!(swapped.validate().is_err());

        // Dropping the tail still leaves a valid (shorter) chain
        let mut shortened = test.voucher.clone();
        shortened.entries.truncate(2);
        shortened.validate().unwrap();
    }

    #[test]
    fn test_voucher_missing_chain() {
        let test = make_voucher(1);
        let mut voucher = test.voucher.clone();
        voucher.device_certificate_chain = None;
        assert!(voucher.validate().is_err());

        let mut voucher = test.voucher;
        voucher.protocol_version = 100;
        assert!(voucher.validate().is_err());
    }

    #[test]
    fn test_extend_requires_owner() {
        let mut test = make_voucher(2);
        let stranger = ec_key(Nid::X9_62_PRIME256V1);
        assert!(matches!(
            test.voucher.extend(&stranger, &public_of(&stranger)),
            Err(Error::NonOwnerKey)
        ));
        // The previous owner no longer owns it either
        assert!(test
            .voucher
            .extend(&test.owner_keys[1], &public_of(&stranger))
            .is_err());
    }

    #[test]
    fn test_pem() {
        let test = make_voucher(1);
        let pem = test.voucher.to_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN OWNERSHIP VOUCHER-----"));
        let voucher = OwnershipVoucher::from_pem_or_raw(pem.as_bytes()).unwrap();
        voucher.validate().unwrap();

        let raw = test.voucher.serialize_data().unwrap();
        OwnershipVoucher::from_pem_or_raw(&raw).unwrap();

        let entry = VoucherDBEntry::new(test.voucher, test.owner_keys.last().unwrap()).unwrap();
        let entry = VoucherDBEntry::from_pem(entry.to_pem().unwrap().as_bytes()).unwrap();
        assert!(entry
            .voucher()
            .final_owner_public_key()
            .unwrap()
            .matches_pkey(&entry.private_key().unwrap()));
    }
}
