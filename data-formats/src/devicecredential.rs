use std::path::Path;

use openssl::pkey::{PKey, PKeyRef, Private};
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use crate::{
    constants::{HashType, ProtocolVersion},
    cose::sig_type_for_key,
    errors::Result,
    ownershipvoucher::OwnershipVoucherHeader,
    publickey::X5Chain,
    rendezvous::RendezvousInfo,
    types::{Guid, HMac, Hash, SigInfo},
    Error, Serializable,
};

/// Secret state a device holds from manufacturing onwards
#[derive(Clone, Serialize_tuple, Deserialize_tuple)]
pub struct DeviceCredential {
    active: bool,
    protocol_version: u16,
    #[serde(with = "serde_bytes")]
    hmac_secret: Vec<u8>,
    hmac_alg: HashType,
    hash_alg: HashType,
    device_info: String,
    guid: Guid,
    rvinfo: RendezvousInfo,
    pubkey_hash: Hash,
    #[serde(with = "serde_bytes")]
    private_key: Vec<u8>,
    certificate_chain: X5Chain,
    certificate_chain_hash: Hash,
    sig_info: SigInfo,
}

impl std::fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("active", &self.active)
            .field("protocol_version", &self.protocol_version)
            .field("hmac_alg", &self.hmac_alg)
            .field("hash_alg", &self.hash_alg)
            .field("device_info", &self.device_info)
            .field("guid", &self.guid)
            .field("rvinfo", &self.rvinfo)
            .field("pubkey_hash", &self.pubkey_hash)
            .field("certificate_chain_hash", &self.certificate_chain_hash)
            .field("sig_info", &self.sig_info)
            .finish_non_exhaustive()
    }
}

impl DeviceCredential {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hmac_secret: Vec<u8>,
        hmac_alg: HashType,
        device_info: String,
        guid: Guid,
        rvinfo: RendezvousInfo,
        pubkey_hash: Hash,
        private_key: &PKeyRef<Private>,
        certificate_chain: X5Chain,
    ) -> Result<Self> {
        if !hmac_alg.is_hmac() {
            return Err(Error::UnsupportedAlgorithm);
        }
        if !certificate_chain
            .leaf_certificate()
            .public_key()?
            .public_eq(private_key)
        {
            return Err(Error::InconsistentValue("device key and certificate"));
        }
        let hash_alg = hmac_alg.inner_hash();
        let sig_info = SigInfo::new(sig_type_for_key(private_key)?, Vec::new());

        Ok(DeviceCredential {
            active: true,
            protocol_version: ProtocolVersion::Version1_1 as u16,
            hmac_secret,
            hmac_alg,
            hash_alg,
            device_info,
            guid,
            rvinfo,
            pubkey_hash,
            private_key: private_key.private_key_to_der()?,
            certificate_chain_hash: certificate_chain.hash(hash_alg)?,
            certificate_chain,
            sig_info,
        })
    }

    pub fn read_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::deserialize_data(&data)
    }

    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.serialize_data()?)?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn hmac_alg(&self) -> HashType {
        self.hmac_alg
    }

    pub fn hash_alg(&self) -> HashType {
        self.hash_alg
    }

    pub fn device_info(&self) -> &str {
        &self.device_info
    }

    pub fn device_guid(&self) -> &Guid {
        &self.guid
    }

    pub fn rendezvous_info(&self) -> &RendezvousInfo {
        &self.rvinfo
    }

    pub fn manufacturer_pubkey_hash(&self) -> &Hash {
        &self.pubkey_hash
    }

    pub fn certificate_chain(&self) -> &X5Chain {
        &self.certificate_chain
    }

    pub fn certificate_chain_hash(&self) -> &Hash {
        &self.certificate_chain_hash
    }

    pub fn sig_info(&self) -> &SigInfo {
        &self.sig_info
    }

    pub fn private_key(&self) -> Result<PKey<Private>> {
        Ok(PKey::private_key_from_der(&self.private_key)?)
    }

    pub fn compute_hmac(&self, data: &[u8]) -> Result<HMac> {
        HMac::hmac_from_data(self.hmac_alg, &self.hmac_secret, data)
    }

    pub fn verify_hmac(&self, data: &[u8], hmac: &HMac) -> Result<()> {
        hmac.verify_hmac(&self.hmac_secret, data)
    }

    /// Checks a voucher header presented by a claimed owner against this
    /// credential, apart from the HMAC which covers the raw header bytes.
    pub fn check_voucher_header(&self, header: &OwnershipVoucherHeader) -> Result<()> {
        if header.guid() != &self.guid {
            return Err(Error::InconsistentValue("voucher guid"));
        }
        let manufacturer_key_hash =
            header.manufacturer_public_key_hash(self.pubkey_hash.get_type())?;
        if let Err(e) = self.pubkey_hash.compare(&manufacturer_key_hash) {
            log::error!("Manufacturer public key hash does not match the credential");
            return Err(e);
        }
        match header.device_certificate_chain_hash() {
            Some(chain_hash) => chain_hash.compare(&self.certificate_chain_hash),
            None => Err(Error::InconsistentValue("certificate chain hash")),
        }
    }

    /// A copy carrying the identity assigned by a new owner
    pub fn replaced(&self, guid: Guid, rvinfo: RendezvousInfo, pubkey_hash: Hash) -> Self {
        DeviceCredential {
            guid,
            rvinfo,
            pubkey_hash,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use openssl::nid::Nid;

    use super::DeviceCredential;
    use crate::{
        constants::{HashType, RendezvousProtocolValue},
        ownershipvoucher::test::public_of,
        ownershipvoucher::OwnershipVoucherHeader,
        publickey::{
            test::{build_cert, ec_key},
            X5Chain,
        },
        rendezvous::{RendezvousDirective, RendezvousInfo},
        types::Guid,
        Serializable,
    };

    fn rvinfo() -> RendezvousInfo {
        RendezvousInfo::new(vec![RendezvousDirective::for_host(
            "rv.example.com",
            8082,
            RendezvousProtocolValue::Http,
        )
        .unwrap()])
        .unwrap()
    }

    #[test]
    fn test_credential_matches_header() {
        let manufacturer_key = ec_key(Nid::X9_62_PRIME256V1);
        let ca_key = ec_key(Nid::X9_62_PRIME256V1);
        let device_key = ec_key(Nid::X9_62_PRIME256V1);
        let chain = X5Chain::new(vec![
            build_cert("dev", &device_key, Some(("ca", &ca_key)), false),
            build_cert("ca", &ca_key, None, true),
        ])
        .unwrap();
        let manufacturer_pub = public_of(&manufacturer_key);
        let guid = Guid::new().unwrap();

        let cred = DeviceCredential::new(
            vec![7u8; 32],
            HashType::HmacSha256,
            "testdevice".to_string(),
            guid.clone(),
            rvinfo(),
            manufacturer_pub.hash(HashType::Sha256).unwrap(),
            &device_key,
            chain.clone(),
        )
        .unwrap();
        assert_eq!(cred.hash_alg(), HashType::Sha256);

        let header = OwnershipVoucherHeader::new(
            guid,
            rvinfo(),
            "testdevice".to_string(),
            manufacturer_pub,
            Some(chain.hash(HashType::Sha256).unwrap()),
        )
        .unwrap();
        cred.check_voucher_header(&header).unwrap();

        let header_raw = header.serialize_data().unwrap();
        let hmac = cred.compute_hmac(&header_raw).unwrap();
        cred.verify_hmac(&header_raw, &hmac).unwrap();
        assert!(cred.verify_hmac(b"other", &hmac).is_err());

        let stranger = OwnershipVoucherHeader::new(
            Guid::new().unwrap(),
            rvinfo(),
            "testdevice".to_string(),
            public_of(&ec_key(Nid::X9_62_PRIME256V1)),
            Some(chain.hash(HashType::Sha256).unwrap()),
        )
        .unwrap();
        assert!(cred.check_voucher_header(&stranger).is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        cred.write_to_path(file.path()).unwrap();
        let loaded = DeviceCredential::read_from_path(file.path()).unwrap();
        assert_eq!(loaded.device_guid(), cred.device_guid());
        assert!(loaded.private_key().unwrap().public_eq(&device_key));
    }

    #[test]
    fn test_credential_key_must_match_chain() {
        let ca_key = ec_key(Nid::X9_62_PRIME256V1);
        let device_key = ec_key(Nid::X9_62_PRIME256V1);
        let chain = X5Chain::new(vec![
            build_cert("dev", &device_key, Some(("ca", &ca_key)), false),
            build_cert("ca", &ca_key, None, true),
        ])
        .unwrap();
        let pubkey_hash = public_of(&ca_key).hash(HashType::Sha256).unwrap();

        assert!(DeviceCredential::new(
            vec![1u8; 32],
            HashType::HmacSha256,
            "x".to_string(),
            Guid::new().unwrap(),
            rvinfo(),
            pubkey_hash,
            &ca_key,
            chain,
        )
        .is_err());
    }
}
