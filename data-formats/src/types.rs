use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use openssl::{hash::hash, pkey::PKey, sign::Signer};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use crate::{
    constants::{DeviceSigType, HashType, TransportProtocol},
    errors::{Error, Result},
    from_cbor,
    ownershipvoucher::OwnershipVoucher,
    to_cbor,
};

#[derive(Debug, Serialize_tuple, Clone, PartialEq, Eq)]
pub struct Hash {
    hash_type: HashType, // hashtype
    #[serde(with = "serde_bytes")]
    value: Vec<u8>, // hash
}

#[derive(Deserialize_tuple)]
struct UncheckedHash {
    hash_type: HashType,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = UncheckedHash::deserialize(deserializer)?;
        Hash::from_digest(raw.hash_type, raw.value).map_err(serde::de::Error::custom)
    }
}

impl Hash {
    pub fn from_data(alg: HashType, data: &[u8]) -> Result<Self> {
        if alg.is_hmac() {
            return Err(Error::UnsupportedAlgorithm);
        }

        Ok(Hash {
            hash_type: alg,
            value: hash(alg.try_into()?, data)?.to_vec(),
        })
    }

    pub fn from_digest(hash_type: HashType, value: Vec<u8>) -> Result<Self> {
        if value.len() != hash_type.digest_size() {
            log::trace!(
                "Digest of {} bytes does not fit {:?}",
                value.len(),
                hash_type
            );
            return Err(Error::IncorrectHash);
        }
        Ok(Hash { hash_type, value })
    }

    pub fn get_type(&self) -> HashType {
        self.hash_type
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn compare_data(&self, other: &[u8]) -> Result<()> {
        let other_digest = hash(self.hash_type.try_into()?, other)?;

        // Compare
        if openssl::memcmp::eq(&self.value, &other_digest) {
            Ok(())
        } else {
            Err(Error::IncorrectHash)
        }
    }

    pub fn compare(&self, other: &Hash) -> Result<()> {
        if self.hash_type != other.hash_type || self.value.len() != other.value.len() {
            return Err(Error::IncorrectHash);
        }
        if openssl::memcmp::eq(&self.value, &other.value) {
            Ok(())
        } else {
            Err(Error::IncorrectHash)
        }
    }

    pub(crate) fn corrupted(&self) -> Hash {
        let mut value = self.value.clone();
        if let Some(first) = value.first_mut() {
            *first ^= 0xFF;
        }
        Hash {
            hash_type: self.hash_type,
            value,
        }
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", hex::encode(&self.value), self.hash_type)
    }
}

/// A keyed digest; shares the wire layout of [`Hash`]
pub type HMac = Hash;

impl HMac {
    pub fn hmac_from_data(alg: HashType, key: &[u8], data: &[u8]) -> Result<Self> {
        if !alg.is_hmac() {
            return Err(Error::UnsupportedAlgorithm);
        }
        let pkey = PKey::hmac(key)?;
        let mut signer = Signer::new(alg.get_md(), &pkey)?;
        signer.update(data)?;

        Ok(Hash {
            hash_type: alg,
            value: signer.sign_to_vec()?,
        })
    }

    pub fn verify_hmac(&self, key: &[u8], data: &[u8]) -> Result<()> {
        let computed = HMac::hmac_from_data(self.hash_type, key, data)?;
        self.compare(&computed)
    }
}

#[derive(Debug, Serialize_tuple, Deserialize_tuple, Clone, PartialEq, Eq)]
pub struct SigInfo {
    sig_type: DeviceSigType, // sgType
    #[serde(with = "serde_bytes")]
    info: Vec<u8>, // Info
}

impl SigInfo {
    pub fn new(dst: DeviceSigType, info: Vec<u8>) -> Self {
        SigInfo {
            sig_type: dst,
            info,
        }
    }

    pub fn sig_type(&self) -> DeviceSigType {
        self.sig_type
    }

    pub fn info(&self) -> &[u8] {
        &self.info
    }
}

fn new_nonce_or_guid_val() -> Result<[u8; 16]> {
    let mut val = [0u8; 16];

    openssl::rand::rand_bytes(&mut val)?;

    Ok(val)
}

struct Bytes16Visitor(&'static str);

impl<'de> serde::de::Visitor<'de> for Bytes16Visitor {
    type Value = [u8; 16];

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a 16-byte {}", self.0)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        self.visit_bytes(&v)
    }
}

macro_rules! bytes16_type {
    ($name:ident, $what:literal) => {
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserializer
                    .deserialize_bytes(Bytes16Visitor($what))
                    .map($name)
            }
        }

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = Error;

            fn try_from(value: &[u8]) -> Result<Self> {
                Ok($name(
                    value
                        .try_into()
                        .map_err(|_| Error::InconsistentValue($what))?,
                ))
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce([u8; 16]);

bytes16_type!(Nonce, "nonce");

impl Nonce {
    pub fn new() -> Result<Nonce> {
        Ok(Nonce(new_nonce_or_guid_val()?))
    }

    pub fn compare(&self, other: &Nonce) -> Result<()> {
        if openssl::memcmp::eq(&self.0, &other.0) {
            Ok(())
        } else {
            Err(Error::IncorrectNonce)
        }
    }

    pub(crate) fn corrupted(&self) -> Nonce {
        let mut value = self.0;
        value[0] ^= 0xFF;
        Nonce(value)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Hash, Eq)]
pub struct Guid([u8; 16]);

bytes16_type!(Guid, "guid");

impl Guid {
    pub fn new() -> Result<Guid> {
        Ok(Guid(new_nonce_or_guid_val()?))
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.0)
    }

    /// The EAT UEID claim: type byte 0x01 followed by the GUID
    pub fn as_ueid(&self) -> Vec<u8> {
        let mut ueid = Vec::with_capacity(17);
        ueid.push(1);
        ueid.extend_from_slice(&self.0);
        ueid
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid())
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Guid> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| Error::InconsistentValue("guid"))?;
        Ok(Guid(*uuid.as_bytes()))
    }
}

pub use std::net::{IpAddr as IPAddress, Ipv4Addr as IP4, Ipv6Addr as IP6};

pub type DNSAddress = String;
pub type Port = u16;

pub(crate) fn ip_to_bytes(addr: &IPAddress) -> Vec<u8> {
    match addr {
        IPAddress::V4(v) => v.octets().to_vec(),
        IPAddress::V6(v) => v.octets().to_vec(),
    }
}

pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Result<IPAddress> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes
                .try_into()
                .map_err(|_| Error::InconsistentValue("ip-address"))?;
            Ok(IPAddress::V4(IP4::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes
                .try_into()
                .map_err(|_| Error::InconsistentValue("ip-address"))?;
            Ok(IPAddress::V6(IP6::from(octets)))
        }
        _ => Err(Error::InconsistentValue("ip-address")),
    }
}

#[derive(Debug, Serialize_tuple, Deserialize_tuple, Clone, PartialEq)]
pub struct TO2AddressEntry {
    ip: Option<ByteBuf>,         // RVIP
    dns: Option<DNSAddress>,     // RVDNS
    port: Port,                  // RVPort
    protocol: TransportProtocol, // RVProtocol
}

impl TO2AddressEntry {
    pub fn new(
        ip: Option<IPAddress>,
        dns: Option<DNSAddress>,
        port: Port,
        protocol: TransportProtocol,
    ) -> Self {
        TO2AddressEntry {
            ip: ip.as_ref().map(|ip| ByteBuf::from(ip_to_bytes(ip))),
            dns,
            port,
            protocol,
        }
    }

    pub fn ip(&self) -> Result<Option<IPAddress>> {
        self.ip
            .as_ref()
            .map(|ip| ip_from_bytes(ip))
            .transpose()
    }

    pub fn dns(&self) -> Option<&DNSAddress> {
        self.dns.as_ref()
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    /// An entry must name at least one of IP or DNS
    pub fn validate(&self) -> Result<()> {
        if self.ip.is_none() && self.dns.is_none() {
            return Err(Error::InconsistentValue("TO2 address without ip or dns"));
        }
        self.ip()?;
        Ok(())
    }

    pub fn urls(&self) -> Result<Vec<String>> {
        let scheme = match self.protocol.url_scheme() {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        let mut urls = Vec::new();
        if let Some(dns) = &self.dns {
            urls.push(format!("{}://{}:{}", scheme, dns, self.port));
        }
        match self.ip()? {
            Some(IPAddress::V4(v4)) => urls.push(format!("{}://{}:{}", scheme, v4, self.port)),
            Some(IPAddress::V6(v6)) => urls.push(format!("{}://[{}]:{}", scheme, v6, self.port)),
            None => {}
        }
        Ok(urls)
    }
}

#[derive(Debug, Serialize_tuple, Deserialize_tuple, Clone)]
pub struct TO0Data {
    ownership_voucher: OwnershipVoucher,
    wait_seconds: u32,
    nonce: Nonce,
}

impl TO0Data {
    pub fn new(ownership_voucher: OwnershipVoucher, wait_seconds: u32, nonce: Nonce) -> Self {
        TO0Data {
            ownership_voucher,
            wait_seconds,
            nonce,
        }
    }

    pub fn ownership_voucher(&self) -> &OwnershipVoucher {
        &self.ownership_voucher
    }

    pub fn wait_seconds(&self) -> u32 {
        self.wait_seconds
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

#[derive(Debug, Serialize_tuple, Deserialize_tuple, Clone)]
pub struct TO1DataPayload {
    to2_addresses: Vec<TO2AddressEntry>,
    to1d_to_to0d_hash: Hash,
}

impl TO1DataPayload {
    pub fn new(to2_addresses: Vec<TO2AddressEntry>, to1d_to_to0d_hash: Hash) -> Self {
        TO1DataPayload {
            to2_addresses,
            to1d_to_to0d_hash,
        }
    }

    pub fn to2_addresses(&self) -> &[TO2AddressEntry] {
        &self.to2_addresses
    }

    pub fn to1d_to_to0d_hash(&self) -> &Hash {
        &self.to1d_to_to0d_hash
    }
}

#[derive(Debug, Serialize_tuple, Deserialize_tuple, Clone, PartialEq, Eq)]
pub struct ServiceInfoKV {
    key: String,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
}

impl ServiceInfoKV {
    pub fn new(key: &str, value: Vec<u8>) -> Self {
        ServiceInfoKV {
            key: key.to_string(),
            value,
        }
    }

    /// Builds an entry whose value is the CBOR encoding of `value`
    pub fn new_encoded<T: Serialize>(key: &str, value: &T) -> Result<Self> {
        Ok(ServiceInfoKV::new(key, to_cbor(value)?))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn decode_value<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        from_cbor(&self.value)
    }
}

pub type ServiceInfo = Vec<ServiceInfoKV>;

pub fn new_random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf)?;
    Ok(buf)
}
