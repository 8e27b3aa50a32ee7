use std::convert::TryFrom;
use std::str::FromStr;

use crate::{errors::Result, Error};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use openssl::hash::MessageDigest;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

mod serviceinfo_names;

pub use serviceinfo_names::{DevmodSim, MANDATORY_DEVMOD_SIMS};

pub const PROTOCOL_MAJOR_VERSION: u16 = 1;
pub const PROTOCOL_MINOR_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq, PartialOrd)]
#[repr(u16)]
#[non_exhaustive]
pub enum ProtocolVersion {
    Version1_0 = 100,
    Version1_1 = 101,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(i8)]
pub enum HashType {
    Sha256 = -16,
    Sha384 = -43,
    HmacSha256 = 5,
    HmacSha384 = 6,
}

impl FromStr for HashType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashType::Sha256),
            "sha384" => Ok(HashType::Sha384),
            "hmac-sha256" => Ok(HashType::HmacSha256),
            "hmac-sha384" => Ok(HashType::HmacSha384),
            _ => Err(Error::InconsistentValue("Invalid digest name")),
        }
    }
}

impl TryFrom<HashType> for MessageDigest {
    type Error = Error;

    fn try_from(ht: HashType) -> Result<MessageDigest> {
        match ht {
            HashType::Sha256 => Ok(MessageDigest::sha256()),
            HashType::Sha384 => Ok(MessageDigest::sha384()),
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }
}

impl HashType {
    pub fn get_md(&self) -> MessageDigest {
        match self {
            HashType::Sha256 | HashType::HmacSha256 => MessageDigest::sha256(),
            HashType::Sha384 | HashType::HmacSha384 => MessageDigest::sha384(),
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashType::Sha256 | HashType::HmacSha256 => 32,
            HashType::Sha384 | HashType::HmacSha384 => 48,
        }
    }

    pub fn is_hmac(&self) -> bool {
        matches!(self, HashType::HmacSha256 | HashType::HmacSha384)
    }

    pub fn inner_hash(&self) -> HashType {
        match self {
            HashType::Sha256 | HashType::HmacSha256 => HashType::Sha256,
            HashType::Sha384 | HashType::HmacSha384 => HashType::Sha384,
        }
    }

    pub fn hmac_variant(&self) -> HashType {
        match self {
            HashType::Sha256 | HashType::HmacSha256 => HashType::HmacSha256,
            HashType::Sha384 | HashType::HmacSha384 => HashType::HmacSha384,
        }
    }
}

const ES256: i16 = -7;
const ES384: i16 = -35;
const RS256: i16 = -257;
const RS384: i16 = -258;

/// The COSE signature algorithms a device or owner may sign with (sgType)
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, Eq, PartialEq)]
#[repr(i16)]
pub enum DeviceSigType {
    StSECP256R1 = ES256,
    StSECP384R1 = ES384,
    StRSA2048 = RS256,
    StRSA3072 = RS384,
    StEPID10 = 90,
    StEPID11 = 91,
}

impl DeviceSigType {
    pub fn from_alg(alg: i64) -> Result<Self> {
        match alg {
            -7 => Ok(DeviceSigType::StSECP256R1),
            -35 => Ok(DeviceSigType::StSECP384R1),
            -257 => Ok(DeviceSigType::StRSA2048),
            -258 => Ok(DeviceSigType::StRSA3072),
            90 => Ok(DeviceSigType::StEPID10),
            91 => Ok(DeviceSigType::StEPID11),
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }

    pub fn alg(&self) -> i64 {
        *self as i16 as i64
    }

    pub fn public_key_type(&self) -> Result<PublicKeyType> {
        match self {
            DeviceSigType::StSECP256R1 => Ok(PublicKeyType::SECP256R1),
            DeviceSigType::StSECP384R1 => Ok(PublicKeyType::SECP384R1),
            DeviceSigType::StRSA2048 => Ok(PublicKeyType::Rsa2048RESTR),
            DeviceSigType::StRSA3072 => Ok(PublicKeyType::RsaPkcs),
            DeviceSigType::StEPID10 | DeviceSigType::StEPID11 => Err(Error::UnsupportedAlgorithm),
        }
    }

    pub fn hash_type(&self) -> Result<HashType> {
        match self {
            DeviceSigType::StSECP256R1 | DeviceSigType::StRSA2048 => Ok(HashType::Sha256),
            DeviceSigType::StSECP384R1 | DeviceSigType::StRSA3072 => Ok(HashType::Sha384),
            DeviceSigType::StEPID10 | DeviceSigType::StEPID11 => Err(Error::UnsupportedAlgorithm),
        }
    }

    pub fn hmac_type(&self) -> Result<HashType> {
        Ok(self.hash_type()?.hmac_variant())
    }

    /// Width of a raw R||S signature, None for RSA
    pub fn ecdsa_signature_len(&self) -> Option<usize> {
        match self {
            DeviceSigType::StSECP256R1 => Some(64),
            DeviceSigType::StSECP384R1 => Some(96),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum PublicKeyType {
    Rsa2048RESTR = 1,
    RsaPkcs = 5,
    RsaPss = 6,
    SECP256R1 = 10,
    SECP384R1 = 11,
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum PublicKeyEncoding {
    Crypto = 0,
    X509 = 1,
    X5CHAIN = 2,
    Cosekey = 3,
}

/// COSE header and EAT claim labels
pub mod header_keys {
    pub const ALG: i64 = 1;
    pub const IV: i64 = 5;

    pub const EAT_NONCE: i64 = 10;
    pub const EAT_UEID: i64 = 11;
    pub const EAT_FDO: i64 = -257;

    pub const CUPH_NONCE: i64 = 256;
    pub const CUPH_OWNER_PUBKEY: i64 = 257;
    pub const EAT_MAROE_PREFIX: i64 = -258;
    pub const EUPH_NONCE: i64 = -259;
}

/// COSE key labels and values
pub mod cose_key {
    pub const KTY: i64 = 1;
    pub const ALG: i64 = 3;
    pub const EC2_CRV: i64 = -1;
    pub const EC2_X: i64 = -2;
    pub const EC2_Y: i64 = -3;
    pub const RSA_N: i64 = -1;
    pub const RSA_E: i64 = -2;

    pub const KTY_EC2: i64 = 2;
    pub const KTY_RSA: i64 = 3;

    pub const CRV_P256: i64 = 1;
    pub const CRV_P384: i64 = 2;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KexSuite {
    #[serde(rename = "DHKEXid14")]
    DhkexId14,
    #[serde(rename = "DHKEXid15")]
    DhkexId15,
    #[serde(rename = "ASYMKEX2048")]
    Asymkex2048,
    #[serde(rename = "ASYMKEX3072")]
    Asymkex3072,
    #[serde(rename = "ECDH256")]
    Ecdh256,
    #[serde(rename = "ECDH384")]
    Ecdh384,
}

impl KexSuite {
    pub fn name(&self) -> &'static str {
        match self {
            KexSuite::DhkexId14 => "DHKEXid14",
            KexSuite::DhkexId15 => "DHKEXid15",
            KexSuite::Asymkex2048 => "ASYMKEX2048",
            KexSuite::Asymkex3072 => "ASYMKEX3072",
            KexSuite::Ecdh256 => "ECDH256",
            KexSuite::Ecdh384 => "ECDH384",
        }
    }
}

impl FromStr for KexSuite {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DHKEXid14" => Ok(KexSuite::DhkexId14),
            "DHKEXid15" => Ok(KexSuite::DhkexId15),
            "ASYMKEX2048" => Ok(KexSuite::Asymkex2048),
            "ASYMKEX3072" => Ok(KexSuite::Asymkex3072),
            "ECDH256" => Ok(KexSuite::Ecdh256),
            "ECDH384" => Ok(KexSuite::Ecdh384),
            other => Err(Error::InvalidSuiteName(other.to_string())),
        }
    }
}

impl std::fmt::Display for KexSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(i32)]
pub enum CipherSuite {
    A128Gcm = 1,
    A256Gcm = 3,
    AesCcm16_128_128 = 30,
    AesCcm16_128_256 = 31,
    AesCcm64_128_128 = 32,
    AesCcm64_128_256 = 33,
    CoseAes128Cbc = -17760703,
    CoseAes128Ctr = -17760704,
    CoseAes256Cbc = -17760705,
    CoseAes256Ctr = -17760706,
}

impl CipherSuite {
    pub fn from_alg(alg: i64) -> Result<Self> {
        match alg {
            1 => Ok(CipherSuite::A128Gcm),
            3 => Ok(CipherSuite::A256Gcm),
            30 => Ok(CipherSuite::AesCcm16_128_128),
            31 => Ok(CipherSuite::AesCcm16_128_256),
            32 => Ok(CipherSuite::AesCcm64_128_128),
            33 => Ok(CipherSuite::AesCcm64_128_256),
            -17760703 => Ok(CipherSuite::CoseAes128Cbc),
            -17760704 => Ok(CipherSuite::CoseAes128Ctr),
            -17760705 => Ok(CipherSuite::CoseAes256Cbc),
            -17760706 => Ok(CipherSuite::CoseAes256Ctr),
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }

    pub fn alg(&self) -> i64 {
        *self as i32 as i64
    }
}

impl FromStr for CipherSuite {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A128GCM" => Ok(CipherSuite::A128Gcm),
            "A256GCM" => Ok(CipherSuite::A256Gcm),
            "AES-CCM-16-128-128" => Ok(CipherSuite::AesCcm16_128_128),
            "AES-CCM-16-128-256" => Ok(CipherSuite::AesCcm16_128_256),
            "AES-CCM-64-128-128" => Ok(CipherSuite::AesCcm64_128_128),
            "AES-CCM-64-128-256" => Ok(CipherSuite::AesCcm64_128_256),
            "AES128/CBC" => Ok(CipherSuite::CoseAes128Cbc),
            "AES128/CTR" => Ok(CipherSuite::CoseAes128Ctr),
            "AES256/CBC" => Ok(CipherSuite::CoseAes256Cbc),
            "AES256/CTR" => Ok(CipherSuite::CoseAes256Ctr),
            other => Err(Error::InvalidSuiteName(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportProtocol {
    Tcp = 1,
    Tls = 2,
    Http = 3,
    CoAP = 4,
    Https = 5,
    CoAPS = 6,
}

impl TransportProtocol {
    pub fn url_scheme(&self) -> Option<&'static str> {
        match self {
            TransportProtocol::Http => Some("http"),
            TransportProtocol::Https => Some("https"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum RendezvousVariable {
    DeviceOnly = 0,
    OwnerOnly = 1,
    IPAddress = 2,
    DevicePort = 3,
    OwnerPort = 4,
    Dns = 5,
    ServerCertHash = 6,
    CaCertHash = 7,
    UserInput = 8,
    WifiSsid = 9,
    WifiPw = 10,
    Medium = 11,
    Protocol = 12,
    Delaysec = 13,
    Bypass = 14,
    ExtRV = 15,
}

impl RendezvousVariable {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            RendezvousVariable::DeviceOnly => "device-only",
            RendezvousVariable::OwnerOnly => "owner-only",
            RendezvousVariable::IPAddress => "ip-address",
            RendezvousVariable::DevicePort => "device-port",
            RendezvousVariable::OwnerPort => "owner-port",
            RendezvousVariable::Dns => "dns",
            RendezvousVariable::ServerCertHash => "server-cert-hash",
            RendezvousVariable::CaCertHash => "ca-cert-hash",
            RendezvousVariable::UserInput => "user-input",
            RendezvousVariable::WifiSsid => "wifi-ssid",
            RendezvousVariable::WifiPw => "wifi-pw",
            RendezvousVariable::Medium => "medium",
            RendezvousVariable::Protocol => "protocol",
            RendezvousVariable::Delaysec => "delay-sec",
            RendezvousVariable::Bypass => "bypass",
            RendezvousVariable::ExtRV => "ext-rv",
        }
    }
}

impl FromStr for RendezvousVariable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match &s.to_lowercase()[..] {
            "deviceonly" | "device_only" => RendezvousVariable::DeviceOnly,
            "owneronly" | "owner_only" => RendezvousVariable::OwnerOnly,
            "ipaddress" | "ip_address" | "ip" => RendezvousVariable::IPAddress,
            "deviceport" | "device_port" => RendezvousVariable::DevicePort,
            "ownerport" | "owner_port" => RendezvousVariable::OwnerPort,
            "dns" => RendezvousVariable::Dns,
            "servercerthash" | "server_cert_hash" => RendezvousVariable::ServerCertHash,
            "cacerthash" | "ca_cert_hash" => RendezvousVariable::CaCertHash,
            "userinput" | "user_input" => RendezvousVariable::UserInput,
            "wifissid" | "wifi_ssid" => RendezvousVariable::WifiSsid,
            "wifipw" | "wifi_pw" => RendezvousVariable::WifiPw,
            "medium" => RendezvousVariable::Medium,
            "protocol" => RendezvousVariable::Protocol,
            "delaysec" | "delay_sec" | "delay" => RendezvousVariable::Delaysec,
            "bypass" => RendezvousVariable::Bypass,
            "extrv" | "ext_rv" => RendezvousVariable::ExtRV,
            _ => return Err(Error::InconsistentValue("variable-name")),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum RendezvousProtocolValue {
    Rest = 0,
    Http = 1,
    Https = 2,
    Tcp = 3,
    Tls = 4,
    CoAPTCP = 5,
    CoAPUDP = 6,
}

impl FromStr for RendezvousProtocolValue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match &s.to_lowercase()[..] {
            "rest" => RendezvousProtocolValue::Rest,
            "http" => RendezvousProtocolValue::Http,
            "https" => RendezvousProtocolValue::Https,
            "tcp" => RendezvousProtocolValue::Tcp,
            "tls" => RendezvousProtocolValue::Tls,
            "coaptcp" => RendezvousProtocolValue::CoAPTCP,
            "coapudp" => RendezvousProtocolValue::CoAPUDP,
            _ => return Err(Error::InconsistentValue("protocol")),
        })
    }
}

impl RendezvousProtocolValue {
    pub(crate) fn from_u8(val: u8) -> Result<Self> {
        Ok(match val {
            0 => RendezvousProtocolValue::Rest,
            1 => RendezvousProtocolValue::Http,
            2 => RendezvousProtocolValue::Https,
            3 => RendezvousProtocolValue::Tcp,
            4 => RendezvousProtocolValue::Tls,
            5 => RendezvousProtocolValue::CoAPTCP,
            6 => RendezvousProtocolValue::CoAPUDP,
            _ => return Err(Error::InconsistentValue("protocol")),
        })
    }

    pub(crate) fn default_port(&self) -> Option<u16> {
        match self {
            RendezvousProtocolValue::Http => Some(80),
            RendezvousProtocolValue::Https => Some(443),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // Transfer Ownership protocol 0 (TO0)
    TO0Hello = 20,
    TO0HelloAck = 21,
    TO0OwnerSign = 22,
    TO0AcceptOwner = 23,
    // Transfer Ownership protocol 1 (TO1)
    TO1HelloRV = 30,
    TO1HelloRVAck = 31,
    TO1ProveToRV = 32,
    TO1RVRedirect = 33,
    // Transfer Ownership protocol 2 (TO2)
    TO2HelloDevice = 60,
    TO2ProveOVHdr = 61,
    TO2GetOVNextEntry = 62,
    TO2OVNextEntry = 63,
    TO2ProveDevice = 64,
    TO2SetupDevice = 65,
    TO2DeviceServiceInfoReady = 66,
    TO2OwnerServiceInfoReady = 67,
    TO2DeviceServiceInfo = 68,
    TO2OwnerServiceInfo = 69,
    TO2Done = 70,
    TO2Done2 = 71,

    // Error
    Error = 255,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        MessageType::from_u8(value).ok_or(Error::InconsistentValue("message type"))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidJwtToken = 1,
    InvalidOwnershipVoucher = 2,
    InvalidOwnerSignBody = 3,
    InvalidIPAddress = 4,
    InvalidGUID = 5,
    ResourceNotFound = 6,
    MessageBodyError = 100,
    InvalidMessageError = 101,
    CredReuseError = 102,
    InternalServerError = 500,
}

#[cfg(test)]
mod test {
    use std::convert::TryFrom;

    use super::{CipherSuite, DeviceSigType, KexSuite, MessageType, PublicKeyType};
    use crate::Serializable;

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(
            MessageType::try_from(61).unwrap(),
            MessageType::TO2ProveOVHdr
        );
        assert_eq!(MessageType::try_from(255).unwrap(), MessageType::Error);
        assert!(MessageType::try_from(24).is_err());
    }

    #[test]
    fn test_kex_suite_wire_name() {
        let encoded = KexSuite::DhkexId14.serialize_data().unwrap();
        let decoded = String::deserialize_data(&encoded).unwrap();
        assert_eq!(decoded, "DHKEXid14");
        assert_eq!(
            KexSuite::deserialize_data(&"ECDH384".to_string().serialize_data().unwrap()).unwrap(),
            KexSuite::Ecdh384
        );
        assert!("ECDH521".parse::<KexSuite>().is_err());
    }

    #[test]
    fn test_cipher_suite_negative_ids() {
        let encoded = CipherSuite::CoseAes256Ctr.serialize_data().unwrap();
        assert_eq!(
            CipherSuite::deserialize_data(&encoded).unwrap(),
            CipherSuite::CoseAes256Ctr
        );
        assert_eq!(
            CipherSuite::from_alg(-17760703).unwrap(),
            CipherSuite::CoseAes128Cbc
        );
    }

    #[test]
    fn test_sig_type_mapping() {
        assert_eq!(
            DeviceSigType::StSECP384R1.public_key_type().unwrap(),
            PublicKeyType::SECP384R1
        );
        assert_eq!(DeviceSigType::StSECP256R1.ecdsa_signature_len(), Some(64));
        assert_eq!(DeviceSigType::StSECP384R1.ecdsa_signature_len(), Some(96));
        assert!(DeviceSigType::StEPID10.hash_type().is_err());
        assert_eq!(
            DeviceSigType::from_alg(-258).unwrap(),
            DeviceSigType::StRSA3072
        );
    }
}
