use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::fmt::Display;

use ciborium::value::{Integer, Value};
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    nid::Nid,
    pkey::{self, PKey, PKeyRef, Public},
    rsa::Rsa,
    stack::Stack,
    x509::{store::X509StoreBuilder, X509StoreContext, X509VerifyResult, X509},
};
use serde::{
    de::Error as _,
    ser::{Error as _, SerializeSeq, SerializeTuple},
    Deserialize, Serialize,
};

use crate::{
    constants::{cose_key, HashType, PublicKeyEncoding, PublicKeyType},
    errors::{ChainError, Error, Result},
    types::Hash,
    Serializable,
};

/// Encoding-specific body of a public key
#[derive(Debug, Clone)]
pub enum PublicKeyBody {
    /// DER encoded SubjectPublicKeyInfo
    X509(Vec<u8>),
    X5Chain(X5Chain),
    /// COSE_Key map, kept as received
    CoseKey(Value),
}

#[derive(Debug, Clone)]
pub struct PublicKey {
    key_type: PublicKeyType,
    body: PublicKeyBody,

    pkey: PKey<Public>,
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.key_type)?;
        tuple.serialize_element(&self.encoding())?;
        match &self.body {
            PublicKeyBody::X509(der) => tuple.serialize_element(serde_bytes::Bytes::new(der))?,
            PublicKeyBody::X5Chain(chain) => tuple.serialize_element(chain)?,
            PublicKeyBody::CoseKey(map) => tuple.serialize_element(map)?,
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<PublicKey, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PublicKeyVisitor;

        impl<'de> serde::de::Visitor<'de> for PublicKeyVisitor {
            type Value = PublicKey;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a tuple of (PublicKeyType, PublicKeyEncoding, body)")
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let key_type: PublicKeyType = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let encoding: PublicKeyEncoding = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                let body = match encoding {
                    PublicKeyEncoding::X509 => {
                        let der: serde_bytes::ByteBuf = seq
                            .next_element()?
                            .ok_or_else(|| serde::de::Error::invalid_length(2, &self))?;
                        PublicKeyBody::X509(der.into_vec())
                    }
                    PublicKeyEncoding::X5CHAIN => PublicKeyBody::X5Chain(
                        seq.next_element()?
                            .ok_or_else(|| serde::de::Error::invalid_length(2, &self))?,
                    ),
                    PublicKeyEncoding::Cosekey => PublicKeyBody::CoseKey(
                        seq.next_element()?
                            .ok_or_else(|| serde::de::Error::invalid_length(2, &self))?,
                    ),
                    PublicKeyEncoding::Crypto => {
                        return Err(A::Error::custom(Error::UnsupportedKeyEncoding))
                    }
                };

                PublicKey::new(key_type, body).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_tuple(3, PublicKeyVisitor)
    }
}

impl PublicKey {
    pub fn new(key_type: PublicKeyType, body: PublicKeyBody) -> Result<Self> {
        log::trace!("Parsing public key, type: {:?}, body: {:?}", key_type, body);
        let pkey = match &body {
            PublicKeyBody::X509(der) => PKey::public_key_from_der(der)?,
            PublicKeyBody::X5Chain(chain) => chain.leaf_certificate().public_key()?,
            PublicKeyBody::CoseKey(map) => pkey_from_cose_key(map)?,
        };

        let actual_type = PublicKey::key_type_from_pkey(&pkey)?;
        if !key_type_compatible(key_type, actual_type, pkey.bits()) {
            log::debug!(
                "Public key claims type {:?} but contains a {:?} key",
                key_type,
                actual_type
            );
            return Err(Error::UnsupportedKeyEncoding);
        }

        Ok(PublicKey {
            key_type,
            body,
            pkey,
        })
    }

    /// Wraps a bare key in the X509 (SubjectPublicKeyInfo) encoding
    pub fn from_pkey(pkey: &PKeyRef<Public>) -> Result<Self> {
        let key_type = PublicKey::key_type_from_pkey(pkey)?;
        let der = pkey.public_key_to_der()?;
        PublicKey::new(key_type, PublicKeyBody::X509(der))
    }

    /// Wraps a bare key in the COSE_Key encoding
    pub fn from_pkey_as_cose_key(pkey: &PKeyRef<Public>) -> Result<Self> {
        let key_type = PublicKey::key_type_from_pkey(pkey)?;
        let map = cose_key_from_pkey(pkey)?;
        PublicKey::new(key_type, PublicKeyBody::CoseKey(map))
    }

    pub fn chain(&self) -> Option<&X5Chain> {
        match &self.body {
            PublicKeyBody::X5Chain(chain) => Some(chain),
            _ => None,
        }
    }

    pub fn keytype(&self) -> PublicKeyType {
        self.key_type
    }

    pub fn encoding(&self) -> PublicKeyEncoding {
        match self.body {
            PublicKeyBody::X509(_) => PublicKeyEncoding::X509,
            PublicKeyBody::X5Chain(_) => PublicKeyEncoding::X5CHAIN,
            PublicKeyBody::CoseKey(_) => PublicKeyEncoding::Cosekey,
        }
    }

    pub fn body(&self) -> &PublicKeyBody {
        &self.body
    }

    fn key_type_from_pkey(pkey: &PKeyRef<Public>) -> Result<PublicKeyType> {
        match pkey.id() {
            pkey::Id::EC => match pkey.ec_key()?.group().curve_name() {
                Some(Nid::X9_62_PRIME256V1) => Ok(PublicKeyType::SECP256R1),
                Some(Nid::SECP384R1) => Ok(PublicKeyType::SECP384R1),
                _ => Err(Error::UnsupportedAlgorithm),
            },
            pkey::Id::RSA => match pkey.bits() {
                2048 => Ok(PublicKeyType::Rsa2048RESTR),
                3072 => Ok(PublicKeyType::RsaPkcs),
                _ => Err(Error::UnsupportedAlgorithm),
            },
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }

    /// The key bytes as carried in the message, without any chain checks
    pub fn pkey(&self) -> &PKeyRef<Public> {
        &self.pkey
    }

    /// The key to verify signatures with. For X5CHAIN keys the chain is
    /// validated up to its self-signed root first.
    pub fn verification_key(&self) -> Result<&PKeyRef<Public>> {
        if let PublicKeyBody::X5Chain(chain) = &self.body {
            chain.verify()?;
        }
        Ok(&self.pkey)
    }

    pub fn matches_pkey<T: pkey::HasPublic>(&self, other: &PKeyRef<T>) -> bool {
        self.pkey.public_eq(other)
    }

    pub fn hash(&self, hash_type: HashType) -> Result<Hash> {
        Hash::from_data(hash_type, &self.serialize_data()?)
    }
}

fn key_type_compatible(claimed: PublicKeyType, actual: PublicKeyType, bits: u32) -> bool {
    match claimed {
        PublicKeyType::SECP256R1 | PublicKeyType::SECP384R1 => claimed == actual,
        PublicKeyType::Rsa2048RESTR => bits == 2048,
        PublicKeyType::RsaPkcs => bits == 2048 || bits == 3072,
        PublicKeyType::RsaPss => false,
    }
}

fn map_int(map: &[(Value, Value)], label: i64) -> Option<&Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == label as i128 => Some(v),
        _ => None,
    })
}

fn map_bytes<'a>(map: &'a [(Value, Value)], label: i64) -> Result<&'a [u8]> {
    match map_int(map, label) {
        Some(Value::Bytes(b)) => Ok(b),
        _ => Err(Error::InconsistentValue("COSE key parameter")),
    }
}

fn map_integer(map: &[(Value, Value)], label: i64) -> Result<i64> {
    match map_int(map, label) {
        Some(Value::Integer(i)) => {
            i64::try_from(*i).map_err(|_| Error::InconsistentValue("COSE key parameter"))
        }
        _ => Err(Error::InconsistentValue("COSE key parameter")),
    }
}

fn pkey_from_cose_key(value: &Value) -> Result<PKey<Public>> {
    let map = match value {
        Value::Map(map) => map,
        _ => return Err(Error::UnsupportedKeyEncoding),
    };

    match map_integer(map, cose_key::KTY)? {
        cose_key::KTY_EC2 => {
            let nid = match map_integer(map, cose_key::EC2_CRV)? {
                cose_key::CRV_P256 => Nid::X9_62_PRIME256V1,
                cose_key::CRV_P384 => Nid::SECP384R1,
                _ => return Err(Error::UnsupportedAlgorithm),
            };
            let group = EcGroup::from_curve_name(nid)?;
            let x = BigNum::from_slice(map_bytes(map, cose_key::EC2_X)?)?;
            let y = BigNum::from_slice(map_bytes(map, cose_key::EC2_Y)?)?;
            let key = EcKey::from_public_key_affine_coordinates(&group, &x, &y)?;
            key.check_key()?;
            Ok(PKey::from_ec_key(key)?)
        }
        cose_key::KTY_RSA => {
            let n = BigNum::from_slice(map_bytes(map, cose_key::RSA_N)?)?;
            let e = BigNum::from_slice(map_bytes(map, cose_key::RSA_E)?)?;
            Ok(PKey::from_rsa(Rsa::from_public_components(n, e)?)?)
        }
        _ => Err(Error::UnsupportedKeyEncoding),
    }
}

fn int_value(i: i64) -> Value {
    Value::Integer(Integer::from(i))
}

fn cose_key_from_pkey(pkey: &PKeyRef<Public>) -> Result<Value> {
    match pkey.id() {
        pkey::Id::EC => {
            let ec = pkey.ec_key()?;
            let (crv, width) = match ec.group().curve_name() {
                Some(Nid::X9_62_PRIME256V1) => (cose_key::CRV_P256, 32),
                Some(Nid::SECP384R1) => (cose_key::CRV_P384, 48),
                _ => return Err(Error::UnsupportedAlgorithm),
            };
            let mut ctx = BigNumContext::new()?;
            let mut x = BigNum::new()?;
            let mut y = BigNum::new()?;
            ec.public_key()
                .affine_coordinates(ec.group(), &mut x, &mut y, &mut ctx)?;
            Ok(Value::Map(vec![
                (int_value(cose_key::KTY), int_value(cose_key::KTY_EC2)),
                (int_value(cose_key::EC2_CRV), int_value(crv)),
                (
                    int_value(cose_key::EC2_X),
                    Value::Bytes(x.to_vec_padded(width)?),
                ),
                (
                    int_value(cose_key::EC2_Y),
                    Value::Bytes(y.to_vec_padded(width)?),
                ),
            ]))
        }
        pkey::Id::RSA => {
            let rsa = pkey.rsa()?;
            Ok(Value::Map(vec![
                (int_value(cose_key::KTY), int_value(cose_key::KTY_RSA)),
                (int_value(cose_key::RSA_N), Value::Bytes(rsa.n().to_vec())),
                (int_value(cose_key::RSA_E), Value::Bytes(rsa.e().to_vec())),
            ]))
        }
        _ => Err(Error::UnsupportedAlgorithm),
    }
}

impl TryFrom<X5Chain> for PublicKey {
    type Error = Error;

    fn try_from(chain: X5Chain) -> Result<Self> {
        let pkey = chain.leaf_certificate().public_key()?;
        let key_type = PublicKey::key_type_from_pkey(&pkey)?;
        PublicKey::new(key_type, PublicKeyBody::X5Chain(chain))
    }
}

impl TryFrom<X509> for PublicKey {
    type Error = Error;

    fn try_from(x509: X509) -> Result<Self> {
        let pkey = x509.public_key()?;
        PublicKey::from_pkey(&pkey)
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> fmt::Result {
        let der = self.pkey.public_key_to_der().map_err(|_| fmt::Error)?;
        write!(
            f,
            "Public key ({:?}, {:?}): {}",
            self.key_type,
            self.encoding(),
            hex::encode(der)
        )
    }
}

// X5Chain order: [leaf, intermediate1, ..., intermediateN, root]
#[derive(Debug, Clone)]
pub struct X5Chain {
    chain: Vec<X509>,
}

impl<'de> Deserialize<'de> for X5Chain {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct X5ChainVisitor;

        impl<'de> serde::de::Visitor<'de> for X5ChainVisitor {
            type Value = X5Chain;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a vector of X509")
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut chain = Vec::new();

                while let Some(x509) = seq.next_element::<serde_bytes::ByteBuf>()? {
                    let x509 = X509::from_der(&x509).map_err(A::Error::custom)?;
                    chain.push(x509);
                }
                X5Chain::new(chain).map_err(A::Error::custom)
            }
        }

        deserializer.deserialize_seq(X5ChainVisitor)
    }
}

impl Serialize for X5Chain {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.chain.len()))?;
        for cert in &self.chain {
            let cert = cert.to_der().map_err(S::Error::custom)?;
            seq.serialize_element(serde_bytes::Bytes::new(&cert))?;
        }
        seq.end()
    }
}

impl X5Chain {
    pub fn new(chain: Vec<X509>) -> Result<Self> {
        if chain.is_empty() {
            Err(Error::InvalidChain(ChainError::Empty))
        } else {
            Ok(X5Chain { chain })
        }
    }

    /// Validates the chain from the leaf up to its last certificate, which
    /// must be a self-signed CA.
    pub fn verify(&self) -> Result<&X509> {
        log::trace!("Validating X5Chain of {} certificates", self.chain.len());

        let n = self.chain.len();
        if n < 2 {
            return Err(Error::InvalidChain(ChainError::TooShort));
        }

        for certpos in 0..n - 1 {
            let cert = &self.chain[certpos];
            let issuer = &self.chain[certpos + 1];
            if issuer.issued(cert) != X509VerifyResult::OK {
                return Err(Error::InvalidChain(ChainError::NonIssuer(certpos)));
            }
            let issuer_key = issuer.public_key()?;
            if !cert.verify(&issuer_key)? {
                return Err(Error::InvalidChain(ChainError::InvalidSignedCert(certpos)));
            }
        }

        let root = &self.chain[n - 1];
        let root_key = root.public_key()?;
        if root.issued(root) != X509VerifyResult::OK || !root.verify(&root_key)? {
            return Err(Error::InvalidChain(ChainError::RootNotCa));
        }

        let mut store = X509StoreBuilder::new()?;
        store.add_cert(root.clone())?;
        let store = store.build();

        let mut untrusted = Stack::new()?;
        for intermediate in &self.chain[1..n - 1] {
            untrusted.push(intermediate.clone())?;
        }

        let mut context = X509StoreContext::new()?;
        let (valid, reason) = context.init(&store, &self.chain[0], &untrusted, |c| {
            let valid = c.verify_cert()?;
            Ok((valid, c.error().error_string().to_string()))
        })?;
        if !valid {
            return Err(Error::InvalidChain(ChainError::PathValidation(reason)));
        }

        Ok(&self.chain[0])
    }

    pub fn leaf_certificate(&self) -> &X509 {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// Digest over the concatenated DER encodings, in chain order
    pub fn hash(&self, hash_type: HashType) -> Result<Hash> {
        let mut concatenated = Vec::new();
        for cert in &self.chain {
            concatenated.extend_from_slice(&cert.to_der()?);
        }
        Hash::from_data(hash_type, &concatenated)
    }
}

/// Collects a COSE header map with integer labels
pub(crate) fn value_map_from(entries: BTreeMap<i64, Value>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (int_value(k), v))
            .collect(),
    )
}

#[cfg(test)]
pub(crate) mod test {
    use std::convert::TryFrom;

    use openssl::{
        asn1::Asn1Time,
        bn::{BigNum, MsbOption},
        ec::{EcGroup, EcKey},
        hash::MessageDigest,
        nid::Nid,
        pkey::{PKey, Private},
        x509::{
            extension::{BasicConstraints, KeyUsage},
            X509Builder, X509NameBuilder, X509,
        },
    };

    use super::{PublicKey, X5Chain};
    use crate::{
        constants::{PublicKeyEncoding, PublicKeyType},
        Serializable,
    };

    pub(crate) fn ec_key(nid: Nid) -> PKey<Private> {
        let group = EcGroup::from_curve_name(nid).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    pub(crate) fn build_cert(
        subject: &str,
        subject_key: &PKey<Private>,
        issuer: Option<(&str, &PKey<Private>)>,
        ca: bool,
    ) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", subject).unwrap();
        let name = name.build();
        let (issuer_name, signer) = match issuer {
            Some((issuer_cn, issuer_key)) => {
                let mut name = X509NameBuilder::new().unwrap();
                name.append_entry_by_text("CN", issuer_cn).unwrap();
                (name.build(), issuer_key)
            }
            None => (name.to_owned().unwrap(), subject_key),
        };

        let mut serial = BigNum::new().unwrap();
        serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&issuer_name).unwrap();
        builder.set_pubkey(subject_key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        if ca {
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
            builder
                .append_extension(
                    KeyUsage::new()
                        .critical()
                        .key_cert_sign()
                        .crl_sign()
                        .build()
                        .unwrap(),
                )
                .unwrap();
        } else {
            builder
                .append_extension(BasicConstraints::new().build().unwrap())
                .unwrap();
            builder
                .append_extension(KeyUsage::new().digital_signature().build().unwrap())
                .unwrap();
        }
        builder.sign(signer, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    #[test]
    fn test_x509_public_key() {
        let key = ec_key(Nid::SECP384R1);
        let public_only = PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap();
        let public = PublicKey::from_pkey(&public_only).unwrap();
        assert_eq!(public.keytype(), PublicKeyType::SECP384R1);
        assert_eq!(public.encoding(), PublicKeyEncoding::X509);

        let decoded = PublicKey::deserialize_data(&public.serialize_data().unwrap()).unwrap();
        assert!(decoded.matches_pkey(&key));
    }

    #[test]
    fn test_cose_key_public_key() {
        let key = ec_key(Nid::X9_62_PRIME256V1);
        let public_only = PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap();
        let public = PublicKey::from_pkey_as_cose_key(&public_only).unwrap();
        assert_eq!(public.encoding(), PublicKeyEncoding::Cosekey);

        let decoded = PublicKey::deserialize_data(&public.serialize_data().unwrap()).unwrap();
        assert_eq!(decoded.keytype(), PublicKeyType::SECP256R1);
        assert!(decoded.matches_pkey(&key));
    }

    #[test]
    fn test_mismatched_key_type() {
        let key = ec_key(Nid::X9_62_PRIME256V1);
        let der = serde_bytes::ByteBuf::from(key.public_key_to_der().unwrap());
        let encoded = (PublicKeyType::SECP384R1, PublicKeyEncoding::X509, der)
            .serialize_data()
            .unwrap();
        assert!(PublicKey::deserialize_data(&encoded).is_err());

        let der = serde_bytes::ByteBuf::from(key.public_key_to_der().unwrap());
        let encoded = (PublicKeyType::SECP256R1, PublicKeyEncoding::Crypto, der)
            .serialize_data()
            .unwrap();
        assert!(PublicKey::deserialize_data(&encoded).is_err());
    }

    #[test]
    fn test_x5chain_validation() {
        let root_key = ec_key(Nid::X9_62_PRIME256V1);
        let leaf_key = ec_key(Nid::X9_62_PRIME256V1);
        let root = build_cert("Test CA", &root_key, None, true);
        let leaf = build_cert("Test device", &leaf_key, Some(("Test CA", &root_key)), false);

        let chain = X5Chain::new(vec![leaf.clone(), root.clone()]).unwrap();
        chain.verify().unwrap();

        let public = PublicKey::try_from(chain).unwrap();
        let decoded = PublicKey::deserialize_data(&public.serialize_data().unwrap()).unwrap();
        assert!(decoded.verification_key().unwrap().public_eq(&leaf_key));

        // A lone leaf is not a chain
        assert!(X5Chain::new(vec![leaf.clone()]).unwrap().verify().is_err());

        // Root that is not a CA
        let fake_root = build_cert("Test CA", &root_key, None, false);
        assert!(X5Chain::new(vec![leaf.clone(), fake_root])
            .unwrap()
            .verify()
            .is_err());

        // Leaf issued by someone else
        let other_root_key = ec_key(Nid::X9_62_PRIME256V1);
        let other_root = build_cert("Test CA", &other_root_key, None, true);
        assert!(X5Chain::new(vec![leaf, other_root]).unwrap().verify().is_err());

        assert!(X5Chain::new(vec![]).is_err());
    }
}
