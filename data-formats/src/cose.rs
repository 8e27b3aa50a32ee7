//! COSE_Sign1 signatures and Entity Attestation Tokens
//!
//! Protected headers are kept as the exact bytes that were received or
//! produced, so the `Sig_structure` recomputed at verification time always
//! matches the one that was signed.

use std::collections::BTreeMap;

use ciborium::{tag::Required, value::Value};
use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::hash,
    nid::Nid,
    pkey::{self, HasPublic, PKeyRef, Private},
    sign::{Signer, Verifier},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_bytes::{ByteBuf, Bytes};

use crate::{
    constants::{header_keys, DeviceSigType},
    errors::{Error, Result},
    from_cbor,
    publickey::PublicKey,
    to_cbor,
    types::{Guid, Nonce},
    Serializable,
};

const COSE_SIGN1_TAG: u64 = 18;
const SIG_STRUCTURE_CONTEXT: &str = "Signature1";

/// A COSE header map with integer labels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap(BTreeMap<i64, Value>);

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap(BTreeMap::new())
    }

    pub fn insert<T: Serialize>(&mut self, label: i64, value: &T) -> Result<()> {
        self.0.insert(label, Value::serialized(value)?);
        Ok(())
    }

    pub fn insert_value(&mut self, label: i64, value: Value) {
        self.0.insert(label, value);
    }

    pub fn get<T: DeserializeOwned>(&self, label: i64) -> Result<Option<T>> {
        match self.0.get(&label) {
            None => Ok(None),
            Some(value) => Ok(Some(value.deserialized()?)),
        }
    }

    /// Like `get`, but an absent label is an error
    pub fn get_required<T: DeserializeOwned>(&self, label: i64) -> Result<T> {
        self.get(label)?
            .ok_or(Error::InconsistentValue("missing header value"))
    }

    pub fn get_value(&self, label: i64) -> Option<&Value> {
        self.0.get(&label)
    }

    pub fn remove(&mut self, label: i64) -> Option<Value> {
        self.0.remove(&label)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The signature algorithm a private key signs with
pub fn sig_type_for_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<DeviceSigType> {
    match key.id() {
        pkey::Id::EC => match key.ec_key()?.group().curve_name() {
            Some(Nid::X9_62_PRIME256V1) => Ok(DeviceSigType::StSECP256R1),
            Some(Nid::SECP384R1) => Ok(DeviceSigType::StSECP384R1),
            _ => Err(Error::UnsupportedAlgorithm),
        },
        pkey::Id::RSA => match key.bits() {
            2048 => Ok(DeviceSigType::StRSA2048),
            3072 => Ok(DeviceSigType::StRSA3072),
            _ => Err(Error::UnsupportedAlgorithm),
        },
        _ => Err(Error::UnsupportedAlgorithm),
    }
}

fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    to_cbor(&(
        SIG_STRUCTURE_CONTEXT,
        Bytes::new(protected),
        Bytes::new(&[]),
        Bytes::new(payload),
    ))
}

/// Returned by getters that decode a payload without checking its signature
#[derive(Debug)]
pub struct UnverifiedValue<T>(T);

impl<T> UnverifiedValue<T> {
    pub fn get_unverified_value(&self) -> &T {
        &self.0
    }

    pub fn into_unverified(self) -> T {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct COSESign {
    protected: Vec<u8>,
    unprotected: HeaderMap,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl Serialize for COSESign {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Required::<_, COSE_SIGN1_TAG>((
            Bytes::new(&self.protected),
            &self.unprotected,
            Bytes::new(&self.payload),
            Bytes::new(&self.signature),
        ))
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for COSESign {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let Required((protected, unprotected, payload, signature)): Required<
            (ByteBuf, HeaderMap, ByteBuf, ByteBuf),
            COSE_SIGN1_TAG,
        > = Deserialize::deserialize(deserializer)?;

        Ok(COSESign {
            protected: protected.into_vec(),
            unprotected,
            payload: payload.into_vec(),
            signature: signature.into_vec(),
        })
    }
}

impl COSESign {
    /// Signs a serializable payload with an algorithm derived from `key`
    pub fn new<T>(payload: &T, unprotected: Option<HeaderMap>, key: &PKeyRef<Private>) -> Result<Self>
    where
        T: Serialize,
    {
        let payload = to_cbor(payload)?;
        let sig_type = sig_type_for_key(key)?;
        COSESign::new_with_protected(
            payload,
            HeaderMap::new(),
            unprotected.unwrap_or_default(),
            key,
            sig_type,
        )
    }

    pub fn from_eat<T>(
        eat: EATokenPayload<T>,
        unprotected: Option<HeaderMap>,
        key: &PKeyRef<Private>,
    ) -> Result<Self>
    where
        T: Serialize + DeserializeOwned,
    {
        COSESign::new(&eat, unprotected, key)
    }

    pub fn new_with_protected(
        payload: Vec<u8>,
        mut protected: HeaderMap,
        unprotected: HeaderMap,
        key: &PKeyRef<Private>,
        sig_type: DeviceSigType,
    ) -> Result<Self> {
        if sig_type_for_key(key)? != sig_type {
            return Err(Error::UnsupportedAlgorithm);
        }
        protected.insert(header_keys::ALG, &sig_type.alg())?;
        let protected = protected.serialize_data()?;

        let to_sign = sig_structure(&protected, &payload)?;
        let md = sig_type.hash_type()?.get_md();

        let signature = match sig_type.ecdsa_signature_len() {
            Some(siglen) => {
                let digest = hash(md, &to_sign)?;
                let ec_key = key.ec_key()?;
                let sig = EcdsaSig::sign(&digest, &ec_key)?;
                let mut raw = sig.r().to_vec_padded((siglen / 2) as i32)?;
                raw.extend_from_slice(&sig.s().to_vec_padded((siglen / 2) as i32)?);
                raw
            }
            None => {
                let mut signer = Signer::new(md, key)?;
                signer.update(&to_sign)?;
                signer.sign_to_vec()?
            }
        };

        Ok(COSESign {
            protected,
            unprotected,
            payload,
            signature,
        })
    }

    pub fn protected_header(&self) -> Result<HeaderMap> {
        if self.protected.is_empty() {
            return Ok(HeaderMap::new());
        }
        HeaderMap::deserialize_data(&self.protected)
    }

    pub fn sig_type(&self) -> Result<DeviceSigType> {
        let alg: i64 = self.protected_header()?.get_required(header_keys::ALG)?;
        DeviceSigType::from_alg(alg)
    }

    pub fn unprotected(&self) -> &HeaderMap {
        &self.unprotected
    }

    pub fn get_unprotected_value<T: DeserializeOwned>(&self, label: i64) -> Result<Option<T>> {
        self.unprotected.get(label)
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub(crate) fn corrupt_signature(&mut self) {
        if let Some(first) = self.signature.first_mut() {
            *first ^= 0xFF;
        }
    }

    pub fn payload_raw(&self) -> &[u8] {
        &self.payload
    }

    /// Checks the signature against a bare key
    pub fn verify_with_pkey<K: HasPublic>(&self, key: &PKeyRef<K>) -> Result<()> {
        let sig_type = self.sig_type()?;
        if sig_type_for_key(key)? != sig_type {
            log::debug!("Signature algorithm {:?} does not fit key", sig_type);
            return Err(Error::InvalidSignature);
        }

        let to_verify = sig_structure(&self.protected, &self.payload)?;
        let md = sig_type.hash_type()?.get_md();

        let valid = match sig_type.ecdsa_signature_len() {
            Some(siglen) => {
                if self.signature.len() != siglen {
                    log::debug!(
                        "ECDSA signature of {} bytes, expected {}",
                        self.signature.len(),
                        siglen
                    );
                    return Err(Error::InvalidSignature);
                }
                let (r, s) = self.signature.split_at(siglen / 2);
                let sig =
                    EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
                let digest = hash(md, &to_verify)?;
                let ec_key = key.ec_key()?;
                sig.verify(&digest, &ec_key)?
            }
            None => {
                let mut verifier = Verifier::new(md, key)?;
                verifier.update(&to_verify)?;
                verifier.verify(&self.signature)?
            }
        };

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidSignature)
        }
    }

    /// Checks the signature against an FDO public key, validating its
    /// certificate chain if it carries one
    pub fn verify(&self, key: &PublicKey) -> Result<()> {
        self.verify_with_pkey(key.verification_key()?)
    }

    pub fn get_payload<T: DeserializeOwned>(&self, key: &PublicKey) -> Result<T> {
        self.verify(key)?;
        from_cbor(&self.payload)
    }

    pub fn get_payload_with_pkey<T, K>(&self, key: &PKeyRef<K>) -> Result<T>
    where
        T: DeserializeOwned,
        K: HasPublic,
    {
        self.verify_with_pkey(key)?;
        from_cbor(&self.payload)
    }

    pub fn get_payload_unverified<T: DeserializeOwned>(&self) -> Result<UnverifiedValue<T>> {
        from_cbor(&self.payload).map(UnverifiedValue)
    }

    pub fn get_eat_unverified<T>(&self) -> Result<UnverifiedValue<EATokenPayload<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.get_payload_unverified()
    }
}

/// Entity Attestation Token claims, with an optional FDO-specific claim
#[derive(Debug, Clone)]
pub struct EATokenPayload<T> {
    nonce: Nonce,
    ueid: Vec<u8>,
    fdo: Option<T>,
}

pub fn new_eat<T>(fdo: Option<T>, nonce: Nonce, guid: &Guid) -> Result<EATokenPayload<T>>
where
    T: Serialize + DeserializeOwned,
{
    Ok(EATokenPayload {
        nonce,
        ueid: guid.as_ueid(),
        fdo,
    })
}

impl<T> EATokenPayload<T> {
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn ueid(&self) -> &[u8] {
        &self.ueid
    }

    pub fn fdo(&self) -> Option<&T> {
        self.fdo.as_ref()
    }

    /// Whether the UEID claim names this device
    pub fn matches_guid(&self, guid: &Guid) -> bool {
        self.ueid == guid.as_ueid()
    }
}

impl<T: Serialize> Serialize for EATokenPayload<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error as _;

        let mut claims = HeaderMap::new();
        claims
            .insert(header_keys::EAT_NONCE, &self.nonce)
            .map_err(S::Error::custom)?;
        claims
            .insert(header_keys::EAT_UEID, &Bytes::new(&self.ueid))
            .map_err(S::Error::custom)?;
        if let Some(fdo) = &self.fdo {
            claims
                .insert(header_keys::EAT_FDO, fdo)
                .map_err(S::Error::custom)?;
        }
        claims.serialize(serializer)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for EATokenPayload<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        let claims = HeaderMap::deserialize(deserializer)?;
        let nonce = claims
            .get_required(header_keys::EAT_NONCE)
            .map_err(D::Error::custom)?;
        let ueid: ByteBuf = claims
            .get_required(header_keys::EAT_UEID)
            .map_err(D::Error::custom)?;
        let fdo = claims
            .get(header_keys::EAT_FDO)
            .map_err(D::Error::custom)?;

        Ok(EATokenPayload {
            nonce,
            ueid: ueid.into_vec(),
            fdo,
        })
    }
}

#[cfg(test)]
mod test {
    use openssl::{
        nid::Nid,
        pkey::{PKey, Private},
        rsa::Rsa,
    };

    use super::{new_eat, COSESign, HeaderMap};
    use crate::{
        constants::{header_keys, DeviceSigType},
        publickey::{test::ec_key, PublicKey},
        types::{new_random_bytes, Guid, Nonce},
        Serializable,
    };

    fn rsa_key(bits: u32) -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(bits).unwrap()).unwrap()
    }

    fn public_of(key: &PKey<Private>) -> PublicKey {
        let public = PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap();
        PublicKey::from_pkey(&public).unwrap()
    }

    fn sign_and_verify_many(key: &PKey<Private>, rounds: usize, expected_len: Option<usize>) {
        let public = public_of(key);
        for round in 0..rounds {
            let payload = serde_bytes::ByteBuf::from(new_random_bytes(round % 97).unwrap());
            let signed = COSESign::new(&payload, None, key).unwrap();
            if let Some(len) = expected_len {
                assert_eq!(signed.signature().len(), len);
            }
            let verified: serde_bytes::ByteBuf = signed.get_payload(&public).unwrap();
            assert_eq!(verified, payload);
        }
    }

    #[test]
    fn test_ecdsa_signatures() {
        sign_and_verify_many(&ec_key(Nid::X9_62_PRIME256V1), 10_000, Some(64));
        sign_and_verify_many(&ec_key(Nid::SECP384R1), 2_000, Some(96));
    }

    #[test]
    fn test_rsa_signatures() {
        sign_and_verify_many(&rsa_key(2048), 20, None);
        sign_and_verify_many(&rsa_key(3072), 5, None);
    }

    #[test]
    fn test_rsa2048_type5_key() {
        use crate::constants::PublicKeyType;
        use crate::publickey::PublicKeyBody;

        let key = rsa_key(2048);
        let public = PublicKey::new(
            PublicKeyType::RsaPkcs,
            PublicKeyBody::X509(key.public_key_to_der().unwrap()),
        )
        .unwrap();
        let signed = COSESign::new(&"payload", None, &key).unwrap();
        let payload: String = signed.get_payload(&public).unwrap();
        assert_eq!(payload, "payload");
    }

    #[test]
    fn test_signature_tamper() {
        let key = ec_key(Nid::X9_62_PRIME256V1);
        let public = public_of(&key);
        let signed = COSESign::new(&"hello", None, &key).unwrap();

        let mut encoded = signed.serialize_data().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        let tampered = COSESign::deserialize_data(&encoded).unwrap();
        assert!(tampered.verify(&public).is_err());

        let other = public_of(&ec_key(Nid::X9_62_PRIME256V1));
        assert!(signed.verify(&other).is_err());

        // Key of another curve
        let other = public_of(&ec_key(Nid::SECP384R1));
        assert!(signed.verify(&other).is_err());
    }

    #[test]
    fn test_cose_sign_round_trip() {
        let empty = COSESign::default();
        let decoded = COSESign::deserialize_data(&empty.serialize_data().unwrap()).unwrap();
        assert_eq!(decoded, empty);

        let key = ec_key(Nid::SECP384R1);
        let mut unprotected = HeaderMap::new();
        unprotected
            .insert(header_keys::CUPH_NONCE, &Nonce::new().unwrap())
            .unwrap();
        let signed = COSESign::new(&vec![1u32, 2, 3], Some(unprotected), &key).unwrap();
        let encoded = signed.serialize_data().unwrap();
        // Tag 18
        assert_eq!(encoded[0], 0xd2);
        let decoded = COSESign::deserialize_data(&encoded).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(decoded.sig_type().unwrap(), DeviceSigType::StSECP384R1);
        let nonce: Option<Nonce> = decoded
            .get_unprotected_value(header_keys::CUPH_NONCE)
            .unwrap();
        assert!(nonce.is_some());
    }

    #[test]
    fn test_eat() {
        let key = ec_key(Nid::X9_62_PRIME256V1);
        let guid = Guid::new().unwrap();
        let nonce = Nonce::new().unwrap();
        let eat = new_eat(Some(serde_bytes::ByteBuf::from(vec![7u8; 4])), nonce.clone(), &guid)
            .unwrap();
        let signed = COSESign::from_eat(eat, None, &key).unwrap();

        let eat = signed
            .get_eat_unverified::<serde_bytes::ByteBuf>()
            .unwrap()
            .into_unverified();
        eat.nonce().compare(&nonce).unwrap();
        assert!(eat.matches_guid(&guid));
        assert_eq!(eat.fdo().unwrap().as_slice(), &[7u8; 4]);

        let eat = new_eat::<bool>(None, nonce, &guid).unwrap();
        let signed = COSESign::from_eat(eat, None, &key).unwrap();
        let eat = signed.get_eat_unverified::<bool>().unwrap().into_unverified();
        assert!(eat.fdo().is_none());
    }
}
