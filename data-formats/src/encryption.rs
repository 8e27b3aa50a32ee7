//! Session key derivation and the TO2 payload wrappings
//!
//! EMB suites (AES-GCM, AES-CCM) seal the payload in a tagged COSE_Encrypt0.
//! ETM suites (AES-CTR, AES-CBC) put a COSE_Encrypt0 inside a COSE_Mac0
//! keyed with a separate verification key.

use std::fmt;

use ciborium::tag::Required;
use openssl::{
    cipher::{Cipher as EvpCipher, CipherRef},
    cipher_ctx::CipherCtx,
    hash::MessageDigest,
    pkey::PKey,
    sign::Signer,
    symm::{self, Cipher},
};
use serde::{Deserialize, Serialize};
use serde_bytes::{ByteBuf, Bytes};

use crate::{
    constants::{header_keys, CipherSuite, HashType},
    cose::HeaderMap,
    errors::{Error, Result},
    keyexchange::SessionKeyInfo,
    to_cbor,
    types::new_random_bytes,
    Serializable,
};

const COSE_ENCRYPT0_TAG: u64 = 16;
const COSE_MAC0_TAG: u64 = 17;

const KDF_LABEL: &[u8] = b"FIDO-KDF";
const KDF_CONTEXT: &[u8] = b"AutomaticOnboardTunnel";

const AEAD_TAG_LEN: usize = 16;

/// SP800-108 KDF in counter mode with HMAC as the PRF
pub fn kdf(hmac_type: HashType, key: &[u8], context_rand: &[u8], out_len: usize) -> Result<Vec<u8>> {
    if !hmac_type.is_hmac() {
        return Err(Error::UnsupportedAlgorithm);
    }
    let bits = out_len * 8;
    if bits > u16::MAX as usize {
        return Err(Error::InconsistentValue("kdf output length"));
    }
    let bits = (bits as u16).to_be_bytes();

    let pkey = PKey::hmac(key)?;
    let rounds = (out_len + hmac_type.digest_size() - 1) / hmac_type.digest_size();
    let mut output = Vec::with_capacity(rounds * hmac_type.digest_size());

    for counter in 1..=rounds {
        let mut signer = Signer::new(hmac_type.get_md(), &pkey)?;
        signer.update(&[counter as u8])?;
        signer.update(KDF_LABEL)?;
        signer.update(&[0x00])?;
        signer.update(KDF_CONTEXT)?;
        signer.update(context_rand)?;
        signer.update(&bits)?;
        output.extend_from_slice(&signer.sign_to_vec()?);
    }

    output.truncate(out_len);
    Ok(output)
}

/// AEAD ciphers of the EMB suites
#[derive(Clone, Copy)]
enum Aead {
    Gcm(Cipher),
    // CCM needs its nonce and tag lengths configured before the key
    Ccm(&'static CipherRef),
}

impl Aead {
    /// Returns the ciphertext with the tag appended
    fn seal(self, key: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut tag = [0u8; AEAD_TAG_LEN];
        let mut ciphertext = match self {
            Aead::Gcm(cipher) => {
                symm::encrypt_aead(cipher, key, Some(iv), aad, plaintext, &mut tag)?
            }
            Aead::Ccm(cipher) => {
                let mut ctx = CipherCtx::new()?;
                ctx.encrypt_init(Some(cipher), None, None)?;
                ctx.set_iv_length(iv.len())?;
                ctx.set_tag_length(AEAD_TAG_LEN)?;
                ctx.encrypt_init(None, Some(key), Some(iv))?;
                ctx.set_data_len(plaintext.len())?;
                ctx.cipher_update(aad, None)?;
                let mut out = Vec::with_capacity(plaintext.len() + AEAD_TAG_LEN);
                ctx.cipher_update_vec(plaintext, &mut out)?;
                ctx.cipher_final_vec(&mut out)?;
                ctx.tag(&mut tag)?;
                out
            }
        };
        ciphertext.extend_from_slice(&tag);
        Ok(ciphertext)
    }

    fn open(self, key: &[u8], iv: &[u8], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < AEAD_TAG_LEN {
            return Err(Error::DecryptionFailed);
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - AEAD_TAG_LEN);
        match self {
            Aead::Gcm(cipher) => symm::decrypt_aead(cipher, key, Some(iv), aad, ciphertext, tag)
                .map_err(|_| Error::DecryptionFailed),
            Aead::Ccm(cipher) => {
                let mut ctx = CipherCtx::new()?;
                ctx.decrypt_init(Some(cipher), None, None)?;
                ctx.set_iv_length(iv.len())?;
                ctx.set_tag(tag)?;
                ctx.decrypt_init(None, Some(key), Some(iv))?;
                ctx.set_data_len(ciphertext.len())?;
                ctx.cipher_update(aad, None)?;
                // The tag is checked by the single update call
                let mut out = Vec::with_capacity(ciphertext.len() + 1);
                ctx.cipher_update_vec(ciphertext, &mut out)
                    .map_err(|_| Error::DecryptionFailed)?;
                Ok(out)
            }
        }
    }
}

enum SuiteKind {
    // (cipher, key length, nonce length)
    Emb(Aead, usize, usize),
    // (cipher, key length, mac type, mac key length)
    Etm(Cipher, usize, HashType, usize),
}

const ETM_IV_LEN: usize = 16;

fn suite_kind(suite: CipherSuite) -> SuiteKind {
    match suite {
        CipherSuite::A128Gcm => SuiteKind::Emb(Aead::Gcm(Cipher::aes_128_gcm()), 16, 12),
        CipherSuite::A256Gcm => SuiteKind::Emb(Aead::Gcm(Cipher::aes_256_gcm()), 32, 12),
        CipherSuite::AesCcm16_128_128 => {
            SuiteKind::Emb(Aead::Ccm(EvpCipher::aes_128_ccm()), 16, 13)
        }
        CipherSuite::AesCcm16_128_256 => {
            SuiteKind::Emb(Aead::Ccm(EvpCipher::aes_256_ccm()), 32, 13)
        }
        CipherSuite::AesCcm64_128_128 => {
            SuiteKind::Emb(Aead::Ccm(EvpCipher::aes_128_ccm()), 16, 7)
        }
        CipherSuite::AesCcm64_128_256 => {
            SuiteKind::Emb(Aead::Ccm(EvpCipher::aes_256_ccm()), 32, 7)
        }
        CipherSuite::CoseAes128Cbc => {
            SuiteKind::Etm(Cipher::aes_128_cbc(), 16, HashType::HmacSha256, 32)
        }
        CipherSuite::CoseAes128Ctr => {
            SuiteKind::Etm(Cipher::aes_128_ctr(), 16, HashType::HmacSha256, 32)
        }
        CipherSuite::CoseAes256Cbc => {
            SuiteKind::Etm(Cipher::aes_256_cbc(), 32, HashType::HmacSha384, 64)
        }
        CipherSuite::CoseAes256Ctr => {
            SuiteKind::Etm(Cipher::aes_256_ctr(), 32, HashType::HmacSha384, 64)
        }
    }
}

/// COSE_Encrypt0 as used by both wrappings
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EncryptedMessage {
    protected: Vec<u8>,
    unprotected: HeaderMap,
    ciphertext: Vec<u8>,
}

impl Serialize for EncryptedMessage {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Required::<_, COSE_ENCRYPT0_TAG>((
            Bytes::new(&self.protected),
            &self.unprotected,
            Bytes::new(&self.ciphertext),
        ))
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EncryptedMessage {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let Required((protected, unprotected, ciphertext)): Required<
            (ByteBuf, HeaderMap, ByteBuf),
            COSE_ENCRYPT0_TAG,
        > = Deserialize::deserialize(deserializer)?;
        Ok(EncryptedMessage {
            protected: protected.into_vec(),
            unprotected,
            ciphertext: ciphertext.into_vec(),
        })
    }
}

impl EncryptedMessage {
    fn new(alg: i64, iv: &[u8], ciphertext: Vec<u8>) -> Result<Self> {
        let mut protected = HeaderMap::new();
        protected.insert(header_keys::ALG, &alg)?;
        let mut unprotected = HeaderMap::new();
        unprotected.insert(header_keys::IV, &Bytes::new(iv))?;
        Ok(EncryptedMessage {
            protected: protected.serialize_data()?,
            unprotected,
            ciphertext,
        })
    }

    fn alg(&self) -> Result<i64> {
        HeaderMap::deserialize_data(&self.protected)?.get_required(header_keys::ALG)
    }

    fn iv(&self) -> Result<Vec<u8>> {
        let iv: ByteBuf = self.unprotected.get_required(header_keys::IV)?;
        Ok(iv.into_vec())
    }

    /// The Enc_structure used as additional authenticated data
    fn aad(&self) -> Result<Vec<u8>> {
        to_cbor(&("Encrypt0", Bytes::new(&self.protected), Bytes::new(&[])))
    }
}

/// COSE_Mac0, the outer block of ETM
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacedMessage {
    protected: Vec<u8>,
    unprotected: HeaderMap,
    payload: Vec<u8>,
    tag: Vec<u8>,
}

impl Serialize for MacedMessage {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Required::<_, COSE_MAC0_TAG>((
            Bytes::new(&self.protected),
            &self.unprotected,
            Bytes::new(&self.payload),
            Bytes::new(&self.tag),
        ))
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MacedMessage {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let Required((protected, unprotected, payload, tag)): Required<
            (ByteBuf, HeaderMap, ByteBuf, ByteBuf),
            COSE_MAC0_TAG,
        > = Deserialize::deserialize(deserializer)?;
        Ok(MacedMessage {
            protected: protected.into_vec(),
            unprotected,
            payload: payload.into_vec(),
            tag: tag.into_vec(),
        })
    }
}

fn mac_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    to_cbor(&(
        "MAC0",
        Bytes::new(protected),
        Bytes::new(&[]),
        Bytes::new(payload),
    ))
}

fn compute_mac(hmac_type: HashType, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let pkey = PKey::hmac(key)?;
    let md: MessageDigest = hmac_type.get_md();
    let mut signer = Signer::new(md, &pkey)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

/// Keys derived for one TO2 session
#[derive(Clone, Serialize, Deserialize)]
pub enum SessionKey {
    Emb {
        suite: CipherSuite,
        #[serde(with = "serde_bytes")]
        sevk: Vec<u8>,
    },
    Etm {
        suite: CipherSuite,
        #[serde(with = "serde_bytes")]
        sek: Vec<u8>,
        #[serde(with = "serde_bytes")]
        svk: Vec<u8>,
    },
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({:?}, [redacted])", self.suite())
    }
}

impl SessionKey {
    pub fn derive(suite: CipherSuite, info: &SessionKeyInfo) -> Result<Self> {
        match suite_kind(suite) {
            SuiteKind::Emb(_, key_len, _) => Ok(SessionKey::Emb {
                suite,
                sevk: kdf(
                    HashType::HmacSha256,
                    info.shared_secret(),
                    info.context_rand(),
                    key_len,
                )?,
            }),
            SuiteKind::Etm(_, key_len, hmac_type, mac_key_len) => {
                let mut keys = kdf(
                    hmac_type,
                    info.shared_secret(),
                    info.context_rand(),
                    mac_key_len + key_len,
                )?;
                let sek = keys.split_off(mac_key_len);
                Ok(SessionKey::Etm {
                    suite,
                    sek,
                    svk: keys,
                })
            }
        }
    }

    pub fn suite(&self) -> CipherSuite {
        match self {
            SessionKey::Emb { suite, .. } | SessionKey::Etm { suite, .. } => *suite,
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match (self, suite_kind(self.suite())) {
            (SessionKey::Emb { suite, sevk }, SuiteKind::Emb(aead, _, nonce_len)) => {
                let iv = new_random_bytes(nonce_len)?;
                let mut message = EncryptedMessage::new(suite.alg(), &iv, Vec::new())?;
                let aad = message.aad()?;
                message.ciphertext = aead.seal(sevk, &iv, &aad, plaintext)?;
                message.serialize_data()
            }
            (SessionKey::Etm { suite, sek, svk }, SuiteKind::Etm(cipher, _, hmac_type, _)) => {
                let iv = new_random_bytes(ETM_IV_LEN)?;
                let ciphertext = symm::encrypt(cipher, sek, Some(&iv), plaintext)?;
                let inner = EncryptedMessage::new(suite.alg(), &iv, ciphertext)?;

                let mut protected = HeaderMap::new();
                protected.insert(header_keys::ALG, &(hmac_type as i8 as i64))?;
                let protected = protected.serialize_data()?;
                let payload = inner.serialize_data()?;
                let tag = compute_mac(hmac_type, svk, &mac_structure(&protected, &payload)?)?;

                MacedMessage {
                    protected,
                    unprotected: HeaderMap::new(),
                    payload,
                    tag,
                }
                .serialize_data()
            }
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match (self, suite_kind(self.suite())) {
            (SessionKey::Emb { suite, sevk }, SuiteKind::Emb(aead, _, nonce_len)) => {
                let message = EncryptedMessage::deserialize_data(data)?;
                if message.alg()? != suite.alg() {
                    return Err(Error::DecryptionFailed);
                }
                let iv = message.iv()?;
                if iv.len() != nonce_len || message.ciphertext.len() < AEAD_TAG_LEN {
                    return Err(Error::DecryptionFailed);
                }
                let aad = message.aad()?;
                aead.open(sevk, &iv, &aad, &message.ciphertext)
            }
            (SessionKey::Etm { suite, sek, svk }, SuiteKind::Etm(cipher, _, hmac_type, _)) => {
                let outer = MacedMessage::deserialize_data(data)?;
                let mac_alg: i64 =
                    HeaderMap::deserialize_data(&outer.protected)?.get_required(header_keys::ALG)?;
                if mac_alg != hmac_type as i8 as i64 {
                    return Err(Error::DecryptionFailed);
                }
                let expected = compute_mac(
                    hmac_type,
                    svk,
                    &mac_structure(&outer.protected, &outer.payload)?,
                )?;
                if expected.len() != outer.tag.len() || !openssl::memcmp::eq(&expected, &outer.tag)
                {
                    return Err(Error::DecryptionFailed);
                }

                let inner = EncryptedMessage::deserialize_data(&outer.payload)?;
                if inner.alg()? != suite.alg() {
                    return Err(Error::DecryptionFailed);
                }
                let iv = inner.iv()?;
                if iv.len() != ETM_IV_LEN {
                    return Err(Error::DecryptionFailed);
                }
                symm::decrypt(cipher, sek, Some(&iv), &inner.ciphertext)
                    .map_err(|_| Error::DecryptionFailed)
            }
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }
}

pub fn add_encryption_wrapping(
    plaintext: &[u8],
    info: &SessionKeyInfo,
    suite: CipherSuite,
) -> Result<Vec<u8>> {
    SessionKey::derive(suite, info)?.encrypt(plaintext)
}

pub fn remove_encryption_wrapping(
    data: &[u8],
    info: &SessionKeyInfo,
    suite: CipherSuite,
) -> Result<Vec<u8>> {
    SessionKey::derive(suite, info)?.decrypt(data)
}
