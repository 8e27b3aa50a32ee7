use std::convert::TryInto;
use std::fmt;
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use openssl::{
    bn::{BigNum, BigNumContext},
    derive::Deriver,
    dh::Dh,
    ec::{EcGroup, EcKey},
    encrypt::{Decrypter, Encrypter},
    hash::MessageDigest,
    nid::Nid,
    pkey::{self, HasPublic, PKey, PKeyRef, Private},
    rsa::Padding,
};
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use crate::{
    constants::KexSuite,
    errors::{Error, Result},
    types::new_random_bytes,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDeriveSide {
    Device,
    OwnerService,
}

/// Shared secret and context randomness fed into the session KDF
#[derive(Clone)]
pub struct SessionKeyInfo {
    shse: Vec<u8>,
    context_rand: Vec<u8>,
}

impl SessionKeyInfo {
    pub fn shared_secret(&self) -> &[u8] {
        &self.shse
    }

    pub fn context_rand(&self) -> &[u8] {
        &self.context_rand
    }
}

impl fmt::Debug for SessionKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyInfo")
            .field("shse", &"[redacted]")
            .field("context_rand", &hex::encode(&self.context_rand))
            .finish()
    }
}

impl KexSuite {
    fn ecdh_params(&self) -> Option<(Nid, usize, usize)> {
        // (curve, coordinate width, random length)
        match self {
            KexSuite::Ecdh256 => Some((Nid::X9_62_PRIME256V1, 32, 16)),
            KexSuite::Ecdh384 => Some((Nid::SECP384R1, 48, 48)),
            _ => None,
        }
    }

    fn dh_params(&self) -> Result<Option<(Dh<openssl::pkey::Params>, usize)>> {
        let (prime, width) = match self {
            KexSuite::DhkexId14 => (BigNum::get_rfc3526_prime_2048()?, 256),
            KexSuite::DhkexId15 => (BigNum::get_rfc3526_prime_3072()?, 384),
            _ => return Ok(None),
        };
        let dh = Dh::from_pqg(prime, None, BigNum::from_u32(2)?)?;
        Ok(Some((dh, width)))
    }

    fn asym_params(&self) -> Option<(u32, usize)> {
        // (RSA modulus bits, random length)
        match self {
            KexSuite::Asymkex2048 => Some((2048, 32)),
            KexSuite::Asymkex3072 => Some((3072, 96)),
            _ => None,
        }
    }
}

fn write_len_prefixed<W: Write>(writer: &mut W, value: &[u8]) -> Result<()> {
    let len: u16 = value
        .len()
        .try_into()
        .map_err(|_| Error::KeyExchangeError("value too long"))?;
    writer.write_u16::<BigEndian>(len)?;
    writer.write_all(value)?;
    Ok(())
}

fn read_len_prefixed<R: Read>(reader: &mut R, expected: usize) -> Result<Vec<u8>> {
    let len = reader
        .read_u16::<BigEndian>()
        .map_err(|_| Error::KeyExchangeError("truncated exchange parameters"))?;
    if len as usize != expected {
        return Err(Error::KeyExchangeError("unexpected parameter length"));
    }
    let mut value = vec![0u8; expected];
    reader
        .read_exact(&mut value)
        .map_err(|_| Error::KeyExchangeError("truncated exchange parameters"))?;
    Ok(value)
}

/// One side's half of a key exchange, including the private material needed
/// to finish it. Stored in the owner's session between 61 and 64.
#[derive(Clone, Serialize_tuple, Deserialize_tuple)]
pub struct KeyExchange {
    suite: KexSuite,
    #[serde(with = "serde_bytes")]
    exchange: Vec<u8>,
    #[serde(with = "serde_bytes")]
    secret: Vec<u8>,
    #[serde(with = "serde_bytes")]
    random: Vec<u8>,
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("suite", &self.suite)
            .field("exchange", &hex::encode(&self.exchange))
            .finish()
    }
}

impl KeyExchange {
    /// Generates this side's contribution. For the ASYMKEX suites, passing
    /// the peer's RSA key wraps the random with RSA-OAEP; otherwise it is
    /// carried in the clear.
    pub fn new<T: HasPublic>(suite: KexSuite, peer_key: Option<&PKeyRef<T>>) -> Result<Self> {
        if let Some((nid, width, random_len)) = suite.ecdh_params() {
            let group = EcGroup::from_curve_name(nid)?;
            let key = EcKey::generate(&group)?;

            let mut ctx = BigNumContext::new()?;
            let mut x = BigNum::new()?;
            let mut y = BigNum::new()?;
            key.public_key()
                .affine_coordinates(&group, &mut x, &mut y, &mut ctx)?;

            let random = new_random_bytes(random_len)?;
            let mut exchange = Vec::new();
            write_len_prefixed(&mut exchange, &x.to_vec_padded(width as i32)?)?;
            write_len_prefixed(&mut exchange, &y.to_vec_padded(width as i32)?)?;
            write_len_prefixed(&mut exchange, &random)?;

            return Ok(KeyExchange {
                suite,
                exchange,
                secret: key.private_key_to_der()?,
                random,
            });
        }

        if let Some((params, width)) = suite.dh_params()? {
            let key = params.generate_key()?;
            return Ok(KeyExchange {
                suite,
                exchange: key.public_key().to_vec_padded(width as i32)?,
                secret: key.private_key().to_vec(),
                random: Vec::new(),
            });
        }

        if let Some((bits, random_len)) = suite.asym_params() {
            let random = new_random_bytes(random_len)?;
            let exchange = match peer_key {
                None => random.clone(),
                Some(peer_key) => {
                    if peer_key.id() != pkey::Id::RSA || peer_key.bits() != bits {
                        return Err(Error::KeyExchangeError("owner key unusable for suite"));
                    }
                    let mut encrypter = Encrypter::new(peer_key)?;
                    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
                    encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
                    encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
                    let mut wrapped = vec![0u8; encrypter.encrypt_len(&random)?];
                    let len = encrypter.encrypt(&random, &mut wrapped)?;
                    wrapped.truncate(len);
                    wrapped
                }
            };
            return Ok(KeyExchange {
                suite,
                exchange,
                secret: random,
                random: Vec::new(),
            });
        }

        Err(Error::UnsupportedAlgorithm)
    }

    pub fn suite(&self) -> KexSuite {
        self.suite
    }

    /// The bytes sent to the peer (xA or xB)
    pub fn exchange(&self) -> &[u8] {
        &self.exchange
    }

    /// Combines this side with the peer's exchange bytes. `own_key` is the
    /// owner's RSA private key, only needed by the owner in ASYMKEX suites.
    pub fn derive_key(
        &self,
        side: KeyDeriveSide,
        peer_exchange: &[u8],
        own_key: Option<&PKeyRef<Private>>,
    ) -> Result<SessionKeyInfo> {
        if let Some((nid, width, random_len)) = self.suite.ecdh_params() {
            let mut reader = Cursor::new(peer_exchange);
            let peer_x = read_len_prefixed(&mut reader, width)?;
            let peer_y = read_len_prefixed(&mut reader, width)?;
            let peer_random = read_len_prefixed(&mut reader, random_len)?;
            if reader.position() as usize != peer_exchange.len() {
                return Err(Error::KeyExchangeError("trailing exchange bytes"));
            }

            let group = EcGroup::from_curve_name(nid)?;
            let peer_x = BigNum::from_slice(&peer_x)?;
            let peer_y = BigNum::from_slice(&peer_y)?;
            let peer = EcKey::from_public_key_affine_coordinates(&group, &peer_x, &peer_y)?;
            peer.check_key()?;
            let peer = PKey::from_ec_key(peer)?;
            let own = PKey::private_key_from_der(&self.secret)?;

            let mut deriver = Deriver::new(&own)?;
            deriver.set_peer(&peer)?;
            let shx = deriver.derive_to_vec()?;

            let mut shse = Vec::with_capacity(shx.len() + 2 * random_len);
            shse.extend_from_slice(&shx);
            match side {
                KeyDeriveSide::Device => {
                    shse.extend_from_slice(&self.random);
                    shse.extend_from_slice(&peer_random);
                }
                KeyDeriveSide::OwnerService => {
                    shse.extend_from_slice(&peer_random);
                    shse.extend_from_slice(&self.random);
                }
            }

            return Ok(SessionKeyInfo {
                shse,
                context_rand: Vec::new(),
            });
        }

        if let Some((params, width)) = self.suite.dh_params()? {
            if peer_exchange.len() != width {
                return Err(Error::KeyExchangeError("unexpected parameter length"));
            }
            let own = params.set_private_key(BigNum::from_slice(&self.secret)?)?;
            let peer_public = BigNum::from_slice(peer_exchange)?;
            let shse = own.compute_key(&peer_public)?;

            return Ok(SessionKeyInfo {
                shse,
                context_rand: Vec::new(),
            });
        }

        if self.suite.asym_params().is_some() {
            return match side {
                KeyDeriveSide::Device => Ok(SessionKeyInfo {
                    shse: self.secret.clone(),
                    context_rand: peer_exchange.to_vec(),
                }),
                KeyDeriveSide::OwnerService => {
                    let own_key = own_key.ok_or(Error::KeyExchangeError(
                        "owner private key required for ASYMKEX",
                    ))?;
                    let mut decrypter = Decrypter::new(own_key)?;
                    decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
                    decrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
                    decrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
                    let mut unwrapped = vec![0u8; decrypter.decrypt_len(peer_exchange)?];
                    let len = decrypter
                        .decrypt(peer_exchange, &mut unwrapped)
                        .map_err(|_| Error::KeyExchangeError("unable to unwrap xB"))?;
                    unwrapped.truncate(len);

                    Ok(SessionKeyInfo {
                        shse: unwrapped,
                        context_rand: self.secret.clone(),
                    })
                }
            };
        }

        Err(Error::UnsupportedAlgorithm)
    }
}

#[cfg(test)]
mod test {
    use openssl::{
        pkey::{PKey, Public},
        rsa::Rsa,
    };

    use super::{KeyDeriveSide, KeyExchange};
    use crate::{constants::KexSuite, Serializable};

    fn exchange_both_ways(suite: KexSuite, rsa_bits: u32) {
        let owner_key = PKey::from_rsa(Rsa::generate(rsa_bits).unwrap()).unwrap();
        let owner_public =
            PKey::public_key_from_der(&owner_key.public_key_to_der().unwrap()).unwrap();

        let owner = KeyExchange::new::<Public>(suite, None).unwrap();
        // The owner keeps its half in the session store between messages
        let owner = KeyExchange::deserialize_data(&owner.serialize_data().unwrap()).unwrap();

        let device = KeyExchange::new(suite, Some(&owner_public)).unwrap();

        let device_keys = device
            .derive_key(KeyDeriveSide::Device, owner.exchange(), None)
            .unwrap();
        let owner_keys = owner
            .derive_key(
                KeyDeriveSide::OwnerService,
                device.exchange(),
                Some(&owner_key),
            )
            .unwrap();

        assert_eq!(device_keys.shared_secret(), owner_keys.shared_secret());
        assert_eq!(device_keys.context_rand(), owner_keys.context_rand());
        assert!(!device_keys.shared_secret().is_empty());
    }

    #[test]
    fn test_kex_symmetry() {
        exchange_both_ways(KexSuite::Ecdh256, 2048);
        exchange_both_ways(KexSuite::Ecdh384, 2048);
        exchange_both_ways(KexSuite::DhkexId14, 2048);
        exchange_both_ways(KexSuite::DhkexId15, 2048);
        exchange_both_ways(KexSuite::Asymkex2048, 2048);
        exchange_both_ways(KexSuite::Asymkex3072, 3072);
    }

    #[test]
    fn test_ecdh_order_matters() {
        let owner = KeyExchange::new::<Public>(KexSuite::Ecdh256, None).unwrap();
        let device = KeyExchange::new::<Public>(KexSuite::Ecdh256, None).unwrap();

        let device_keys = device
            .derive_key(KeyDeriveSide::Device, owner.exchange(), None)
            .unwrap();
        // Owner deriving as if it were the device
        let wrong_keys = owner
            .derive_key(KeyDeriveSide::Device, device.exchange(), None)
            .unwrap();
        assert_ne!(device_keys.shared_secret(), wrong_keys.shared_secret());
        // 32 bytes of x coordinate plus two 16 byte randoms
        assert_eq!(device_keys.shared_secret().len(), 64);
    }

    #[test]
    fn test_ecdh_malformed_exchange() {
        let owner = KeyExchange::new::<Public>(KexSuite::Ecdh384, None).unwrap();
        let device = KeyExchange::new::<Public>(KexSuite::Ecdh384, None).unwrap();

        let mut truncated = owner.exchange().to_vec();
        truncated.pop();
        assert!(device
            .derive_key(KeyDeriveSide::Device, &truncated, None)
            .is_err());

        let mut extended = owner.exchange().to_vec();
        extended.push(0);
        assert!(device
            .derive_key(KeyDeriveSide::Device, &extended, None)
            .is_err());

        let p256 = KeyExchange::new::<Public>(KexSuite::Ecdh256, None).unwrap();
        assert!(device
            .derive_key(KeyDeriveSide::Device, p256.exchange(), None)
            .is_err());
    }

    #[test]
    fn test_asymkex_wrong_key() {
        let owner_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let other_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let owner_public =
            PKey::public_key_from_der(&owner_key.public_key_to_der().unwrap()).unwrap();

        let owner = KeyExchange::new::<Public>(KexSuite::Asymkex2048, None).unwrap();
        let device = KeyExchange::new(KexSuite::Asymkex2048, Some(&owner_public)).unwrap();
        assert!(owner
            .derive_key(
                KeyDeriveSide::OwnerService,
                device.exchange(),
                Some(&other_key)
            )
            .is_err());

        // 2048 bit suite with a 3072 bit owner key
        let big_key = PKey::from_rsa(Rsa::generate(3072).unwrap()).unwrap();
        let big_public = PKey::public_key_from_der(&big_key.public_key_to_der().unwrap()).unwrap();
        assert!(KeyExchange::new(KexSuite::Asymkex2048, Some(&big_public)).is_err());
    }
}
