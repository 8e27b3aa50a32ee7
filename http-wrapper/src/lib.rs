use serde::{Deserialize, Serialize};

use fdo_data_formats::{
    constants::CipherSuite,
    encryption::SessionKey,
    messages::{EncryptionRequirement, Message},
    Error,
};

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub mod client;

pub const FDO_PROTOCOL_PATH: &str = "101";

pub fn init_logging() {
    if let Err(e) = pretty_env_logger::try_init() {
        eprintln!("Unable to initialize logging: {}", e);
    }
}

/// Keys protecting message bodies once TO2 key exchange completed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum EncryptionKeys {
    #[default]
    None,
    Session(SessionKey),
}

impl EncryptionKeys {
    pub fn from_session_key(key: SessionKey) -> Self {
        EncryptionKeys::Session(key)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, EncryptionKeys::None)
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        match self {
            EncryptionKeys::None => None,
            EncryptionKeys::Session(key) => Some(key.suite()),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            EncryptionKeys::None => Err(Error::InvalidTransition),
            EncryptionKeys::Session(key) => key.encrypt(plaintext),
        }
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            EncryptionKeys::None => Err(Error::InvalidTransition),
            EncryptionKeys::Session(key) => key.decrypt(ciphertext),
        }
    }

    /// Wraps the body of an outgoing `M` as its encryption requirement says
    pub fn wrap_message<M: Message>(&self, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        match M::encryption_requirement() {
            Some(EncryptionRequirement::MustBeEncrypted) => self.encrypt(&body),
            _ => Ok(body),
        }
    }

    /// Reverse of [`EncryptionKeys::wrap_message`] for an incoming `M`
    pub fn unwrap_message<M: Message>(&self, body: &[u8]) -> Result<Vec<u8>, Error> {
        match M::encryption_requirement() {
            Some(EncryptionRequirement::MustBeEncrypted) => self.decrypt(body),
            _ => Ok(body.to_vec()),
        }
    }
}

#[cfg(test)]
mod test {
    use fdo_data_formats::{
        constants::{CipherSuite, KexSuite},
        encryption::SessionKey,
        keyexchange::{KeyDeriveSide, KeyExchange},
        messages::to2::{Done, HelloDevice},
        types::{Guid, Nonce, SigInfo},
        Serializable,
    };
    use openssl::pkey::Public;

    use super::EncryptionKeys;

    #[test]
    fn test_wrapping_follows_requirement() {
        let device = KeyExchange::new::<Public>(KexSuite::Ecdh256, None).unwrap();
        let owner = KeyExchange::new::<Public>(KexSuite::Ecdh256, None).unwrap();
        let info = device
            .derive_key(KeyDeriveSide::Device, owner.exchange(), None)
            .unwrap();
        let keys = EncryptionKeys::from_session_key(
            SessionKey::derive(CipherSuite::A128Gcm, &info).unwrap(),
        );

        let done = Done::new(Nonce::new().unwrap()).serialize_data().unwrap();
        let wrapped = keys.wrap_message::<Done>(done.clone()).unwrap();
        assert_ne!(wrapped, done);
        assert_eq!(keys.unwrap_message::<Done>(&wrapped).unwrap(), done);

        let hello = HelloDevice::new(
            Guid::new().unwrap(),
            Nonce::new().unwrap(),
            KexSuite::Ecdh256,
            CipherSuite::A128Gcm,
            SigInfo::new(
                fdo_data_formats::constants::DeviceSigType::StSECP256R1,
                vec![],
            ),
        )
        .serialize_data()
        .unwrap();
        assert_eq!(
            keys.wrap_message::<HelloDevice>(hello.clone()).unwrap(),
            hello
        );

        assert!(EncryptionKeys::None
            .wrap_message::<Done>(done.clone())
            .is_err());
    }
}
