use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use super::{ClientMessage, EncryptionRequirement, Message, ServerMessage};

use crate::{
    constants::{HashType, MessageType},
    cose::COSESign,
    types::{Hash, Nonce, TO0Data},
    Error, Serializable,
};

#[derive(Debug)]
pub struct Hello {}

impl Hello {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Hello {}
    }
}

impl Serialize for Hello {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let seq = serializer.serialize_seq(Some(0))?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Hello {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EmptyVisitor;

        impl<'de> serde::de::Visitor<'de> for EmptyVisitor {
            type Value = Hello;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an empty array")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Hello, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                match seq.next_element::<serde::de::IgnoredAny>()? {
                    None => Ok(Hello {}),
                    Some(_) => Err(serde::de::Error::invalid_length(1, &self)),
                }
            }
        }

        deserializer.deserialize_seq(EmptyVisitor)
    }
}

impl Message for Hello {
    fn message_type() -> MessageType {
        MessageType::TO0Hello
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        message_type.is_none()
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ClientMessage for Hello {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct HelloAck {
    nonce3: Nonce,
}

impl HelloAck {
    pub fn new(nonce3: Nonce) -> Self {
        HelloAck { nonce3 }
    }

    pub fn nonce3(&self) -> &Nonce {
        &self.nonce3
    }
}

impl Message for HelloAck {
    fn message_type() -> MessageType {
        MessageType::TO0HelloAck
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO0Hello))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ServerMessage for HelloAck {}

/// The owner's registration: the encoded To0d and the signed To1d blob
#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct OwnerSign {
    to0d: ByteBuf,
    to1d: COSESign,
}

impl OwnerSign {
    pub fn new(to0d: &TO0Data, to1d: COSESign) -> Result<Self, Error> {
        Ok(OwnerSign {
            to0d: ByteBuf::from(to0d.serialize_data()?),
            to1d,
        })
    }

    pub fn to0d(&self) -> Result<TO0Data, Error> {
        TO0Data::deserialize_data(&self.to0d)
    }

    pub fn to0d_raw(&self) -> &[u8] {
        &self.to0d
    }

    pub fn to1d(&self) -> &COSESign {
        &self.to1d
    }

    /// Hash over the To0d bytes exactly as received
    pub fn to0d_hash(&self, hash_type: HashType) -> Result<Hash, Error> {
        Hash::from_data(hash_type, &self.to0d)
    }
}

impl Message for OwnerSign {
    fn message_type() -> MessageType {
        MessageType::TO0OwnerSign
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO0HelloAck))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ClientMessage for OwnerSign {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct AcceptOwner {
    wait_seconds: u32,
}

impl AcceptOwner {
    pub fn new(wait_seconds: u32) -> Self {
        AcceptOwner { wait_seconds }
    }

    pub fn wait_seconds(&self) -> u32 {
        self.wait_seconds
    }
}

impl Message for AcceptOwner {
    fn message_type() -> MessageType {
        MessageType::TO0AcceptOwner
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO0OwnerSign))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ServerMessage for AcceptOwner {}

#[cfg(test)]
mod test {
    use super::{AcceptOwner, Hello};
    use crate::Serializable;

    #[test]
    fn test_hello_is_empty_array() {
        let encoded = Hello::new().serialize_data().unwrap();
        assert_eq!(encoded, vec![0x80]);
        Hello::deserialize_data(&encoded).unwrap();
        assert!(Hello::deserialize_data(&[0x81, 0x01]).is_err());
    }

    #[test]
    fn test_accept_owner() {
        let encoded = AcceptOwner::new(3600).serialize_data().unwrap();
        assert_eq!(encoded, vec![0x81, 0x19, 0x0e, 0x10]);
    }
}
