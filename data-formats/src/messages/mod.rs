use serde::{de::DeserializeOwned, Serialize};

use crate::constants::MessageType;

mod error;
pub use error::ErrorMessage;

pub mod to0;
pub mod to1;
pub mod to2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionRequirement {
    MustBeEncrypted,
    MustNotBeEncrypted,
}

pub trait Message: Send + Serialize + DeserializeOwned + std::fmt::Debug {
    fn message_type() -> MessageType;

    /// Whether this message may follow `message_type` within a session
    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool;

    fn encryption_requirement() -> Option<EncryptionRequirement>;

    fn status_code() -> http::StatusCode {
        http::StatusCode::OK
    }
}

/// Messages sent by the requestor
pub trait ClientMessage: Message {}

/// Messages sent by the listener
pub trait ServerMessage: Message {}
