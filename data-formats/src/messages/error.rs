use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use super::{ClientMessage, EncryptionRequirement, Message, ServerMessage};

use crate::constants::{ErrorCode, MessageType};

/// FdoError body, sent by either role when a step fails
#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct ErrorMessage {
    error_code: ErrorCode,
    previous_message_id: u8,
    error_string: String,
    timestamp: Option<u64>,
    correlation_id: u64,
}

impl ErrorMessage {
    pub fn new(
        error_code: ErrorCode,
        previous_message_type: MessageType,
        error_string: String,
        correlation_id: u64,
    ) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .ok();

        ErrorMessage {
            error_code,
            previous_message_id: previous_message_type as u8,
            error_string,
            timestamp,
            correlation_id,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    pub fn previous_message_id(&self) -> u8 {
        self.previous_message_id
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "error {:?} after message {}: {} (correlation id {})",
            self.error_code, self.previous_message_id, self.error_string, self.correlation_id
        )
    }
}

impl Message for ErrorMessage {
    fn message_type() -> MessageType {
        MessageType::Error
    }

    fn is_valid_previous_message(_message_type: Option<MessageType>) -> bool {
        true
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        None
    }

    fn status_code() -> http::StatusCode {
        http::StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl ClientMessage for ErrorMessage {}
impl ServerMessage for ErrorMessage {}
