use std::time::Duration;

use thiserror::Error;

use fdo_data_formats::{
    constants::MessageType,
    messages::{ClientMessage, ErrorMessage, Message, ServerMessage},
    Serializable,
};

use crate::{EncryptionKeys, FDO_PROTOCOL_PATH};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error parsing or generating request: {0}")]
    Parse(#[from] fdo_data_formats::Error),
    #[error("Error performing request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Invalid service URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Missing message type in response")]
    MissingMessageType,
    #[error("Invalid message type {0} encountered")]
    InvalidMessageType(String),
    #[error("Invalid message type {0} encountered, expected {1}")]
    InvalidMessage(u8, u8),
    #[error("Message {0:?} is not valid at this point of the protocol")]
    InvalidSequence(MessageType),
    #[error("Error returned by server: {0}")]
    Error(ErrorMessage),
}

pub type RequestResult<MT> = Result<MT, Error>;

/// A client for one protocol session against one server
#[derive(Debug)]
pub struct ServiceClient {
    base_url: url::Url,
    client: reqwest::Client,
    authorization_token: Option<String>,
    encryption_keys: EncryptionKeys,
    last_message_type: Option<MessageType>,
}

impl ServiceClient {
    pub fn new(base_url: &str) -> RequestResult<Self> {
        let base_url = url::Url::parse(base_url.trim_end_matches('/'))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(ServiceClient {
            base_url,
            client,
            authorization_token: None,
            encryption_keys: EncryptionKeys::None,
            last_message_type: None,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Bodies of all following requests and responses are protected with `keys`
    pub fn set_encryption_keys(&mut self, keys: EncryptionKeys) {
        self.encryption_keys = keys;
    }

    fn message_url(&self, message_type: MessageType) -> RequestResult<url::Url> {
        Ok(self.base_url.join(&format!(
            "fdo/{}/msg/{}",
            FDO_PROTOCOL_PATH, message_type as u8
        ))?)
    }

    pub async fn send_request<OM, SM>(&mut self, to_send: OM) -> RequestResult<SM>
    where
        OM: ClientMessage,
        SM: ServerMessage,
    {
        if !OM::is_valid_previous_message(self.last_message_type) {
            return Err(Error::InvalidSequence(OM::message_type()));
        }
        if !SM::is_valid_previous_message(Some(OM::message_type())) {
            return Err(Error::InvalidSequence(SM::message_type()));
        }

        let body = self
            .encryption_keys
            .wrap_message::<OM>(to_send.serialize_data()?)?;
        log::trace!("Sending {:?}: {:?}", OM::message_type(), to_send);

        let mut req = self
            .client
            .post(self.message_url(OM::message_type())?)
            .header("Content-Type", "application/cbor")
            .body(body);
        if let Some(authorization_token) = &self.authorization_token {
            req = req.header("Authorization", authorization_token);
        }

        let resp = req.send().await?;

        let msgtype = resp
            .headers()
            .get("message-type")
            .ok_or(Error::MissingMessageType)?
            .to_str()
            .map_err(|_| Error::MissingMessageType)?;
        let msgtype = msgtype
            .parse::<u8>()
            .map_err(|_| Error::InvalidMessageType(msgtype.to_string()))?;

        if let Some(val) = resp.headers().get("authorization") {
            match val.to_str() {
                Ok(val) => self.authorization_token = Some(val.to_string()),
                Err(_) => log::warn!("Ignoring unreadable authorization header"),
            }
        }

        let is_success = if resp.status().is_success() {
            if msgtype != SM::message_type() as u8 {
                return Err(Error::InvalidMessage(msgtype, SM::message_type() as u8));
            }
            true
        } else {
            if msgtype != MessageType::Error as u8 {
                return Err(Error::InvalidMessage(msgtype, MessageType::Error as u8));
            }
            false
        };

        let resp = resp.bytes().await?;

        if is_success {
            let resp = self.encryption_keys.unwrap_message::<SM>(&resp)?;
            let resp = SM::deserialize_data(&resp)?;
            log::trace!("Received {:?}: {:?}", SM::message_type(), resp);
            self.last_message_type = Some(SM::message_type());
            Ok(resp)
        } else {
            Err(Error::Error(ErrorMessage::deserialize_data(&resp)?))
        }
    }

    /// Reports a failure to the server. Best effort, any failure is only logged.
    pub async fn send_error(&self, error: ErrorMessage) {
        let url = match self.message_url(MessageType::Error) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("Unable to build error report URL: {}", e);
                return;
            }
        };
        let body = match error.serialize_data() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Unable to serialize error report: {}", e);
                return;
            }
        };

        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/cbor")
            .body(body);
        if let Some(authorization_token) = &self.authorization_token {
            req = req.header("Authorization", authorization_token);
        }
        if let Err(e) = req.send().await {
            log::warn!("Unable to send error report: {}", e);
        }
    }
}
