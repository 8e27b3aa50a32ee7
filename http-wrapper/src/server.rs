use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_bytes::ByteBuf;
use warp::{http::StatusCode, hyper::body::Bytes, Filter, Rejection};

use fdo_data_formats::{
    constants::{ErrorCode, MessageType},
    from_cbor,
    messages::{ErrorMessage, Message},
    to_cbor, Serializable,
};
use fdo_store::StoreError;

use crate::{EncryptionKeys, FDO_PROTOCOL_PATH};

const MAX_BODY_SIZE: u64 = 1024 * 64;

#[derive(Debug)]
pub struct Error {
    status: StatusCode,
    message: ErrorMessage,
}

impl Error {
    pub fn new(error_code: ErrorCode, previous_message_type: MessageType, error_string: &str) -> Self {
        let status = match error_code {
            ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InvalidJwtToken => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        };
        let correlation_id = uuid::Uuid::new_v4().as_u128() as u64;

        Error {
            status,
            message: ErrorMessage::new(
                error_code,
                previous_message_type,
                error_string.to_string(),
                correlation_id,
            ),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// An internal failure while handling `M`; details only go to the log
    pub fn from_error<M, E>(err: E) -> Self
    where
        M: Message,
        E: std::fmt::Debug,
    {
        let error = Error::new(
            ErrorCode::InternalServerError,
            M::message_type(),
            "Internal error",
        );
        log::error!(
            "Internal error processing {:?} (correlation id {}): {:?}",
            M::message_type(),
            error.message.correlation_id(),
            err
        );
        error
    }

    /// A failed nonce, signature, hash or MAC check on `M`
    pub fn invalid_message<M: Message>(reason: &str) -> Self {
        log::info!("Rejecting {:?}: {}", M::message_type(), reason);
        Error::new(
            ErrorCode::InvalidMessageError,
            M::message_type(),
            "Invalid message",
        )
    }

    pub fn error_code(&self) -> ErrorCode {
        self.message.error_code()
    }

    fn into_response(self) -> warp::reply::Response {
        let body = match self.message.serialize_data() {
            Ok(body) => body,
            Err(e) => {
                log::error!("Error serializing error message: {:?}", e);
                Vec::new()
            }
        };
        let mut response = warp::reply::Response::new(body.into());
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(
            "Content-Type",
            warp::http::HeaderValue::from_static("application/cbor"),
        );
        headers.insert(
            "Message-Type",
            warp::http::HeaderValue::from(MessageType::Error as u16),
        );
        response
    }
}

impl warp::reject::Reject for Error {}

/// Per-session state kept between requests of one protocol run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    last_message_type: Option<MessageType>,
    encryption_keys: EncryptionKeys,
    values: HashMap<String, ByteBuf>,
    finished: bool,
}

impl Session {
    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), fdo_data_formats::Error> {
        self.values
            .insert(key.to_string(), ByteBuf::from(to_cbor(value)?));
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, fdo_data_formats::Error> {
        match self.values.get(key) {
            None => Ok(None),
            Some(value) => Ok(Some(from_cbor(value)?)),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn last_message_type(&self) -> Option<MessageType> {
        self.last_message_type
    }

    pub fn encryption_keys(&self) -> &EncryptionKeys {
        &self.encryption_keys
    }

    pub fn set_encryption_keys(&mut self, keys: EncryptionKeys) {
        self.encryption_keys = keys;
    }

    /// Drop the session after the current response has been sent
    pub fn mark_finished(&mut self) {
        self.finished = true;
    }
}

pub type SessionStore = fdo_store::SessionStore<Session>;

pub fn new_session_store(config: &fdo_store::StoreConfig) -> Result<Arc<SessionStore>, StoreError> {
    Ok(Arc::new(SessionStore::new(config.initialize()?)))
}

/// The session of a request together with the raw (decrypted) request body
#[derive(Debug)]
pub struct SessionWithStore {
    pub session: Session,
    raw_request: Vec<u8>,
}

impl SessionWithStore {
    pub fn raw_request(&self) -> &[u8] {
        &self.raw_request
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    let local_err = if let Some(err) = err.find::<Error>() {
        return Ok(Error {
            status: err.status,
            message: err.message.clone(),
        }
        .into_response());
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        Error::new(
            ErrorCode::MessageBodyError,
            MessageType::Error,
            "Invalid request method",
        )
        .with_status(StatusCode::METHOD_NOT_ALLOWED)
    } else if err.find::<warp::reject::InvalidHeader>().is_some()
        || err.find::<warp::reject::MissingHeader>().is_some()
    {
        Error::new(
            ErrorCode::MessageBodyError,
            MessageType::Error,
            "Invalid content type",
        )
        .with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        Error::new(
            ErrorCode::MessageBodyError,
            MessageType::Error,
            "Request body too large",
        )
    } else if err.is_not_found() {
        Error::new(
            ErrorCode::MessageBodyError,
            MessageType::Error,
            "Invalid request type",
        )
    } else {
        log::warn!("Unhandled rejection: {:?}", err);
        Error::new(
            ErrorCode::InternalServerError,
            MessageType::Error,
            "Error processing request",
        )
    };

    Ok(local_err.into_response())
}

fn parse_token(authorization: Option<String>) -> Option<String> {
    authorization.map(|value| match value.strip_prefix("Bearer ") {
        Some(token) => token.trim().to_string(),
        None => value.trim().to_string(),
    })
}

async fn process_request<UD, IM, OM, F, FR>(
    user_data: UD,
    sessions: Arc<SessionStore>,
    handler: F,
    authorization: Option<String>,
    body: Bytes,
) -> Result<warp::reply::Response, Error>
where
    UD: Clone + Send + Sync + 'static,
    F: Fn(UD, SessionWithStore, IM) -> FR + Clone + Send + Sync + 'static,
    FR: futures::Future<Output = Result<(OM, SessionWithStore), Rejection>> + Send,
    IM: Message + 'static,
    OM: Message + 'static,
{
    let token = parse_token(authorization);
    let session = match &token {
        None => Session::default(),
        Some(token) => match sessions.get(token).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                log::debug!("Request with unknown session token");
                return Err(Error::new(
                    ErrorCode::InvalidJwtToken,
                    IM::message_type(),
                    "Invalid session token",
                ));
            }
            Err(e) => return Err(Error::from_error::<IM, _>(e)),
        },
    };

    let result = handle_in_session(user_data, handler, session, body).await;

    let (response, session) = match result {
        Ok(v) => v,
        Err(e) => {
            if let Some(token) = &token {
                if let Err(destroy_err) = sessions.destroy(token).await {
                    log::warn!("Error destroying failed session: {:?}", destroy_err);
                }
            }
            return Err(e);
        }
    };

    let token = match (session.finished, token) {
        (true, Some(token)) => {
            sessions
                .destroy(&token)
                .await
                .map_err(Error::from_error::<IM, _>)?;
            token
        }
        (true, None) => String::new(),
        (false, Some(token)) => {
            sessions
                .update(&token, session)
                .await
                .map_err(Error::from_error::<IM, _>)?;
            token
        }
        (false, None) => sessions
            .new_session(session)
            .await
            .map_err(Error::from_error::<IM, _>)?,
    };

    let mut response = warp::reply::Response::new(response.into());
    *response.status_mut() = OM::status_code();
    let headers = response.headers_mut();
    headers.insert(
        "Message-Type",
        warp::http::HeaderValue::from(OM::message_type() as u16),
    );
    headers.insert(
        "Content-Type",
        warp::http::HeaderValue::from_static("application/cbor"),
    );
    if !token.is_empty() {
        let value = warp::http::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(Error::from_error::<IM, _>)?;
        headers.insert("Authorization", value);
    }

    Ok(response)
}

async fn handle_in_session<UD, IM, OM, F, FR>(
    user_data: UD,
    handler: F,
    session: Session,
    body: Bytes,
) -> Result<(Vec<u8>, Session), Error>
where
    F: Fn(UD, SessionWithStore, IM) -> FR,
    FR: futures::Future<Output = Result<(OM, SessionWithStore), Rejection>>,
    IM: Message,
    OM: Message,
{
    if !IM::is_valid_previous_message(session.last_message_type) {
        log::info!(
            "Message {:?} not valid after {:?}",
            IM::message_type(),
            session.last_message_type
        );
        return Err(Error::new(
            ErrorCode::InvalidMessageError,
            IM::message_type(),
            "Invalid message sequence",
        ));
    }

    let raw_request = session
        .encryption_keys
        .unwrap_message::<IM>(&body)
        .map_err(|_| Error::invalid_message::<IM>("unable to decrypt"))?;
    let message = IM::deserialize_data(&raw_request).map_err(|e| {
        log::debug!("Error parsing {:?}: {:?}", IM::message_type(), e);
        Error::new(
            ErrorCode::MessageBodyError,
            IM::message_type(),
            "Invalid request body",
        )
    })?;
    log::trace!("Received {:?}: {:?}", IM::message_type(), message);

    let ses_with_store = SessionWithStore {
        session,
        raw_request,
    };

    let (response, ses_with_store) = match handler(user_data, ses_with_store, message).await {
        Ok(v) => v,
        Err(rejection) => match rejection.find::<Error>() {
            Some(e) => {
                return Err(Error {
                    status: e.status,
                    message: e.message.clone(),
                })
            }
            None => {
                return Err(Error::from_error::<IM, _>(rejection));
            }
        },
    };
    let mut session = ses_with_store.session;
    session.last_message_type = Some(OM::message_type());

    let response = response
        .serialize_data()
        .map_err(Error::from_error::<IM, _>)?;
    let response = session
        .encryption_keys
        .wrap_message::<OM>(response)
        .map_err(Error::from_error::<IM, _>)?;

    Ok((response, session))
}

/// Route accepting `IM` on `/fdo/101/msg/<type>` and answering with `OM`
pub fn fdo_request_filter<UD, IM, OM, F, FR>(
    user_data: UD,
    sessions: Arc<SessionStore>,
    handler: F,
) -> warp::filters::BoxedFilter<(warp::reply::Response,)>
where
    UD: Clone + Send + Sync + 'static,
    F: Fn(UD, SessionWithStore, IM) -> FR + Clone + Send + Sync + 'static,
    FR: futures::Future<Output = Result<(OM, SessionWithStore), Rejection>> + Send,
    IM: Message + 'static,
    OM: Message + 'static,
{
    warp::path("fdo")
        .and(warp::path(FDO_PROTOCOL_PATH))
        .and(warp::path("msg"))
        .and(warp::path((IM::message_type() as u8).to_string()))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::header::exact_ignore_case(
            "Content-Type",
            "application/cbor",
        ))
        .and(warp::header::optional::<String>("Authorization"))
        .and(warp::body::content_length_limit(MAX_BODY_SIZE))
        .and(warp::body::bytes())
        .then(move |authorization: Option<String>, body: Bytes| {
            let user_data = user_data.clone();
            let sessions = sessions.clone();
            let handler = handler.clone();
            async move {
                match process_request(user_data, sessions, handler, authorization, body).await {
                    Ok(response) => response,
                    Err(e) => e.into_response(),
                }
            }
        })
        .boxed()
}

/// Accepts error reports (message 255) sent by a peer and logs them
pub fn error_report_filter() -> warp::filters::BoxedFilter<(warp::reply::Response,)> {
    warp::path("fdo")
        .and(warp::path(FDO_PROTOCOL_PATH))
        .and(warp::path("msg"))
        .and(warp::path((MessageType::Error as u8).to_string()))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_SIZE))
        .and(warp::body::bytes())
        .map(|body: Bytes| {
            match ErrorMessage::deserialize_data(&body) {
                Ok(report) => log::warn!("Peer reported an error: {}", report),
                Err(e) => log::warn!("Peer sent an unparseable error report: {:?}", e),
            }
            let mut response = warp::reply::Response::new(Vec::new().into());
            *response.status_mut() = StatusCode::OK;
            response
        })
        .boxed()
}

pub fn ping_handler() -> warp::filters::BoxedFilter<(warp::reply::Response,)> {
    warp::path("ping")
        .and(warp::path::end())
        .and(warp::post())
        .map(|| warp::reply::Response::new("pong".into()))
        .boxed()
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use fdo_data_formats::{
        constants::{ErrorCode, MessageType},
        messages::{
            to0::{AcceptOwner, Hello, HelloAck, OwnerSign},
            ErrorMessage,
        },
        types::Nonce,
        Serializable,
    };
    use fdo_store::StoreConfig;
    use warp::Filter;

    use super::{fdo_request_filter, handle_rejection, new_session_store, Error, SessionWithStore};

    async fn hello(
        _ud: (),
        mut ses: SessionWithStore,
        _msg: Hello,
    ) -> Result<(HelloAck, SessionWithStore), warp::Rejection> {
        let nonce = Nonce::new().map_err(Error::from_error::<Hello, _>)?;
        ses.session
            .insert("nonce", &nonce)
            .map_err(Error::from_error::<Hello, _>)?;
        Ok((HelloAck::new(nonce), ses))
    }

    async fn ownersign(
        _ud: (),
        _ses: SessionWithStore,
        _msg: OwnerSign,
    ) -> Result<(AcceptOwner, SessionWithStore), warp::Rejection> {
        Err(Error::invalid_message::<OwnerSign>("always").into())
    }

    #[tokio::test]
    async fn test_session_and_errors() {
        let sessions = new_session_store(&StoreConfig::InMemory).unwrap();
        let routes = fdo_request_filter((), sessions.clone(), hello)
            .or(fdo_request_filter((), sessions.clone(), ownersign))
            .unify()
            .recover(handle_rejection);
        let routes = Arc::new(routes);

        let response = warp::test::request()
            .method("POST")
            .path("/fdo/101/msg/20")
            .header("Content-Type", "application/cbor")
            .body(Hello::new().serialize_data().unwrap())
            .reply(routes.as_ref())
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["Message-Type"], "21");
        let token = response.headers()["Authorization"]
            .to_str()
            .unwrap()
            .to_string();
        assert!(token.starts_with("Bearer "));
        HelloAck::deserialize_data(response.body()).unwrap();

        // Hello cannot follow HelloAck
        let response = warp::test::request()
            .method("POST")
            .path("/fdo/101/msg/20")
            .header("Content-Type", "application/cbor")
            .header("Authorization", &token)
            .body(Hello::new().serialize_data().unwrap())
            .reply(routes.as_ref())
            .await;
        assert_eq!(response.status(), 400);
        assert_eq!(response.headers()["Message-Type"], "255");
        let error = ErrorMessage::deserialize_data(response.body()).unwrap();
        assert_eq!(error.error_code(), ErrorCode::InvalidMessageError);
        assert_eq!(error.previous_message_id(), MessageType::TO0Hello as u8);

        // The failed session is gone
        let response = warp::test::request()
            .method("POST")
            .path("/fdo/101/msg/22")
            .header("Content-Type", "application/cbor")
            .header("Authorization", &token)
            .body(vec![0x80])
            .reply(routes.as_ref())
            .await;
        assert_eq!(response.status(), 401);

        let response = warp::test::request()
            .method("POST")
            .path("/fdo/101/msg/20")
            .header("Content-Type", "text/plain")
            .body(Hello::new().serialize_data().unwrap())
            .reply(routes.as_ref())
            .await;
        assert_eq!(response.status(), 415);

        let response = warp::test::request()
            .method("POST")
            .path("/fdo/101/msg/20")
            .header("Content-Type", "application/cbor")
            .body(vec![0xff, 0x00])
            .reply(routes.as_ref())
            .await;
        assert_eq!(response.status(), 400);
        let error = ErrorMessage::deserialize_data(response.body()).unwrap();
        assert_eq!(error.error_code(), ErrorCode::MessageBodyError);
    }
}
