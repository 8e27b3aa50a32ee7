use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain is empty")]
    Empty,
    #[error("Chain needs at least a leaf and a root certificate")]
    TooShort,
    #[error("Certificate at position {0} was not issued by its successor")]
    NonIssuer(usize),
    #[error("Invalid signed certificate at position {0}")]
    InvalidSignedCert(usize),
    #[error("Root certificate is not a self-signed CA")]
    RootNotCa,
    #[error("Path validation failed: {0}")]
    PathValidation(String),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Cryptographic error stack: {0}")]
    CryptoStack(#[from] openssl::error::ErrorStack),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),
    #[error("Invalid PEM tag: {0}")]
    InvalidPemTag(String),
    #[error("Invalid hash value")]
    IncorrectHash,
    #[error("Incorrect nonce value")]
    IncorrectNonce,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Unsupported algorithm used")]
    UnsupportedAlgorithm,
    #[error("Unsupported public key encoding/type combination")]
    UnsupportedKeyEncoding,
    #[error("Non-owner key attempted to sign")]
    NonOwnerKey,
    #[error("Inconsistent values were used for '{0}'")]
    InconsistentValue(&'static str),
    #[error("An invalid state machine transition was attempted")]
    InvalidTransition,
    #[error("Invalid cryptographic suite name requested: {0}")]
    InvalidSuiteName(String),
    #[error("Invalid entry number requested")]
    InvalidEntryNum,
    #[error("Error in key exchange: {0}")]
    KeyExchangeError(&'static str),
    #[error("Invalid certificate chain encountered: {0}")]
    InvalidChain(ChainError),
    #[error("Ownership voucher is invalid: {0}")]
    InvalidVoucher(&'static str),
    #[error("Decryption failed")]
    DecryptionFailed,
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for Error {
    fn from(e: ciborium::de::Error<T>) -> Self {
        Error::Serialization(format!("{:?}", e))
    }
}

impl<T: std::fmt::Debug> From<ciborium::ser::Error<T>> for Error {
    fn from(e: ciborium::ser::Error<T>) -> Self {
        Error::Serialization(format!("{:?}", e))
    }
}

impl From<ciborium::value::Error> for Error {
    fn from(e: ciborium::value::Error) -> Self {
        Error::Serialization(format!("{:?}", e))
    }
}

impl From<ChainError> for Error {
    fn from(e: ChainError) -> Self {
        Error::InvalidChain(e)
    }
}
