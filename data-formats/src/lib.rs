mod errors;
pub use errors::{ChainError, Error};

pub mod constants;
pub use constants::ProtocolVersion;

pub mod types;

pub mod cose;

pub mod publickey;

pub mod rendezvous;

pub mod ownershipvoucher;

pub mod devicecredential;
pub use devicecredential::DeviceCredential;

pub mod keyexchange;

pub mod encryption;

pub mod serviceinfo;

pub mod conformance;

pub mod messages;

pub mod serializable;
pub use serializable::{from_cbor, to_cbor, Serializable};
