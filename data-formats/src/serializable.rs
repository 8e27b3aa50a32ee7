use serde::{de::DeserializeOwned, Serialize};

use crate::Error;

/// Encodes any serializable value, including borrowed views, as CBOR
pub fn to_cbor<T>(value: &T) -> Result<Vec<u8>, Error>
where
    T: Serialize + ?Sized,
{
    let mut output = Vec::new();
    ciborium::ser::into_writer(value, &mut output)?;
    Ok(output)
}

pub fn from_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T, Error> {
    ciborium::de::from_reader(data).map_err(Error::from)
}

pub trait Serializable {
    fn deserialize_data(data: &[u8]) -> Result<Self, Error>
    where
        Self: Sized;
    fn serialize_data(&self) -> Result<Vec<u8>, Error>;

    fn deserialize_from_reader<R>(mut reader: R) -> Result<Self, Error>
    where
        Self: Sized,
        R: std::io::Read,
    {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        Self::deserialize_data(&buffer)
    }

    fn serialize_to_writer<W>(&self, mut writer: W) -> Result<(), Error>
    where
        W: std::io::Write,
    {
        let serialized = self.serialize_data()?;
        writer.write_all(&serialized).map_err(Error::from)
    }
}

impl<T> Serializable for T
where
    T: Serialize + DeserializeOwned,
{
    fn deserialize_data(data: &[u8]) -> Result<Self, Error> {
        from_cbor(data)
    }

    fn deserialize_from_reader<R>(reader: R) -> Result<Self, Error>
    where
        Self: Sized,
        R: std::io::Read,
    {
        ciborium::de::from_reader(reader).map_err(Error::from)
    }

    fn serialize_data(&self) -> Result<Vec<u8>, Error> {
        to_cbor(self)
    }

    fn serialize_to_writer<W>(&self, writer: W) -> Result<(), Error>
    where
        W: std::io::Write,
    {
        ciborium::ser::into_writer(self, writer).map_err(Error::from)
    }
}
