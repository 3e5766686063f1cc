pub mod connection;
pub mod messages;

use serde::Deserialize;
use serde::Serialize;

pub fn serialize<T: Serialize + ?Sized>(value: &T) -> crate::Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|error| crate::Error::SerializationError(error.to_string()))
}

pub fn deserialize<'a, T: Deserialize<'a>>(data: &'a [u8]) -> crate::Result<T> {
    bincode::deserialize(data)
        .map_err(|error| crate::Error::DeserializationError(error.to_string()))
}
