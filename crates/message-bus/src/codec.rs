//! Binary payload encoding.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Encodes a payload for publishing.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decodes a delivered payload.
///
/// Fails with [`BusError::Codec`](crate::BusError::Codec) on truncated or
/// foreign bytes; callers treat that as a poison message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
