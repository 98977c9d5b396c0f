use super::EncodingError;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("serialization should not fail")
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| EncodingError::InvalidFormat(format!("Deserialization failed: {}", e)).into())
}

/// Size of the bincode encoding of `value`.
pub fn serialized_size<T: Serialize>(value: &T) -> usize {
    bincode::serialized_size(value).expect("size computation should not fail") as usize
}

/// Deserialize a value that must occupy the whole buffer.
///
/// Fixed-layout records carry no framing of their own, so a buffer of the
/// wrong length means it holds some other record type.
pub fn deserialize_exact<T>(bytes: &[u8], expected: usize) -> Result<T>
where
    T: for<'a> Deserialize<'a>,
{
    if bytes.len() != expected {
        return Err(EncodingError::LengthMismatch {
            expected,
            actual: bytes.len(),
        }
        .into());
    }
    deserialize(bytes)
}
