//! Order-preserving encoding of index key components.

use super::{EncodingError, Key};
use crate::error::Result;

// Type prefixes keep components of different types apart in a composite key
const TYPE_INTEGER: u8 = 0x02;
const TYPE_UNSIGNED: u8 = 0x06;

pub const INTEGER_SIZE: usize = 9;

/// Encode a signed integer with order preservation
pub fn encode_integer(i: i64) -> Vec<u8> {
    // Flip the sign bit to ensure negative numbers sort before positive
    let unsigned = (i as u64) ^ (1u64 << 63);
    let mut result = vec![TYPE_INTEGER];
    result.extend_from_slice(&unsigned.to_be_bytes());
    result
}

/// Decode a signed integer from bytes
pub fn decode_integer(bytes: &[u8]) -> Result<i64> {
    let raw = decode_tagged(bytes, TYPE_INTEGER, "an integer")?;
    Ok((raw ^ (1u64 << 63)) as i64)
}

/// Encode an unsigned integer with order preservation
pub fn encode_unsigned(u: u64) -> Vec<u8> {
    let mut result = vec![TYPE_UNSIGNED];
    result.extend_from_slice(&u.to_be_bytes());
    result
}

/// Decode an unsigned integer from bytes
pub fn decode_unsigned(bytes: &[u8]) -> Result<u64> {
    decode_tagged(bytes, TYPE_UNSIGNED, "an unsigned integer")
}

fn decode_tagged(bytes: &[u8], tag: u8, what: &str) -> Result<u64> {
    if bytes.is_empty() {
        return Err(EncodingError::TruncatedData.into());
    }

    if bytes[0] != tag {
        return Err(EncodingError::InvalidFormat(format!("Not {}", what)).into());
    }

    if bytes.len() != INTEGER_SIZE {
        return Err(EncodingError::InvalidFormat(format!(
            "{} must be {} bytes total",
            what, INTEGER_SIZE
        ))
        .into());
    }

    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[1..INTEGER_SIZE]);
    Ok(u64::from_be_bytes(buf))
}

impl Key for i64 {
    fn encode(&self) -> Vec<u8> {
        encode_integer(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_integer(bytes)
    }
}

impl Key for i32 {
    fn encode(&self) -> Vec<u8> {
        encode_integer(*self as i64)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let value = decode_integer(bytes)?;
        i32::try_from(value).map_err(|_| {
            EncodingError::InvalidFormat(format!("{} out of range for i32", value)).into()
        })
    }
}

impl Key for u64 {
    fn encode(&self) -> Vec<u8> {
        encode_unsigned(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_unsigned(bytes)
    }
}

/// Composite keys: the first component is the scan prefix.
impl<A: Key, B: Key> Key for (A, B) {
    fn encode(&self) -> Vec<u8> {
        let mut out = self.0.encode();
        out.extend(self.1.encode());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 2 * INTEGER_SIZE {
            return Err(EncodingError::InvalidFormat(
                "Composite key must hold two integer components".to_string(),
            )
            .into());
        }
        let (first, second) = bytes.split_at(INTEGER_SIZE);
        Ok((A::decode(first)?, B::decode(second)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_ordering() {
        let values = [i64::MIN, -1000, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<_> = values.iter().map(|v| v.encode()).collect();

        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1], "Encoding must preserve order");
        }
        for (value, bytes) in values.iter().zip(&encoded) {
            assert_eq!(i64::decode(bytes).unwrap(), *value);
        }
    }

    #[test]
    fn test_unsigned_ordering() {
        let small = 1u64.encode();
        let large = u64::MAX.encode();
        assert!(small < large);
        assert_eq!(u64::decode(&large).unwrap(), u64::MAX);
    }

    #[test]
    fn test_composite_prefix() {
        let key = (7i32, 42u64).encode();
        let prefix = 7i32.encode();
        assert!(key.starts_with(&prefix));

        // All keys with the same first component sort together
        let lower = (7i32, 0u64).encode();
        let upper = (8i32, 0u64).encode();
        assert!(lower <= key && key < upper);

        assert_eq!(<(i32, u64)>::decode(&key).unwrap(), (7, 42));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let bytes = 5u64.encode();
        assert!(i64::decode(&bytes).is_err());
        assert!(u64::decode(&bytes[..4]).is_err());
        assert!(u64::decode(&[]).is_err());
    }
}
