pub mod bincode;
pub mod dataset;
pub mod keycode;

use crate::error::Result;

/// Trait for encoding index keys with order preservation.
///
/// Index scans walk keys in byte order, so the encoding must sort the same
/// way the decoded values do. Composite keys are plain concatenations of
/// their encoded components, which makes every leading component a usable
/// scan prefix.
pub trait Key {
    /// Encode the key to bytes while preserving sort order
    fn encode(&self) -> Vec<u8>;

    /// Decode bytes back to the original key type
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Error type for encoding operations
#[derive(Debug)]
pub enum EncodingError {
    InvalidFormat(String),
    TruncatedData,
    LengthMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid encoding format: {}", msg),
            EncodingError::TruncatedData => write!(f, "Truncated data"),
            EncodingError::LengthMismatch { expected, actual } => write!(
                f,
                "Encoded length {} does not match declared size {}",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        match err {
            EncodingError::LengthMismatch { expected, actual } => {
                crate::Error::SizeMismatch { expected, actual }
            }
            other => crate::Error::InvalidData(other.to_string()),
        }
    }
}
