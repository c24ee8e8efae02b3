//! Error types for packet framing and decoding

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while framing or decoding packets
///
/// Every variant is fatal to the connection it was produced on: once a frame
/// cannot be trusted, the byte stream can no longer be resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame header declared a size smaller than the fixed header
    #[error("Internal protocol error: invalid packet size {0}")]
    InvalidPacketSize(u32),

    /// The frame header carried a type byte no packet uses
    #[error("Internal protocol error: invalid packet type {0}")]
    UnknownPacketType(u8),

    /// The payload ended before a field could be read
    #[error("Truncated payload while reading {field}: needed {needed} bytes, {available} left")]
    Truncated {
        /// Field being decoded
        field: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes remaining in the payload
        available: usize,
    },

    /// An enum or bool field held a value outside its range
    #[error("Invalid value {value} for {field}")]
    InvalidValue {
        /// Field being decoded
        field: &'static str,
        /// Raw byte that was read
        value: u8,
    },

    /// A string field was not valid UTF-8
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// The payload had bytes left over after the last field
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

impl ProtocolError {
    /// Create a truncation error
    pub fn truncated(field: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            field,
            needed,
            available,
        }
    }

    /// Create an out-of-range value error
    pub fn invalid_value(field: &'static str, value: u8) -> Self {
        Self::InvalidValue { field, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_size_message() {
        let err = ProtocolError::InvalidPacketSize(3);
        assert_eq!(
            err.to_string(),
            "Internal protocol error: invalid packet size 3"
        );
    }

    #[test]
    fn test_truncated_message() {
        let err = ProtocolError::truncated("pid", 8, 2);
        assert!(err.to_string().contains("pid"));
        assert!(err.to_string().contains("needed 8"));
    }
}
