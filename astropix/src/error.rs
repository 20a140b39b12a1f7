/*!
Common error types for the AstroPix configuration and readout library.
*/

use thiserror::Error;

use crate::transport::TransportError;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all configuration, framing and readout operations
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid register tree, or chip version/geometry mismatch
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration vector was requested before any register was loaded
    #[error("Configuration not initialized")]
    NotInitialized,

    /// A register value does not fit its declared bit width
    #[error("Value {value} out of range for {name} ({width} bits, max {max})", max = max_for_width(*.width))]
    OutOfRange { name: String, value: u64, width: u32 },

    /// Link unreachable or I/O failure on the link; never retried
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A readout failed the stream pre-filter and cannot be decoded as a whole
    #[error("Undecodable readout: chunk starting with 0x{first:02x} ({len} bytes) has no start marker")]
    DecodeFault { first: u8, len: usize },

    /// An addressed frame payload exceeds the 16-bit length field
    #[error("Frame payload of {0} bytes exceeds the 16-bit length field")]
    FrameTooLong(usize),

    /// I/O errors (register files, logs)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Register source parse errors
    #[error("Register source error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Register source serialization errors
    #[error("Register source serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new out-of-range error for a named field
    pub fn out_of_range(name: impl Into<String>, value: u64, width: u32) -> Self {
        Self::OutOfRange {
            name: name.into(),
            value,
            width,
        }
    }

    /// Decode faults are soft failures counted by the caller
    pub fn is_decode_fault(&self) -> bool {
        matches!(self, Self::DecodeFault { .. })
    }
}

fn max_for_width(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = Error::out_of_range("vdacs.thpix", 1024, 10);
        assert_eq!(
            err.to_string(),
            "Value 1024 out of range for vdacs.thpix (10 bits, max 1023)"
        );
    }

    #[test]
    fn test_decode_fault_classification() {
        assert!(Error::DecodeFault { first: 0x12, len: 3 }.is_decode_fault());
        assert!(!Error::NotInitialized.is_decode_fault());
    }
}
