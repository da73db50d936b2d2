/*
    errors.rs - Error types for the crypto provider
*/

use thiserror::Error;

/// Errors raised by key handling, sealing and encryption
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A prefixed string could not be decoded
    #[error("Invalid {kind} encoding: {reason}")]
    InvalidEncoding { kind: &'static str, reason: String },

    /// Bytes decoded fine but are not a valid key
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// AEAD encryption failed
    #[error("Encryption failed")]
    Encryption,

    /// AEAD authentication or decryption failed
    #[error("Decryption failed")]
    Decryption,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_display() {
        let err = CryptoError::InvalidEncoding { kind: "signer id", reason: "bad".to_string() };
        assert_eq!(err.to_string(), "Invalid signer id encoding: bad");
        assert_eq!(CryptoError::Decryption.to_string(), "Decryption failed");
    }
}
