//! Error types shared by the broker, the crypto engine and the callback router.

use thiserror::Error;

use crate::store::{CredentialKind, StoreError};

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The remote API answered with a structured failure.
    #[error("remote call failed with code {code}: {message}")]
    Remote { code: i64, message: String },

    /// Nothing cached and nothing to refresh from. Never retried automatically.
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(CredentialKind),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Inbound event failed origin or freshness checks.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The HTTP request never produced a usable response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Body could not be decoded as the expected XML or JSON shape.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl BrokerError {
    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        BrokerError::Remote {
            code,
            message: message.into(),
        }
    }

    /// Remote error code, if this is a structured remote failure.
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            BrokerError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Signature and envelope failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("invalid base64 envelope")]
    InvalidBase64,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Ciphertext is empty or not a whole number of AES blocks.
    #[error("invalid ciphertext length {0}")]
    InvalidCiphertext(usize),

    #[error("invalid padding byte {0}")]
    InvalidPadding(u8),

    #[error("decrypted buffer too short ({0} bytes)")]
    Truncated(usize),

    #[error("declared payload length {declared} overruns {available} available bytes")]
    LengthOverrun { declared: usize, available: usize },

    #[error("origin id mismatch: expected {expected}, found {found}")]
    OriginMismatch { expected: String, found: String },
}

impl CryptoError {
    /// True when a different key could plausibly have produced a valid result.
    ///
    /// Encoding and configuration errors fail identically under every key, so
    /// retrying them with the previous key is pointless.
    pub fn is_key_dependent(&self) -> bool {
        !matches!(
            self,
            CryptoError::SignatureMismatch | CryptoError::InvalidBase64 | CryptoError::InvalidKey(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_code_only_for_remote_errors() {
        assert_eq!(BrokerError::remote(61023, "invalid refresh token").remote_code(), Some(61023));
        assert_eq!(
            BrokerError::CredentialUnavailable(CredentialKind::VerifyTicket).remote_code(),
            None
        );
    }

    #[test]
    fn key_dependent_classification() {
        assert!(CryptoError::InvalidPadding(0).is_key_dependent());
        assert!(CryptoError::Truncated(3).is_key_dependent());
        assert!(!CryptoError::InvalidBase64.is_key_dependent());
        assert!(!CryptoError::SignatureMismatch.is_key_dependent());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = BrokerError::remote(40001, "invalid credential");
        assert_eq!(err.to_string(), "remote call failed with code 40001: invalid credential");
    }
}
