//! Error types for the envelope encryption module

use thiserror::Error;

use crate::provider::ProviderError;

/// Result type alias for envelope encryption operations
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors that can occur during envelope encryption operations
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Missing or blank caller input
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The root key provider failed to mint a data encryption key
    #[error("Failed to generate data encryption key: {0}")]
    KeyGeneration(ProviderError),

    /// The key store failed to persist a new data encryption key record
    #[error("Failed to create encryption key: {0}")]
    KeyCreate(String),

    /// The root key provider failed to unwrap a data encryption key
    #[error("Failed to retrieve data encryption key: {0}")]
    KeyRetrieve(ProviderError),

    /// Envelope facade encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Envelope facade decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Object transfer failed
    #[error("File service error: {0}")]
    FileService(String),

    /// Payload larger than the configured maximum
    #[error("File size {size} is larger than maximum allowed size of {max}")]
    FileSizeTooLarge { size: u64, max: u64 },

    /// AEAD tag verification failed (including the legacy retry)
    #[error("Decryption failed: authentication error")]
    AuthenticationFailed,

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Root key provider admin operation failed
    #[error("Root key provider error: {0}")]
    Provider(ProviderError),

    /// Key store lookup failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        EnvelopeError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for EnvelopeError {
    fn from(err: base64::DecodeError) -> Self {
        EnvelopeError::Serialization(format!("Base64 decode error: {}", err))
    }
}
