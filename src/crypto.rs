//! Cryptographic primitives for envelope encryption
//!
//! This module provides the AES-256-GCM seal/open step, the zeroizing
//! [`SecureKey`] container for plaintext data keys, and the scoped wipe
//! helpers used on every code path that touches unwrapped key material.

use std::ops::{Deref, DerefMut};

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EnvelopeError, Result};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A plaintext data encryption key that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: [u8; AES_256_KEY_SIZE],
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: [u8; AES_256_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copy key material out of a slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; AES_256_KEY_SIZE] = bytes.try_into().map_err(|_| {
            EnvelopeError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Generate a new random AES-256 key
    pub fn generate() -> Self {
        let mut bytes = [0u8; AES_256_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false: the key has a fixed length, even after a wipe
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite the key material with zeros, keeping its length
    pub fn wipe(&mut self) {
        secure_wipe(&mut self.bytes);
    }

    /// True once every byte of the key is zero
    pub fn is_wiped(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Overwrite a buffer in place with zero bytes of identical length.
pub fn secure_wipe(buffer: &mut [u8]) {
    buffer.zeroize();
}

/// Borrows a key for the length of a scope and wipes it when the scope ends,
/// whichever way it ends (early return, `?`, or unwinding).
pub(crate) struct WipeOnDrop<'a> {
    key: &'a mut SecureKey,
}

impl<'a> WipeOnDrop<'a> {
    pub(crate) fn new(key: &'a mut SecureKey) -> Self {
        Self { key }
    }
}

impl Deref for WipeOnDrop<'_> {
    type Target = SecureKey;

    fn deref(&self) -> &SecureKey {
        self.key
    }
}

impl DerefMut for WipeOnDrop<'_> {
    fn deref_mut(&mut self) -> &mut SecureKey {
        self.key
    }
}

impl Drop for WipeOnDrop<'_> {
    fn drop(&mut self) {
        self.key.wipe();
    }
}

/// Historical key transform for values written by a release that erased the
/// data key before sealing: those payloads were sealed under an all-zero key
/// of the same length. Only used to read old ciphertexts.
// TODO: remove once stored values have been re-encrypted under the current scheme
pub(crate) fn legacy_key_transform(key: &mut SecureKey) {
    key.wipe();
}

/// Encrypted data container with nonce and ciphertext
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: Vec<u8>,
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Create a new EncryptedData container
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext using AES-256-GCM under a fresh random nonce
    ///
    /// # Arguments
    /// * `key` - The 256-bit encryption key
    /// * `plaintext` - The data to encrypt
    /// * `aad` - Additional authenticated data (optional context)
    pub fn encrypt(key: &SecureKey, plaintext: &[u8], aad: Option<&[u8]>) -> Result<EncryptedData> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| EnvelopeError::Crypto(format!("Cipher init error: {}", e)))?;

        // A nonce is never reused under the same key
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: aad.unwrap_or_default() })
            .map_err(|e| EnvelopeError::Crypto(format!("Encryption error: {}", e)))?;

        Ok(EncryptedData::new(nonce_bytes.to_vec(), ciphertext))
    }

    /// Decrypt ciphertext using AES-256-GCM
    ///
    /// Fails with [`EnvelopeError::AuthenticationFailed`] when the tag does not
    /// verify, and with [`EnvelopeError::Crypto`] when the nonce is malformed.
    pub fn decrypt(key: &SecureKey, encrypted: &EncryptedData, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        if encrypted.nonce.len() != NONCE_SIZE {
            return Err(EnvelopeError::Crypto(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                encrypted.nonce.len()
            )));
        }

        if encrypted.ciphertext.len() < TAG_SIZE {
            return Err(EnvelopeError::AuthenticationFailed);
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| EnvelopeError::Crypto(format!("Cipher init error: {}", e)))?;

        let nonce = Nonce::from_slice(&encrypted.nonce);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &encrypted.ciphertext,
                    aad: aad.unwrap_or_default(),
                },
            )
            .map_err(|_| EnvelopeError::AuthenticationFailed)
    }
}
