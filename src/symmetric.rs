//! Symmetric crypto engine
//!
//! Seals and opens payloads under a data encryption key (DEK), and delegates
//! every DEK mint/unwrap to the root key provider. Unwrapped key material is
//! wiped before any call returns, on success and failure alike.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::crypto::{legacy_key_transform, AesGcmCipher, EncryptedData, SecureKey, WipeOnDrop};
use crate::error::{EnvelopeError, Result};
use crate::provider::{
    DataKey, EncryptionContext, KeyOrigin, KeyUsage, RootKeyProvider, Tag, KEY_SPEC_AES_256,
};

/// Output of [`SymmetricEngine::encrypt`]
#[derive(Debug, Clone)]
pub struct EncryptionResult {
    /// Wrapped DEK, to be stored next to the ciphertext or reused
    pub wrapped_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Output of [`SymmetricEngine::decrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionResult {
    pub plaintext: Vec<u8>,
    /// Set when the value only opened under the legacy key transform and
    /// should be persisted again under the current scheme
    pub should_reencrypt: bool,
}

/// AEAD engine bound to one root key provider
pub struct SymmetricEngine<P: RootKeyProvider> {
    provider: Arc<P>,
}

impl<P: RootKeyProvider> SymmetricEngine<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Create a root key, optionally enabling rotation and pointing an alias at it
    pub fn create_key(&self, tags: &[Tag], key_alias: Option<&str>, key_rotation_enabled: bool) -> Result<String> {
        let key_id = self
            .provider
            .create_key(KeyUsage::EncryptDecrypt, KeyOrigin::AwsKms, tags)
            .map_err(EnvelopeError::Provider)?;

        if key_rotation_enabled {
            self.enable_key_rotation(&key_id)?;
        }

        if let Some(alias) = key_alias {
            self.create_alias(&key_id, alias)?;
        }

        Ok(key_id)
    }

    pub fn enable_key_rotation(&self, key_id: &str) -> Result<()> {
        self.provider.enable_key_rotation(key_id).map_err(EnvelopeError::Provider)
    }

    pub fn create_alias(&self, key_id: &str, key_alias: &str) -> Result<()> {
        self.provider.create_alias(key_id, key_alias).map_err(EnvelopeError::Provider)
    }

    pub fn root_key_alias_exists(&self, key_alias: &str) -> Result<bool> {
        let aliases = self.provider.list_aliases().map_err(EnvelopeError::Provider)?;
        Ok(aliases.iter().any(|entry| entry.alias_name == key_alias))
    }

    /// Mint a fresh DEK under `root_key_id`
    #[tracing::instrument(level = "debug", skip(self, context))]
    pub fn generate_data_key(&self, root_key_id: &str, context: Option<&EncryptionContext>) -> Result<DataKey> {
        if root_key_id.trim().is_empty() {
            return Err(EnvelopeError::InvalidParameter("root key id is blank".into()));
        }

        self.provider
            .generate_data_key(root_key_id, KEY_SPEC_AES_256, context)
            .map_err(EnvelopeError::KeyGeneration)
    }

    /// Unwrap a stored DEK. The caller owns the returned key.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn unwrap_data_key(&self, wrapped: &[u8], context: Option<&EncryptionContext>) -> Result<SecureKey> {
        self.provider.decrypt(wrapped, context).map_err(EnvelopeError::KeyRetrieve)
    }

    /// Seal `data` under a new DEK, or under `existing_wrapped` when given.
    #[tracing::instrument(level = "debug", skip_all, fields(root_key_id = %root_key_id, len = data.len()))]
    pub fn encrypt(
        &self,
        data: &[u8],
        root_key_id: &str,
        existing_wrapped: Option<&[u8]>,
        context: Option<&EncryptionContext>,
    ) -> Result<EncryptionResult> {
        let (mut plaintext_key, wrapped_key) = match existing_wrapped {
            Some(wrapped) => (self.unwrap_data_key(wrapped, context)?, wrapped.to_vec()),
            None => {
                let DataKey { plaintext, wrapped } = self.generate_data_key(root_key_id, context)?;
                (plaintext, wrapped)
            }
        };

        let sealed = seal_and_wipe(&mut plaintext_key, data)?;

        Ok(EncryptionResult {
            wrapped_key,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
        })
    }

    /// Seal `data` under an already-unwrapped DEK. The key is left intact.
    pub fn encrypt_with_key(&self, data: &[u8], plaintext_key: &SecureKey) -> Result<EncryptedData> {
        AesGcmCipher::encrypt(plaintext_key, data, None)
    }

    /// Unwrap the DEK and open `ciphertext`, retrying once under the legacy
    /// key transform when the tag does not verify.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn decrypt(
        &self,
        wrapped: &[u8],
        ciphertext: &[u8],
        nonce: &[u8],
        context: Option<&EncryptionContext>,
    ) -> Result<DecryptionResult> {
        let mut plaintext_key = self.unwrap_data_key(wrapped, context)?;
        let sealed = EncryptedData::new(nonce.to_vec(), ciphertext.to_vec());

        open_and_wipe(&mut plaintext_key, &sealed)
    }

    /// Open `ciphertext` under an already-unwrapped DEK. No legacy retry.
    pub fn decrypt_with_key(&self, ciphertext: &[u8], plaintext_key: &SecureKey, nonce: &[u8]) -> Result<Vec<u8>> {
        let sealed = EncryptedData::new(nonce.to_vec(), ciphertext.to_vec());
        AesGcmCipher::decrypt(plaintext_key, &sealed, None)
    }
}

/// Seal under `key`, leaving `key` zeroed on every exit path.
pub(crate) fn seal_and_wipe(key: &mut SecureKey, data: &[u8]) -> Result<EncryptedData> {
    let key = WipeOnDrop::new(key);
    AesGcmCipher::encrypt(&key, data, None)
}

/// Open under `key` with a single legacy retry, leaving `key` zeroed on every exit path.
pub(crate) fn open_and_wipe(key: &mut SecureKey, sealed: &EncryptedData) -> Result<DecryptionResult> {
    let mut key = WipeOnDrop::new(key);

    match AesGcmCipher::decrypt(&key, sealed, None) {
        Ok(plaintext) => Ok(DecryptionResult { plaintext, should_reencrypt: false }),
        Err(EnvelopeError::AuthenticationFailed) => {
            debug!("primary open failed, retrying with legacy key transform");
            legacy_key_transform(&mut key);
            let plaintext = AesGcmCipher::decrypt(&key, sealed, None)?;
            warn!("ciphertext opened under legacy key transform, value should be re-encrypted");
            Ok(DecryptionResult { plaintext, should_reencrypt: true })
        }
        Err(e) => Err(e),
    }
}
