//! File-at-rest codec
//!
//! Every stored object is sealed under its own data encryption key, minted
//! for that object alone and never cached. The wrapped key travels inside
//! the object body, so reading needs nothing but the root key provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::encoding;
use crate::error::{EnvelopeError, Result};
use crate::provider::RootKeyProvider;
use crate::symmetric::{DecryptionResult, SymmetricEngine};

/// Stored object body: URL-safe base64 with padding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEnvelope {
    pub key: String,
    pub data: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl FileEnvelope {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(EnvelopeError::from)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(EnvelopeError::from)
    }
}

pub struct FileCodec<P: RootKeyProvider> {
    engine: Arc<SymmetricEngine<P>>,
    max_file_size: u64,
}

impl<P: RootKeyProvider> FileCodec<P> {
    pub fn new(engine: Arc<SymmetricEngine<P>>, max_file_size: u64) -> Self {
        Self { engine, max_file_size }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Reject sizes above the configured maximum
    pub fn check_size(&self, size: u64) -> Result<()> {
        if size > self.max_file_size {
            error!("File size {} exceeds maximum of {}", size, self.max_file_size);
            return Err(EnvelopeError::FileSizeTooLarge { size, max: self.max_file_size });
        }
        Ok(())
    }

    /// Seal `data` under a fresh DEK and return the envelope and its JSON body
    #[tracing::instrument(level = "debug", skip_all, fields(len = data.len()))]
    pub fn write(
        &self,
        data: &[u8],
        root_key_id: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(FileEnvelope, String)> {
        self.check_size(data.len() as u64)?;

        let result = self.engine.encrypt(data, root_key_id, None, None)?;
        let envelope = FileEnvelope {
            key: encoding::encode_url_safe(&result.wrapped_key),
            data: encoding::encode_url_safe(&result.ciphertext),
            nonce: encoding::encode_url_safe(&result.nonce),
            metadata,
        };

        let json = envelope.to_json()?;
        debug!(stored_len = json.len(), "sealed file envelope");
        Ok((envelope, json))
    }

    /// Open a stored JSON body
    pub fn read(&self, json: &str) -> Result<DecryptionResult> {
        let envelope = FileEnvelope::from_json(json)?;
        self.open(&envelope)
    }

    pub fn open(&self, envelope: &FileEnvelope) -> Result<DecryptionResult> {
        let wrapped = encoding::decode_url_safe(&envelope.key)?;
        let ciphertext = encoding::decode_url_safe(&envelope.data)?;
        let nonce = encoding::decode_url_safe(&envelope.nonce)?;

        self.engine.decrypt(&wrapped, &ciphertext, &nonce, None)
    }
}
