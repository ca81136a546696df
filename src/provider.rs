//! Root key provider abstraction
//!
//! The root key provider (a KMS) holds the root keys and is only ever asked
//! to mint, wrap or unwrap 32-byte data encryption keys. Payload bytes never
//! reach it.
//!
//! [`LocalKms`] is an in-process provider with the same contract and error
//! kinds, suitable for development, testing, and single-instance deployments.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey, NONCE_SIZE};

/// Key spec requested for every data key: 256-bit AES
pub const KEY_SPEC_AES_256: &str = "AES_256";

/// Prefix every alias name must carry
pub const ALIAS_PREFIX: &str = "alias/";

/// Alias namespace reserved by the provider itself
pub const RESERVED_ALIAS_PREFIX: &str = "alias/aws/";

const MAX_TAG_KEY_LEN: usize = 128;
const MAX_TAG_VALUE_LEN: usize = 256;

/// Associated authenticated data bound into wrap/unwrap calls.
///
/// Ordered so that its canonical encoding is stable.
pub type EncryptionContext = BTreeMap<String, String>;

/// Narrow provider failure kinds. Callers branch on these, so they are
/// never collapsed into a single string error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("root key not found")]
    NotFound,

    #[error("invalid key usage")]
    InvalidKeyUsage,

    #[error("alias already exists")]
    AlreadyExists,

    #[error("invalid alias name")]
    InvalidAliasName,

    #[error("tag rejected")]
    TagRejected,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// What a root key may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyUsage {
    #[serde(rename = "ENCRYPT_DECRYPT")]
    EncryptDecrypt,
}

/// Where a root key's material came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrigin {
    #[serde(rename = "AWS_KMS")]
    AwsKms,
}

/// A tag attached to a root key at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// One entry of the provider's alias list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub alias_name: String,
    pub target_key_id: String,
}

/// A freshly minted data key: plaintext for immediate use, wrapped for storage
#[derive(Debug)]
pub struct DataKey {
    pub plaintext: SecureKey,
    pub wrapped: Vec<u8>,
}

/// Root key provider contract
pub trait RootKeyProvider: Send + Sync {
    /// Create a root key and return its id
    fn create_key(&self, usage: KeyUsage, origin: KeyOrigin, tags: &[Tag]) -> ProviderResult<String>;

    /// Turn on automatic rotation of a root key's material
    fn enable_key_rotation(&self, key_id: &str) -> ProviderResult<()>;

    /// Point an alias at a root key
    fn create_alias(&self, key_id: &str, alias: &str) -> ProviderResult<()>;

    /// List every alias known to the provider
    fn list_aliases(&self) -> ProviderResult<Vec<AliasEntry>>;

    /// Mint a data key under a root key (by id or alias)
    fn generate_data_key(
        &self,
        key_id: &str,
        key_spec: &str,
        context: Option<&EncryptionContext>,
    ) -> ProviderResult<DataKey>;

    /// Unwrap a data key. The context must match the one used to wrap it.
    fn decrypt(&self, wrapped: &[u8], context: Option<&EncryptionContext>) -> ProviderResult<SecureKey>;
}

/// Public description of a root key held by [`LocalKms`]
#[derive(Debug, Clone, Serialize)]
pub struct KeyDescription {
    pub key_id: String,
    pub usage: KeyUsage,
    pub origin: KeyOrigin,
    pub tags: Vec<Tag>,
    pub rotation_enabled: bool,
    pub created_at: DateTime<Utc>,
}

struct RootKey {
    material: SecureKey,
    usage: KeyUsage,
    origin: KeyOrigin,
    tags: Vec<Tag>,
    rotation_enabled: bool,
    created_at: DateTime<Utc>,
}

/// In-process root key provider.
///
/// Wrapped data keys are laid out as `[id_len][key id][nonce][ciphertext+tag]`
/// and sealed with the root key under AAD made of the key id and the canonical
/// encoding of the encryption context.
pub struct LocalKms {
    keys: RwLock<HashMap<String, RootKey>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl LocalKms {
    /// Create an empty provider with no root keys
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Describe a root key by id or alias
    pub fn describe_key(&self, key_id: &str) -> Option<KeyDescription> {
        let key_id = self.resolve(key_id)?;
        self.keys.read().get(&key_id).map(|k| KeyDescription {
            key_id: key_id.clone(),
            usage: k.usage,
            origin: k.origin,
            tags: k.tags.clone(),
            rotation_enabled: k.rotation_enabled,
            created_at: k.created_at,
        })
    }

    fn resolve(&self, key_id: &str) -> Option<String> {
        if key_id.starts_with(ALIAS_PREFIX) {
            self.aliases.read().get(key_id).cloned()
        } else if self.keys.read().contains_key(key_id) {
            Some(key_id.to_string())
        } else {
            None
        }
    }

    fn aad(key_id: &str, context: Option<&EncryptionContext>) -> ProviderResult<Vec<u8>> {
        let mut aad = key_id.as_bytes().to_vec();
        aad.push(0);
        if let Some(ctx) = context.filter(|c| !c.is_empty()) {
            let encoded = serde_json::to_vec(ctx).map_err(|e| ProviderError::Unavailable(e.to_string()))?;
            aad.extend_from_slice(&encoded);
        }
        Ok(aad)
    }

    fn validate_tag(tag: &Tag) -> ProviderResult<()> {
        if tag.key.is_empty() || tag.key.len() > MAX_TAG_KEY_LEN || tag.value.len() > MAX_TAG_VALUE_LEN {
            return Err(ProviderError::TagRejected);
        }
        Ok(())
    }

    fn validate_alias(alias: &str) -> ProviderResult<()> {
        let name = alias.strip_prefix(ALIAS_PREFIX).ok_or(ProviderError::InvalidAliasName)?;
        let valid_chars = name.chars().all(|c| c.is_ascii_alphanumeric() || "/_-".contains(c));
        let reserved = name == "aws" || alias.starts_with(RESERVED_ALIAS_PREFIX);
        if name.is_empty() || reserved || !valid_chars {
            return Err(ProviderError::InvalidAliasName);
        }
        Ok(())
    }
}

impl Default for LocalKms {
    fn default() -> Self {
        Self::new()
    }
}

impl RootKeyProvider for LocalKms {
    fn create_key(&self, usage: KeyUsage, origin: KeyOrigin, tags: &[Tag]) -> ProviderResult<String> {
        tags.iter().try_for_each(Self::validate_tag)?;

        let key_id = Uuid::new_v4().to_string();
        self.keys.write().insert(
            key_id.clone(),
            RootKey {
                material: SecureKey::generate(),
                usage,
                origin,
                tags: tags.to_vec(),
                rotation_enabled: false,
                created_at: Utc::now(),
            },
        );
        Ok(key_id)
    }

    fn enable_key_rotation(&self, key_id: &str) -> ProviderResult<()> {
        let key_id = self.resolve(key_id).ok_or(ProviderError::NotFound)?;
        let mut keys = self.keys.write();
        let key = keys.get_mut(&key_id).ok_or(ProviderError::NotFound)?;
        key.rotation_enabled = true;
        Ok(())
    }

    fn create_alias(&self, key_id: &str, alias: &str) -> ProviderResult<()> {
        Self::validate_alias(alias)?;
        if !self.keys.read().contains_key(key_id) {
            return Err(ProviderError::NotFound);
        }

        let mut aliases = self.aliases.write();
        if aliases.contains_key(alias) {
            return Err(ProviderError::AlreadyExists);
        }
        aliases.insert(alias.to_string(), key_id.to_string());
        Ok(())
    }

    fn list_aliases(&self) -> ProviderResult<Vec<AliasEntry>> {
        let aliases = self.aliases.read();
        let mut entries: Vec<_> = aliases
            .iter()
            .map(|(alias_name, target_key_id)| AliasEntry {
                alias_name: alias_name.clone(),
                target_key_id: target_key_id.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.alias_name.cmp(&b.alias_name));
        Ok(entries)
    }

    fn generate_data_key(
        &self,
        key_id: &str,
        key_spec: &str,
        context: Option<&EncryptionContext>,
    ) -> ProviderResult<DataKey> {
        if key_spec != KEY_SPEC_AES_256 {
            return Err(ProviderError::InvalidKeyUsage);
        }
        let key_id = self.resolve(key_id).ok_or(ProviderError::NotFound)?;
        let id_len = u8::try_from(key_id.len()).map_err(|_| ProviderError::InvalidKeyUsage)?;

        let keys = self.keys.read();
        let root = keys.get(&key_id).ok_or(ProviderError::NotFound)?;

        let plaintext = SecureKey::generate();
        let aad = Self::aad(&key_id, context)?;
        let sealed = AesGcmCipher::encrypt(&root.material, plaintext.as_bytes(), Some(&aad))
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let mut wrapped = Vec::with_capacity(1 + key_id.len() + sealed.nonce.len() + sealed.ciphertext.len());
        wrapped.push(id_len);
        wrapped.extend_from_slice(key_id.as_bytes());
        wrapped.extend_from_slice(&sealed.nonce);
        wrapped.extend_from_slice(&sealed.ciphertext);

        Ok(DataKey { plaintext, wrapped })
    }

    fn decrypt(&self, wrapped: &[u8], context: Option<&EncryptionContext>) -> ProviderResult<SecureKey> {
        let (&id_len, rest) = wrapped.split_first().ok_or(ProviderError::InvalidCiphertext)?;
        let id_len = usize::from(id_len);
        if rest.len() < id_len + NONCE_SIZE {
            return Err(ProviderError::InvalidCiphertext);
        }
        let (id_bytes, rest) = rest.split_at(id_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let key_id = std::str::from_utf8(id_bytes).map_err(|_| ProviderError::InvalidCiphertext)?;

        let keys = self.keys.read();
        let root = keys.get(key_id).ok_or(ProviderError::InvalidCiphertext)?;

        let aad = Self::aad(key_id, context)?;
        let sealed = EncryptedData::new(nonce.to_vec(), ciphertext.to_vec());
        let mut plaintext = AesGcmCipher::decrypt(&root.material, &sealed, Some(&aad))
            .map_err(|_| ProviderError::InvalidCiphertext)?;

        let key = SecureKey::from_slice(&plaintext).map_err(|_| ProviderError::InvalidCiphertext);
        crate::crypto::secure_wipe(&mut plaintext);
        key
    }
}
