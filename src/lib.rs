//! Envelope encryption backed by a KMS-style root key provider.
//!
//! Data encryption keys (DEKs) are minted and unwrapped by a
//! [`RootKeyProvider`]; payloads are sealed with AES-256-GCM. Attribute
//! values share one DEK per partition and epoch ([`EnvelopeEncryption`]);
//! stored files get a DEK each ([`FileCodec`], [`FileService`]).

pub mod cache;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod file_codec;
pub mod file_service;
pub mod key_manager;
pub mod provider;
pub mod storage;
pub mod symmetric;

pub use cache::{CacheError, InMemoryKeyCache, KeyCache, KEY_CACHE_NAMESPACE};
pub use config::EnvelopeConfig;
pub use crypto::{secure_wipe, AesGcmCipher, EncryptedData, SecureKey, AES_256_KEY_SIZE, NONCE_SIZE};
pub use envelope::{Envelope, EnvelopeEncryption};
pub use error::{EnvelopeError, Result};
pub use file_codec::{FileCodec, FileEnvelope};
pub use file_service::{FileService, InMemoryObjectStore, ObjectInfo, ObjectStore, ObjectStoreError, PutOptions, WriteOptions};
pub use key_manager::{encryption_key_epoch, KeyManager, KEY_VERSION};
pub use provider::{DataKey, EncryptionContext, LocalKms, ProviderError, RootKeyProvider, Tag};
pub use storage::{DataEncryptionKey, InMemoryKeyStore, KeyStore, NewDataEncryptionKey, StoreError};
pub use symmetric::{DecryptionResult, EncryptionResult, SymmetricEngine};
