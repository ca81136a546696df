//! Encrypted object storage on top of the file-at-rest codec
//!
//! The object store is abstract; an in-memory implementation is provided
//! for development and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{EnvelopeError, Result};
use crate::file_codec::FileCodec;
use crate::provider::RootKeyProvider;
use crate::symmetric::DecryptionResult;

/// Object store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("no such object: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

/// Size and user metadata of a stored object, obtained without its body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub content_length: u64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub metadata: BTreeMap<String, String>,
    pub storage_class: Option<String>,
}

/// Blob storage contract
pub trait ObjectStore: Send + Sync {
    fn head(&self, bucket: &str, key: &str) -> std::result::Result<ObjectInfo, ObjectStoreError>;

    fn get(&self, bucket: &str, key: &str) -> std::result::Result<Vec<u8>, ObjectStoreError>;

    fn put(&self, bucket: &str, key: &str, body: Vec<u8>, options: PutOptions) -> std::result::Result<(), ObjectStoreError>;
}

/// Options for [`FileService::write_data`]
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Explicit object key. Takes precedence over `directory`.
    pub file_name: Option<String>,
    /// Prefix for a generated object key
    pub directory: Option<String>,
    /// Stored as object metadata and inside the envelope
    pub metadata: Option<BTreeMap<String, String>>,
    pub storage_class: Option<String>,
}

impl WriteOptions {
    fn file_key(&self) -> String {
        match (&self.file_name, &self.directory) {
            (Some(name), _) if !name.trim().is_empty() => name.clone(),
            (_, Some(dir)) if !dir.trim().is_empty() => {
                format!("{}/{}", dir.trim_end_matches('/'), Uuid::new_v4())
            }
            _ => Uuid::new_v4().to_string(),
        }
    }
}

struct StoredObject {
    body: Vec<u8>,
    metadata: BTreeMap<String, String>,
    storage_class: Option<String>,
}

/// In-memory implementation of ObjectStore
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
    gets: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of body fetches served
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn storage_class(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|object| object.storage_class.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(bucket: &str, key: &str) -> ObjectStoreError {
    ObjectStoreError::NotFound { bucket: bucket.to_string(), key: key.to_string() }
}

impl ObjectStore for InMemoryObjectStore {
    fn head(&self, bucket: &str, key: &str) -> std::result::Result<ObjectInfo, ObjectStoreError> {
        let objects = self.objects.read();
        let object = objects.get(&(bucket.to_string(), key.to_string())).ok_or_else(|| not_found(bucket, key))?;

        Ok(ObjectInfo {
            content_length: object.body.len() as u64,
            metadata: object.metadata.clone(),
        })
    }

    fn get(&self, bucket: &str, key: &str) -> std::result::Result<Vec<u8>, ObjectStoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| object.body.clone())
            .ok_or_else(|| not_found(bucket, key))
    }

    fn put(&self, bucket: &str, key: &str, body: Vec<u8>, options: PutOptions) -> std::result::Result<(), ObjectStoreError> {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { body, metadata: options.metadata, storage_class: options.storage_class },
        );
        Ok(())
    }
}

/// Stores files encrypted, one data key per object
pub struct FileService<P: RootKeyProvider, O: ObjectStore> {
    codec: FileCodec<P>,
    store: O,
}

impl<P: RootKeyProvider, O: ObjectStore> FileService<P, O> {
    pub fn new(codec: FileCodec<P>, store: O) -> Self {
        Self { codec, store }
    }

    pub fn store(&self) -> &O {
        &self.store
    }

    /// Encrypt and upload under a new object key, returning the key
    pub fn write_data(&self, data: &[u8], bucket: &str, root_key_id: &str, options: WriteOptions) -> Result<String> {
        let file_key = options.file_key();
        self.upload(data, &file_key, bucket, root_key_id, options)?;
        Ok(file_key)
    }

    /// Encrypt and upload, replacing whatever is stored at `file_key`
    pub fn overwrite_data(
        &self,
        data: &[u8],
        file_key: &str,
        bucket: &str,
        root_key_id: &str,
        options: WriteOptions,
    ) -> Result<()> {
        if file_key.trim().is_empty() {
            return Err(EnvelopeError::FileService("file key is blank".into()));
        }
        self.upload(data, file_key, bucket, root_key_id, options)
    }

    fn upload(&self, data: &[u8], file_key: &str, bucket: &str, root_key_id: &str, options: WriteOptions) -> Result<()> {
        if bucket.trim().is_empty() {
            return Err(EnvelopeError::FileService("bucket is blank".into()));
        }
        if root_key_id.trim().is_empty() {
            return Err(EnvelopeError::FileService("root key id is blank".into()));
        }

        let (_, json) = self.codec.write(data, root_key_id, options.metadata.clone())?;
        let put_options = PutOptions {
            metadata: options.metadata.unwrap_or_default(),
            storage_class: options.storage_class,
        };

        self.store.put(bucket, file_key, json.into_bytes(), put_options).map_err(|e| {
            error!("Failed to upload {}/{}: {}", bucket, file_key, e);
            EnvelopeError::FileService(e.to_string())
        })?;

        info!(bucket, file_key, "uploaded encrypted file");
        Ok(())
    }

    /// Download and decrypt. Objects above the size limit are rejected
    /// before their body is fetched.
    pub fn read(&self, bucket: &str, file_key: &str) -> Result<DecryptionResult> {
        let info = self.file_info(bucket, file_key)?;
        self.codec.check_size(info.content_length)?;

        let body = self.store.get(bucket, file_key).map_err(|e| {
            error!("Failed to download {}/{}: {}", bucket, file_key, e);
            EnvelopeError::FileService(e.to_string())
        })?;
        let json = String::from_utf8(body).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;

        self.codec.read(&json)
    }

    pub fn file_info(&self, bucket: &str, file_key: &str) -> Result<ObjectInfo> {
        self.store
            .head(bucket, file_key)
            .map_err(|e| EnvelopeError::FileService(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::crypto::{AesGcmCipher, SecureKey, AES_256_KEY_SIZE};
    use crate::encoding;
    use crate::file_codec::FileEnvelope;
    use crate::provider::LocalKms;
    use crate::symmetric::SymmetricEngine;

    const BUCKET: &str = "documents";

    fn service(max_file_size: u64) -> (FileService<LocalKms, InMemoryObjectStore>, String) {
        let engine = Arc::new(SymmetricEngine::new(Arc::new(LocalKms::new())));
        let key_id = engine.create_key(&[], None, false).unwrap();
        let service = FileService::new(FileCodec::new(engine, max_file_size), InMemoryObjectStore::new());
        (service, key_id)
    }

    #[test]
    fn test_write_then_read() {
        let (service, key_id) = service(4096);

        let file_key = service.write_data(b"statement", BUCKET, &key_id, WriteOptions::default()).unwrap();
        assert!(Uuid::parse_str(&file_key).is_ok());

        let result = service.read(BUCKET, &file_key).unwrap();
        assert_eq!(result.plaintext, b"statement");
    }

    #[test]
    fn test_file_key_selection() {
        let (service, key_id) = service(4096);

        let named = WriteOptions { file_name: Some("reports/q1.pdf".into()), directory: Some("ignored".into()), ..Default::default() };
        assert_eq!(service.write_data(b"a", BUCKET, &key_id, named).unwrap(), "reports/q1.pdf");

        let in_dir = WriteOptions { directory: Some("uploads/".into()), ..Default::default() };
        let file_key = service.write_data(b"b", BUCKET, &key_id, in_dir).unwrap();
        let (dir, name) = file_key.split_once('/').unwrap();
        assert_eq!(dir, "uploads");
        assert!(Uuid::parse_str(name).is_ok());
    }

    #[test]
    fn test_metadata_and_storage_class() {
        let (service, key_id) = service(4096);
        let metadata = BTreeMap::from([("owner".to_string(), "merchant-42".to_string())]);
        let options = WriteOptions {
            metadata: Some(metadata.clone()),
            storage_class: Some("STANDARD_IA".into()),
            ..Default::default()
        };

        let file_key = service.write_data(b"data", BUCKET, &key_id, options).unwrap();

        assert_eq!(service.file_info(BUCKET, &file_key).unwrap().metadata, metadata);
        assert_eq!(service.store().storage_class(BUCKET, &file_key).as_deref(), Some("STANDARD_IA"));
    }

    #[test]
    fn test_overwrite() {
        let (service, key_id) = service(4096);

        service.overwrite_data(b"v1", "fixed", BUCKET, &key_id, WriteOptions::default()).unwrap();
        service.overwrite_data(b"v2", "fixed", BUCKET, &key_id, WriteOptions::default()).unwrap();

        assert_eq!(service.read(BUCKET, "fixed").unwrap().plaintext, b"v2");
        assert_eq!(service.store().len(), 1);
    }

    #[test]
    fn test_blank_parameters() {
        let (service, key_id) = service(4096);

        let err = service.write_data(b"x", " ", &key_id, WriteOptions::default()).unwrap_err();
        assert!(matches!(err, EnvelopeError::FileService(_)));

        let err = service.write_data(b"x", BUCKET, "", WriteOptions::default()).unwrap_err();
        assert!(matches!(err, EnvelopeError::FileService(_)));

        let err = service.overwrite_data(b"x", "", BUCKET, &key_id, WriteOptions::default()).unwrap_err();
        assert!(matches!(err, EnvelopeError::FileService(_)));
        assert!(service.store().is_empty());
    }

    #[test]
    fn test_oversized_write_is_not_uploaded() {
        let (service, key_id) = service(8);

        let err = service.write_data(&[1u8; 9], BUCKET, &key_id, WriteOptions::default()).unwrap_err();

        assert!(matches!(err, EnvelopeError::FileSizeTooLarge { size: 9, max: 8 }));
        assert!(service.store().is_empty());
    }

    #[test]
    fn test_oversized_read_is_not_fetched() {
        let (service, _) = service(64);
        service
            .store()
            .put(BUCKET, "big", vec![b'x'; 65], PutOptions::default())
            .unwrap();

        let err = service.read(BUCKET, "big").unwrap_err();

        assert!(matches!(err, EnvelopeError::FileSizeTooLarge { size: 65, max: 64 }));
        assert_eq!(service.store().get_count(), 0);
    }

    #[test]
    fn test_read_flags_legacy_object_for_reencryption() {
        let engine = Arc::new(SymmetricEngine::new(Arc::new(LocalKms::new())));
        let key_id = engine.create_key(&[], None, false).unwrap();
        let service = FileService::new(FileCodec::new(engine.clone(), 4096), InMemoryObjectStore::new());

        // Sealed under the all-zero key, as the erased-key release wrote it
        let data_key = engine.generate_data_key(&key_id, None).unwrap();
        let zero_key = SecureKey::new([0u8; AES_256_KEY_SIZE]);
        let sealed = AesGcmCipher::encrypt(&zero_key, b"old statement", None).unwrap();
        let body = FileEnvelope {
            key: encoding::encode_url_safe(&data_key.wrapped),
            data: encoding::encode_url_safe(&sealed.ciphertext),
            nonce: encoding::encode_url_safe(&sealed.nonce),
            metadata: None,
        }
        .to_json()
        .unwrap();
        service.store().put(BUCKET, "legacy", body.into_bytes(), PutOptions::default()).unwrap();

        let result = service.read(BUCKET, "legacy").unwrap();
        assert_eq!(result.plaintext, b"old statement");
        assert!(result.should_reencrypt);
    }

    #[test]
    fn test_missing_object() {
        let (service, _) = service(4096);

        assert!(matches!(service.read(BUCKET, "nope"), Err(EnvelopeError::FileService(_))));
        assert_eq!(service.store().get_count(), 0);
    }
}
