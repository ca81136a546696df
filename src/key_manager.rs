//! Key lifecycle manager: one DEK per (partition, epoch), created lazily,
//! with a best-effort cache of unwrapped keys in front of the provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use tracing::{error, info};

use crate::cache::KeyCache;
use crate::crypto::SecureKey;
use crate::encoding;
use crate::error::{EnvelopeError, Result};
use crate::provider::{ProviderError, RootKeyProvider};
use crate::storage::{DataEncryptionKey, KeyStore, NewDataEncryptionKey, StoreError};
use crate::symmetric::SymmetricEngine;

/// Version tag written on every new record
pub const KEY_VERSION: &str = "KeyManagementService::V1";

/// The epoch a point in time belongs to: 00:00:00 UTC on January 1 of its UTC year.
pub fn encryption_key_epoch<Tz: TimeZone>(datetime: &DateTime<Tz>) -> Result<DateTime<Utc>> {
    let year = datetime.with_timezone(&Utc).year();
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| EnvelopeError::InvalidParameter(format!("no epoch for year {}", year)))
}

/// Finds or creates the DEK of one partition and resolves its plaintext
pub struct KeyManager<P: RootKeyProvider, S: KeyStore, C: KeyCache> {
    engine: Arc<SymmetricEngine<P>>,
    store: Arc<S>,
    cache: Arc<C>,
    partition: String,
    cache_ttl: Duration,
    root_key_id: String,
}

impl<P: RootKeyProvider, S: KeyStore, C: KeyCache> KeyManager<P, S, C> {
    pub fn new(
        engine: Arc<SymmetricEngine<P>>,
        store: Arc<S>,
        cache: Arc<C>,
        partition: &str,
        cache_ttl: Duration,
        root_key_id: &str,
    ) -> Result<Self> {
        if partition.trim().is_empty() {
            return Err(EnvelopeError::InvalidParameter("partition is blank".into()));
        }
        if cache_ttl.is_zero() {
            return Err(EnvelopeError::InvalidParameter("cache ttl is zero".into()));
        }
        if root_key_id.trim().is_empty() {
            return Err(EnvelopeError::InvalidParameter("root key id is blank".into()));
        }

        Ok(Self {
            engine,
            store,
            cache,
            partition: partition.to_string(),
            cache_ttl,
            root_key_id: root_key_id.to_string(),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn root_key_id(&self) -> &str {
        &self.root_key_id
    }

    /// Return the partition's record for `key_epoch`, creating it on first use.
    ///
    /// Losing a creation race is not an error: the winner's record is returned.
    #[tracing::instrument(level = "debug", skip(self), fields(partition = %self.partition))]
    pub fn find_or_create_key(&self, key_epoch: DateTime<Utc>) -> Result<DataEncryptionKey> {
        match self.find(key_epoch)? {
            Some(record) => Ok(record),
            None => self.create(key_epoch),
        }
    }

    /// Plaintext DEK for `record`, from the cache when possible
    #[tracing::instrument(level = "debug", skip_all, fields(guid = %record.guid))]
    pub fn retrieve_plaintext_key(&self, record: &DataEncryptionKey) -> Result<SecureKey> {
        match self.read_plaintext_key(record) {
            Some(key) => Ok(key),
            None => self.decrypt_encryption_key(record),
        }
    }

    fn find(&self, key_epoch: DateTime<Utc>) -> Result<Option<DataEncryptionKey>> {
        self.store.find_by_partition_epoch(&self.partition, key_epoch).map_err(|e| {
            error!("Failed to look up encryption key: {}", e);
            EnvelopeError::KeyCreate(e.to_string())
        })
    }

    fn create(&self, key_epoch: DateTime<Utc>) -> Result<DataEncryptionKey> {
        let data_key = self.engine.generate_data_key(&self.root_key_id, None).map_err(|e| {
            error!("Failed to generate data encryption key: {}", e);
            e
        })?;

        let new_key = NewDataEncryptionKey {
            partition: self.partition.clone(),
            key_epoch,
            encrypted_data_encryption_key: encoding::encode_standard(&data_key.wrapped),
            version: KEY_VERSION.to_string(),
        };

        match self.store.create(new_key) {
            Ok(record) => {
                self.cache_plaintext_key(&record, &data_key.plaintext);
                Ok(record)
            }
            Err(StoreError::Conflict) => {
                info!(partition = %self.partition, %key_epoch, "Retrying find after failed EncryptionKey create");
                self.find(key_epoch)?.ok_or_else(|| {
                    EnvelopeError::KeyCreate("conflicting encryption key not found on retry".into())
                })
            }
            Err(e) => {
                error!("Failed to save encryption key: {}", e);
                Err(EnvelopeError::KeyCreate(e.to_string()))
            }
        }
    }

    fn read_plaintext_key(&self, record: &DataEncryptionKey) -> Option<SecureKey> {
        match self.cache.read(&record.guid) {
            Ok(key) => key,
            Err(e) => {
                error!("Failed to read cache for encryption key {}: {}", record.guid, e);
                None
            }
        }
    }

    fn decrypt_encryption_key(&self, record: &DataEncryptionKey) -> Result<SecureKey> {
        let wrapped = encoding::decode_standard(&record.encrypted_data_encryption_key).map_err(|e| {
            error!("Failed to decode data encryption key {}: {}", record.guid, e);
            EnvelopeError::KeyRetrieve(ProviderError::InvalidCiphertext)
        })?;

        let plaintext_key = self.engine.unwrap_data_key(&wrapped, None).map_err(|e| {
            error!("Failed to decrypt data encryption key: {}", e);
            e
        })?;

        self.cache_plaintext_key(record, &plaintext_key);
        Ok(plaintext_key)
    }

    fn cache_plaintext_key(&self, record: &DataEncryptionKey, plaintext_key: &SecureKey) {
        if let Err(e) = self.cache.write(&record.guid, plaintext_key, self.cache_ttl) {
            error!("Failed to cache encryption key: {}", e);
        }
    }
}
