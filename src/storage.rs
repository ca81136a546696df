//! Storage abstraction for data encryption key records
//!
//! This module provides a trait-based key store that can be implemented for
//! various backends (in-memory, a relational database, etc.). The store's
//! uniqueness constraint on `(partition, key_epoch)` is the only mutual
//! exclusion the key lifecycle relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prefix of every data encryption key guid
pub const DEK_GUID_PREFIX: &str = "dek";

/// A persisted data encryption key record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEncryptionKey {
    /// Opaque identifier, immutable once persisted
    pub guid: String,
    /// Tenant / scope the key belongs to
    pub partition: String,
    /// Coarse time bucket (start of a calendar year, UTC)
    pub key_epoch: DateTime<Utc>,
    /// Wrapped DEK, standard base64
    pub encrypted_data_encryption_key: String,
    /// Schema version tag
    pub version: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the caller when creating a record
#[derive(Debug, Clone)]
pub struct NewDataEncryptionKey {
    pub partition: String,
    pub key_epoch: DateTime<Utc>,
    pub encrypted_data_encryption_key: String,
    pub version: String,
}

/// Key store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A record for the same (partition, epoch) already exists
    #[error("a key for this partition and epoch already exists")]
    Conflict,

    /// The record failed validation
    #[error("invalid record: {0}")]
    Invalid(String),

    /// Anything else the backend reports
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key store trait for data encryption key records
pub trait KeyStore: Send + Sync {
    /// Find the record for a partition and epoch
    fn find_by_partition_epoch(&self, partition: &str, key_epoch: DateTime<Utc>) -> StoreResult<Option<DataEncryptionKey>>;

    /// Find a record by guid
    fn find_by_guid(&self, guid: &str) -> StoreResult<Option<DataEncryptionKey>>;

    /// Persist a new record. Must return [`StoreError::Conflict`] when the
    /// (partition, epoch) pair is already taken.
    fn create(&self, new_key: NewDataEncryptionKey) -> StoreResult<DataEncryptionKey>;
}

/// Generate a fresh `dek_...` guid
pub fn generate_guid() -> String {
    format!("{}_{}", DEK_GUID_PREFIX, Uuid::new_v4().simple())
}

fn validate(new_key: &NewDataEncryptionKey) -> StoreResult<()> {
    let blank = [
        ("partition", &new_key.partition),
        ("encrypted_data_encryption_key", &new_key.encrypted_data_encryption_key),
        ("version", &new_key.version),
    ]
    .into_iter()
    .find(|(_, value)| value.trim().is_empty());

    match blank {
        Some((field, _)) => Err(StoreError::Invalid(format!("{} can't be blank", field))),
        None => Ok(()),
    }
}

#[derive(Default)]
struct Tables {
    by_guid: HashMap<String, DataEncryptionKey>,
    by_partition_epoch: HashMap<(String, DateTime<Utc>), String>,
}

/// In-memory implementation of KeyStore
///
/// Suitable for development, testing, and single-instance deployments.
/// Data is lost when the process terminates.
#[derive(Default)]
pub struct InMemoryKeyStore {
    tables: RwLock<Tables>,
    conflicts: AtomicUsize,
}

impl InMemoryKeyStore {
    /// Create a new in-memory key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.tables.read().by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of create calls rejected by the uniqueness constraint
    pub fn conflict_count(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

impl KeyStore for InMemoryKeyStore {
    fn find_by_partition_epoch(&self, partition: &str, key_epoch: DateTime<Utc>) -> StoreResult<Option<DataEncryptionKey>> {
        let tables = self.tables.read();
        Ok(tables
            .by_partition_epoch
            .get(&(partition.to_string(), key_epoch))
            .and_then(|guid| tables.by_guid.get(guid))
            .cloned())
    }

    fn find_by_guid(&self, guid: &str) -> StoreResult<Option<DataEncryptionKey>> {
        Ok(self.tables.read().by_guid.get(guid).cloned())
    }

    fn create(&self, new_key: NewDataEncryptionKey) -> StoreResult<DataEncryptionKey> {
        validate(&new_key)?;

        let mut tables = self.tables.write();
        let unique_key = (new_key.partition.clone(), new_key.key_epoch);
        if tables.by_partition_epoch.contains_key(&unique_key) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict);
        }

        let record = DataEncryptionKey {
            guid: generate_guid(),
            partition: new_key.partition,
            key_epoch: new_key.key_epoch,
            encrypted_data_encryption_key: new_key.encrypted_data_encryption_key,
            version: new_key.version,
            created_at: Utc::now(),
        };

        tables.by_partition_epoch.insert(unique_key, record.guid.clone());
        tables.by_guid.insert(record.guid.clone(), record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_key(partition: &str, year: i32) -> NewDataEncryptionKey {
        NewDataEncryptionKey {
            partition: partition.to_string(),
            key_epoch: Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
            encrypted_data_encryption_key: "d3JhcHBlZA==".to_string(),
            version: "KeyManagementService::V1".to_string(),
        }
    }

    #[test]
    fn test_create_and_find() {
        let store = InMemoryKeyStore::new();

        let record = store.create(new_key("p1", 2024)).unwrap();
        assert!(record.guid.starts_with("dek_"));

        let by_epoch = store.find_by_partition_epoch("p1", record.key_epoch).unwrap();
        assert_eq!(by_epoch.as_ref(), Some(&record));

        let by_guid = store.find_by_guid(&record.guid).unwrap();
        assert_eq!(by_guid, Some(record));
    }

    #[test]
    fn test_unique_per_partition_and_epoch() {
        let store = InMemoryKeyStore::new();

        store.create(new_key("p1", 2024)).unwrap();
        assert_eq!(store.create(new_key("p1", 2024)).unwrap_err(), StoreError::Conflict);
        assert_eq!(store.conflict_count(), 1);

        // Other partitions and epochs are independent
        store.create(new_key("p2", 2024)).unwrap();
        store.create(new_key("p1", 2025)).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_missing_records() {
        let store = InMemoryKeyStore::new();
        let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(store.find_by_partition_epoch("p1", epoch).unwrap(), None);
        assert_eq!(store.find_by_guid("dek_missing").unwrap(), None);
    }

    #[test]
    fn test_blank_fields_are_invalid() {
        let store = InMemoryKeyStore::new();
        let mut blank = new_key("p1", 2024);
        blank.encrypted_data_encryption_key = "  ".to_string();

        assert!(matches!(store.create(blank), Err(StoreError::Invalid(_))));
        assert!(store.is_empty());
    }
}
