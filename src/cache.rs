//! Best-effort cache of unwrapped data encryption keys
//!
//! Callers treat every cache failure as a miss (on read) or as "not cached"
//! (on write); nothing here is allowed to fail an encrypt or decrypt.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;

use crate::crypto::SecureKey;

/// Namespace every cache entry is stored under
pub const KEY_CACHE_NAMESPACE: &str = "key_management_service";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// Plaintext key cache contract
pub trait KeyCache: Send + Sync {
    /// Read a key by DEK guid
    fn read(&self, guid: &str) -> Result<Option<SecureKey>, CacheError>;

    /// Store a key by DEK guid for `ttl`
    fn write(&self, guid: &str, key: &SecureKey, ttl: Duration) -> Result<(), CacheError>;
}

struct CacheEntry {
    key: SecureKey,
    expires_at: Instant,
}

/// In-process TTL cache. Expired entries are dropped (and zeroized) on the
/// next read of the same guid or on any write.
#[derive(Default)]
pub struct InMemoryKeyCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespaced(guid: &str) -> String {
        format!("{}:{}", KEY_CACHE_NAMESPACE, guid)
    }

    /// Number of live (unexpired) entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyCache for InMemoryKeyCache {
    fn read(&self, guid: &str) -> Result<Option<SecureKey>, CacheError> {
        let name = Self::namespaced(guid);
        let now = Instant::now();

        {
            let entries = self.entries.read();
            match entries.get(&name) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.key.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Re-checked under the write lock: a concurrent write may have refreshed it
        let mut entries = self.entries.write();
        let expired = match entries.get(&name) {
            Some(entry) if entry.expires_at > Instant::now() => return Ok(Some(entry.key.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(&name);
        }
        Ok(None)
    }

    fn write(&self, guid: &str, key: &SecureKey, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| CacheError(format!("ttl out of range: {:?}", ttl)))?;

        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(Self::namespaced(guid), CacheEntry { key: key.clone(), expires_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let cache = InMemoryKeyCache::new();
        let key = SecureKey::generate();

        cache.write("dek_1", &key, Duration::from_secs(60)).unwrap();
        let cached = cache.read("dek_1").unwrap().unwrap();

        assert_eq!(cached.as_bytes(), key.as_bytes());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_miss() {
        let cache = InMemoryKeyCache::new();
        assert!(cache.read("dek_unknown").unwrap().is_none());
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = InMemoryKeyCache::new();
        let key = SecureKey::generate();

        cache.write("dek_1", &key, Duration::ZERO).unwrap();

        assert!(cache.read("dek_1").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_overflow_is_an_error() {
        let cache = InMemoryKeyCache::new();
        let key = SecureKey::generate();

        assert!(cache.write("dek_1", &key, Duration::MAX).is_err());
    }

    #[test]
    fn test_writes_sweep_expired_entries() {
        let cache = InMemoryKeyCache::new();
        let key = SecureKey::generate();

        for i in 0..1000 {
            cache.write(&format!("dek_{}", i), &key, Duration::ZERO).unwrap();
        }
        cache.write("dek_live", &key, Duration::from_secs(60)).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries.read().len(), 1);
        assert!(cache.read("dek_live").unwrap().is_some());
    }
}
