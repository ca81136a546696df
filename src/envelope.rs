//! Envelope facade: partition/epoch scoped encryption of attribute values.
//!
//! Values are stored as a JSON object carrying a reference to the DEK record
//! (`key_guid`), the wrapped DEK itself, the ciphertext and the nonce, all
//! standard base64. Values written before DEK records existed carry no
//! `key_guid`; their `key` field is the only copy of the wrapped DEK.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::error;

use crate::cache::KeyCache;
use crate::encoding;
use crate::error::{EnvelopeError, Result};
use crate::key_manager::KeyManager;
use crate::provider::RootKeyProvider;
use crate::storage::KeyStore;
use crate::symmetric::SymmetricEngine;

/// A parsed wire envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    /// References a DEK record by guid. The inline `key` is informational
    /// and never read back.
    Current {
        key_guid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        data: String,
        nonce: String,
    },
    /// Carries only the inline wrapped DEK
    Legacy { key: String, data: String, nonce: String },
}

impl Envelope {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(EnvelopeError::from)
    }

    /// Parse a stored value. The presence of `key_guid`, whatever its value,
    /// selects the current format.
    pub fn from_json(json: &str) -> Result<Self> {
        let fields: Map<String, Value> = serde_json::from_str(json)?;

        if let Some(key_guid) = fields.get("key_guid") {
            let key_guid = key_guid
                .as_str()
                .ok_or_else(|| EnvelopeError::Serialization("key_guid must be a string".into()))?;
            let key = match fields.get("key") {
                None | Some(Value::Null) => None,
                Some(Value::String(key)) => Some(key.clone()),
                Some(_) => return Err(EnvelopeError::Serialization("key must be a string".into())),
            };

            return Ok(Envelope::Current {
                key_guid: key_guid.to_string(),
                key,
                data: string_field(&fields, "data")?,
                nonce: string_field(&fields, "nonce")?,
            });
        }

        Ok(Envelope::Legacy {
            key: string_field(&fields, "key")?,
            data: string_field(&fields, "data")?,
            nonce: string_field(&fields, "nonce")?,
        })
    }
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Result<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EnvelopeError::Serialization(format!("missing or non-string field {}", name)))
}

/// Partition-scoped envelope encryption over shared DEK records
pub struct EnvelopeEncryption<P: RootKeyProvider, S: KeyStore, C: KeyCache> {
    engine: Arc<SymmetricEngine<P>>,
    store: Arc<S>,
    cache: Arc<C>,
}

impl<P: RootKeyProvider, S: KeyStore, C: KeyCache> EnvelopeEncryption<P, S, C> {
    pub fn new(engine: Arc<SymmetricEngine<P>>, store: Arc<S>, cache: Arc<C>) -> Self {
        Self { engine, store, cache }
    }

    fn key_manager(&self, partition: &str, cache_ttl: Duration, root_key_id: &str) -> Result<KeyManager<P, S, C>> {
        KeyManager::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            partition,
            cache_ttl,
            root_key_id,
        )
    }

    /// Encrypt `plaintext` under the DEK of (`partition`, `key_epoch`) and
    /// return the JSON envelope.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        partition: &str,
        key_epoch: DateTime<Utc>,
        cache_ttl: Duration,
        root_key_id: &str,
    ) -> Result<String> {
        if plaintext.is_empty() {
            return Err(EnvelopeError::InvalidParameter("value is blank".into()));
        }
        let key_manager = self.key_manager(partition, cache_ttl, root_key_id)?;

        self.encrypt_with_manager(plaintext, &key_manager, key_epoch).map_err(|e| {
            error!("Key management exception on encrypt: {}", e);
            EnvelopeError::EncryptionFailed(e.to_string())
        })
    }

    fn encrypt_with_manager(
        &self,
        plaintext: &[u8],
        key_manager: &KeyManager<P, S, C>,
        key_epoch: DateTime<Utc>,
    ) -> Result<String> {
        let record = key_manager.find_or_create_key(key_epoch)?;
        let plaintext_key = key_manager.retrieve_plaintext_key(&record)?;
        let sealed = self.engine.encrypt_with_key(plaintext, &plaintext_key)?;

        Envelope::Current {
            key_guid: record.guid,
            // Copy of the record's wrapped DEK; reads always go through the record
            key: Some(record.encrypted_data_encryption_key),
            data: encoding::encode_standard(&sealed.ciphertext),
            nonce: encoding::encode_standard(&sealed.nonce),
        }
        .to_json()
    }

    /// Decrypt a JSON envelope written by [`Self::encrypt`] or by the legacy format.
    pub fn decrypt(&self, value: &str, cache_ttl: Duration, root_key_id: &str) -> Result<Vec<u8>> {
        if value.trim().is_empty() {
            return Err(EnvelopeError::InvalidParameter("value is blank".into()));
        }
        if cache_ttl.is_zero() {
            return Err(EnvelopeError::InvalidParameter("cache ttl is zero".into()));
        }
        if root_key_id.trim().is_empty() {
            return Err(EnvelopeError::InvalidParameter("root key id is blank".into()));
        }

        let envelope = Envelope::from_json(value).map_err(|e| {
            error!("JSON parse error on decryption: {}", e);
            EnvelopeError::DecryptionFailed(e.to_string())
        })?;

        let result = match envelope {
            Envelope::Legacy { key, data, nonce } => self.legacy_decrypt(&key, &data, &nonce),
            Envelope::Current { key_guid, data, nonce, .. } => {
                self.decrypt_current(&key_guid, &data, &nonce, cache_ttl, root_key_id)
            }
        };

        result.map_err(|e| match e {
            EnvelopeError::DecryptionFailed(_) => e,
            other => {
                error!("Exception on decrypt: {}", other);
                EnvelopeError::DecryptionFailed(other.to_string())
            }
        })
    }

    fn legacy_decrypt(&self, key: &str, data: &str, nonce: &str) -> Result<Vec<u8>> {
        let wrapped = encoding::decode_standard(key)?;
        let ciphertext = encoding::decode_standard(data)?;
        let nonce = encoding::decode_standard(nonce)?;

        // Legacy values are final: the re-encrypt signal is not surfaced
        Ok(self.engine.decrypt(&wrapped, &ciphertext, &nonce, None)?.plaintext)
    }

    fn decrypt_current(
        &self,
        key_guid: &str,
        data: &str,
        nonce: &str,
        cache_ttl: Duration,
        root_key_id: &str,
    ) -> Result<Vec<u8>> {
        let ciphertext = encoding::decode_standard(data)?;
        let nonce = encoding::decode_standard(nonce)?;

        let record = self
            .store
            .find_by_guid(key_guid)
            .map_err(|e| EnvelopeError::Storage(e.to_string()))?
            .ok_or_else(|| {
                error!("Failed to find encryption key for guid {} on decrypt", key_guid);
                EnvelopeError::DecryptionFailed(format!("encryption key {} not found", key_guid))
            })?;

        let key_manager = self.key_manager(&record.partition, cache_ttl, root_key_id)?;
        let plaintext_key = key_manager.retrieve_plaintext_key(&record)?;

        self.engine.decrypt_with_key(&ciphertext, &plaintext_key, &nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::cache::InMemoryKeyCache;
    use crate::crypto::{AesGcmCipher, SecureKey, AES_256_KEY_SIZE};
    use crate::provider::LocalKms;
    use crate::storage::InMemoryKeyStore;

    const TTL: Duration = Duration::from_secs(300);

    type Service = EnvelopeEncryption<LocalKms, InMemoryKeyStore, InMemoryKeyCache>;

    fn service() -> (Service, Arc<InMemoryKeyStore>, String) {
        let engine = Arc::new(SymmetricEngine::new(Arc::new(LocalKms::new())));
        let key_id = engine.create_key(&[], Some("alias/zetatango"), true).unwrap();
        let store = Arc::new(InMemoryKeyStore::new());
        let service = EnvelopeEncryption::new(engine, store.clone(), Arc::new(InMemoryKeyCache::new()));
        (service, store, key_id)
    }

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (service, _, key_id) = service();

        let value = service.encrypt(b"hello", "p1", epoch(), TTL, &key_id).unwrap();
        let plaintext = service.decrypt(&value, TTL, &key_id).unwrap();

        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_round_trip_payload_shapes() {
        let (service, store, key_id) = service();
        let large = vec![0xA5u8; 256 * 1024];
        let payloads: [&[u8]; 4] = [b"x", b"bin\0ary\0", "ünïcödé 🔐".as_bytes(), &large];

        for payload in payloads {
            let value = service.encrypt(payload, "p1", epoch(), TTL, &key_id).unwrap();
            assert_eq!(service.decrypt(&value, TTL, &key_id).unwrap(), payload);
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_envelope_fields() {
        let (service, store, key_id) = service();

        let value = service.encrypt(b"abc123", "p1", epoch(), TTL, &key_id).unwrap();
        let json: serde_json::Value = serde_json::from_str(&value).unwrap();
        let fields: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(fields.len(), 4);

        let record = store.find_by_partition_epoch("p1", epoch()).unwrap().unwrap();
        assert_eq!(json["key_guid"], record.guid.as_str());
        assert_eq!(json["key"], record.encrypted_data_encryption_key.as_str());
        assert_eq!(encoding::decode_standard(json["nonce"].as_str().unwrap()).unwrap().len(), 12);

        assert!(matches!(Envelope::from_json(&value).unwrap(), Envelope::Current { .. }));
    }

    #[test]
    fn test_encrypt_invalid_parameters() {
        let (service, _, key_id) = service();

        let cases: [(&[u8], &str, Duration, &str); 4] = [
            (b"", "p1", TTL, &key_id),
            (b"data", "", TTL, &key_id),
            (b"data", "p1", Duration::ZERO, &key_id),
            (b"data", "p1", TTL, ""),
        ];
        for (plaintext, partition, ttl, root_key_id) in cases {
            let err = service.encrypt(plaintext, partition, epoch(), ttl, root_key_id).unwrap_err();
            assert!(matches!(err, EnvelopeError::InvalidParameter(_)));
        }
    }

    #[test]
    fn test_encrypt_failures_are_wrapped() {
        let (service, _, _) = service();

        let err = service.encrypt(b"data", "p1", epoch(), TTL, "alias/bad_key").unwrap_err();
        assert!(matches!(err, EnvelopeError::EncryptionFailed(_)));
    }

    #[test]
    fn test_decrypt_invalid_json() {
        let (service, _, key_id) = service();

        let err = service.decrypt("{not json", TTL, &key_id).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptionFailed(_)));

        let err = service.decrypt(r#"{"key_guid":"dek_x"}"#, TTL, &key_id).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptionFailed(_)));
    }

    #[test]
    fn test_decrypt_unknown_guid() {
        let (service, _, key_id) = service();
        let value = service.encrypt(b"data", "p1", epoch(), TTL, &key_id).unwrap();

        let mut json: serde_json::Value = serde_json::from_str(&value).unwrap();
        json["key_guid"] = "dek_missing".into();

        let err = service.decrypt(&json.to_string(), TTL, &key_id).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptionFailed(_)));
    }

    #[test]
    fn test_key_guid_presence_selects_current_format() {
        let (service, _, key_id) = service();
        let value = service.encrypt(b"secret", "p1", epoch(), TTL, &key_id).unwrap();
        let json: serde_json::Value = serde_json::from_str(&value).unwrap();

        // A present but unusable key_guid must not fall back to the inline key
        for bad_guid in [serde_json::Value::Null, serde_json::json!(42)] {
            let mut tampered = json.clone();
            tampered["key_guid"] = bad_guid;
            let tampered = tampered.to_string();

            assert!(matches!(Envelope::from_json(&tampered), Err(EnvelopeError::Serialization(_))));
            let err = service.decrypt(&tampered, TTL, &key_id).unwrap_err();
            assert!(matches!(err, EnvelopeError::DecryptionFailed(_)));
        }
    }

    #[test]
    fn test_current_envelope_without_inline_key() {
        let (service, _, key_id) = service();
        let value = service.encrypt(b"secret", "p1", epoch(), TTL, &key_id).unwrap();

        let mut json: serde_json::Value = serde_json::from_str(&value).unwrap();
        json.as_object_mut().unwrap().remove("key");
        let without_key = json.to_string();

        match Envelope::from_json(&without_key).unwrap() {
            Envelope::Current { key, .. } => assert_eq!(key, None),
            other => panic!("expected current envelope, got {:?}", other),
        }
        assert_eq!(service.decrypt(&without_key, TTL, &key_id).unwrap(), b"secret");
    }

    #[test]
    fn test_decrypt_tampered_data() {
        let (service, _, key_id) = service();
        let value = service.encrypt(b"data", "p1", epoch(), TTL, &key_id).unwrap();

        let mut json: serde_json::Value = serde_json::from_str(&value).unwrap();
        let mut data = encoding::decode_standard(json["data"].as_str().unwrap()).unwrap();
        data[0] ^= 0x80;
        json["data"] = encoding::encode_standard(&data).into();

        let err = service.decrypt(&json.to_string(), TTL, &key_id).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptionFailed(_)));
    }

    #[test]
    fn test_legacy_envelope() {
        let (service, store, key_id) = service();
        let result = service.engine.encrypt(b"legacy value", &key_id, None, None).unwrap();

        let legacy = Envelope::Legacy {
            key: encoding::encode_standard(&result.wrapped_key),
            data: encoding::encode_standard(&result.ciphertext),
            nonce: encoding::encode_standard(&result.nonce),
        }
        .to_json()
        .unwrap();
        assert!(matches!(Envelope::from_json(&legacy).unwrap(), Envelope::Legacy { .. }));

        assert_eq!(service.decrypt(&legacy, TTL, &key_id).unwrap(), b"legacy value");
        assert!(store.is_empty());
    }

    #[test]
    fn test_legacy_envelope_with_legacy_key_transform() {
        let (service, _, key_id) = service();
        let data_key = service.engine.generate_data_key(&key_id, None).unwrap();
        let zero_key = SecureKey::new([0u8; AES_256_KEY_SIZE]);
        let sealed = AesGcmCipher::encrypt(&zero_key, b"very old value", None).unwrap();

        // MIME-style base64 with line breaks, as older writers produced
        let mime = |bytes: &[u8]| format!("{}\n", encoding::encode_standard(bytes));
        let legacy = serde_json::json!({
            "key": mime(&data_key.wrapped),
            "data": mime(&sealed.ciphertext),
            "nonce": mime(&sealed.nonce),
        })
        .to_string();

        assert_eq!(service.decrypt(&legacy, TTL, &key_id).unwrap(), b"very old value");
    }

    #[test]
    fn test_decrypt_uses_record_partition() {
        let (service, _, key_id) = service();

        let a = service.encrypt(b"for a", "a", epoch(), TTL, &key_id).unwrap();
        let b = service.encrypt(b"for b", "b", epoch(), TTL, &key_id).unwrap();

        assert_eq!(service.decrypt(&a, TTL, &key_id).unwrap(), b"for a");
        assert_eq!(service.decrypt(&b, TTL, &key_id).unwrap(), b"for b");
    }
}
