use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kms_envelope::{
    encryption_key_epoch, EnvelopeConfig, EnvelopeEncryption, FileCodec, FileService, InMemoryKeyCache,
    InMemoryKeyStore, InMemoryObjectStore, LocalKms, Result, SymmetricEngine, Tag, WriteOptions,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_ROOT_KEY_ALIAS: &str = "alias/envelope-demo";

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        error!("demo failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = EnvelopeConfig::from_env()?;
    info!(
        max_file_size = %config.max_file_size_display(),
        key_cache_ttl_secs = config.key_cache_ttl_secs,
        "loaded configuration"
    );

    let engine = Arc::new(SymmetricEngine::new(Arc::new(LocalKms::new())));

    // The local provider starts empty, so the configured root key is provisioned here
    let alias = config.root_key_alias.as_deref().unwrap_or(DEFAULT_ROOT_KEY_ALIAS);
    let key_id = engine.create_key(&[Tag::new("purpose", "demo")], Some(alias), true)?;
    let root_key_id = config.root_key_id.clone().unwrap_or_else(|| alias.to_string());
    let alias_exists = engine.root_key_alias_exists(alias)?;
    info!(%key_id, alias, alias_exists, "provisioned root key");

    let store = Arc::new(InMemoryKeyStore::new());
    let envelopes = EnvelopeEncryption::new(engine.clone(), store.clone(), Arc::new(InMemoryKeyCache::new()));
    let epoch = encryption_key_epoch(&Utc::now())?;

    for partition in ["merchant-1", "merchant-2"] {
        let value = envelopes.encrypt(b"4111 1111 1111 1111", partition, epoch, config.key_cache_ttl(), &root_key_id)?;
        let plaintext = envelopes.decrypt(&value, config.key_cache_ttl(), &root_key_id)?;
        info!(partition, stored_len = value.len(), roundtrip = plaintext == b"4111 1111 1111 1111", "attribute value");
    }
    info!(records = store.len(), "data encryption keys in store");

    let files = FileService::new(FileCodec::new(engine, config.max_file_size), InMemoryObjectStore::new());
    let options = WriteOptions {
        directory: Some("statements".to_string()),
        metadata: Some(BTreeMap::from([("content-type".to_string(), "text/plain".to_string())])),
        ..Default::default()
    };
    let file_key = files.write_data(b"monthly statement", "documents", &root_key_id, options)?;
    let result = files.read("documents", &file_key)?;
    info!(
        %file_key,
        plaintext = %String::from_utf8_lossy(&result.plaintext),
        should_reencrypt = result.should_reencrypt,
        "file round trip"
    );

    Ok(())
}
