//! Runtime configuration, loaded from `ENVELOPE_*` environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EnvelopeError, Result};

/// Default upper bound for file payloads (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default lifetime of cached plaintext keys
pub const DEFAULT_KEY_CACHE_TTL_SECS: u64 = 300;

const ENV_PREFIX: &str = "ENVELOPE_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeConfig {
    /// Largest payload the file codec will seal or fetch, in bytes
    pub max_file_size: u64,
    /// Seconds an unwrapped DEK stays in the key cache
    pub key_cache_ttl_secs: u64,
    /// Root key id or alias used for new data keys
    pub root_key_id: Option<String>,
    /// Alias to create for the root key when provisioning one
    pub root_key_alias: Option<String>,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            key_cache_ttl_secs: DEFAULT_KEY_CACHE_TTL_SECS,
            root_key_id: None,
            root_key_alias: None,
        }
    }
}

impl EnvelopeConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            max_file_size: parse_or(var("MAX_FILE_SIZE"), "MAX_FILE_SIZE", defaults.max_file_size)?,
            key_cache_ttl_secs: parse_or(
                var("KEY_CACHE_TTL_SECS"),
                "KEY_CACHE_TTL_SECS",
                defaults.key_cache_ttl_secs,
            )?,
            root_key_id: var("ROOT_KEY_ID"),
            root_key_alias: var("ROOT_KEY_ALIAS"),
        };

        if config.key_cache_ttl_secs == 0 {
            return Err(EnvelopeError::Config(format!("{}KEY_CACHE_TTL_SECS must be positive", ENV_PREFIX)));
        }
        Ok(config)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }

    /// Human readable maximum file size, e.g. `10MB`
    pub fn max_file_size_display(&self) -> String {
        format_size(self.max_file_size)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, name: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| EnvelopeError::Config(format!("{}{} is not a valid number: {}", ENV_PREFIX, name, raw))),
        None => Ok(default),
    }
}

/// Format a byte count using binary multiples
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if size.fract() == 0.0 {
        format!("{}{}", size as u64, UNITS[unit])
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}
