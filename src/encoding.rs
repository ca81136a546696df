//! Base64 helpers for the two wire formats.
//!
//! Older writers emitted MIME-style base64 with embedded newlines, so
//! decoding strips ASCII whitespace before handing off to the engine.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    DecodeError, Engine,
};

pub fn encode_standard(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_standard(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(strip_whitespace(encoded))
}

pub fn encode_url_safe(bytes: &[u8]) -> String {
    URL_SAFE.encode(bytes)
}

pub fn decode_url_safe(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE.decode(strip_whitespace(encoded))
}

fn strip_whitespace(encoded: &str) -> String {
    encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}
