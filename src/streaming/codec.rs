//! Pluggable byte transforms applied to serialized payloads before framing.
//!
//! The default codec is plain base64. It keeps payloads text-safe and is
//! trivially reversible; it is not meant to hide anything.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Reversible transform applied to every frame payload.
///
/// `encrypt` runs on the sending side right before the length header is
/// written, `decrypt` runs on the receiving side after the payload has been
/// read in full. Implementations must satisfy
/// `decrypt(encrypt(data, key), key) == data` for every key they accept.
pub trait Codec: Send + Sync {
    /// Name reported in framing errors.
    fn name(&self) -> &str;

    fn encrypt(&self, data: &[u8], key: Option<&[u8]>) -> Result<Vec<u8>, String>;

    fn decrypt(&self, data: &[u8], key: Option<&[u8]>) -> Result<Vec<u8>, String>;
}

/// Default codec: standard base64, key ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Codec;

impl Codec for Base64Codec {
    fn name(&self) -> &str {
        "Default"
    }

    fn encrypt(&self, data: &[u8], _key: Option<&[u8]>) -> Result<Vec<u8>, String> {
        Ok(STANDARD.encode(data).into_bytes())
    }

    fn decrypt(&self, data: &[u8], _key: Option<&[u8]>) -> Result<Vec<u8>, String> {
        STANDARD.decode(data).map_err(|e| e.to_string())
    }
}

/// Length of `len` input bytes once base64-encoded.
pub const fn base64_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}
