//! Pre-shared key handling and the TLS 1.2 pseudo-random function.
//!
//! Keys are loaded the same way for mock servers, the file server and the
//! client command line: from a hex string or from a file holding either hex
//! text or raw bytes.

use std::{fs, path::Path};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 output length.
pub const SHA256_LENGTH: usize = 32;

/// Errors that can occur while loading PSK credentials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PskError {
    /// The key is empty.
    #[error("PSK must not be empty")]
    EmptyKey,

    /// Invalid hexadecimal string.
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    /// Failed to read key from file.
    #[error("Failed to read key file: {0}")]
    FileReadError(String),
}

/// Pre-shared key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PskKey(Vec<u8>);

impl PskKey {
    /// # Errors
    /// Returns `PskError::EmptyKey` for an empty key.
    pub fn new(key: Vec<u8>) -> Result<Self, PskError> {
        if key.is_empty() {
            return Err(PskError::EmptyKey);
        }
        Ok(Self(key))
    }

    /// # Errors
    /// Returns `PskError::InvalidHex` if the string is not valid hex.
    pub fn from_hex(hex_str: &str) -> Result<Self, PskError> {
        let key = hex::decode(hex_str).map_err(|e| PskError::InvalidHex(e.to_string()))?;
        Self::new(key)
    }

    /// Reads a key from a file holding hex text or raw bytes.
    ///
    /// # Errors
    /// Returns `PskError::FileReadError` if the file cannot be read.
    pub fn from_file(path: &Path) -> Result<Self, PskError> {
        let raw = fs::read(path).map_err(|e| PskError::FileReadError(e.to_string()))?;

        if let Ok(text) = std::str::from_utf8(&raw) {
            if let Ok(key) = Self::from_hex(text.trim()) {
                return Ok(key);
            }
        }

        Self::new(raw)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for PskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PskKey({} bytes)", self.0.len())
    }
}

/// PSK identity and key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psk {
    pub identity: Vec<u8>,
    pub key: PskKey,
}

impl Psk {
    #[must_use]
    pub fn new(identity: &[u8], key: PskKey) -> Self {
        Self {
            identity: identity.to_vec(),
            key,
        }
    }
}

/// Computes HMAC-SHA256 over the concatenation of `parts`.
#[must_use]
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; SHA256_LENGTH] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

#[must_use]
pub fn sha256(data: &[u8]) -> [u8; SHA256_LENGTH] {
    Sha256::digest(data).into()
}

/// TLS 1.2 PRF with P_SHA256 (RFC 5246 Section 5).
///
/// ```text
/// P_hash(secret, seed) = HMAC(secret, A(1) + seed) + HMAC(secret, A(2) + seed) + ...
/// A(0) = seed, A(i) = HMAC(secret, A(i-1))
/// ```
#[must_use]
pub fn prf_sha256(secret: &[u8], label: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(length + SHA256_LENGTH);
    let mut a = hmac_sha256(secret, &[label, seed]);
    while output.len() < length {
        output.extend_from_slice(&hmac_sha256(secret, &[&a, label, seed]));
        a = hmac_sha256(secret, &[&a]);
    }
    output.truncate(length);
    output
}

/// Performs constant-time comparison of two byte slices.
#[must_use]
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_known_vector() {
        let secret = hex::decode("9bbe436ba940f017b17652849a71db35").unwrap();
        let seed = hex::decode("a0ba9f936cda311827a6f796ffd5198c").unwrap();
        let out = prf_sha256(&secret, b"test label", &seed, 100);
        assert_eq!(out.len(), 100);
        assert_eq!(hex::encode(&out[..16]), "e3f229ba727be17b8d122620557cd453");
    }

    #[test]
    fn test_prf_prefix_stable() {
        let short = prf_sha256(b"secret", b"label", b"seed", 12);
        let long = prf_sha256(b"secret", b"label", b"seed", 48);
        assert_eq!(&long[..12], &short[..]);
    }

    #[test]
    fn test_key_from_hex() {
        let key = PskKey::from_hex("0123456789ABCDEF").unwrap();
        assert_eq!(key.as_bytes().len(), 8);
        assert_eq!(key.to_hex(), "0123456789abcdef");
        assert!(matches!(
            PskKey::from_hex("not_valid_hex!"),
            Err(PskError::InvalidHex(_))
        ));
        assert_eq!(PskKey::from_hex(""), Err(PskError::EmptyKey));
    }

    #[test]
    fn test_key_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let hex_path = dir.path().join("key.hex");
        fs::write(&hex_path, "deadbeef\n").unwrap();
        assert_eq!(
            PskKey::from_file(&hex_path).unwrap().as_bytes(),
            &[0xde, 0xad, 0xbe, 0xef]
        );

        let raw_path = dir.path().join("key.bin");
        fs::write(&raw_path, [0xff, 0x00, 0x10]).unwrap();
        assert_eq!(
            PskKey::from_file(&raw_path).unwrap().as_bytes(),
            &[0xff, 0x00, 0x10]
        );

        assert!(matches!(
            PskKey::from_file(&dir.path().join("missing")),
            Err(PskError::FileReadError(_))
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let key = PskKey::new(b"secret".to_vec()).unwrap();
        assert_eq!(format!("{key:?}"), "PskKey(6 bytes)");
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_compare(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_compare(&[1, 2], &[1, 2, 3]));
        assert!(constant_time_compare(&[], &[]));
    }
}
