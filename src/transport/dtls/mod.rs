//! Sans-IO DTLS 1.2 engine used by the mock servers and the file server.
//!
//! Supported cipher suites:
//! - `TLS_PSK_WITH_AES_128_CCM_8` (0xC0A8)
//! - `TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8` (0xC0AE) on secp256r1, with either
//!   an X.509 chain or a raw public key (RFC 7250)
//!
//! Session resumption is keyed by session ID through a [`SessionCache`] that
//! survives engine restarts, and RFC 9146 connection IDs let a peer change its
//! source port mid-session.
//!
//! The engine never touches a socket: it consumes datagrams and produces
//! [`DtlsEvent`]s, one of which is `Transmit`.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use p256::{elliptic_curve::sec1::ToEncodedPoint, pkcs8::DecodePrivateKey, SecretKey};
use thiserror::Error;

use crate::crypto::Psk;

/// Cipher keys and record protection.
pub mod cipher;
/// Handshake state machine.
pub mod engine;
/// Handshake message encodings.
pub mod handshake;
/// Record layer framing.
pub mod record;

pub use engine::{DtlsEngine, DtlsEvent};

/// DER prefix of a `SubjectPublicKeyInfo` holding an uncompressed P-256 point.
pub const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// Default path MTU for outgoing flights.
pub const DEFAULT_MTU: usize = 1400;

/// Length of connection IDs issued by this implementation.
pub const CONNECTION_ID_LENGTH: usize = 8;

/// Alert descriptions used by the engine.
pub mod alert {
    pub const LEVEL_WARNING: u8 = 1;
    pub const LEVEL_FATAL: u8 = 2;

    pub const CLOSE_NOTIFY: u8 = 0;
    pub const UNEXPECTED_MESSAGE: u8 = 10;
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const DECODE_ERROR: u8 = 50;
    pub const DECRYPT_ERROR: u8 = 51;
    pub const UNKNOWN_PSK_IDENTITY: u8 = 115;
}

/// Errors produced by the DTLS engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DtlsError {
    #[error("Malformed DTLS record: {0}")]
    MalformedRecord(String),

    #[error("Malformed handshake message: {0}")]
    MalformedHandshake(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Unknown PSK identity: {}", String::from_utf8_lossy(.0))]
    UnknownPskIdentity(Vec<u8>),

    #[error("Record authentication failed")]
    DecryptFailed,

    #[error("Finished verify_data mismatch")]
    BadFinished,

    #[error("Unexpected handshake message type {msg_type} in state {state}")]
    UnexpectedMessage { msg_type: u8, state: String },

    #[error("Peer sent alert level={level} description={description}")]
    PeerAlert { level: u8, description: u8 },

    #[error("Session is not established")]
    NotEstablished,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

impl DtlsError {
    /// Alert description sent to the peer when this error aborts a handshake.
    #[must_use]
    pub fn alert_description(&self) -> Option<u8> {
        match self {
            Self::MalformedRecord(_) | Self::MalformedHandshake(_) => Some(alert::DECODE_ERROR),
            Self::HandshakeFailed(_) | Self::InvalidKey(_) => Some(alert::HANDSHAKE_FAILURE),
            Self::UnknownPskIdentity(_) => Some(alert::UNKNOWN_PSK_IDENTITY),
            Self::BadFinished => Some(alert::DECRYPT_ERROR),
            Self::UnexpectedMessage { .. } => Some(alert::UNEXPECTED_MESSAGE),
            Self::DecryptFailed | Self::PeerAlert { .. } | Self::NotEstablished => None,
        }
    }
}

/// Which side of the handshake an engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Certificate-mode credentials.
#[derive(Clone)]
pub struct CertificateConfig {
    pub private_key: SecretKey,
    /// DER certificates, leaf first. Empty selects raw public key mode.
    pub certificate_chain: Vec<Vec<u8>>,
    /// Server side: send a CertificateRequest.
    pub request_client_certificate: bool,
}

impl CertificateConfig {
    /// Fresh raw-public-key credentials.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            private_key: SecretKey::random(&mut rand::rngs::OsRng),
            certificate_chain: Vec::new(),
            request_client_certificate: false,
        }
    }

    /// # Errors
    /// Returns `DtlsError::InvalidKey` if the key is not a PKCS#8 P-256 key.
    pub fn from_pkcs8_der(key_der: &[u8], certificate_chain: Vec<Vec<u8>>) -> Result<Self, DtlsError> {
        let private_key =
            SecretKey::from_pkcs8_der(key_der).map_err(|e| DtlsError::InvalidKey(e.to_string()))?;
        Ok(Self {
            private_key,
            certificate_chain,
            request_client_certificate: false,
        })
    }

    #[must_use]
    pub fn with_client_certificate_request(mut self, request: bool) -> Self {
        self.request_client_certificate = request;
        self
    }

    #[must_use]
    pub fn is_raw_public_key(&self) -> bool {
        self.certificate_chain.is_empty()
    }

    /// `SubjectPublicKeyInfo` of the public key, as sent in RPK mode.
    #[must_use]
    pub fn spki(&self) -> Vec<u8> {
        let mut spki = P256_SPKI_PREFIX.to_vec();
        spki.extend_from_slice(
            self.private_key
                .public_key()
                .to_encoded_point(false)
                .as_bytes(),
        );
        spki
    }
}

impl fmt::Debug for CertificateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateConfig")
            .field("certificates", &self.certificate_chain.len())
            .field("request_client_certificate", &self.request_client_certificate)
            .finish_non_exhaustive()
    }
}

/// Credentials selecting the cipher suite.
#[derive(Debug, Clone)]
pub enum DtlsCredentials {
    Psk(Psk),
    Certificate(CertificateConfig),
}

impl DtlsCredentials {
    #[must_use]
    pub fn cipher_suite(&self) -> u16 {
        match self {
            Self::Psk(_) => handshake::TLS_PSK_WITH_AES_128_CCM_8,
            Self::Certificate(_) => handshake::TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8,
        }
    }
}

/// State kept for an abbreviated handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub session_id: Vec<u8>,
    pub master_secret: Vec<u8>,
    pub cipher_suite: u16,
}

impl fmt::Debug for CachedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CachedSession({}, suite={:#06x})",
            hex::encode(&self.session_id),
            self.cipher_suite
        )
    }
}

/// Session-ID indexed cache shared between engine instances of one endpoint.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    sessions: Arc<Mutex<HashMap<Vec<u8>, CachedSession>>>,
}

impl SessionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, session: CachedSession) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.session_id.clone(), session);
    }

    #[must_use]
    pub fn get(&self, session_id: &[u8]) -> Option<CachedSession> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets all sessions, forcing full handshakes.
    pub fn clear(&self) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct DtlsConfig {
    pub credentials: DtlsCredentials,
    /// Negotiate RFC 9146 connection IDs when the peer offers them.
    pub connection_id: bool,
    pub session_cache: SessionCache,
    /// Client side: session to offer for resumption.
    pub resume: Option<CachedSession>,
    pub mtu: usize,
}

impl DtlsConfig {
    #[must_use]
    pub fn new(credentials: DtlsCredentials) -> Self {
        Self {
            credentials,
            connection_id: true,
            session_cache: SessionCache::new(),
            resume: None,
            mtu: DEFAULT_MTU,
        }
    }

    #[must_use]
    pub fn psk(psk: Psk) -> Self {
        Self::new(DtlsCredentials::Psk(psk))
    }

    #[must_use]
    pub fn certificate(config: CertificateConfig) -> Self {
        Self::new(DtlsCredentials::Certificate(config))
    }

    #[must_use]
    pub fn with_connection_id(mut self, enabled: bool) -> Self {
        self.connection_id = enabled;
        self
    }

    #[must_use]
    pub fn with_session_cache(mut self, cache: SessionCache) -> Self {
        self.session_cache = cache;
        self
    }

    #[must_use]
    pub fn with_resume(mut self, session: Option<CachedSession>) -> Self {
        self.resume = session;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PskKey;

    #[test]
    fn test_spki_layout() {
        let cert = CertificateConfig::generate();
        let spki = cert.spki();
        assert_eq!(spki.len(), 91);
        assert_eq!(&spki[..26], &P256_SPKI_PREFIX);
        assert_eq!(spki[26], 0x04);
        assert!(cert.is_raw_public_key());
    }

    #[test]
    fn test_session_cache_shared_between_clones() {
        let cache = SessionCache::new();
        let other = cache.clone();
        cache.store(CachedSession {
            session_id: vec![1; 32],
            master_secret: vec![2; 48],
            cipher_suite: handshake::TLS_PSK_WITH_AES_128_CCM_8,
        });
        assert_eq!(other.len(), 1);
        assert!(other.get(&[1; 32]).is_some());
        assert!(other.get(&[3; 32]).is_none());
        other.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_alert_mapping() {
        assert_eq!(
            DtlsError::UnknownPskIdentity(b"x".to_vec()).alert_description(),
            Some(alert::UNKNOWN_PSK_IDENTITY)
        );
        assert_eq!(DtlsError::BadFinished.alert_description(), Some(alert::DECRYPT_ERROR));
        assert_eq!(DtlsError::DecryptFailed.alert_description(), None);
    }

    #[test]
    fn test_credentials_select_suite() {
        let psk = Psk::new(b"id", PskKey::new(vec![1, 2, 3]).unwrap());
        assert_eq!(
            DtlsConfig::psk(psk).credentials.cipher_suite(),
            handshake::TLS_PSK_WITH_AES_128_CCM_8
        );
        assert_eq!(
            DtlsConfig::certificate(CertificateConfig::generate())
                .credentials
                .cipher_suite(),
            handshake::TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8
        );
    }
}
