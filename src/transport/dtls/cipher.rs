//! Key schedule and AES-128-CCM-8 record protection.
//!
//! # Protected record fragment
//!
//! ```text
//! +--------------------+---------------------+---------+
//! | explicit nonce (8) | ciphertext          | tag (8) |
//! | epoch || sequence  |                     |         |
//! +--------------------+---------------------+---------+
//! nonce = write_iv (4) || explicit nonce (8)
//! ```
//!
//! With a negotiated connection ID (RFC 9146) the plaintext becomes
//! `content || real_type` and the additional data changes shape.

use aes::Aes128;
use ccm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    consts::{U12, U8},
    Ccm,
};

use super::{
    record::{content_type, Record, DTLS_1_2},
    DtlsError, Role,
};
use crate::crypto::{prf_sha256, sha256};

type Aes128Ccm8 = Ccm<Aes128, U8, U12>;

pub const MASTER_SECRET_LENGTH: usize = 48;
pub const VERIFY_DATA_LENGTH: usize = 12;
pub const KEY_LENGTH: usize = 16;
pub const FIXED_IV_LENGTH: usize = 4;
pub const EXPLICIT_NONCE_LENGTH: usize = 8;
pub const TAG_LENGTH: usize = 8;

/// Bytes added to a record by protection (without a connection ID).
pub const PROTECTION_OVERHEAD: usize = EXPLICIT_NONCE_LENGTH + TAG_LENGTH;

/// `master_secret = PRF(pre_master_secret, "master secret", client_random + server_random)`.
#[must_use]
pub fn master_secret(premaster: &[u8], client_random: &[u8], server_random: &[u8]) -> Vec<u8> {
    let seed = [client_random, server_random].concat();
    prf_sha256(premaster, b"master secret", &seed, MASTER_SECRET_LENGTH)
}

/// PSK premaster secret (RFC 4279 Section 2).
///
/// # Errors
/// Returns `DtlsError::InvalidKey` for keys longer than 65535 bytes.
pub fn psk_premaster(psk: &[u8]) -> Result<Vec<u8>, DtlsError> {
    let len = u16::try_from(psk.len())
        .map_err(|_| DtlsError::InvalidKey(format!("PSK of {} bytes is too long", psk.len())))?
        .to_be_bytes();
    let mut premaster = Vec::with_capacity(4 + 2 * psk.len());
    premaster.extend_from_slice(&len);
    premaster.resize(2 + psk.len(), 0);
    premaster.extend_from_slice(&len);
    premaster.extend_from_slice(psk);
    Ok(premaster)
}

/// Finished `verify_data` over the handshake transcript.
#[must_use]
pub fn verify_data(master: &[u8], role: Role, transcript: &[u8]) -> Vec<u8> {
    let label: &[u8] = match role {
        Role::Client => b"client finished",
        Role::Server => b"server finished",
    };
    prf_sha256(master, label, &sha256(transcript), VERIFY_DATA_LENGTH)
}

/// Keys for one direction.
struct DirectionKeys {
    cipher: Aes128Ccm8,
    iv: [u8; FIXED_IV_LENGTH],
}

impl DirectionKeys {
    fn new(key: &[u8], iv: &[u8]) -> Self {
        let mut fixed = [0u8; FIXED_IV_LENGTH];
        fixed.copy_from_slice(iv);
        Self {
            cipher: Aes128Ccm8::new(GenericArray::from_slice(key)),
            iv: fixed,
        }
    }

    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..FIXED_IV_LENGTH].copy_from_slice(&self.iv);
        nonce[FIXED_IV_LENGTH..].copy_from_slice(explicit);
        nonce
    }
}

/// Epoch-1 record protection for both directions.
pub struct RecordProtection {
    write: DirectionKeys,
    read: DirectionKeys,
}

impl RecordProtection {
    /// Expands the key block and assigns directions for `role`.
    ///
    /// ```text
    /// key_block = PRF(master, "key expansion", server_random + client_random)
    ///           = client_write_key[16] server_write_key[16]
    ///             client_write_IV[4] server_write_IV[4]
    /// ```
    #[must_use]
    pub fn new(master: &[u8], client_random: &[u8], server_random: &[u8], role: Role) -> Self {
        let seed = [server_random, client_random].concat();
        let block = prf_sha256(
            master,
            b"key expansion",
            &seed,
            2 * KEY_LENGTH + 2 * FIXED_IV_LENGTH,
        );
        let (client_key, rest) = block.split_at(KEY_LENGTH);
        let (server_key, rest) = rest.split_at(KEY_LENGTH);
        let (client_iv, server_iv) = rest.split_at(FIXED_IV_LENGTH);

        let client = DirectionKeys::new(client_key, client_iv);
        let server = DirectionKeys::new(server_key, server_iv);
        match role {
            Role::Client => Self {
                write: client,
                read: server,
            },
            Role::Server => Self {
                write: server,
                read: client,
            },
        }
    }

    /// Builds a protected record. A non-empty `peer_cid` produces a
    /// `tls12_cid` record.
    ///
    /// # Errors
    /// Returns `DtlsError::DecryptFailed` if the cipher refuses the input.
    pub fn seal(
        &self,
        content: u8,
        epoch: u16,
        sequence: u64,
        plaintext: &[u8],
        peer_cid: &[u8],
    ) -> Result<Record, DtlsError> {
        let explicit = explicit_nonce(epoch, sequence);
        let nonce = self.write.nonce(&explicit);

        let (outer_type, inner, aad) = if peer_cid.is_empty() {
            let aad = plain_aad(content, epoch, sequence, plaintext.len());
            (content, plaintext.to_vec(), aad)
        } else {
            let mut inner = plaintext.to_vec();
            inner.push(content);
            let aad = cid_aad(epoch, sequence, peer_cid, inner.len());
            (content_type::TLS12_CID, inner, aad)
        };

        let ciphertext = self
            .write
            .cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &inner,
                    aad: &aad,
                },
            )
            .map_err(|_| DtlsError::DecryptFailed)?;

        let mut fragment = explicit.to_vec();
        fragment.extend_from_slice(&ciphertext);
        let mut record = Record::new(outer_type, epoch, sequence, fragment);
        if !peer_cid.is_empty() {
            record.cid = Some(peer_cid.to_vec());
        }
        Ok(record)
    }

    /// Authenticates and decrypts a record; returns the real content type
    /// and the plaintext.
    ///
    /// # Errors
    /// Returns `DtlsError::DecryptFailed` on authentication failure and
    /// `DtlsError::MalformedRecord` on short fragments.
    pub fn open(&self, record: &Record) -> Result<(u8, Vec<u8>), DtlsError> {
        if record.fragment.len() < PROTECTION_OVERHEAD {
            return Err(DtlsError::MalformedRecord(format!(
                "protected fragment of {} bytes",
                record.fragment.len()
            )));
        }
        let (explicit, ciphertext) = record.fragment.split_at(EXPLICIT_NONCE_LENGTH);
        let nonce = self.read.nonce(explicit);
        let plain_len = ciphertext.len() - TAG_LENGTH;

        let aad = match &record.cid {
            Some(cid) => cid_aad(record.epoch, record.sequence, cid, plain_len),
            None => plain_aad(record.content_type, record.epoch, record.sequence, plain_len),
        };

        let mut plaintext = self
            .read
            .cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| DtlsError::DecryptFailed)?;

        if record.cid.is_none() {
            return Ok((record.content_type, plaintext));
        }
        // DTLSInnerPlaintext: content, real type, zero padding
        while plaintext.last() == Some(&0) {
            plaintext.pop();
        }
        let real_type = plaintext
            .pop()
            .ok_or_else(|| DtlsError::MalformedRecord("empty inner plaintext".into()))?;
        Ok((real_type, plaintext))
    }
}

fn explicit_nonce(epoch: u16, sequence: u64) -> [u8; EXPLICIT_NONCE_LENGTH] {
    let mut explicit = [0u8; EXPLICIT_NONCE_LENGTH];
    explicit[..2].copy_from_slice(&epoch.to_be_bytes());
    explicit[2..].copy_from_slice(&sequence.to_be_bytes()[2..]);
    explicit
}

fn plain_aad(content: u8, epoch: u16, sequence: u64, len: usize) -> Vec<u8> {
    let mut aad = explicit_nonce(epoch, sequence).to_vec();
    aad.push(content);
    aad.extend_from_slice(&DTLS_1_2);
    aad.extend_from_slice(&(len as u16).to_be_bytes());
    aad
}

fn cid_aad(epoch: u16, sequence: u64, cid: &[u8], inner_len: usize) -> Vec<u8> {
    let mut aad = vec![0xFF; 8];
    aad.push(content_type::TLS12_CID);
    aad.push(cid.len() as u8);
    aad.push(content_type::TLS12_CID);
    aad.extend_from_slice(&DTLS_1_2);
    aad.extend_from_slice(&explicit_nonce(epoch, sequence));
    aad.extend_from_slice(cid);
    aad.extend_from_slice(&(inner_len as u16).to_be_bytes());
    aad
}
