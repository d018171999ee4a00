//! DTLS 1.2 record layer framing, including the RFC 9146 `tls12_cid` record.
//!
//! # Record Header (RFC 6347 Section 4.1)
//!
//! ```text
//! +--------+---------+---------+-------------------+----------+
//! | type   | version | epoch   | sequence_number   | length   |
//! | 1 byte | 2 bytes | 2 bytes | 6 bytes           | 2 bytes  |
//! +--------+---------+---------+-------------------+----------+
//! ```
//!
//! A `tls12_cid` record (type 25) carries the connection ID between the
//! sequence number and the length; its size is known from negotiation only.

use super::DtlsError;

/// DTLS 1.2 on-the-wire version.
pub const DTLS_1_2: [u8; 2] = [0xFE, 0xFD];

/// DTLS 1.0 version, allowed in the record carrying the first ClientHello.
pub const DTLS_1_0: [u8; 2] = [0xFE, 0xFF];

/// Plain record header size.
pub const RECORD_HEADER_SIZE: usize = 13;

/// Largest 48-bit sequence number.
pub const MAX_SEQUENCE: u64 = (1 << 48) - 1;

/// Record content types.
pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
    pub const TLS12_CID: u8 = 25;
}

/// One DTLS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: u8,
    pub version: [u8; 2],
    pub epoch: u16,
    pub sequence: u64,
    pub cid: Option<Vec<u8>>,
    pub fragment: Vec<u8>,
}

impl Record {
    #[must_use]
    pub fn new(content_type: u8, epoch: u16, sequence: u64, fragment: Vec<u8>) -> Self {
        Self {
            content_type,
            version: DTLS_1_2,
            epoch,
            sequence,
            cid: None,
            fragment,
        }
    }

    /// Parses one record from the start of `buf`.
    ///
    /// `cid_len` is the length of the connection ID this endpoint expects in
    /// `tls12_cid` records.
    ///
    /// # Errors
    /// Returns `DtlsError::MalformedRecord` on truncation or an unknown version.
    pub fn parse(buf: &[u8], cid_len: usize) -> Result<(Self, usize), DtlsError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(DtlsError::MalformedRecord(format!(
                "{} bytes is shorter than a record header",
                buf.len()
            )));
        }
        let content_type = buf[0];
        let version = [buf[1], buf[2]];
        if version != DTLS_1_2 && version != DTLS_1_0 {
            return Err(DtlsError::MalformedRecord(format!(
                "unsupported version {:02x}{:02x}",
                version[0], version[1]
            )));
        }
        let epoch = u16::from_be_bytes([buf[3], buf[4]]);
        let sequence = buf[5..11]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

        let (cid, length_at) = if content_type == content_type::TLS12_CID {
            if buf.len() < RECORD_HEADER_SIZE + cid_len {
                return Err(DtlsError::MalformedRecord("truncated connection ID".into()));
            }
            (Some(buf[11..11 + cid_len].to_vec()), 11 + cid_len)
        } else {
            (None, 11)
        };

        let length = usize::from(u16::from_be_bytes([buf[length_at], buf[length_at + 1]]));
        let start = length_at + 2;
        if buf.len() - start < length {
            return Err(DtlsError::MalformedRecord(format!(
                "record length {length} exceeds remaining {}",
                buf.len() - start
            )));
        }

        Ok((
            Self {
                content_type,
                version,
                epoch,
                sequence,
                cid,
                fragment: buf[start..start + length].to_vec(),
            },
            start + length,
        ))
    }

    /// Splits a datagram into records.
    ///
    /// # Errors
    /// Returns the first framing error.
    pub fn parse_datagram(buf: &[u8], cid_len: usize) -> Result<Vec<Self>, DtlsError> {
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (record, consumed) = Self::parse(&buf[offset..], cid_len)?;
            records.push(record);
            offset += consumed;
        }
        Ok(records)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.content_type);
        buf.extend_from_slice(&self.version);
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes()[2..]);
        if let Some(cid) = &self.cid {
            buf.extend_from_slice(cid);
        }
        buf.extend_from_slice(&(self.fragment.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.fragment);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + self.fragment.len() + 8);
        self.write_to(&mut buf);
        buf
    }
}

/// True when the datagram starts with an epoch-0 handshake record carrying a
/// ClientHello, i.e. a peer starting a new handshake.
#[must_use]
pub fn is_client_hello(datagram: &[u8]) -> bool {
    datagram.len() > RECORD_HEADER_SIZE
        && datagram[0] == content_type::HANDSHAKE
        && datagram[3] == 0
        && datagram[4] == 0
        && datagram[RECORD_HEADER_SIZE] == super::handshake::msg_type::CLIENT_HELLO
}
