//! DTLS 1.2 handshake messages and their encodings.
//!
//! # Handshake Header (RFC 6347 Section 4.2.2)
//!
//! ```text
//! +----------+----------+-------------+-----------------+-----------------+
//! | msg_type | length   | message_seq | fragment_offset | fragment_length |
//! | 1 byte   | 3 bytes  | 2 bytes     | 3 bytes         | 3 bytes         |
//! +----------+----------+-------------+-----------------+-----------------+
//! ```

use super::{record::DTLS_1_2, DtlsError};

/// Handshake header size.
pub const HANDSHAKE_HEADER_SIZE: usize = 12;

/// Size of client and server randoms.
pub const RANDOM_SIZE: usize = 32;

pub mod msg_type {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const HELLO_VERIFY_REQUEST: u8 = 3;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const CERTIFICATE_REQUEST: u8 = 13;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CERTIFICATE_VERIFY: u8 = 15;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
}

pub mod extension_type {
    pub const SUPPORTED_GROUPS: u16 = 10;
    pub const EC_POINT_FORMATS: u16 = 11;
    pub const SIGNATURE_ALGORITHMS: u16 = 13;
    pub const CLIENT_CERTIFICATE_TYPE: u16 = 19;
    pub const SERVER_CERTIFICATE_TYPE: u16 = 20;
    pub const CONNECTION_ID: u16 = 54;
    pub const RENEGOTIATION_INFO: u16 = 0xFF01;
}

/// `TLS_PSK_WITH_AES_128_CCM_8` (RFC 6655).
pub const TLS_PSK_WITH_AES_128_CCM_8: u16 = 0xC0A8;
/// `TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8` (RFC 7251).
pub const TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8: u16 = 0xC0AE;
/// Signalling cipher suite value for secure renegotiation.
pub const TLS_EMPTY_RENEGOTIATION_INFO_SCSV: u16 = 0x00FF;

/// secp256r1 named group.
pub const NAMED_GROUP_SECP256R1: u16 = 23;
/// `ecdsa_secp256r1_sha256` signature scheme.
pub const SIGNATURE_ECDSA_SHA256: u16 = 0x0403;
/// Certificate types (RFC 7250).
pub const CERT_TYPE_X509: u8 = 0;
pub const CERT_TYPE_RAW_PUBLIC_KEY: u8 = 2;

/// A handshake fragment as carried in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFragment {
    pub msg_type: u8,
    pub length: usize,
    pub message_seq: u16,
    pub fragment_offset: usize,
    pub body: Vec<u8>,
}

impl HandshakeFragment {
    /// Parses all fragments in a handshake record payload.
    ///
    /// # Errors
    /// Returns `DtlsError::MalformedHandshake` on truncated headers or bodies.
    pub fn parse_all(buf: &[u8]) -> Result<Vec<Self>, DtlsError> {
        let mut fragments = Vec::new();
        let mut r = Reader::new(buf);
        while !r.is_empty() {
            let msg_type = r.u8()?;
            let length = r.u24()?;
            let message_seq = r.u16()?;
            let fragment_offset = r.u24()?;
            let fragment_length = r.u24()?;
            if fragment_offset + fragment_length > length {
                return Err(DtlsError::MalformedHandshake(format!(
                    "fragment {fragment_offset}+{fragment_length} exceeds message length {length}"
                )));
            }
            let body = r.bytes(fragment_length)?.to_vec();
            fragments.push(Self {
                msg_type,
                length,
                message_seq,
                fragment_offset,
                body,
            });
        }
        Ok(fragments)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fragment_offset == 0 && self.body.len() == self.length
    }
}

/// Encodes a complete (unfragmented) handshake message with its header.
///
/// The same bytes feed the transcript hash.
#[must_use]
pub fn encode_message(msg_type: u8, message_seq: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HANDSHAKE_HEADER_SIZE + body.len());
    buf.push(msg_type);
    put_u24(&mut buf, body.len());
    buf.extend_from_slice(&message_seq.to_be_bytes());
    put_u24(&mut buf, 0);
    put_u24(&mut buf, body.len());
    buf.extend_from_slice(body);
    buf
}

/// Splits a complete handshake message into fragments whose bodies are at
/// most `max_body` bytes. Messages that fit are returned unchanged.
#[must_use]
pub fn fragment_message(message: &[u8], max_body: usize) -> Vec<Vec<u8>> {
    if message.len() <= HANDSHAKE_HEADER_SIZE + max_body || max_body == 0 {
        return vec![message.to_vec()];
    }
    let (header, body) = message.split_at(HANDSHAKE_HEADER_SIZE);
    body.chunks(max_body)
        .enumerate()
        .map(|(idx, chunk)| {
            // msg_type, length and message_seq are shared by all fragments
            let mut fragment = header[..6].to_vec();
            put_u24(&mut fragment, idx * max_body);
            put_u24(&mut fragment, chunk.len());
            fragment.extend_from_slice(chunk);
            fragment
        })
        .collect()
}

/// Hello extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub ext_type: u16,
    pub data: Vec<u8>,
}

impl Extension {
    #[must_use]
    pub fn new(ext_type: u16, data: Vec<u8>) -> Self {
        Self { ext_type, data }
    }

    /// RFC 9146 `connection_id` extension: `opaque cid<0..2^8-1>`.
    #[must_use]
    pub fn connection_id(cid: &[u8]) -> Self {
        let mut data = vec![cid.len() as u8];
        data.extend_from_slice(cid);
        Self::new(extension_type::CONNECTION_ID, data)
    }

    /// # Errors
    /// Returns `DtlsError::MalformedHandshake` if the data is not a CID vector.
    pub fn parse_connection_id(&self) -> Result<Vec<u8>, DtlsError> {
        let mut r = Reader::new(&self.data);
        let len = usize::from(r.u8()?);
        Ok(r.bytes(len)?.to_vec())
    }

    /// Client-side certificate type list or server-side single selection.
    #[must_use]
    pub fn certificate_types(&self) -> Vec<u8> {
        match self.data.split_first() {
            Some((&len, rest)) if usize::from(len) == rest.len() => rest.to_vec(),
            _ => self.data.clone(),
        }
    }
}

fn write_extensions(extensions: &[Extension], buf: &mut Vec<u8>) {
    if extensions.is_empty() {
        return;
    }
    let mut block = Vec::new();
    for ext in extensions {
        block.extend_from_slice(&ext.ext_type.to_be_bytes());
        block.extend_from_slice(&(ext.data.len() as u16).to_be_bytes());
        block.extend_from_slice(&ext.data);
    }
    buf.extend_from_slice(&(block.len() as u16).to_be_bytes());
    buf.extend_from_slice(&block);
}

fn read_extensions(r: &mut Reader<'_>) -> Result<Vec<Extension>, DtlsError> {
    if r.is_empty() {
        return Ok(Vec::new());
    }
    let block = r.vec16()?;
    let mut inner = Reader::new(block);
    let mut extensions = Vec::new();
    while !inner.is_empty() {
        let ext_type = inner.u16()?;
        let data = inner.vec16()?.to_vec();
        extensions.push(Extension { ext_type, data });
    }
    Ok(extensions)
}

/// Finds an extension by type.
#[must_use]
pub fn find_extension(extensions: &[Extension], ext_type: u16) -> Option<&Extension> {
    extensions.iter().find(|e| e.ext_type == ext_type)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: [u8; 2],
    pub random: [u8; RANDOM_SIZE],
    pub session_id: Vec<u8>,
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    /// # Errors
    /// Returns `DtlsError::MalformedHandshake` on truncated or malformed bodies.
    pub fn parse(body: &[u8]) -> Result<Self, DtlsError> {
        let mut r = Reader::new(body);
        let version = r.array2()?;
        let random = r.random()?;
        let session_id = r.vec8()?.to_vec();
        let cookie = r.vec8()?.to_vec();
        let suites = r.vec16()?;
        if suites.len() % 2 != 0 {
            return Err(DtlsError::MalformedHandshake("odd cipher suite list".into()));
        }
        let cipher_suites = suites
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        let compression_methods = r.vec8()?.to_vec();
        let extensions = read_extensions(&mut r)?;
        Ok(Self {
            version,
            random,
            session_id,
            cookie,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version);
        buf.extend_from_slice(&self.random);
        put_vec8(&mut buf, &self.session_id);
        put_vec8(&mut buf, &self.cookie);
        let suites: Vec<u8> = self
            .cipher_suites
            .iter()
            .flat_map(|s| s.to_be_bytes())
            .collect();
        put_vec16(&mut buf, &suites);
        put_vec8(&mut buf, &self.compression_methods);
        write_extensions(&self.extensions, &mut buf);
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_SIZE],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    /// # Errors
    /// Returns `DtlsError::MalformedHandshake` on truncated bodies.
    pub fn parse(body: &[u8]) -> Result<Self, DtlsError> {
        let mut r = Reader::new(body);
        let _version = r.array2()?;
        let random = r.random()?;
        let session_id = r.vec8()?.to_vec();
        let cipher_suite = r.u16()?;
        let _compression = r.u8()?;
        let extensions = read_extensions(&mut r)?;
        Ok(Self {
            random,
            session_id,
            cipher_suite,
            extensions,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DTLS_1_2);
        buf.extend_from_slice(&self.random);
        put_vec8(&mut buf, &self.session_id);
        buf.extend_from_slice(&self.cipher_suite.to_be_bytes());
        buf.push(0);
        write_extensions(&self.extensions, &mut buf);
        buf
    }
}

/// `HelloVerifyRequest` body: server version and cookie.
#[must_use]
pub fn encode_hello_verify_request(cookie: &[u8]) -> Vec<u8> {
    let mut buf = DTLS_1_2.to_vec();
    put_vec8(&mut buf, cookie);
    buf
}

/// # Errors
/// Returns `DtlsError::MalformedHandshake` on truncated bodies.
pub fn parse_hello_verify_request(body: &[u8]) -> Result<Vec<u8>, DtlsError> {
    let mut r = Reader::new(body);
    let _version = r.array2()?;
    Ok(r.vec8()?.to_vec())
}

/// Certificate message for X.509 chains or a single raw public key.
#[must_use]
pub fn encode_certificate(entries: &[Vec<u8>], raw_public_key: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    if raw_public_key {
        let spki = entries.first().map(Vec::as_slice).unwrap_or_default();
        put_u24(&mut buf, spki.len());
        buf.extend_from_slice(spki);
        return buf;
    }
    let total: usize = entries.iter().map(|c| c.len() + 3).sum();
    put_u24(&mut buf, total);
    for cert in entries {
        put_u24(&mut buf, cert.len());
        buf.extend_from_slice(cert);
    }
    buf
}

/// # Errors
/// Returns `DtlsError::MalformedHandshake` on inconsistent lengths.
pub fn parse_certificate(body: &[u8], raw_public_key: bool) -> Result<Vec<Vec<u8>>, DtlsError> {
    let mut r = Reader::new(body);
    let total = r.u24()?;
    let list = r.bytes(total)?;
    if raw_public_key {
        return Ok(if list.is_empty() { vec![] } else { vec![list.to_vec()] });
    }
    let mut inner = Reader::new(list);
    let mut certs = Vec::new();
    while !inner.is_empty() {
        let len = inner.u24()?;
        certs.push(inner.bytes(len)?.to_vec());
    }
    Ok(certs)
}

/// ECDHE ServerKeyExchange parameters: named curve secp256r1 and the point.
#[must_use]
pub fn encode_ecdh_params(public_point: &[u8]) -> Vec<u8> {
    let mut buf = vec![3];
    buf.extend_from_slice(&NAMED_GROUP_SECP256R1.to_be_bytes());
    put_vec8(&mut buf, public_point);
    buf
}

/// Parsed ECDHE ServerKeyExchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdheServerKeyExchange {
    pub params: Vec<u8>,
    pub public_point: Vec<u8>,
    pub signature_scheme: u16,
    pub signature: Vec<u8>,
}

impl EcdheServerKeyExchange {
    /// # Errors
    /// Returns `DtlsError::MalformedHandshake` for other curve types or truncation.
    pub fn parse(body: &[u8]) -> Result<Self, DtlsError> {
        let mut r = Reader::new(body);
        let curve_type = r.u8()?;
        let group = r.u16()?;
        if curve_type != 3 || group != NAMED_GROUP_SECP256R1 {
            return Err(DtlsError::MalformedHandshake(format!(
                "unsupported curve {curve_type}/{group}"
            )));
        }
        let public_point = r.vec8()?.to_vec();
        let params_len = 3 + 1 + public_point.len();
        let signature_scheme = r.u16()?;
        let signature = r.vec16()?.to_vec();
        Ok(Self {
            params: body[..params_len].to_vec(),
            public_point,
            signature_scheme,
            signature,
        })
    }

    #[must_use]
    pub fn encode(params: &[u8], signature: &[u8]) -> Vec<u8> {
        let mut buf = params.to_vec();
        buf.extend_from_slice(&SIGNATURE_ECDSA_SHA256.to_be_bytes());
        put_vec16(&mut buf, signature);
        buf
    }
}

/// CertificateRequest asking for an ECDSA P-256 certificate.
#[must_use]
pub fn encode_certificate_request() -> Vec<u8> {
    let mut buf = vec![1, 64]; // ecdsa_sign
    put_vec16(&mut buf, &SIGNATURE_ECDSA_SHA256.to_be_bytes());
    put_vec16(&mut buf, &[]);
    buf
}

/// `DigitallySigned` body of CertificateVerify.
#[must_use]
pub fn encode_certificate_verify(signature: &[u8]) -> Vec<u8> {
    let mut buf = SIGNATURE_ECDSA_SHA256.to_be_bytes().to_vec();
    put_vec16(&mut buf, signature);
    buf
}

/// # Errors
/// Returns `DtlsError::MalformedHandshake` on truncation.
pub fn parse_certificate_verify(body: &[u8]) -> Result<(u16, Vec<u8>), DtlsError> {
    let mut r = Reader::new(body);
    let scheme = r.u16()?;
    Ok((scheme, r.vec16()?.to_vec()))
}

/// PSK ClientKeyExchange: `opaque psk_identity<0..2^16-1>`.
#[must_use]
pub fn encode_psk_client_key_exchange(identity: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_vec16(&mut buf, identity);
    buf
}

/// # Errors
/// Returns `DtlsError::MalformedHandshake` on truncation.
pub fn parse_psk_client_key_exchange(body: &[u8]) -> Result<Vec<u8>, DtlsError> {
    Ok(Reader::new(body).vec16()?.to_vec())
}

/// ECDHE ClientKeyExchange: `opaque point<1..2^8-1>`.
#[must_use]
pub fn encode_ecdh_client_key_exchange(point: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_vec8(&mut buf, point);
    buf
}

/// # Errors
/// Returns `DtlsError::MalformedHandshake` on truncation.
pub fn parse_ecdh_client_key_exchange(body: &[u8]) -> Result<Vec<u8>, DtlsError> {
    Ok(Reader::new(body).vec8()?.to_vec())
}

fn put_u24(buf: &mut Vec<u8>, value: usize) {
    buf.extend_from_slice(&(value as u32).to_be_bytes()[1..]);
}

fn put_vec8(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
}

fn put_vec16(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Bounds-checked big-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DtlsError> {
        if self.buf.len() - self.pos < len {
            return Err(DtlsError::MalformedHandshake(format!(
                "need {len} bytes at offset {}, {} left",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DtlsError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DtlsError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, DtlsError> {
        let b = self.bytes(3)?;
        Ok((usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn array2(&mut self) -> Result<[u8; 2], DtlsError> {
        let b = self.bytes(2)?;
        Ok([b[0], b[1]])
    }

    fn random(&mut self) -> Result<[u8; RANDOM_SIZE], DtlsError> {
        let mut random = [0u8; RANDOM_SIZE];
        random.copy_from_slice(self.bytes(RANDOM_SIZE)?);
        Ok(random)
    }

    fn vec8(&mut self) -> Result<&'a [u8], DtlsError> {
        let len = usize::from(self.u8()?);
        self.bytes(len)
    }

    fn vec16(&mut self) -> Result<&'a [u8], DtlsError> {
        let len = usize::from(self.u16()?);
        self.bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_hello() -> ClientHello {
        ClientHello {
            version: DTLS_1_2,
            random: [7; RANDOM_SIZE],
            session_id: vec![],
            cookie: vec![1, 2, 3],
            cipher_suites: vec![TLS_PSK_WITH_AES_128_CCM_8, TLS_EMPTY_RENEGOTIATION_INFO_SCSV],
            compression_methods: vec![0],
            extensions: vec![Extension::connection_id(&[])],
        }
    }

    #[test]
    fn test_client_hello_parse() {
        let hello = sample_client_hello();
        let parsed = ClientHello::parse(&hello.encode()).unwrap();
        assert_eq!(parsed, hello);
        let cid = find_extension(&parsed.extensions, extension_type::CONNECTION_ID).unwrap();
        assert_eq!(cid.parse_connection_id().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_message_header_and_fragments() {
        let body = sample_client_hello().encode();
        let msg = encode_message(msg_type::CLIENT_HELLO, 1, &body);
        assert_eq!(msg[0], msg_type::CLIENT_HELLO);
        assert_eq!(&msg[4..6], &[0, 1]);

        let mut two = msg.clone();
        two.extend(encode_message(msg_type::FINISHED, 2, &[0; 12]));
        let fragments = HandshakeFragment::parse_all(&two).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].is_complete());
        assert_eq!(fragments[1].message_seq, 2);
        assert_eq!(fragments[1].body.len(), 12);
    }

    #[test]
    fn test_fragment_message() {
        let msg = encode_message(msg_type::CERTIFICATE, 3, &[0xAB; 250]);
        assert_eq!(fragment_message(&msg, 300), vec![msg.clone()]);

        let fragments = fragment_message(&msg, 100);
        assert_eq!(fragments.len(), 3);
        let parsed: Vec<_> = fragments
            .iter()
            .flat_map(|f| HandshakeFragment::parse_all(f).unwrap())
            .collect();
        assert_eq!(parsed[0].fragment_offset, 0);
        assert_eq!(parsed[1].fragment_offset, 100);
        assert_eq!(parsed[2].body.len(), 50);
        assert!(parsed.iter().all(|f| f.length == 250 && f.message_seq == 3));
    }

    #[test]
    fn test_fragment_bounds_checked() {
        // length 4, offset 2, fragment length 4
        let bad = [1, 0, 0, 4, 0, 0, 0, 0, 2, 0, 0, 4, 1, 2, 3, 4];
        assert!(HandshakeFragment::parse_all(&bad).is_err());
    }

    #[test]
    fn test_server_key_exchange() {
        let point = [4u8; 65];
        let params = encode_ecdh_params(&point);
        let body = EcdheServerKeyExchange::encode(&params, &[9; 70]);
        let parsed = EcdheServerKeyExchange::parse(&body).unwrap();
        assert_eq!(parsed.params, params);
        assert_eq!(parsed.public_point, point.to_vec());
        assert_eq!(parsed.signature_scheme, SIGNATURE_ECDSA_SHA256);
        assert_eq!(parsed.signature.len(), 70);
    }

    #[test]
    fn test_certificate_encodings() {
        let chain = vec![vec![1; 10], vec![2; 20]];
        assert_eq!(
            parse_certificate(&encode_certificate(&chain, false), false).unwrap(),
            chain
        );
        let spki = vec![vec![3; 91]];
        let rpk = encode_certificate(&spki, true);
        assert_eq!(rpk.len(), 3 + 91);
        assert_eq!(parse_certificate(&rpk, true).unwrap(), spki);
    }

    #[test]
    fn test_hello_verify_request() {
        let body = encode_hello_verify_request(&[5; 16]);
        assert_eq!(parse_hello_verify_request(&body).unwrap(), vec![5; 16]);
    }
}
