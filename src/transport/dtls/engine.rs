//! DTLS 1.2 handshake and record state machine.
//!
//! Full handshake (server view):
//!
//! ```text
//! ClientHello            -->
//!                        <--  HelloVerifyRequest
//! ClientHello + cookie   -->
//!                             ServerHello
//!                            [Certificate, ServerKeyExchange,
//!                             CertificateRequest]
//!                        <--  ServerHelloDone
//! [Certificate]
//! ClientKeyExchange
//! [CertificateVerify]
//! ChangeCipherSpec
//! Finished               -->
//!                             ChangeCipherSpec
//!                        <--  Finished
//! ```
//!
//! An abbreviated handshake replaces everything after the cookie exchange
//! with `ServerHello, ChangeCipherSpec, Finished` from the server and
//! `ChangeCipherSpec, Finished` from the client.

use std::{collections::BTreeMap, fmt};

use log::{debug, info, warn};
use p256::{
    ecdh,
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};

use super::{
    alert,
    cipher::{self, RecordProtection, PROTECTION_OVERHEAD},
    handshake::{
        self, encode_message, extension_type, find_extension, msg_type, ClientHello,
        EcdheServerKeyExchange, Extension, HandshakeFragment, ServerHello, HANDSHAKE_HEADER_SIZE,
        RANDOM_SIZE,
    },
    record::{content_type, Record, DTLS_1_2, RECORD_HEADER_SIZE},
    CachedSession, DtlsConfig, DtlsCredentials, DtlsError, Role, CONNECTION_ID_LENGTH,
    P256_SPKI_PREFIX,
};
use crate::crypto::{constant_time_compare, hmac_sha256};

/// Largest handshake message accepted for reassembly.
const MAX_HANDSHAKE_MESSAGE: usize = 64 * 1024;

const COOKIE_LENGTH: usize = 16;

/// Output of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtlsEvent {
    /// Datagram to send to the peer.
    Transmit(Vec<u8>),
    /// Decrypted application data.
    ApplicationData(Vec<u8>),
    /// Handshake completed.
    Connected,
    /// Peer closed the session.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitClientHello,
    AwaitClientFlight,
    AwaitClientFinished,
    AwaitServerHello,
    AwaitServerFlight,
    AwaitServerFinished,
    Established,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One message of the last flight sent, kept for retransmission.
#[derive(Debug, Clone)]
struct FlightEntry {
    content: u8,
    epoch: u16,
    plaintext: Vec<u8>,
}

struct Reassembly {
    msg_type: u8,
    data: Vec<u8>,
    received: Vec<bool>,
}

impl Reassembly {
    fn new(msg_type: u8, length: usize) -> Self {
        Self {
            msg_type,
            data: vec![0; length],
            received: vec![false; length],
        }
    }

    fn insert(&mut self, offset: usize, body: &[u8]) {
        self.data[offset..offset + body.len()].copy_from_slice(body);
        self.received[offset..offset + body.len()].fill(true);
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }
}

/// Sans-IO DTLS 1.2 endpoint.
pub struct DtlsEngine {
    role: Role,
    config: DtlsConfig,
    state: State,
    cookie_secret: [u8; 32],
    cookie: Vec<u8>,
    client_random: [u8; RANDOM_SIZE],
    server_random: [u8; RANDOM_SIZE],
    session_id: Vec<u8>,
    cipher_suite: u16,
    resumed: bool,
    transcript: Vec<u8>,
    master_secret: Vec<u8>,
    protection: Option<RecordProtection>,
    read_epoch: u16,
    write_epoch: u16,
    write_seq: [u64; 2],
    next_send_seq: u16,
    next_receive_seq: u16,
    reassembly: BTreeMap<u16, Reassembly>,
    last_flight: Vec<FlightEntry>,
    own_cid: Vec<u8>,
    peer_cid: Vec<u8>,
    ephemeral: Option<SecretKey>,
    peer_public_point: Vec<u8>,
    server_rpk: bool,
    client_rpk: bool,
    certificate_requested: bool,
    peer_certificates: Vec<Vec<u8>>,
    psk_identity: Vec<u8>,
}

impl DtlsEngine {
    #[must_use]
    pub fn new(role: Role, config: DtlsConfig) -> Self {
        Self::with_cookie_secret(role, config, rand::random())
    }

    fn with_cookie_secret(role: Role, config: DtlsConfig, cookie_secret: [u8; 32]) -> Self {
        let state = match role {
            Role::Client => State::AwaitServerHello,
            Role::Server => State::AwaitClientHello,
        };
        Self {
            role,
            config,
            state,
            cookie_secret,
            cookie: Vec::new(),
            client_random: rand::random(),
            server_random: rand::random(),
            session_id: Vec::new(),
            cipher_suite: 0,
            resumed: false,
            transcript: Vec::new(),
            master_secret: Vec::new(),
            protection: None,
            read_epoch: 0,
            write_epoch: 0,
            write_seq: [0; 2],
            next_send_seq: 0,
            next_receive_seq: 0,
            reassembly: BTreeMap::new(),
            last_flight: Vec::new(),
            own_cid: Vec::new(),
            peer_cid: Vec::new(),
            ephemeral: None,
            peer_public_point: Vec::new(),
            server_rpk: false,
            client_rpk: false,
            certificate_requested: false,
            peer_certificates: Vec::new(),
            psk_identity: Vec::new(),
        }
    }

    #[must_use]
    pub fn server(config: DtlsConfig) -> Self {
        Self::new(Role::Server, config)
    }

    #[must_use]
    pub fn client(config: DtlsConfig) -> Self {
        Self::new(Role::Client, config)
    }

    /// A fresh engine with the same configuration and cookie secret, used when
    /// the peer starts over with a new ClientHello.
    #[must_use]
    pub fn restarted(&self) -> Self {
        Self::with_cookie_secret(self.role, self.config.clone(), self.cookie_secret)
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        !self.is_established() && !self.is_closed()
    }

    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    #[must_use]
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    #[must_use]
    pub fn cipher_suite(&self) -> u16 {
        self.cipher_suite
    }

    /// Connection ID the peer puts into records sent to us.
    #[must_use]
    pub fn own_cid(&self) -> &[u8] {
        &self.own_cid
    }

    /// Connection ID this endpoint puts into records it sends.
    #[must_use]
    pub fn peer_cid(&self) -> &[u8] {
        &self.peer_cid
    }

    #[must_use]
    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.peer_certificates
    }

    /// PSK identity presented by the client (server role).
    #[must_use]
    pub fn psk_identity(&self) -> &[u8] {
        &self.psk_identity
    }

    /// Resumable session state once established.
    #[must_use]
    pub fn session(&self) -> Option<CachedSession> {
        (self.is_established() && !self.session_id.is_empty()).then(|| CachedSession {
            session_id: self.session_id.clone(),
            master_secret: self.master_secret.clone(),
            cipher_suite: self.cipher_suite,
        })
    }

    /// Client role: produces the initial ClientHello.
    ///
    /// # Errors
    /// Returns `DtlsError::HandshakeFailed` for a server engine.
    pub fn start(&mut self) -> Result<Vec<Vec<u8>>, DtlsError> {
        if self.role != Role::Client || self.state != State::AwaitServerHello {
            return Err(DtlsError::HandshakeFailed(
                "only a fresh client engine can start a handshake".into(),
            ));
        }
        let hello = self.build_client_hello().encode();
        let entry = self.handshake_entry(msg_type::CLIENT_HELLO, &hello, 0);
        self.set_flight(vec![entry]);
        self.flight_datagrams()
    }

    /// Re-sends the last flight; driven by the caller's retransmission timer.
    ///
    /// # Errors
    /// Propagates sealing errors.
    pub fn retransmit_flight(&mut self) -> Result<Vec<Vec<u8>>, DtlsError> {
        if self.last_flight.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Retransmitting DTLS flight of {} messages", self.last_flight.len());
        self.flight_datagrams()
    }

    /// Protects application data for sending.
    ///
    /// # Errors
    /// Returns `DtlsError::NotEstablished` before the handshake completes.
    pub fn seal_application_data(&mut self, data: &[u8]) -> Result<Vec<u8>, DtlsError> {
        if !self.is_established() {
            return Err(DtlsError::NotEstablished);
        }
        self.seal_record(content_type::APPLICATION_DATA, 1, data)
    }

    /// Sends `close_notify` and closes the engine.
    ///
    /// # Errors
    /// Propagates sealing errors.
    pub fn close_notify(&mut self) -> Result<Vec<u8>, DtlsError> {
        let datagram = self.seal_record(
            content_type::ALERT,
            self.write_epoch,
            &[alert::LEVEL_WARNING, alert::CLOSE_NOTIFY],
        )?;
        self.state = State::Closed;
        Ok(datagram)
    }

    /// Fatal alert matching `error`, if the error warrants one.
    pub fn fatal_alert(&mut self, error: &DtlsError) -> Option<Vec<u8>> {
        let description = error.alert_description()?;
        self.state = State::Closed;
        self.seal_record(
            content_type::ALERT,
            self.write_epoch,
            &[alert::LEVEL_FATAL, description],
        )
        .ok()
    }

    /// Processes one received datagram.
    ///
    /// # Errors
    /// Returns handshake failures and fatal peer alerts. Records that fail
    /// authentication are dropped silently.
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> Result<Vec<DtlsEvent>, DtlsError> {
        let records = Record::parse_datagram(datagram, self.own_cid.len())?;
        let mut events = Vec::new();
        let mut retransmit = false;
        for record in records {
            self.handle_record(record, &mut events, &mut retransmit)?;
        }
        if retransmit && !self.last_flight.is_empty() {
            debug!("Peer retransmitted, resending last flight");
            events.extend(self.flight_datagrams()?.into_iter().map(DtlsEvent::Transmit));
        }
        Ok(events)
    }

    fn handle_record(
        &mut self,
        record: Record,
        events: &mut Vec<DtlsEvent>,
        retransmit: &mut bool,
    ) -> Result<(), DtlsError> {
        let (content, plaintext) = if record.epoch == 0 {
            if record.cid.is_some() {
                debug!("Dropping epoch 0 record with connection ID");
                return Ok(());
            }
            (record.content_type, record.fragment)
        } else {
            let Some(protection) = self.protection.as_ref().filter(|_| record.epoch == self.read_epoch)
            else {
                debug!(
                    "Dropping record for epoch {} (read epoch {})",
                    record.epoch, self.read_epoch
                );
                return Ok(());
            };
            if let Some(cid) = &record.cid {
                if *cid != self.own_cid {
                    debug!("Dropping record for unknown connection ID {}", hex::encode(cid));
                    return Ok(());
                }
            }
            match protection.open(&record) {
                Ok(opened) => opened,
                Err(DtlsError::DecryptFailed) => {
                    debug!("Dropping record {} that failed authentication", record.sequence);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        match content {
            content_type::HANDSHAKE => {
                for fragment in HandshakeFragment::parse_all(&plaintext)? {
                    self.handle_fragment(fragment, record.sequence, events, retransmit)?;
                }
            }
            content_type::CHANGE_CIPHER_SPEC => {
                if plaintext != [1] {
                    return Err(DtlsError::MalformedRecord("invalid ChangeCipherSpec".into()));
                }
                if self.protection.is_none() {
                    debug!("ChangeCipherSpec before key exchange, ignoring");
                } else {
                    self.read_epoch = 1;
                }
            }
            content_type::ALERT => {
                if plaintext.len() < 2 {
                    return Err(DtlsError::MalformedRecord("short alert".into()));
                }
                let (level, description) = (plaintext[0], plaintext[1]);
                if description == alert::CLOSE_NOTIFY {
                    info!("Peer sent close_notify");
                    self.state = State::Closed;
                    events.push(DtlsEvent::Closed);
                } else if level == alert::LEVEL_FATAL {
                    warn!("Peer sent fatal alert {description}");
                    self.state = State::Closed;
                    events.push(DtlsEvent::Closed);
                    return Err(DtlsError::PeerAlert { level, description });
                } else {
                    debug!("Ignoring warning alert {description}");
                }
            }
            content_type::APPLICATION_DATA => {
                if self.is_established() && record.epoch > 0 {
                    events.push(DtlsEvent::ApplicationData(plaintext));
                } else {
                    debug!("Dropping application data in state {}", self.state);
                }
            }
            other => debug!("Ignoring record of content type {other}"),
        }
        Ok(())
    }

    fn handle_fragment(
        &mut self,
        fragment: HandshakeFragment,
        record_seq: u64,
        events: &mut Vec<DtlsEvent>,
        retransmit: &mut bool,
    ) -> Result<(), DtlsError> {
        if self.role == Role::Server && fragment.msg_type == msg_type::CLIENT_HELLO {
            if !fragment.is_complete() {
                debug!("Ignoring fragmented ClientHello");
                return Ok(());
            }
            if self.state != State::AwaitClientHello {
                let hello = ClientHello::parse(&fragment.body)?;
                if hello.random == self.client_random {
                    *retransmit = true;
                    return Ok(());
                }
                info!("Peer started a new handshake");
                *self = self.restarted();
            }
            return self.on_client_hello(fragment.message_seq, record_seq, &fragment.body, events);
        }

        if fragment.message_seq < self.next_receive_seq {
            *retransmit = true;
            return Ok(());
        }
        if fragment.length > MAX_HANDSHAKE_MESSAGE {
            return Err(DtlsError::MalformedHandshake(format!(
                "message of {} bytes",
                fragment.length
            )));
        }

        let entry = self
            .reassembly
            .entry(fragment.message_seq)
            .or_insert_with(|| Reassembly::new(fragment.msg_type, fragment.length));
        if entry.msg_type != fragment.msg_type || entry.data.len() != fragment.length {
            return Err(DtlsError::MalformedHandshake(format!(
                "inconsistent fragments for message_seq {}",
                fragment.message_seq
            )));
        }
        entry.insert(fragment.fragment_offset, &fragment.body);

        loop {
            let seq = self.next_receive_seq;
            if !self.reassembly.get(&seq).is_some_and(Reassembly::is_complete) {
                break;
            }
            let Some(done) = self.reassembly.remove(&seq) else {
                break;
            };
            self.next_receive_seq = seq.wrapping_add(1);
            self.handle_message(done.msg_type, seq, &done.data, events)?;
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        msg: u8,
        seq: u16,
        body: &[u8],
        events: &mut Vec<DtlsEvent>,
    ) -> Result<(), DtlsError> {
        debug!("DTLS {:?} received handshake message {msg} seq {seq}", self.role);
        let raw = encode_message(msg, seq, body);

        match (self.state, msg) {
            (State::AwaitClientFlight, msg_type::CERTIFICATE) if self.certificate_requested => {
                self.peer_certificates = handshake::parse_certificate(body, self.client_rpk)?;
                self.transcript.extend_from_slice(&raw);
            }
            (State::AwaitClientFlight, msg_type::CLIENT_KEY_EXCHANGE) => {
                let premaster = self.server_premaster(body)?;
                self.transcript.extend_from_slice(&raw);
                self.derive_keys(&premaster);
            }
            (State::AwaitClientFlight, msg_type::CERTIFICATE_VERIFY) if self.protection.is_some() => {
                let (scheme, _signature) = handshake::parse_certificate_verify(body)?;
                debug!("Client CertificateVerify with scheme {scheme:#06x} accepted unverified");
                self.transcript.extend_from_slice(&raw);
            }
            (State::AwaitClientFlight | State::AwaitClientFinished, msg_type::FINISHED) => {
                self.check_finished(Role::Client, body)?;
                self.transcript.extend_from_slice(&raw);
                if self.state == State::AwaitClientFlight {
                    let finished = self.finished_entry();
                    let ccs = self.ccs_entry();
                    self.set_flight(vec![ccs, finished]);
                    events.extend(self.flight_datagrams()?.into_iter().map(DtlsEvent::Transmit));
                    if let Some(session) = self.session_for_cache() {
                        self.config.session_cache.store(session);
                    }
                }
                self.establish(events);
            }
            (State::AwaitServerHello, msg_type::HELLO_VERIFY_REQUEST) => {
                self.cookie = handshake::parse_hello_verify_request(body)?;
                self.transcript.clear();
                let hello = self.build_client_hello().encode();
                let entry = self.handshake_entry(msg_type::CLIENT_HELLO, &hello, 0);
                self.set_flight(vec![entry]);
                events.extend(self.flight_datagrams()?.into_iter().map(DtlsEvent::Transmit));
            }
            (State::AwaitServerHello, msg_type::SERVER_HELLO) => {
                self.transcript.extend_from_slice(&raw);
                self.on_server_hello(body)?;
            }
            (State::AwaitServerFlight, msg_type::CERTIFICATE) => {
                self.peer_certificates = handshake::parse_certificate(body, self.server_rpk)?;
                self.transcript.extend_from_slice(&raw);
            }
            (State::AwaitServerFlight, msg_type::SERVER_KEY_EXCHANGE) => {
                self.on_server_key_exchange(body)?;
                self.transcript.extend_from_slice(&raw);
            }
            (State::AwaitServerFlight, msg_type::CERTIFICATE_REQUEST) => {
                self.certificate_requested = true;
                self.transcript.extend_from_slice(&raw);
            }
            (State::AwaitServerFlight, msg_type::SERVER_HELLO_DONE) => {
                self.transcript.extend_from_slice(&raw);
                self.send_client_flight(events)?;
            }
            (State::AwaitServerFinished, msg_type::FINISHED) => {
                self.check_finished(Role::Server, body)?;
                self.transcript.extend_from_slice(&raw);
                if self.resumed {
                    let ccs = self.ccs_entry();
                    let finished = self.finished_entry();
                    self.set_flight(vec![ccs, finished]);
                    events.extend(self.flight_datagrams()?.into_iter().map(DtlsEvent::Transmit));
                }
                self.establish(events);
            }
            (state, msg) => {
                return Err(DtlsError::UnexpectedMessage {
                    msg_type: msg,
                    state: state.to_string(),
                })
            }
        }
        Ok(())
    }

    fn establish(&mut self, events: &mut Vec<DtlsEvent>) {
        info!(
            "DTLS {:?} session established (suite {:#06x}, resumed={}, cid={})",
            self.role,
            self.cipher_suite,
            self.resumed,
            hex::encode(&self.own_cid)
        );
        self.state = State::Established;
        events.push(DtlsEvent::Connected);
    }

    fn session_for_cache(&self) -> Option<CachedSession> {
        (!self.session_id.is_empty()).then(|| CachedSession {
            session_id: self.session_id.clone(),
            master_secret: self.master_secret.clone(),
            cipher_suite: self.cipher_suite,
        })
    }

    fn cookie_for(&self, hello: &ClientHello) -> Vec<u8> {
        let suites: Vec<u8> = hello
            .cipher_suites
            .iter()
            .flat_map(|s| s.to_be_bytes())
            .collect();
        hmac_sha256(
            &self.cookie_secret,
            &[&hello.random, &hello.session_id, &suites],
        )[..COOKIE_LENGTH]
            .to_vec()
    }

    fn on_client_hello(
        &mut self,
        message_seq: u16,
        record_seq: u64,
        body: &[u8],
        events: &mut Vec<DtlsEvent>,
    ) -> Result<(), DtlsError> {
        let hello = ClientHello::parse(body)?;
        let expected = self.cookie_for(&hello);

        if !constant_time_compare(&hello.cookie, &expected) {
            debug!("Sending HelloVerifyRequest");
            let hvr = encode_message(
                msg_type::HELLO_VERIFY_REQUEST,
                message_seq,
                &handshake::encode_hello_verify_request(&expected),
            );
            let record = Record::new(content_type::HANDSHAKE, 0, record_seq, hvr);
            self.write_seq[0] = self.write_seq[0].max(record_seq + 1);
            events.push(DtlsEvent::Transmit(record.to_bytes()));
            return Ok(());
        }

        let suite = self.config.credentials.cipher_suite();
        if !hello.cipher_suites.contains(&suite) {
            return Err(DtlsError::HandshakeFailed(format!(
                "client did not offer cipher suite {suite:#06x}"
            )));
        }
        self.cipher_suite = suite;
        self.client_random = hello.random;
        self.server_random = rand::random();
        self.next_receive_seq = message_seq.wrapping_add(1);
        self.next_send_seq = message_seq;
        self.write_seq[0] = self.write_seq[0].max(record_seq);
        self.transcript = encode_message(msg_type::CLIENT_HELLO, message_seq, body);

        let mut extensions = Vec::new();
        if hello.cipher_suites.contains(&handshake::TLS_EMPTY_RENEGOTIATION_INFO_SCSV)
            || find_extension(&hello.extensions, extension_type::RENEGOTIATION_INFO).is_some()
        {
            extensions.push(Extension::new(extension_type::RENEGOTIATION_INFO, vec![0]));
        }
        if let Some(ext) = find_extension(&hello.extensions, extension_type::CONNECTION_ID) {
            if self.config.connection_id {
                self.peer_cid = ext.parse_connection_id()?;
                self.own_cid = rand::random::<[u8; CONNECTION_ID_LENGTH]>().to_vec();
                extensions.push(Extension::connection_id(&self.own_cid));
            }
        }

        let cached = self
            .config
            .session_cache
            .get(&hello.session_id)
            .filter(|s| !hello.session_id.is_empty() && s.cipher_suite == suite);
        if let Some(session) = cached {
            return self.resume_session(session, extensions, events);
        }

        self.session_id = rand::random::<[u8; 32]>().to_vec();
        let mut flight = Vec::new();
        match self.config.credentials.clone() {
            DtlsCredentials::Psk(_) => {
                let hello_body = self.server_hello(extensions).encode();
                flight.push(self.handshake_entry(msg_type::SERVER_HELLO, &hello_body, 0));
            }
            DtlsCredentials::Certificate(cert) => {
                if find_extension(&hello.extensions, extension_type::EC_POINT_FORMATS).is_some() {
                    extensions.push(Extension::new(extension_type::EC_POINT_FORMATS, vec![1, 0]));
                }
                self.server_rpk = cert.is_raw_public_key();
                let wanted = if self.server_rpk {
                    handshake::CERT_TYPE_RAW_PUBLIC_KEY
                } else {
                    handshake::CERT_TYPE_X509
                };
                match find_extension(&hello.extensions, extension_type::SERVER_CERTIFICATE_TYPE) {
                    Some(ext) if ext.certificate_types().contains(&wanted) => extensions.push(
                        Extension::new(extension_type::SERVER_CERTIFICATE_TYPE, vec![wanted]),
                    ),
                    Some(_) => {
                        return Err(DtlsError::HandshakeFailed(
                            "client does not accept our certificate type".into(),
                        ))
                    }
                    None if self.server_rpk => {
                        return Err(DtlsError::HandshakeFailed(
                            "client does not accept raw public keys".into(),
                        ))
                    }
                    None => {}
                }
                self.certificate_requested = cert.request_client_certificate;
                if self.certificate_requested {
                    if let Some(ext) =
                        find_extension(&hello.extensions, extension_type::CLIENT_CERTIFICATE_TYPE)
                    {
                        self.client_rpk = ext
                            .certificate_types()
                            .contains(&handshake::CERT_TYPE_RAW_PUBLIC_KEY);
                        let selected = if self.client_rpk {
                            handshake::CERT_TYPE_RAW_PUBLIC_KEY
                        } else {
                            handshake::CERT_TYPE_X509
                        };
                        extensions.push(Extension::new(
                            extension_type::CLIENT_CERTIFICATE_TYPE,
                            vec![selected],
                        ));
                    }
                }

                let hello_body = self.server_hello(extensions).encode();
                flight.push(self.handshake_entry(msg_type::SERVER_HELLO, &hello_body, 0));

                let entries = if self.server_rpk {
                    vec![cert.spki()]
                } else {
                    cert.certificate_chain.clone()
                };
                let certificate = handshake::encode_certificate(&entries, self.server_rpk);
                flight.push(self.handshake_entry(msg_type::CERTIFICATE, &certificate, 0));

                let ephemeral = SecretKey::random(&mut rand::rngs::OsRng);
                let point = ephemeral.public_key().to_encoded_point(false);
                let params = handshake::encode_ecdh_params(point.as_bytes());
                let signed = [&self.client_random[..], &self.server_random[..], &params].concat();
                let signature: Signature = SigningKey::from(&cert.private_key).sign(&signed);
                let ske = EcdheServerKeyExchange::encode(&params, signature.to_der().as_bytes());
                self.ephemeral = Some(ephemeral);
                flight.push(self.handshake_entry(msg_type::SERVER_KEY_EXCHANGE, &ske, 0));

                if self.certificate_requested {
                    let request = handshake::encode_certificate_request();
                    flight.push(self.handshake_entry(msg_type::CERTIFICATE_REQUEST, &request, 0));
                }
            }
        }
        flight.push(self.handshake_entry(msg_type::SERVER_HELLO_DONE, &[], 0));
        self.state = State::AwaitClientFlight;
        self.set_flight(flight);
        events.extend(self.flight_datagrams()?.into_iter().map(DtlsEvent::Transmit));
        Ok(())
    }

    fn resume_session(
        &mut self,
        session: CachedSession,
        extensions: Vec<Extension>,
        events: &mut Vec<DtlsEvent>,
    ) -> Result<(), DtlsError> {
        info!("Resuming DTLS session {}", hex::encode(&session.session_id));
        self.session_id = session.session_id;
        self.master_secret = session.master_secret;
        self.resumed = true;

        let hello_body = self.server_hello(extensions).encode();
        let hello = self.handshake_entry(msg_type::SERVER_HELLO, &hello_body, 0);
        self.protection = Some(RecordProtection::new(
            &self.master_secret,
            &self.client_random,
            &self.server_random,
            self.role,
        ));
        let ccs = self.ccs_entry();
        let finished = self.finished_entry();
        self.state = State::AwaitClientFinished;
        self.set_flight(vec![hello, ccs, finished]);
        events.extend(self.flight_datagrams()?.into_iter().map(DtlsEvent::Transmit));
        Ok(())
    }

    fn server_hello(&self, extensions: Vec<Extension>) -> ServerHello {
        ServerHello {
            random: self.server_random,
            session_id: self.session_id.clone(),
            cipher_suite: self.cipher_suite,
            extensions,
        }
    }

    fn server_premaster(&mut self, body: &[u8]) -> Result<Vec<u8>, DtlsError> {
        match &self.config.credentials {
            DtlsCredentials::Psk(psk) => {
                let identity = handshake::parse_psk_client_key_exchange(body)?;
                if identity != psk.identity {
                    return Err(DtlsError::UnknownPskIdentity(identity));
                }
                self.psk_identity = identity;
                cipher::psk_premaster(psk.key.as_bytes())
            }
            DtlsCredentials::Certificate(_) => {
                let point = handshake::parse_ecdh_client_key_exchange(body)?;
                let ephemeral = self.ephemeral.as_ref().ok_or_else(|| {
                    DtlsError::HandshakeFailed("no ephemeral key for ClientKeyExchange".into())
                })?;
                ecdh_premaster(ephemeral, &point)
            }
        }
    }

    fn derive_keys(&mut self, premaster: &[u8]) {
        self.master_secret =
            cipher::master_secret(premaster, &self.client_random, &self.server_random);
        self.protection = Some(RecordProtection::new(
            &self.master_secret,
            &self.client_random,
            &self.server_random,
            self.role,
        ));
    }

    fn check_finished(&self, sender: Role, body: &[u8]) -> Result<(), DtlsError> {
        if self.read_epoch != 1 {
            return Err(DtlsError::UnexpectedMessage {
                msg_type: msg_type::FINISHED,
                state: "before ChangeCipherSpec".into(),
            });
        }
        let expected = cipher::verify_data(&self.master_secret, sender, &self.transcript);
        if constant_time_compare(body, &expected) {
            Ok(())
        } else {
            Err(DtlsError::BadFinished)
        }
    }

    fn build_client_hello(&self) -> ClientHello {
        let mut extensions = Vec::new();
        if let DtlsCredentials::Certificate(cert) = &self.config.credentials {
            extensions.push(Extension::new(
                extension_type::SUPPORTED_GROUPS,
                [&[0u8, 2][..], &handshake::NAMED_GROUP_SECP256R1.to_be_bytes()].concat(),
            ));
            extensions.push(Extension::new(extension_type::EC_POINT_FORMATS, vec![1, 0]));
            extensions.push(Extension::new(
                extension_type::SIGNATURE_ALGORITHMS,
                [&[0u8, 2][..], &handshake::SIGNATURE_ECDSA_SHA256.to_be_bytes()].concat(),
            ));
            extensions.push(Extension::new(
                extension_type::SERVER_CERTIFICATE_TYPE,
                vec![
                    2,
                    handshake::CERT_TYPE_RAW_PUBLIC_KEY,
                    handshake::CERT_TYPE_X509,
                ],
            ));
            if cert.is_raw_public_key() {
                extensions.push(Extension::new(
                    extension_type::CLIENT_CERTIFICATE_TYPE,
                    vec![1, handshake::CERT_TYPE_RAW_PUBLIC_KEY],
                ));
            }
        }
        if self.config.connection_id {
            extensions.push(Extension::connection_id(&[]));
        }
        ClientHello {
            version: DTLS_1_2,
            random: self.client_random,
            session_id: self
                .config
                .resume
                .as_ref()
                .map(|s| s.session_id.clone())
                .unwrap_or_default(),
            cookie: self.cookie.clone(),
            cipher_suites: vec![
                self.config.credentials.cipher_suite(),
                handshake::TLS_EMPTY_RENEGOTIATION_INFO_SCSV,
            ],
            compression_methods: vec![0],
            extensions,
        }
    }

    fn on_server_hello(&mut self, body: &[u8]) -> Result<(), DtlsError> {
        let hello = ServerHello::parse(body)?;
        let suite = self.config.credentials.cipher_suite();
        if hello.cipher_suite != suite {
            return Err(DtlsError::HandshakeFailed(format!(
                "server selected cipher suite {:#06x}",
                hello.cipher_suite
            )));
        }
        self.cipher_suite = suite;
        self.server_random = hello.random;

        if let Some(ext) = find_extension(&hello.extensions, extension_type::CONNECTION_ID) {
            if self.config.connection_id {
                self.peer_cid = ext.parse_connection_id()?;
            }
        }
        self.server_rpk = find_extension(&hello.extensions, extension_type::SERVER_CERTIFICATE_TYPE)
            .is_some_and(|ext| ext.data == [handshake::CERT_TYPE_RAW_PUBLIC_KEY]);
        self.client_rpk = find_extension(&hello.extensions, extension_type::CLIENT_CERTIFICATE_TYPE)
            .is_some_and(|ext| ext.data == [handshake::CERT_TYPE_RAW_PUBLIC_KEY]);

        let resumed = self
            .config
            .resume
            .clone()
            .filter(|s| !hello.session_id.is_empty() && s.session_id == hello.session_id);
        self.session_id = hello.session_id;
        if let Some(session) = resumed {
            self.resumed = true;
            self.master_secret = session.master_secret;
            self.protection = Some(RecordProtection::new(
                &self.master_secret,
                &self.client_random,
                &self.server_random,
                self.role,
            ));
            self.state = State::AwaitServerFinished;
        } else {
            self.state = State::AwaitServerFlight;
        }
        Ok(())
    }

    fn on_server_key_exchange(&mut self, body: &[u8]) -> Result<(), DtlsError> {
        let ske = EcdheServerKeyExchange::parse(body)?;
        if self.server_rpk {
            let spki = self.peer_certificates.first().ok_or_else(|| {
                DtlsError::HandshakeFailed("ServerKeyExchange before Certificate".into())
            })?;
            let point = spki.strip_prefix(&P256_SPKI_PREFIX[..]).ok_or_else(|| {
                DtlsError::HandshakeFailed("server public key is not P-256".into())
            })?;
            let key = VerifyingKey::from_sec1_bytes(point)
                .map_err(|e| DtlsError::InvalidKey(e.to_string()))?;
            let signature = Signature::from_der(&ske.signature)
                .map_err(|e| DtlsError::MalformedHandshake(e.to_string()))?;
            let signed = [&self.client_random[..], &self.server_random[..], &ske.params].concat();
            key.verify(&signed, &signature).map_err(|_| {
                DtlsError::HandshakeFailed("bad ServerKeyExchange signature".into())
            })?;
        }
        PublicKey::from_sec1_bytes(&ske.public_point)
            .map_err(|e| DtlsError::MalformedHandshake(e.to_string()))?;
        self.peer_public_point = ske.public_point;
        Ok(())
    }

    fn send_client_flight(&mut self, events: &mut Vec<DtlsEvent>) -> Result<(), DtlsError> {
        let mut flight = Vec::new();
        let credentials = self.config.credentials.clone();

        if self.certificate_requested {
            let entries = match &credentials {
                DtlsCredentials::Certificate(cert) if self.client_rpk => vec![cert.spki()],
                DtlsCredentials::Certificate(cert) => cert.certificate_chain.clone(),
                DtlsCredentials::Psk(_) => Vec::new(),
            };
            let body = handshake::encode_certificate(&entries, self.client_rpk);
            flight.push(self.handshake_entry(msg_type::CERTIFICATE, &body, 0));
        }

        let premaster = match &credentials {
            DtlsCredentials::Psk(psk) => {
                let body = handshake::encode_psk_client_key_exchange(&psk.identity);
                flight.push(self.handshake_entry(msg_type::CLIENT_KEY_EXCHANGE, &body, 0));
                cipher::psk_premaster(psk.key.as_bytes())?
            }
            DtlsCredentials::Certificate(_) => {
                let ephemeral = SecretKey::random(&mut rand::rngs::OsRng);
                let premaster = ecdh_premaster(&ephemeral, &self.peer_public_point)?;
                let point = ephemeral.public_key().to_encoded_point(false);
                let body = handshake::encode_ecdh_client_key_exchange(point.as_bytes());
                flight.push(self.handshake_entry(msg_type::CLIENT_KEY_EXCHANGE, &body, 0));
                premaster
            }
        };
        self.derive_keys(&premaster);

        if let (true, DtlsCredentials::Certificate(cert)) = (self.certificate_requested, &credentials) {
            let signature: Signature = SigningKey::from(&cert.private_key).sign(&self.transcript);
            let body = handshake::encode_certificate_verify(signature.to_der().as_bytes());
            flight.push(self.handshake_entry(msg_type::CERTIFICATE_VERIFY, &body, 0));
        }

        flight.push(self.ccs_entry());
        flight.push(self.finished_entry());
        self.state = State::AwaitServerFinished;
        self.set_flight(flight);
        events.extend(self.flight_datagrams()?.into_iter().map(DtlsEvent::Transmit));
        Ok(())
    }

    /// Encodes the next outgoing handshake message and appends it to the transcript.
    fn handshake_entry(&mut self, msg: u8, body: &[u8], epoch: u16) -> FlightEntry {
        let plaintext = encode_message(msg, self.next_send_seq, body);
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        self.transcript.extend_from_slice(&plaintext);
        FlightEntry {
            content: content_type::HANDSHAKE,
            epoch,
            plaintext,
        }
    }

    fn ccs_entry(&mut self) -> FlightEntry {
        self.write_epoch = 1;
        FlightEntry {
            content: content_type::CHANGE_CIPHER_SPEC,
            epoch: 0,
            plaintext: vec![1],
        }
    }

    fn finished_entry(&mut self) -> FlightEntry {
        let verify = cipher::verify_data(&self.master_secret, self.role, &self.transcript);
        self.handshake_entry(msg_type::FINISHED, &verify, 1)
    }

    fn set_flight(&mut self, flight: Vec<FlightEntry>) {
        self.last_flight = flight;
    }

    fn flight_datagrams(&mut self) -> Result<Vec<Vec<u8>>, DtlsError> {
        let flight = std::mem::take(&mut self.last_flight);
        let result = self.seal_flight(&flight);
        self.last_flight = flight;
        result
    }

    fn seal_flight(&mut self, flight: &[FlightEntry]) -> Result<Vec<Vec<u8>>, DtlsError> {
        let overhead =
            RECORD_HEADER_SIZE + PROTECTION_OVERHEAD + self.peer_cid.len() + 1 + HANDSHAKE_HEADER_SIZE;
        let max_body = self.config.mtu.saturating_sub(overhead).max(64);

        let mut datagrams = Vec::new();
        let mut current = Vec::new();
        for entry in flight {
            let pieces = if entry.content == content_type::HANDSHAKE {
                handshake::fragment_message(&entry.plaintext, max_body)
            } else {
                vec![entry.plaintext.clone()]
            };
            for piece in pieces {
                let record = self.seal_record(entry.content, entry.epoch, &piece)?;
                if !current.is_empty() && current.len() + record.len() > self.config.mtu {
                    datagrams.push(std::mem::take(&mut current));
                }
                current.extend_from_slice(&record);
            }
        }
        if !current.is_empty() {
            datagrams.push(current);
        }
        Ok(datagrams)
    }

    fn seal_record(&mut self, content: u8, epoch: u16, plaintext: &[u8]) -> Result<Vec<u8>, DtlsError> {
        let slot = usize::from(epoch.min(1));
        let sequence = self.write_seq[slot];
        self.write_seq[slot] += 1;
        if epoch == 0 {
            return Ok(Record::new(content, 0, sequence, plaintext.to_vec()).to_bytes());
        }
        let protection = self.protection.as_ref().ok_or(DtlsError::NotEstablished)?;
        Ok(protection
            .seal(content, epoch, sequence, plaintext, &self.peer_cid)?
            .to_bytes())
    }
}

fn ecdh_premaster(ephemeral: &SecretKey, peer_point: &[u8]) -> Result<Vec<u8>, DtlsError> {
    let peer = PublicKey::from_sec1_bytes(peer_point)
        .map_err(|e| DtlsError::MalformedHandshake(format!("invalid ECDH point: {e}")))?;
    let shared = ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), peer.as_affine());
    Ok(shared.raw_secret_bytes().to_vec())
}

impl fmt::Debug for DtlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("cipher_suite", &format_args!("{:#06x}", self.cipher_suite))
            .field("session_id", &hex::encode(&self.session_id))
            .field("own_cid", &hex::encode(&self.own_cid))
            .field("peer_cid", &hex::encode(&self.peer_cid))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{Psk, PskKey},
        transport::dtls::{CertificateConfig, SessionCache},
    };

    fn psk_config(identity: &[u8]) -> DtlsConfig {
        DtlsConfig::psk(Psk::new(identity, PskKey::new(b"sesame".to_vec()).unwrap()))
    }

    fn transmits(events: &[DtlsEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                DtlsEvent::Transmit(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// Shuttles datagrams until both sides are idle.
    fn run(client: &mut DtlsEngine, server: &mut DtlsEngine) -> Result<(), DtlsError> {
        let mut to_server = client.start()?;
        let mut rounds = 0;
        while !to_server.is_empty() && rounds < 10 {
            let mut to_client = Vec::new();
            for datagram in to_server.drain(..) {
                to_client.extend(transmits(&server.handle_datagram(&datagram)?));
            }
            for datagram in to_client {
                to_server.extend(transmits(&client.handle_datagram(&datagram)?));
            }
            rounds += 1;
        }
        Ok(())
    }

    #[test]
    fn test_psk_handshake_and_data() {
        let mut client = DtlsEngine::client(psk_config(b"demo"));
        let mut server = DtlsEngine::server(psk_config(b"demo"));
        run(&mut client, &mut server).unwrap();
        assert!(client.is_established());
        assert!(server.is_established());
        assert_eq!(server.psk_identity(), b"demo");
        assert_eq!(server.own_cid().len(), CONNECTION_ID_LENGTH);
        assert_eq!(client.peer_cid(), server.own_cid());

        let datagram = client.seal_application_data(b"ping").unwrap();
        let events = server.handle_datagram(&datagram).unwrap();
        assert_eq!(events, vec![DtlsEvent::ApplicationData(b"ping".to_vec())]);

        let reply = server.seal_application_data(b"pong").unwrap();
        let events = client.handle_datagram(&reply).unwrap();
        assert_eq!(events, vec![DtlsEvent::ApplicationData(b"pong".to_vec())]);
    }

    #[test]
    fn test_hello_verify_request_first() {
        let mut client = DtlsEngine::client(psk_config(b"demo"));
        let mut server = DtlsEngine::server(psk_config(b"demo"));
        let hello = client.start().unwrap();
        let events = server.handle_datagram(&hello[0]).unwrap();
        let reply = transmits(&events);
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0][RECORD_HEADER_SIZE], msg_type::HELLO_VERIFY_REQUEST);
        assert!(server.is_handshaking());
    }

    #[test]
    fn test_unknown_psk_identity() {
        let mut client = DtlsEngine::client(psk_config(b"stranger"));
        let mut server = DtlsEngine::server(psk_config(b"demo"));
        let err = run(&mut client, &mut server).unwrap_err();
        assert_eq!(err, DtlsError::UnknownPskIdentity(b"stranger".to_vec()));
        let alert = server.fatal_alert(&err).unwrap();
        assert_eq!(alert[0], content_type::ALERT);
        assert!(server.is_closed());
    }

    #[test]
    fn test_wrong_key_fails_finished() {
        let mut client = DtlsEngine::client(DtlsConfig::psk(Psk::new(
            b"demo",
            PskKey::new(b"wrong".to_vec()).unwrap(),
        )));
        let mut server = DtlsEngine::server(psk_config(b"demo"));
        // server cannot authenticate the client's Finished record and drops it
        run(&mut client, &mut server).unwrap();
        assert!(!server.is_established());
        assert!(!client.is_established());
    }

    #[test]
    fn test_session_resumption() {
        let cache = SessionCache::new();
        let mut client = DtlsEngine::client(psk_config(b"demo"));
        let mut server = DtlsEngine::server(psk_config(b"demo").with_session_cache(cache.clone()));
        run(&mut client, &mut server).unwrap();
        let session = client.session().unwrap();
        assert_eq!(cache.len(), 1);

        let mut client = DtlsEngine::client(psk_config(b"demo").with_resume(Some(session.clone())));
        let mut server = server.restarted();
        run(&mut client, &mut server).unwrap();
        assert!(client.is_established() && server.is_established());
        assert!(client.is_resumed() && server.is_resumed());
        assert_eq!(server.session_id(), session.session_id.as_slice());
    }

    #[test]
    fn test_raw_public_key_handshake() {
        let server_cert = CertificateConfig::generate().with_client_certificate_request(true);
        let mut client = DtlsEngine::client(DtlsConfig::certificate(CertificateConfig::generate()));
        let mut server = DtlsEngine::server(DtlsConfig::certificate(server_cert.clone()));
        run(&mut client, &mut server).unwrap();
        assert!(client.is_established() && server.is_established());
        assert_eq!(client.peer_certificates(), &[server_cert.spki()]);
        assert_eq!(server.peer_certificates().len(), 1);
        assert_eq!(
            server.cipher_suite(),
            handshake::TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8
        );
    }

    #[test]
    fn test_lost_final_flight_is_retransmitted() {
        let mut client = DtlsEngine::client(psk_config(b"demo").with_connection_id(false));
        let mut server = DtlsEngine::server(psk_config(b"demo"));
        let ch1 = client.start().unwrap();
        let hvr = transmits(&server.handle_datagram(&ch1[0]).unwrap());
        let ch2 = transmits(&client.handle_datagram(&hvr[0]).unwrap());
        let flight2 = transmits(&server.handle_datagram(&ch2[0]).unwrap());
        let mut flight3 = Vec::new();
        for d in &flight2 {
            flight3.extend(transmits(&client.handle_datagram(d).unwrap()));
        }
        let mut final_flight = Vec::new();
        for d in &flight3 {
            final_flight.extend(transmits(&server.handle_datagram(d).unwrap()));
        }
        assert!(server.is_established());
        assert!(!final_flight.is_empty());

        // final flight lost; client retransmits and server answers again
        let again = client.retransmit_flight().unwrap();
        let mut resent = Vec::new();
        for d in &again {
            resent.extend(transmits(&server.handle_datagram(d).unwrap()));
        }
        assert!(!resent.is_empty());
        for d in &resent {
            client.handle_datagram(d).unwrap();
        }
        assert!(client.is_established());
        assert!(client.peer_cid().is_empty());
    }

    #[test]
    fn test_close_notify() {
        let mut client = DtlsEngine::client(psk_config(b"demo"));
        let mut server = DtlsEngine::server(psk_config(b"demo"));
        run(&mut client, &mut server).unwrap();
        let bye = client.close_notify().unwrap();
        let events = server.handle_datagram(&bye).unwrap();
        assert_eq!(events, vec![DtlsEvent::Closed]);
        assert!(server.is_closed());
    }

    #[test]
    fn test_small_mtu_fragments_flight() {
        let mut config = DtlsConfig::certificate(CertificateConfig::generate());
        config.mtu = 128;
        let mut client = DtlsEngine::client(DtlsConfig::certificate(CertificateConfig::generate()));
        let mut server = DtlsEngine::server(config);
        run(&mut client, &mut server).unwrap();
        assert!(client.is_established() && server.is_established());
    }
}
