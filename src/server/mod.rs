//! Mock LwM2M server.
//!
//! A [`MockServer`] owns one [`Transport`] and speaks CoAP to the client
//! under test. Tests drive it explicitly: [`MockServer::recv`] returns the
//! next classified message, [`MockServer::send`] transmits one verbatim and
//! [`MockServer::request`] performs a complete confirmable exchange with
//! retransmissions.
//!
//! Some traffic is handled without the test seeing it:
//! - confirmable responses and notifications carrying a token this server
//!   issued are acknowledged with an empty ACK;
//! - confirmable responses with an unknown token are answered with Reset;
//! - CoAP pings are answered with Reset.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    net::SocketAddr,
};

use chrono::{DateTime, Utc};

use crate::{
    coap::{ContentFormat, Message, MessageIdGenerator, MessageType, Token, TokenGenerator},
    error::Result,
    messages::{Lwm2mMessage, MessageKind},
    time::Deadline,
    transport::{FakeClose, Transport, TransportConfig, TransportError},
};

pub mod exchange;
pub mod registration;
pub mod timing;

use exchange::{ExchangeMatch, PendingExchange};
pub use registration::{Registration, RegistrationState};
pub use timing::TransmissionParams;

/// Predicate deciding which received messages are dropped unseen.
pub type IgnorePredicate = Box<dyn Fn(&Lwm2mMessage) -> bool + Send + Sync>;

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
    Ignored,
}

/// One line of the per-server message log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub direction: Direction,
    pub kind: MessageKind,
    pub summary: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Sent => "->",
            Direction::Received => "<-",
            Direction::Ignored => "x-",
        };
        write!(
            f,
            "{} {arrow} {}",
            self.at.format("%H:%M:%S%.3f"),
            self.summary
        )
    }
}

/// A mock LwM2M server bound on loopback.
pub struct MockServer {
    name: String,
    transport: Transport,
    ids: MessageIdGenerator,
    tokens: TokenGenerator,
    params: TransmissionParams,
    inbox: VecDeque<Lwm2mMessage>,
    issued_tokens: HashSet<Token>,
    observations: HashMap<Token, String>,
    notification_tokens: HashMap<u16, Token>,
    registration: Registration,
    should_ignore: Option<IgnorePredicate>,
    preferred_format: Option<ContentFormat>,
    log: Vec<LogEntry>,
}

impl MockServer {
    /// Binds a server. `name` prefixes its log lines.
    ///
    /// # Errors
    /// Returns a transport error if the port cannot be bound.
    pub async fn bind(name: &str, config: TransportConfig) -> Result<Self> {
        let transport = Transport::bind(config).await?;
        log::info!("{name}: listening on {}", transport.local_addr());
        Ok(Self {
            name: name.to_string(),
            transport,
            ids: MessageIdGenerator::new(),
            tokens: TokenGenerator::new(),
            params: TransmissionParams::default(),
            inbox: VecDeque::new(),
            issued_tokens: HashSet::new(),
            observations: HashMap::new(),
            notification_tokens: HashMap::new(),
            registration: Registration::default(),
            should_ignore: None,
            preferred_format: None,
            log: Vec::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// The latched client endpoint.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> {
        self.transport.remote()
    }

    /// URI the client should be configured with.
    #[must_use]
    pub fn uri(&self) -> String {
        let scheme = if self.transport.is_secure() { "coaps" } else { "coap" };
        format!("{scheme}://127.0.0.1:{}", self.port())
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    #[must_use]
    pub fn transmission_params(&self) -> TransmissionParams {
        self.params
    }

    pub fn set_transmission_params(&mut self, params: TransmissionParams) {
        self.params = params;
    }

    #[must_use]
    pub fn preferred_format(&self) -> Option<ContentFormat> {
        self.preferred_format
    }

    /// Content format requested by reads that do not specify one.
    pub fn set_preferred_format(&mut self, format: Option<ContentFormat>) {
        self.preferred_format = format;
    }

    #[must_use]
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Path observed under `token`, if the observation is active.
    #[must_use]
    pub fn observation(&self, token: &Token) -> Option<&str> {
        self.observations.get(token).map(String::as_str)
    }

    #[must_use]
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    #[must_use]
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Installs a predicate; matching received messages are dropped before
    /// any automatic handling, as if lost on the network.
    pub fn set_should_ignore(&mut self, predicate: Option<IgnorePredicate>) {
        self.should_ignore = predicate;
    }

    /// Assigns a fresh message ID and, when empty, a fresh token.
    pub fn prepare_request(&mut self, mut msg: Lwm2mMessage) -> Lwm2mMessage {
        let message = msg.message_mut();
        message.message_id = self.ids.generate();
        if message.token.is_empty() {
            message.token = self.tokens.generate();
        }
        msg
    }

    /// Sends a message verbatim, except that a NON message with ID 0 (as
    /// built by the `*_matching` constructors) gets a fresh message ID.
    ///
    /// # Errors
    /// Returns the transport error.
    pub async fn send(&mut self, msg: impl Into<Message>) -> Result<()> {
        let mut msg: Message = msg.into();
        if msg.msg_type == MessageType::NonConfirmable && msg.message_id == 0 {
            msg.message_id = self.ids.generate();
        }
        self.track_sent(&msg);
        let classified = Lwm2mMessage::from_coap(msg);
        log::debug!("{}: sending {classified}", self.name);
        self.record(Direction::Sent, &classified);
        self.transport.send(&classified.encode()).await?;
        Ok(())
    }

    fn track_sent(&mut self, msg: &Message) {
        if msg.code.is_request() {
            self.issued_tokens.insert(msg.token.clone());
            match msg.observe() {
                Ok(Some(0)) => {
                    self.observations.insert(msg.token.clone(), msg.uri_path());
                }
                Ok(Some(1)) => {
                    self.observations.remove(&msg.token);
                }
                _ => {}
            }
        } else if msg.msg_type == MessageType::Reset {
            if let Some(token) = self.notification_tokens.remove(&msg.message_id) {
                log::debug!("{}: observation {token} cancelled by Reset", self.name);
                self.observations.remove(&token);
            }
        } else {
            self.registration.on_response(msg);
        }
    }

    fn record(&mut self, direction: Direction, msg: &Lwm2mMessage) {
        self.log.push(LogEntry {
            at: Utc::now(),
            direction,
            kind: msg.kind(),
            summary: msg.to_string(),
        });
    }

    /// Waits for the next message from the client.
    ///
    /// # Errors
    /// Returns `Transport(Timeout)` when the deadline passes, or the codec
    /// error for a malformed datagram.
    pub async fn recv(&mut self, deadline: Deadline) -> Result<Lwm2mMessage> {
        if let Some(msg) = self.inbox.pop_front() {
            return Ok(msg);
        }
        self.recv_from_transport(deadline).await
    }

    async fn recv_from_transport(&mut self, deadline: Deadline) -> Result<Lwm2mMessage> {
        loop {
            let (datagram, src) = self.transport.recv(deadline).await?;
            let msg = match Lwm2mMessage::decode(&datagram) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!(
                        "{}: malformed datagram from {src}: {e} ({})",
                        self.name,
                        hex::encode(&datagram)
                    );
                    return Err(e.into());
                }
            };
            if self.should_ignore.as_ref().is_some_and(|ignore| ignore(&msg)) {
                log::debug!("{}: ignoring {msg}", self.name);
                self.record(Direction::Ignored, &msg);
                continue;
            }
            log::debug!("{}: received {msg}", self.name);
            self.record(Direction::Received, &msg);
            self.handle_received(&msg).await?;
            return Ok(msg);
        }
    }

    async fn handle_received(&mut self, msg: &Lwm2mMessage) -> Result<()> {
        let confirmable = msg.msg_type == MessageType::Confirmable;
        if msg.is_request() {
            self.registration.on_request(msg);
            return Ok(());
        }
        if msg.kind() == MessageKind::Ping {
            return self.send(Message::reset(msg.message_id)).await;
        }
        if msg.code.is_error() && self.observations.remove(&msg.token).is_some() {
            log::debug!("{}: observation {} ended by {}", self.name, msg.token, msg.code);
        }
        if msg.kind() == MessageKind::Notify {
            self.notification_tokens
                .insert(msg.message_id, msg.token.clone());
        }
        if confirmable && msg.code.is_response() {
            if self.issued_tokens.contains(&msg.token) {
                self.send(Message::empty_ack(msg.message_id)).await?;
            } else {
                log::info!("{}: unsolicited response with token {}", self.name, msg.token);
                self.send(Message::reset(msg.message_id)).await?;
            }
        }
        Ok(())
    }

    /// Sends a request and waits for its response, retransmitting a CON
    /// request per the server's [`TransmissionParams`]. Unrelated messages
    /// arriving meanwhile are queued for [`MockServer::recv`].
    ///
    /// Returns the response, or the Reset the client answered with.
    ///
    /// # Errors
    /// Returns `Transport(Timeout)` if the deadline passes or retransmissions
    /// are exhausted without a response.
    pub async fn request(&mut self, msg: Lwm2mMessage, deadline: Deadline) -> Result<Lwm2mMessage> {
        let msg = self.prepare_request(msg);
        let request = msg.message().clone();
        self.send(msg).await?;

        let mut exchange = PendingExchange::new(request, &self.params);
        loop {
            let wait = exchange
                .next_retransmit()
                .map_or(deadline, |at| deadline.min(at));
            match self.recv_from_transport(wait).await {
                Ok(received) => match exchange.classify(&received) {
                    ExchangeMatch::Response | ExchangeMatch::Reset => return Ok(received),
                    ExchangeMatch::Acknowledged => {}
                    ExchangeMatch::None => self.inbox.push_back(received),
                },
                Err(e) if e.is_timeout() && !deadline.is_expired() => {
                    if !exchange.on_timeout(&self.params) {
                        log::info!(
                            "{}: no response after {} retransmissions",
                            self.name,
                            exchange.retransmissions()
                        );
                        return Err(TransportError::Timeout.into());
                    }
                    log::debug!(
                        "{}: retransmission {} of {}",
                        self.name,
                        exchange.retransmissions(),
                        exchange.request
                    );
                    self.record(
                        Direction::Sent,
                        &Lwm2mMessage::from_coap(exchange.request.clone()),
                    );
                    self.transport.send(&exchange.request.encode()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Discards queued and already-received datagrams.
    ///
    /// # Errors
    /// Returns transport errors other than the expected timeout.
    pub async fn drain(&mut self) -> Result<usize> {
        let mut drained = self.inbox.len();
        self.inbox.clear();
        loop {
            match self.recv_from_transport(Deadline::after(std::time::Duration::ZERO)).await {
                Ok(msg) => {
                    log::debug!("{}: drained {msg}", self.name);
                    drained += 1;
                }
                Err(e) if e.is_timeout() => return Ok(drained),
                Err(e) => return Err(e),
            }
        }
    }

    /// Forgets the client: rebinds the port and clears the session state.
    ///
    /// # Errors
    /// Returns the transport error if the port cannot be rebound.
    pub async fn reset(&mut self) -> Result<()> {
        self.transport.reset().await?;
        self.inbox.clear();
        self.observations.clear();
        self.notification_tokens.clear();
        self.registration.reset();
        Ok(())
    }

    /// Releases the port until the guard is dropped.
    pub fn fake_close(&mut self) -> FakeClose<'_> {
        self.inbox.clear();
        self.transport.fake_close()
    }

    pub async fn close(&mut self) {
        log::info!("{}: closing", self.name);
        self.transport.close().await;
    }
}

impl fmt::Debug for MockServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockServer")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("registration", &self.registration.state())
            .field("observations", &self.observations.len())
            .field("inbox", &self.inbox.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::{coap::Code, link_format::Link, path::Lwm2mPath};

    async fn pair() -> (MockServer, UdpSocket) {
        let server = MockServer::bind("test", TransportConfig::plain()).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr()).await.unwrap();
        (server, client)
    }

    async fn client_recv(client: &UdpSocket) -> Lwm2mMessage {
        let mut buf = [0u8; 2048];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Lwm2mMessage::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_register_tracks_state() {
        let (mut server, client) = pair().await;
        let register = Lwm2mMessage::register("demo", Some(86400), "1.1", &[Link::new("/1/1")])
            .with_ids(7, Token::new(vec![1]).unwrap());
        client.send(&register.encode()).await.unwrap();

        let received = server.recv(Deadline::after(Duration::from_secs(1))).await.unwrap();
        assert_eq!(received.kind(), MessageKind::Register);
        assert_eq!(server.registration().state(), RegistrationState::Registering);

        server
            .send(Lwm2mMessage::created_matching(&received, Some("/rd/demo")))
            .await
            .unwrap();
        let created = client_recv(&client).await;
        assert_eq!(created.message_id, 7);
        assert_eq!(created.location_path(), "/rd/demo");
        assert_eq!(server.registration().state(), RegistrationState::Registered);
        assert_eq!(server.uri(), format!("coap://127.0.0.1:{}", server.port()));
    }

    #[tokio::test]
    async fn test_request_retransmits_until_answered() {
        let (mut server, client) = pair().await;
        client.send(&Message::reset(1).encode()).await.unwrap();
        server.recv(Deadline::after(Duration::from_secs(1))).await.unwrap();
        server.set_transmission_params(TransmissionParams::new(Duration::from_millis(100), 1.0, 2));

        let fake_client = tokio::spawn(async move {
            let first = client_recv(&client).await;
            let second = client_recv(&client).await;
            assert_eq!(first.message_id, second.message_id);
            let reply = Lwm2mMessage::content_matching(&second, Some(ContentFormat::TEXT), b"42".to_vec());
            client.send(&reply.encode()).await.unwrap();
        });

        let path: Lwm2mPath = "/3/0/1".parse().unwrap();
        let response = server
            .request(Lwm2mMessage::read(&path, None), Deadline::after(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(response.kind(), MessageKind::Content);
        assert_eq!(response.payload, b"42");
        fake_client.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_gives_up_after_max_retransmit() {
        let (mut server, client) = pair().await;
        client.send(&Message::reset(1).encode()).await.unwrap();
        server.recv(Deadline::after(Duration::from_secs(1))).await.unwrap();
        server.set_transmission_params(TransmissionParams::new(Duration::from_millis(50), 1.0, 1));

        let err = server
            .request(Lwm2mMessage::ping(), Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let sent = server
            .log()
            .iter()
            .filter(|e| e.direction == Direction::Sent && e.kind == MessageKind::Ping)
            .count();
        assert_eq!(sent, 2);
    }

    #[tokio::test]
    async fn test_observe_and_notifications() {
        let (mut server, client) = pair().await;
        client.send(&Message::reset(1).encode()).await.unwrap();
        server.recv(Deadline::after(Duration::from_secs(1))).await.unwrap();

        let path: Lwm2mPath = "/3/0/13".parse().unwrap();
        let observe = server.prepare_request(Lwm2mMessage::observe(&path, None));
        let token = observe.token.clone();
        server.send(observe).await.unwrap();
        assert_eq!(server.observation(&token), Some("/3/0/13"));
        client_recv(&client).await;

        let notify = Lwm2mMessage::notify(token.clone(), 2, true, ContentFormat::TEXT, b"1".to_vec())
            .with_ids(300, token.clone());
        client.send(&notify.encode()).await.unwrap();
        let received = server.recv(Deadline::after(Duration::from_secs(1))).await.unwrap();
        assert_eq!(received.kind(), MessageKind::Notify);
        let ack = client_recv(&client).await;
        assert_eq!(ack.kind(), MessageKind::Empty);
        assert_eq!(ack.message_id, 300);

        server.send(Message::reset(300)).await.unwrap();
        assert_eq!(server.observation(&token), None);
    }

    #[tokio::test]
    async fn test_unknown_token_response_is_reset() {
        let (mut server, client) = pair().await;
        let stray = Message::new(
            MessageType::Confirmable,
            Code::CONTENT,
            55,
            Token::new(vec![0xEE]).unwrap(),
        );
        client.send(&stray.encode()).await.unwrap();
        server.recv(Deadline::after(Duration::from_secs(1))).await.unwrap();
        let reply = client_recv(&client).await;
        assert_eq!(reply.kind(), MessageKind::Reset);
        assert_eq!(reply.message_id, 55);
    }

    #[tokio::test]
    async fn test_should_ignore_drops_messages() {
        let (mut server, client) = pair().await;
        server.set_should_ignore(Some(Box::new(|m: &Lwm2mMessage| m.kind() == MessageKind::Update)));
        client
            .send(&Lwm2mMessage::update("/rd/demo", None, None).with_ids(1, Token::empty()).encode())
            .await
            .unwrap();
        client
            .send(&Lwm2mMessage::deregister("/rd/demo").with_ids(2, Token::empty()).encode())
            .await
            .unwrap();
        let msg = server.recv(Deadline::after(Duration::from_secs(1))).await.unwrap();
        assert_eq!(msg.kind(), MessageKind::Deregister);
        assert_eq!(server.log()[0].direction, Direction::Ignored);
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let (mut server, _client) = pair().await;
        let err = server
            .recv(Deadline::after(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(server.drain().await.unwrap(), 0);
    }
}
