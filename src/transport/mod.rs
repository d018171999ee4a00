//! UDP and DTLS datagram transport for mock servers and test peers.
//!
//! A [`Transport`] owns one socket bound on loopback. The first datagram
//! received latches its source as the remote endpoint; in connected mode the
//! socket is then connected so that ICMP port-unreachable surfaces as
//! [`TransportError::ConnectionRefused`]. Secured transports run every
//! datagram through a [`dtls::DtlsEngine`]; a server-side handshake happens
//! implicitly inside [`Transport::recv`].

use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::time::Deadline;

/// DTLS 1.2 engine.
pub mod dtls;

use dtls::{record::is_client_hello, DtlsConfig, DtlsEngine, DtlsError, DtlsEvent, Role};

/// Largest UDP payload accepted by default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_535;

/// Initial handshake retransmission timeout (RFC 6347 Section 4.2.4.1).
const HANDSHAKE_INITIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced by [`Transport`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Timed out waiting for a datagram")]
    Timeout,

    #[error("Connection aborted: {0}")]
    ConnectionAborted(String),

    #[error("Connection refused (ICMP port unreachable)")]
    ConnectionRefused,

    #[error("Malformed DTLS handshake: {0}")]
    MalformedHandshake(String),

    #[error("DTLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("No remote endpoint known yet")]
    NoRemote,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<DtlsError> for TransportError {
    fn from(e: DtlsError) -> Self {
        match e {
            DtlsError::MalformedRecord(msg) | DtlsError::MalformedHandshake(msg) => {
                Self::MalformedHandshake(msg)
            }
            DtlsError::PeerAlert { .. } => Self::ConnectionAborted(e.to_string()),
            other => Self::HandshakeFailed(other.to_string()),
        }
    }
}

fn map_io(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::ConnectionRefused {
        TransportError::ConnectionRefused
    } else {
        TransportError::Io(e)
    }
}

/// How a transport is bound and secured.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_addr: SocketAddr,
    /// Connect the socket to the remote once it is latched.
    pub connect: bool,
    pub dtls: Option<DtlsConfig>,
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: (Ipv4Addr::LOCALHOST, 0).into(),
            connect: true,
            dtls: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn plain() -> Self {
        Self::default()
    }

    /// Secured transport. With connection IDs enabled the socket stays
    /// unconnected so the peer may move to another port.
    #[must_use]
    pub fn dtls(config: DtlsConfig) -> Self {
        Self {
            connect: !config.connection_id,
            dtls: Some(config),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    #[must_use]
    pub fn with_connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }
}

/// A datagram endpoint, optionally secured with DTLS.
pub struct Transport {
    config: TransportConfig,
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    remote: Option<SocketAddr>,
    connected: bool,
    dtls: Option<DtlsEngine>,
    pending: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl Transport {
    /// Binds a transport; DTLS transports created here act as servers.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the address cannot be bound.
    pub async fn bind(config: TransportConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let dtls = config.dtls.clone().map(DtlsEngine::server);
        log::debug!(
            "Bound {} transport on {local_addr}",
            if dtls.is_some() { "DTLS" } else { "UDP" }
        );
        Ok(Self {
            config,
            socket: Some(socket),
            local_addr,
            remote: None,
            connected: false,
            dtls,
            pending: VecDeque::new(),
        })
    }

    /// Binds a transport aimed at `remote`. A DTLS transport created here is
    /// a client and must complete [`Transport::handshake`] before sending.
    ///
    /// # Errors
    /// Returns `TransportError::Io` on bind or connect failure.
    pub async fn connect_to(config: TransportConfig, remote: SocketAddr) -> Result<Self, TransportError> {
        let mut transport = Self::bind(config).await?;
        transport.dtls = transport.config.dtls.clone().map(DtlsEngine::client);
        transport.latch(remote).await?;
        Ok(transport)
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.dtls.is_some()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    #[must_use]
    pub fn dtls(&self) -> Option<&DtlsEngine> {
        self.dtls.as_ref()
    }

    pub fn dtls_mut(&mut self) -> Option<&mut DtlsEngine> {
        self.dtls.as_mut()
    }

    fn socket(&self) -> Result<&UdpSocket, TransportError> {
        self.socket
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionAborted("socket is closed".into()))
    }

    async fn latch(&mut self, remote: SocketAddr) -> Result<(), TransportError> {
        if self.remote != Some(remote) {
            log::debug!("{}: remote endpoint is now {remote}", self.local_addr);
        }
        self.remote = Some(remote);
        if self.config.connect {
            self.socket()?.connect(remote).await?;
            self.connected = true;
        }
        Ok(())
    }

    /// Forgets the remote endpoint so the next datagram latches a new one.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the socket cannot be recreated.
    pub async fn reset(&mut self) -> Result<(), TransportError> {
        self.socket = None;
        let socket = UdpSocket::bind(self.local_addr).await?;
        self.socket = Some(socket);
        self.remote = None;
        self.connected = false;
        self.pending.clear();
        if let Some(engine) = &self.dtls {
            self.dtls = Some(engine.restarted());
        }
        log::debug!("Transport on {} reset", self.local_addr);
        Ok(())
    }

    /// Closes the socket until the returned guard is dropped, at which point
    /// the same port is bound again. The peer sees ICMP port-unreachable
    /// meanwhile.
    pub fn fake_close(&mut self) -> FakeClose<'_> {
        log::info!("Fake-closing port {}", self.local_addr.port());
        self.socket = None;
        self.connected = false;
        FakeClose { transport: self }
    }

    /// Closes the socket for good, sending close_notify first when secured.
    pub async fn close(&mut self) {
        if let Some(engine) = self.dtls.as_mut().filter(|e| e.is_established()) {
            if let Ok(alert) = engine.close_notify() {
                let _ = self.send_raw(&alert).await;
            }
        }
        self.socket = None;
    }

    fn rebind_blocking(&mut self) -> io::Result<()> {
        let std_socket = std::net::UdpSocket::bind(self.local_addr)?;
        std_socket.set_nonblocking(true)?;
        if let (true, Some(remote)) = (self.config.connect, self.remote) {
            std_socket.connect(remote)?;
            self.connected = true;
        }
        self.socket = Some(UdpSocket::from_std(std_socket)?);
        Ok(())
    }

    async fn send_raw(&self, datagram: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket()?;
        if self.connected {
            socket.send(datagram).await.map_err(map_io)?;
        } else {
            let remote = self.remote.ok_or(TransportError::NoRemote)?;
            socket.send_to(datagram, remote).await.map_err(map_io)?;
        }
        Ok(())
    }

    /// Sends one message to the latched remote, encrypting it when secured.
    ///
    /// # Errors
    /// Returns `NoRemote` before anything was received, `HandshakeFailed` if
    /// the DTLS session is not established, or the socket error.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let datagram = match self.dtls.as_mut() {
            Some(engine) => engine.seal_application_data(data)?,
            None => data.to_vec(),
        };
        self.send_raw(&datagram).await
    }

    /// Waits until `deadline` for one message; returns it with its source.
    ///
    /// # Errors
    /// Returns `Timeout` when the deadline passes, `ConnectionRefused` on
    /// ICMP port-unreachable, or DTLS failures.
    pub async fn recv(&mut self, deadline: Deadline) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(message);
            }
            let (datagram, src) = self.recv_datagram(deadline).await?;
            if self.dtls.is_none() {
                if self.remote != Some(src) {
                    self.latch(src).await?;
                }
                return Ok((datagram, src));
            }
            self.process_dtls(&datagram, src).await?;
        }
    }

    async fn recv_datagram(&mut self, deadline: Deadline) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        let mut buf = vec![0u8; self.config.max_message_size];
        let socket = self.socket()?;
        let (len, src) = tokio::time::timeout_at(deadline.instant(), socket.recv_from(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_io)?;
        buf.truncate(len);
        Ok((buf, src))
    }

    async fn process_dtls(&mut self, datagram: &[u8], src: SocketAddr) -> Result<(), TransportError> {
        let Some(engine) = self.dtls.as_mut() else {
            return Ok(());
        };
        if engine.role() == Role::Server && !engine.is_handshaking() && is_client_hello(datagram) {
            log::info!("New DTLS handshake from {src}");
            *engine = engine.restarted();
        }

        let events = match engine.handle_datagram(datagram) {
            Ok(events) => events,
            Err(e) => {
                log::warn!("DTLS error from {src}: {e}");
                if let Some(alert) = engine.fatal_alert(&e) {
                    let socket = self.socket()?;
                    let _ = socket.send_to(&alert, src).await;
                }
                return Err(e.into());
            }
        };

        if self.remote != Some(src) && (!self.connected || self.remote.is_none()) {
            self.latch(src).await?;
        }
        for event in events {
            match event {
                DtlsEvent::Transmit(out) => self.send_raw(&out).await?,
                DtlsEvent::ApplicationData(data) => self.pending.push_back((data, src)),
                DtlsEvent::Connected => log::info!("DTLS session with {src} established"),
                DtlsEvent::Closed => {
                    return Err(TransportError::ConnectionAborted(format!(
                        "{src} closed the DTLS session"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Client role: runs the DTLS handshake to completion with flight
    /// retransmission (1 s, doubling).
    ///
    /// # Errors
    /// Returns `Timeout` if the deadline passes first or the handshake failure.
    pub async fn handshake(&mut self, deadline: Deadline) -> Result<(), TransportError> {
        let Some(engine) = self.dtls.as_mut() else {
            return Ok(());
        };
        let first_flight = engine.start()?;
        for datagram in first_flight {
            self.send_raw(&datagram).await?;
        }

        let mut timeout = HANDSHAKE_INITIAL_TIMEOUT;
        let mut retransmit_at = Deadline::after(timeout);
        while !self.dtls.as_ref().is_some_and(DtlsEngine::is_established) {
            match self.recv_datagram(deadline.min(retransmit_at)).await {
                Ok((datagram, src)) => self.process_dtls(&datagram, src).await?,
                Err(TransportError::Timeout) if !deadline.is_expired() => {
                    timeout *= 2;
                    retransmit_at = Deadline::after(timeout);
                    let flight = match self.dtls.as_mut() {
                        Some(engine) => engine.retransmit_flight()?,
                        None => Vec::new(),
                    };
                    for datagram in flight {
                        self.send_raw(&datagram).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Guard returned by [`Transport::fake_close`].
pub struct FakeClose<'a> {
    transport: &'a mut Transport,
}

impl FakeClose<'_> {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.transport.port()
    }
}

impl Drop for FakeClose<'_> {
    fn drop(&mut self) {
        match self.transport.rebind_blocking() {
            Ok(()) => log::info!("Port {} reopened", self.transport.port()),
            Err(e) => log::error!("Cannot reopen port {}: {e}", self.transport.port()),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.local_addr)
            .field("remote", &self.remote)
            .field("connected", &self.connected)
            .field("dtls", &self.dtls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn peer() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
    }

    #[tokio::test]
    async fn test_latch_and_reply() {
        let mut transport = Transport::bind(TransportConfig::plain()).await.unwrap();
        let client = peer().await;
        client.send_to(b"hello", transport.local_addr()).await.unwrap();

        let (data, src) = transport
            .recv(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(src, client.local_addr().unwrap());
        assert_eq!(transport.remote(), Some(src));

        transport.send(b"world").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"world");
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let mut transport = Transport::bind(TransportConfig::plain()).await.unwrap();
        let err = transport
            .recv(Deadline::after(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_send_without_remote() {
        let mut transport = Transport::bind(TransportConfig::plain()).await.unwrap();
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::NoRemote)
        ));
    }

    #[tokio::test]
    async fn test_reset_keeps_port() {
        let mut transport = Transport::bind(TransportConfig::plain()).await.unwrap();
        let port = transport.port();
        let client = peer().await;
        client.send_to(b"a", transport.local_addr()).await.unwrap();
        transport
            .recv(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();

        transport.reset().await.unwrap();
        assert_eq!(transport.port(), port);
        assert_eq!(transport.remote(), None);

        let other = peer().await;
        other.send_to(b"b", transport.local_addr()).await.unwrap();
        let (_, src) = transport
            .recv(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(src, other.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_fake_close_reopens_port() {
        let mut transport = Transport::bind(TransportConfig::plain()).await.unwrap();
        let port = transport.port();
        {
            let guard = transport.fake_close();
            assert_eq!(guard.port(), port);
        }
        assert!(transport.is_open());
        let client = peer().await;
        client.send_to(b"again", transport.local_addr()).await.unwrap();
        let (data, _) = transport
            .recv(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(data, b"again");
    }

    #[test]
    fn test_dtls_error_mapping() {
        assert!(matches!(
            TransportError::from(DtlsError::MalformedHandshake("x".into())),
            TransportError::MalformedHandshake(_)
        ));
        assert!(matches!(
            TransportError::from(DtlsError::BadFinished),
            TransportError::HandshakeFailed(_)
        ));
        assert!(matches!(
            TransportError::from(DtlsError::PeerAlert {
                level: 2,
                description: 40
            }),
            TransportError::ConnectionAborted(_)
        ));
    }
}
