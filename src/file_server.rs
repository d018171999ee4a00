//! Blockwise CoAP file server used by firmware-download tests.
//!
//! The server runs as a background task that polls a shutdown flag every
//! 100 ms. Resources and the drop predicate live behind a mutex shared with
//! the test, so they may be changed while a download is in progress.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crc::{Crc, CRC_32_ISO_HDLC};
use tokio::task::JoinHandle;

use crate::{
    coap::{BlockOption, Code, ContentFormat, Message, MessageIdGenerator, MessageType},
    error::{HarnessError, Result},
    messages::response_to,
    time::Deadline,
    transport::{Transport, TransportConfig, TransportError},
};

/// Block size used when a GET carries no Block2 option.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Interval at which the serving task checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Predicate deciding which requests are dropped unanswered.
pub type RequestFilter = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// A served byte resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub etag: [u8; 4],
    pub data: Vec<u8>,
}

impl Resource {
    /// Resource tagged with the CRC32 of its data.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            etag: CRC32.checksum(&data).to_be_bytes(),
            data,
        }
    }

    #[must_use]
    pub fn with_etag(mut self, etag: [u8; 4]) -> Self {
        self.etag = etag;
        self
    }
}

#[derive(Default)]
struct State {
    resources: HashMap<String, Resource>,
    should_ignore: Option<RequestFilter>,
    requests_served: usize,
    requests_ignored: usize,
}

/// Handle to a running file server.
pub struct FileServer {
    local_addr: SocketAddr,
    secure: bool,
    state: Arc<Mutex<State>>,
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<Result<()>>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileServer {
    /// Binds the transport and spawns the serving task. The socket is never
    /// connected so that every download may use a fresh client port.
    ///
    /// # Errors
    /// Returns a transport error if the port cannot be bound.
    pub async fn start(config: TransportConfig) -> Result<Self> {
        let transport = Transport::bind(config.with_connect(false)).await?;
        let local_addr = transport.local_addr();
        let secure = transport.is_secure();
        let state = Arc::new(Mutex::new(State::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(serve(transport, Arc::clone(&state), Arc::clone(&shutdown)));
        log::info!("File server listening on {local_addr}");
        Ok(Self {
            local_addr,
            secure,
            state,
            shutdown,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Download URI of the resource at `path`.
    #[must_use]
    pub fn uri(&self, path: &str) -> String {
        let scheme = if self.secure { "coaps" } else { "coap" };
        format!(
            "{scheme}://127.0.0.1:{}/{}",
            self.port(),
            path.trim_start_matches('/')
        )
    }

    /// Adds or replaces the resource served at `path`.
    pub fn set_resource(&self, path: &str, resource: Resource) {
        lock(&self.state)
            .resources
            .insert(normalize(path), resource);
    }

    pub fn remove_resource(&self, path: &str) -> Option<Resource> {
        lock(&self.state).resources.remove(&normalize(path))
    }

    pub fn set_should_ignore(&self, filter: Option<RequestFilter>) {
        lock(&self.state).should_ignore = filter;
    }

    /// Number of requests answered so far.
    #[must_use]
    pub fn requests_served(&self) -> usize {
        lock(&self.state).requests_served
    }

    #[must_use]
    pub fn requests_ignored(&self) -> usize {
        lock(&self.state).requests_ignored
    }

    /// Stops the serving task and waits for it to exit.
    ///
    /// # Errors
    /// Returns the error that ended the task, if any.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| HarnessError::Setup(format!("file server task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

async fn serve(mut transport: Transport, state: Arc<Mutex<State>>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let ids = MessageIdGenerator::new();
    while !shutdown.load(Ordering::Relaxed) {
        let datagram = match transport.recv(Deadline::after(POLL_INTERVAL)).await {
            Ok((datagram, _)) => datagram,
            Err(TransportError::Timeout) => continue,
            Err(TransportError::Io(e)) => {
                log::error!("File server socket failed: {e}");
                return Err(TransportError::Io(e).into());
            }
            Err(e) => {
                log::warn!("File server: {e}");
                continue;
            }
        };
        let request = match Message::decode(&datagram) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("File server: dropping malformed request: {e}");
                continue;
            }
        };
        let response = {
            let mut state = lock(&state);
            state.respond(&request)
        };
        if let Some(mut response) = response {
            if response.msg_type == MessageType::NonConfirmable {
                response.message_id = ids.generate();
            }
            log::debug!("File server: {request} -> {response}");
            if let Err(e) = transport.send(&response.encode()).await {
                log::warn!("File server: cannot send response: {e}");
            }
        }
    }
    log::info!("File server on {} stopped", transport.local_addr());
    Ok(())
}

impl State {
    fn respond(&mut self, request: &Message) -> Option<Message> {
        if request.code.is_empty() {
            return (request.msg_type == MessageType::Confirmable)
                .then(|| Message::reset(request.message_id));
        }
        if !request.code.is_request() {
            return None;
        }
        if self.should_ignore.as_ref().is_some_and(|ignore| ignore(request)) {
            log::debug!("File server: ignoring {request}");
            self.requests_ignored += 1;
            return None;
        }
        self.requests_served += 1;

        if request.code != Code::GET {
            return Some(response_to(request, Code::METHOD_NOT_ALLOWED));
        }
        let Some(resource) = self.resources.get(&request.uri_path()) else {
            return Some(response_to(request, Code::NOT_FOUND));
        };
        if request.etag() == Some(&resource.etag[..]) {
            return Some(response_to(request, Code::VALID).with_etag(&resource.etag));
        }
        Some(serve_block(request, resource))
    }
}

fn serve_block(request: &Message, resource: &Resource) -> Message {
    let bad_option = || response_to(request, Code::BAD_OPTION);
    let requested = match request.block2() {
        Ok(Some(block)) => block,
        Ok(None) => match BlockOption::new(0, false, DEFAULT_BLOCK_SIZE) {
            Ok(block) => block,
            Err(_) => return bad_option(),
        },
        Err(_) => return bad_option(),
    };

    let size = usize::from(requested.size);
    let offset = requested.offset();
    let len = resource.data.len();
    if offset >= len && !(offset == 0 && len == 0) {
        return bad_option();
    }
    let end = (offset + size).min(len);
    let more = end < len;
    let Ok(block) = BlockOption::new(requested.seq_num, more, size) else {
        return bad_option();
    };

    response_to(request, Code::CONTENT)
        .with_content_format(ContentFormat::OPAQUE)
        .with_etag(&resource.etag)
        .with_block2(block)
        .with_payload(resource.data[offset..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::Token;

    fn get(path: &str, block: Option<BlockOption>) -> Message {
        let mut msg = Message::new(
            MessageType::Confirmable,
            Code::GET,
            10,
            Token::new(vec![1]).unwrap(),
        )
        .with_uri_path(path);
        if let Some(block) = block {
            msg = msg.with_block2(block);
        }
        msg
    }

    fn state_with(data: Vec<u8>) -> State {
        let mut state = State::default();
        state
            .resources
            .insert("/fw".to_string(), Resource::new(data));
        state
    }

    /// Fetches the whole resource with sequential Block2 requests of `size`.
    fn fetch_blockwise(state: &mut State, size: usize) -> (Vec<u8>, u32) {
        let mut received = Vec::new();
        let mut seq = 0;
        loop {
            let block = BlockOption::new(seq, false, size).unwrap();
            let response = state.respond(&get("/fw", Some(block))).unwrap();
            assert_eq!(response.code, Code::CONTENT);
            assert_eq!(response.msg_type, MessageType::Acknowledgement);
            let block2 = response.block2().unwrap().unwrap();
            assert_eq!(block2.seq_num, seq);
            assert_eq!(usize::from(block2.size), size);
            received.extend_from_slice(&response.payload);
            if !block2.more {
                return (received, seq + 1);
            }
            assert_eq!(response.payload.len(), size, "only the last block may be short");
            seq += 1;
        }
    }

    #[test]
    fn test_blocks_cover_resource() {
        const BLOCK_SIZES: &[usize] = &[16, 32, 64, 128, 256, 512, 1024];
        for &size in BLOCK_SIZES {
            for len in [1, size * 3, 9001] {
                let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let mut state = state_with(data.clone());
                let (received, blocks) = fetch_blockwise(&mut state, size);
                assert_eq!(received, data, "size {size}, length {len}");
                assert_eq!(blocks as usize, len.div_ceil(size), "size {size}, length {len}");
            }
        }
    }

    #[test]
    fn test_default_block_size() {
        let mut state = state_with(vec![7; 3000]);
        let response = state.respond(&get("/fw", None)).unwrap();
        let block2 = response.block2().unwrap().unwrap();
        assert_eq!(usize::from(block2.size), DEFAULT_BLOCK_SIZE);
        assert!(block2.more);
        assert_eq!(response.payload.len(), DEFAULT_BLOCK_SIZE);
        assert_eq!(
            response.etag(),
            Some(&Resource::new(vec![7; 3000]).etag[..])
        );
    }

    #[test]
    fn test_error_responses() {
        let mut state = state_with(vec![1; 100]);
        let past_end = BlockOption::new(1, false, 128).unwrap();
        const TEST_CASES: &[(Code, &str, Code)] = &[
            (Code::PUT, "/fw", Code::METHOD_NOT_ALLOWED),
            (Code::GET, "/missing", Code::NOT_FOUND),
        ];
        for &(method, path, expected) in TEST_CASES {
            let mut request = get(path, None);
            request.code = method;
            assert_eq!(state.respond(&request).unwrap().code, expected);
        }
        assert_eq!(
            state.respond(&get("/fw", Some(past_end))).unwrap().code,
            Code::BAD_OPTION
        );

        let etag = Resource::new(vec![1; 100]).etag;
        let cached = get("/fw", None).with_etag(&etag);
        assert_eq!(state.respond(&cached).unwrap().code, Code::VALID);
    }

    #[test]
    fn test_ignored_requests() {
        let mut state = state_with(vec![1; 10]);
        state.should_ignore = Some(Box::new(|m: &Message| m.message_id == 10));
        assert!(state.respond(&get("/fw", None)).is_none());
        assert_eq!(state.requests_ignored, 1);
        assert_eq!(state.requests_served, 0);
    }

    #[tokio::test]
    async fn test_serves_over_udp() {
        let server = FileServer::start(TransportConfig::plain()).await.unwrap();
        server.set_resource("fw", Resource::new(b"firmware".to_vec()));
        assert_eq!(
            server.uri("/fw"),
            format!("coap://127.0.0.1:{}/fw", server.port())
        );

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&get("/fw", None).encode(), ("127.0.0.1", server.port()))
            .await
            .unwrap();
        let mut buf = [0u8; 2048];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::decode(&buf[..len]).unwrap();
        assert_eq!(response.payload, b"firmware");
        assert_eq!(server.requests_served(), 1);
        server.stop().await.unwrap();
    }
}
