//! Test-case trait and the per-test context owning the client process, the
//! mock servers and the packet capture.

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};

use crate::{
    assertions::{assert_demo_deregisters, assert_demo_registers, RegisterExpectation, DEFAULT_WAIT, DEMO_LOCATION},
    client::{ClientCommand, ClientProcess, MemcheckWrapper, DEFAULT_TERMINATE_GRACE},
    configuration::TestConfig,
    crypto::Psk,
    error::{HarnessError, Result},
    file_server::FileServer,
    pcap::PcapCapture,
    server::{MockServer, TransmissionParams},
    time::Deadline,
    transport::{dtls::DtlsConfig, TransportConfig},
};

/// Endpoint name the demo client registers with unless overridden.
pub const DEFAULT_ENDPOINT: &str = "urn:dev:os:0023C7-000001";

/// Future returned by [`TestCase::run`].
pub type TestFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Parameters of [`TestContext::set_up`].
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub servers: usize,
    pub bootstrap_server: bool,
    pub auto_register: bool,
    pub auto_deregister: bool,
    pub lifetime: Option<u32>,
    pub endpoint: String,
    /// Secures every server with DTLS-PSK.
    pub psk: Option<Psk>,
    pub transmission_params: Option<TransmissionParams>,
    pub extra_cmdline_args: Vec<String>,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            servers: 1,
            bootstrap_server: false,
            auto_register: true,
            auto_deregister: true,
            lifetime: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            psk: None,
            transmission_params: None,
            extra_cmdline_args: Vec::new(),
        }
    }
}

impl SetupOptions {
    #[must_use]
    pub fn servers(mut self, servers: usize) -> Self {
        self.servers = servers;
        self
    }

    /// Adds a bootstrap server; the client starts with no regular servers
    /// registered and nothing is auto-registered.
    #[must_use]
    pub fn with_bootstrap_server(mut self) -> Self {
        self.bootstrap_server = true;
        self.auto_register = false;
        self
    }

    #[must_use]
    pub fn auto_register(mut self, enabled: bool) -> Self {
        self.auto_register = enabled;
        self
    }

    #[must_use]
    pub fn auto_deregister(mut self, enabled: bool) -> Self {
        self.auto_deregister = enabled;
        self
    }

    #[must_use]
    pub fn lifetime(mut self, lifetime: u32) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    #[must_use]
    pub fn psk(mut self, psk: Psk) -> Self {
        self.psk = Some(psk);
        self
    }

    #[must_use]
    pub fn transmission_params(mut self, params: TransmissionParams) -> Self {
        self.transmission_params = Some(params);
        self
    }

    #[must_use]
    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_cmdline_args
            .extend(args.into_iter().map(Into::into));
        self
    }

    fn transport_config(&self) -> TransportConfig {
        match &self.psk {
            Some(psk) => TransportConfig::dtls(DtlsConfig::psk(psk.clone())),
            None => TransportConfig::plain(),
        }
    }
}

/// One integration test.
pub trait TestCase: Send + Sync {
    /// Suite, usually the module name, e.g. `register`.
    fn suite(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default()
    }

    /// False for tests that cannot run under the memory checker, e.g.
    /// because they depend on tight timing.
    fn memcheck_compatible(&self) -> bool {
        true
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a>;

    fn full_name(&self) -> String {
        format!("{}.{}", self.suite(), self.name())
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Everything one running test owns.
pub struct TestContext {
    config: TestConfig,
    options: SetupOptions,
    log_dir: PathBuf,
    pub servers: Vec<MockServer>,
    pub bootstrap_server: Option<MockServer>,
    client: Option<ClientProcess>,
    pcap: Option<PcapCapture>,
    file_servers: Vec<FileServer>,
    cleanups: Vec<Cleanup>,
}

impl TestContext {
    /// Binds the servers, starts the capture and the client and, with
    /// `auto_register`, completes the initial registration on every server.
    ///
    /// # Errors
    /// Returns the first setup failure; resources acquired so far are
    /// released when the partially built context is dropped.
    pub async fn set_up(config: &TestConfig, test: &dyn TestCase) -> Result<Self> {
        let options = test.setup_options();
        let log_dir = config.test_log_dir(test.suite(), test.name());
        std::fs::create_dir_all(&log_dir)?;

        let mut servers = Vec::with_capacity(options.servers);
        for i in 0..options.servers {
            let mut server = MockServer::bind(&format!("server{}", i + 1), options.transport_config()).await?;
            if let Some(params) = options.transmission_params {
                server.set_transmission_params(params);
            }
            servers.push(server);
        }
        let bootstrap_server = if options.bootstrap_server {
            Some(MockServer::bind("bootstrap", options.transport_config()).await?)
        } else {
            None
        };

        let mut ctx = Self {
            config: config.clone(),
            options,
            log_dir,
            servers,
            bootstrap_server,
            client: None,
            pcap: None,
            file_servers: Vec::new(),
            cleanups: Vec::new(),
        };
        if ctx.config.pcap {
            ctx.start_capture();
        }

        let memcheck = test.memcheck_compatible();
        ctx.start_client(memcheck)?;

        if ctx.options.auto_register {
            let count = ctx.servers.len();
            let mut expectation = RegisterExpectation::default().with_endpoint(&ctx.options.endpoint);
            if let Some(lifetime) = ctx.options.lifetime {
                expectation = expectation.with_lifetime(Some(lifetime));
            }
            for i in 0..count {
                let location = if count == 1 {
                    DEMO_LOCATION.to_string()
                } else {
                    format!("/rd/server{}", i + 1)
                };
                let expectation = expectation.clone().with_location(&location);
                assert_demo_registers(&mut ctx.servers[i], &expectation, Deadline::after(DEFAULT_WAIT)).await?;
            }
        }
        Ok(ctx)
    }

    fn all_ports(&self) -> Vec<u16> {
        self.servers
            .iter()
            .chain(self.bootstrap_server.iter())
            .map(MockServer::port)
            .collect()
    }

    fn start_capture(&mut self) {
        let path = self.log_dir.join("capture.pcap");
        match PcapCapture::start(&path, &self.all_ports()) {
            Ok(capture) => self.pcap = Some(capture),
            Err(e) => log::warn!("Packet capture unavailable: {e}"),
        }
    }

    /// Command line of the demo client for the current servers.
    #[must_use]
    pub fn client_args(&self) -> Vec<String> {
        let mut args = vec!["--endpoint-name".to_string(), self.options.endpoint.clone()];
        if let Some(bootstrap) = &self.bootstrap_server {
            args.extend(["--bootstrap-server-uri".to_string(), bootstrap.uri()]);
        } else {
            for server in &self.servers {
                args.extend(["--server-uri".to_string(), server.uri()]);
            }
        }
        if let Some(lifetime) = self.options.lifetime {
            args.extend(["--lifetime".to_string(), lifetime.to_string()]);
        }
        if let Some(psk) = &self.options.psk {
            args.extend([
                "--identity".to_string(),
                hex::encode(&psk.identity),
                "--key".to_string(),
                psk.key.to_hex(),
            ]);
        }
        args.extend(self.options.extra_cmdline_args.iter().cloned());
        args
    }

    fn start_client(&mut self, memcheck_compatible: bool) -> Result<()> {
        let memcheck = self
            .config
            .memcheck
            .clone()
            .filter(|_| memcheck_compatible)
            .map(|command| MemcheckWrapper {
                command,
                log_path: self.log_dir.join("memcheck.log"),
            });
        let command = ClientCommand::new(&self.config.client_path, self.log_dir.join("client.log"))
            .with_args(self.client_args())
            .with_memcheck(memcheck)
            .with_record(self.config.record);
        self.client = Some(ClientProcess::spawn(command)?);
        Ok(())
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[must_use]
    pub fn options(&self) -> &SetupOptions {
        &self.options
    }

    /// The `index`-th regular server.
    ///
    /// # Errors
    /// Returns `Setup` if there is no such server.
    pub fn server(&mut self, index: usize) -> Result<&mut MockServer> {
        self.servers
            .get_mut(index)
            .ok_or_else(|| HarnessError::Setup(format!("no server #{index}")))
    }

    /// # Errors
    /// Returns `Setup` if the test has no bootstrap server.
    pub fn bootstrap(&mut self) -> Result<&mut MockServer> {
        self.bootstrap_server
            .as_mut()
            .ok_or_else(|| HarnessError::Setup("no bootstrap server".into()))
    }

    /// # Errors
    /// Returns `Setup` once the client was stopped.
    pub fn client(&mut self) -> Result<&mut ClientProcess> {
        self.client
            .as_mut()
            .ok_or_else(|| HarnessError::Setup("client is not running".into()))
    }

    /// Splits the context into the client and a server so a test can drive
    /// both at once.
    ///
    /// # Errors
    /// Returns `Setup` if either is missing.
    pub fn client_and_server(&mut self, index: usize) -> Result<(&mut ClientProcess, &mut MockServer)> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| HarnessError::Setup("client is not running".into()))?;
        let server = self
            .servers
            .get_mut(index)
            .ok_or_else(|| HarnessError::Setup(format!("no server #{index}")))?;
        Ok((client, server))
    }

    /// Binds one more regular server, included in the capture.
    pub async fn add_server(&mut self, config: TransportConfig) -> Result<&mut MockServer> {
        let name = format!("server{}", self.servers.len() + 1);
        let server = MockServer::bind(&name, config).await?;
        if let Some(pcap) = &self.pcap {
            pcap.add_port(server.port());
        }
        self.servers.push(server);
        let last = self.servers.len() - 1;
        self.server(last)
    }

    /// Starts a file server stopped at tear-down.
    pub async fn start_file_server(&mut self, config: TransportConfig) -> Result<&FileServer> {
        let server = FileServer::start(config).await?;
        if let Some(pcap) = &self.pcap {
            pcap.add_port(server.port());
        }
        self.file_servers.push(server);
        self.file_servers
            .last()
            .ok_or_else(|| HarnessError::Setup("file server vanished".into()))
    }

    /// # Errors
    /// Returns `Setup` if no such file server was started.
    pub fn file_server(&self, index: usize) -> Result<&FileServer> {
        self.file_servers
            .get(index)
            .ok_or_else(|| HarnessError::Setup(format!("no file server #{index}")))
    }

    /// Registers a callback run at tear-down, in reverse order.
    pub fn add_cleanup(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Writes a harness note into the client log.
    pub fn note(&self, text: &str) {
        if let Some(client) = &self.client {
            client.note(text);
        }
    }

    /// Stops everything. With `auto_deregister` (and a passing test) the
    /// client is asked to shut down and must deregister from every
    /// registered server first. Logs of passing tests are removed unless
    /// configured otherwise.
    ///
    /// # Errors
    /// Returns the first tear-down failure; later steps still run.
    pub async fn tear_down(mut self, test_passed: bool) -> Result<()> {
        let mut errors: Vec<HarnessError> = Vec::new();

        if test_passed && self.options.auto_deregister {
            if let Err(e) = self.deregister_all().await {
                errors.push(e);
            }
        }

        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.terminate(DEFAULT_TERMINATE_GRACE).await {
                errors.push(e);
            }
        }

        for server in &mut self.servers {
            server.close().await;
        }
        for file_server in self.file_servers.drain(..) {
            if let Err(e) = file_server.stop().await {
                errors.push(e);
            }
        }
        if let Some(pcap) = self.pcap.take() {
            if let Err(e) = pcap.stop().await {
                log::warn!("Capture ended with an error: {e}");
            }
        }
        if let Some(bootstrap) = &mut self.bootstrap_server {
            bootstrap.close().await;
        }
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }

        let passed = test_passed && errors.is_empty();
        if passed && !self.config.keep_success_logs {
            if let Err(e) = std::fs::remove_dir_all(&self.log_dir) {
                log::warn!("Cannot remove {}: {e}", self.log_dir.display());
            }
        }
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn deregister_all(&mut self) -> Result<()> {
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };
        client.shutdown().await?;
        let deadline = Deadline::after(DEFAULT_WAIT);
        for server in &mut self.servers {
            if server.registration().is_registered() {
                assert_demo_deregisters(server, deadline).await?;
            }
        }
        if let Some(client) = self.client.as_mut() {
            client.wait(Deadline::after(Duration::from_secs(5))).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("log_dir", &self.log_dir)
            .field("servers", &self.servers)
            .field("bootstrap_server", &self.bootstrap_server)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PskKey;

    struct Noop;

    impl TestCase for Noop {
        fn suite(&self) -> &'static str {
            "harness"
        }

        fn name(&self) -> &'static str {
            "noop"
        }

        fn setup_options(&self) -> SetupOptions {
            SetupOptions::default()
                .servers(2)
                .auto_register(false)
                .auto_deregister(false)
                .lifetime(30)
                .extra_args(["--verbose"])
        }

        fn run<'a>(&'a self, _ctx: &'a mut TestContext) -> TestFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_setup_options() {
        let options = SetupOptions::default().with_bootstrap_server();
        assert!(options.bootstrap_server);
        assert!(!options.auto_register);

        let psk = Psk::new(b"id", PskKey::from_hex("0011").unwrap());
        let secured = SetupOptions::default().psk(psk).transport_config();
        assert!(secured.dtls.is_some());
        assert_eq!(Noop.full_name(), "harness.noop");
    }

    #[tokio::test]
    async fn test_context_with_cat_client() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-client.sh");
        std::fs::write(&script, "#!/bin/sh\nexec cat\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = TestConfig::new(&script, dir.path().join("log"));
        config.keep_success_logs = true;

        let mut ctx = TestContext::set_up(&config, &Noop).await.unwrap();
        let args = ctx.client_args();
        assert_eq!(args[0], "--endpoint-name");
        assert_eq!(args.iter().filter(|a| *a == "--server-uri").count(), 2);
        assert!(args.contains(&"30".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--verbose"));
        assert!(ctx.server(1).is_ok());
        assert!(ctx.server(2).is_err());
        assert!(ctx.bootstrap().is_err());

        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observed = std::sync::Arc::clone(&flag);
        ctx.add_cleanup(move || observed.store(true, std::sync::atomic::Ordering::Relaxed));

        let log_dir = ctx.log_dir().to_path_buf();
        ctx.tear_down(true).await.unwrap();
        assert!(flag.load(std::sync::atomic::Ordering::Relaxed));
        assert!(log_dir.join("client.log").exists());
    }
}
