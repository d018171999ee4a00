//! The LwM2M client under test, run as a child process.
//!
//! The client reads line commands on stdin and reports on stdout. Every line
//! it prints on stdout or stderr goes to the per-test log file, into a tail
//! ring kept for crash reports, and (stdout only) into a channel scanned by
//! [`ClientProcess::read_until`].

use std::{
    collections::{HashMap, VecDeque},
    fs::{File, OpenOptions},
    io::Write,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    error::{HarnessError, Result},
    time::{log_timestamp, Deadline},
    transport::TransportError,
};

/// Lines kept for crash reports.
pub const TAIL_LINES: usize = 100;

/// Exit code the memory checker is told to use when it found errors.
pub const MEMCHECK_ERROR_EXITCODE: i32 = 63;

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long output readers may keep draining after the client exited.
/// A grandchild holding stdout open would otherwise block tear-down.
pub const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Memory-checker wrapper, e.g. `valgrind --leak-check=full`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemcheckWrapper {
    pub command: Vec<String>,
    pub log_path: PathBuf,
}

/// How to launch the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub memcheck: Option<MemcheckWrapper>,
    /// Run under `rr record`.
    pub record: bool,
}

impl ClientCommand {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_path: log_path.into(),
            memcheck: None,
            record: false,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_memcheck(mut self, memcheck: Option<MemcheckWrapper>) -> Self {
        self.memcheck = memcheck;
        self
    }

    #[must_use]
    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Full argument vector including wrappers.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if self.record {
            argv.extend(["rr".to_string(), "record".to_string()]);
        }
        if let Some(memcheck) = &self.memcheck {
            argv.extend(memcheck.command.iter().cloned());
            argv.push(format!("--log-file={}", memcheck.log_path.display()));
            argv.push(format!("--error-exitcode={MEMCHECK_ERROR_EXITCODE}"));
        }
        argv.push(self.program.display().to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

type SharedLog = Arc<Mutex<File>>;
type Tail = Arc<Mutex<VecDeque<String>>>;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running client process.
pub struct ClientProcess {
    command: ClientCommand,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::UnboundedReceiver<String>,
    log: SharedLog,
    tail: Tail,
    readers: Vec<JoinHandle<()>>,
}

impl ClientProcess {
    /// Spawns the client with piped stdio.
    ///
    /// # Errors
    /// Returns `ClientSpawnFailed` if the log cannot be created or the
    /// program cannot be started.
    pub fn spawn(command: ClientCommand) -> Result<Self> {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&command.log_path)
            .map_err(|e| {
                HarnessError::ClientSpawnFailed(format!("{}: {e}", command.log_path.display()))
            })?;
        let argv = command.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(HarnessError::ClientSpawnFailed("empty command line".into()));
        };
        log::info!("Starting client: {}", argv.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarnessError::ClientSpawnFailed(format!("{program}: {e}")))?;

        let log = Arc::new(Mutex::new(log_file));
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let (tx, lines) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Some(tx), Arc::clone(&log), Arc::clone(&tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, None, Arc::clone(&log), Arc::clone(&tail)));
        }

        Ok(Self {
            stdin: child.stdin.take(),
            command,
            child,
            lines,
            log,
            tail,
            readers,
        })
    }

    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[must_use]
    pub fn command(&self) -> &ClientCommand {
        &self.command
    }

    /// Last lines printed by the client.
    #[must_use]
    pub fn tail(&self) -> String {
        locked(&self.tail)
            .iter()
            .fold(String::new(), |acc, line| acc + line + "\n")
    }

    /// Writes a timestamped harness note into the client log.
    pub fn note(&self, text: &str) {
        let mut log = locked(&self.log);
        if let Err(e) = writeln!(log, "[harness {}] {text}", log_timestamp()) {
            log::warn!("Cannot write to client log: {e}");
        }
    }

    /// Sends one command line.
    ///
    /// # Errors
    /// Returns `ClientCrashed` if the client has exited.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        self.check_alive()?;
        log::debug!("Client command: {command}");
        self.note(&format!("command: {command}"));
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(HarnessError::Setup("client stdin is closed".into()));
        };
        let written = async {
            stdin.write_all(command.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if written.is_err() {
            // a broken pipe means the client is gone
            self.check_alive()?;
        }
        Ok(written?)
    }

    /// Reads stdout lines until one matches `pattern`; returns its capture
    /// groups, group 0 being the whole match.
    ///
    /// # Errors
    /// `Timeout` if the deadline passes, `ClientCrashed` if the output ends.
    pub async fn read_until(&mut self, pattern: &Regex, deadline: Deadline) -> Result<Vec<String>> {
        loop {
            let line = self.next_line(deadline).await?;
            if let Some(captures) = pattern.captures(&line) {
                return Ok(captures
                    .iter()
                    .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                    .collect());
            }
        }
    }

    async fn next_line(&mut self, deadline: Deadline) -> Result<String> {
        match tokio::time::timeout_at(deadline.instant(), self.lines.recv()).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => {
                let status = self.child.wait().await?;
                Err(self.crash_report(status))
            }
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }

    /// Sends a command and optionally waits for a matching output line.
    pub async fn communicate(
        &mut self,
        command: &str,
        pattern: Option<&Regex>,
        deadline: Deadline,
    ) -> Result<Option<Vec<String>>> {
        self.send_command(command).await?;
        match pattern {
            Some(pattern) => self.read_until(pattern, deadline).await.map(Some),
            None => Ok(None),
        }
    }

    /// Sends a command and collects its `KEY==value` reply lines up to `END`.
    pub async fn query(&mut self, command: &str, deadline: Deadline) -> Result<HashMap<String, String>> {
        self.send_command(command).await?;
        let mut values = HashMap::new();
        loop {
            let line = self.next_line(deadline).await?;
            if line.trim() == "END" {
                return Ok(values);
            }
            if let Some((key, value)) = parse_key_value(&line) {
                values.insert(key.to_string(), value.to_string());
            }
        }
    }

    /// Sends a command and waits for the single `KEY==value` line.
    pub async fn query_value(&mut self, command: &str, key: &str, deadline: Deadline) -> Result<String> {
        self.send_command(command).await?;
        loop {
            let line = self.next_line(deadline).await?;
            if let Some((k, value)) = parse_key_value(&line) {
                if k == key {
                    return Ok(value.to_string());
                }
            }
        }
    }

    /// Fails with `ClientCrashed` if the process has exited.
    ///
    /// # Errors
    /// Returns `ClientCrashed` with the output tail.
    pub fn check_alive(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            Some(status) => Err(self.crash_report(status)),
            None => Ok(()),
        }
    }

    fn crash_report(&self, status: ExitStatus) -> HarnessError {
        HarnessError::ClientCrashed {
            status: describe_status(status),
            tail: self.tail(),
            memcheck_log: self.memcheck_log(),
        }
    }

    fn memcheck_log(&self) -> Option<String> {
        let path = &self.command.memcheck.as_ref()?.log_path;
        std::fs::read_to_string(path).ok()
    }

    /// Closes stdin and waits for the client to exit on its own.
    pub async fn wait(&mut self, deadline: Deadline) -> Result<ExitStatus> {
        self.stdin = None;
        let status = tokio::time::timeout_at(deadline.instant(), self.child.wait())
            .await
            .map_err(|_| HarnessError::from(TransportError::Timeout))??;
        self.join_readers().await;
        Ok(status)
    }

    /// Stops the client: SIGTERM, then SIGKILL after `grace`. An exit caused
    /// by SIGTERM or SIGKILL is normal; any other failure is a crash.
    ///
    /// # Errors
    /// Returns `ClientCrashed` if the client died abnormally or the memory
    /// checker reported errors.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        let status = match self.child.try_wait()? {
            Some(status) => status,
            None => {
                if let Some(pid) = self.child.id() {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        log::warn!("Cannot send SIGTERM to client {pid}: {e}");
                    }
                }
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        log::warn!("Client ignored SIGTERM for {grace:?}, killing it");
                        self.child.kill().await?;
                        self.child.wait().await?
                    }
                }
            }
        };
        self.stdin = None;
        self.join_readers().await;
        log::info!("Client exited: {}", describe_status(status));
        self.note(&format!("client exited: {}", describe_status(status)));

        let by_signal = matches!(status.signal(), Some(s) if s == Signal::SIGTERM as i32 || s == Signal::SIGKILL as i32);
        if status.success() || by_signal {
            Ok(status)
        } else {
            Err(self.crash_report(status))
        }
    }

    async fn join_readers(&mut self) {
        let deadline = tokio::time::Instant::now() + READER_DRAIN_TIMEOUT;
        for mut reader in self.readers.drain(..) {
            match tokio::time::timeout_at(deadline, &mut reader).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Client output reader failed: {e}"),
                Err(_) => {
                    log::warn!("Client output still open after {READER_DRAIN_TIMEOUT:?}, dropping it");
                    reader.abort();
                }
            }
        }
    }

    // Command channel helpers.

    pub async fn send_update(&mut self, server_index: Option<usize>) -> Result<()> {
        match server_index {
            Some(i) => self.send_command(&format!("send-update {i}")).await,
            None => self.send_command("send-update").await,
        }
    }

    pub async fn enter_offline(&mut self) -> Result<()> {
        self.send_command("enter-offline").await
    }

    pub async fn exit_offline(&mut self) -> Result<()> {
        self.send_command("exit-offline").await
    }

    pub async fn reconnect(&mut self) -> Result<()> {
        self.send_command("reconnect").await
    }

    pub async fn trim_servers(&mut self, count: usize) -> Result<()> {
        self.send_command(&format!("trim-servers {count}")).await
    }

    pub async fn add_server(&mut self, uri: &str) -> Result<()> {
        self.send_command(&format!("add-server {uri}")).await
    }

    pub async fn notify(&mut self, path: &str) -> Result<()> {
        self.send_command(&format!("notify {path}")).await
    }

    pub async fn unregister_object(&mut self, oid: u16) -> Result<()> {
        self.send_command(&format!("unregister-object {oid}")).await
    }

    /// Starts a download of `uri` into `target`, optionally over DTLS-PSK.
    pub async fn download(&mut self, uri: &str, target: &Path, psk: Option<(&str, &str)>) -> Result<()> {
        let mut command = format!("download {uri} {}", target.display());
        if let Some((identity, key)) = psk {
            command.push_str(&format!(" {identity} {key}"));
        }
        self.send_command(&command).await
    }

    /// Graceful shutdown: the client deregisters and exits.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.send_command("shutdown").await
    }

    /// Number of sockets the client currently has open.
    pub async fn socket_count(&mut self, deadline: Deadline) -> Result<usize> {
        let value = self.query_value("socket-count", "SOCKET_COUNT", deadline).await?;
        value
            .trim()
            .parse()
            .map_err(|_| HarnessError::assertion(format!("bad socket count {value:?}")))
    }

    /// Local port of the client's `index`-th socket.
    pub async fn get_port(&mut self, index: usize, deadline: Deadline) -> Result<u16> {
        let value = self
            .query_value(&format!("get-port {index}"), "PORT", deadline)
            .await?;
        value
            .trim()
            .parse()
            .map_err(|_| HarnessError::assertion(format!("bad port {value:?}")))
    }
}

impl std::fmt::Debug for ClientProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProcess")
            .field("command", &self.command)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

/// Splits a `KEY==value` line.
#[must_use]
pub fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once("==")?;
    let key = key.trim();
    (!key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        .then_some((key, value))
}

fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => match Signal::try_from(signal) {
            Ok(sig) => format!("killed by {sig}"),
            Err(_) => format!("killed by signal {signal}"),
        },
        (None, None) => status.to_string(),
    }
}

fn spawn_reader<R>(
    stream: R,
    lines: Option<mpsc::UnboundedSender<String>>,
    log: SharedLog,
    tail: Tail,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Reading client output failed: {e}");
                    break;
                }
            };
            if let Err(e) = writeln!(locked(&log), "{line}") {
                log::warn!("Cannot write to client log: {e}");
            }
            {
                let mut tail = locked(&tail);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
            }
            if let Some(tx) = &lines {
                // the receiver is dropped once the test stops reading
                let _ = tx.send(line);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        const TEST_CASES: &[(&str, Option<(&str, &str)>)] = &[
            ("PORT==5683", Some(("PORT", "5683"))),
            ("SOCKET_COUNT==2", Some(("SOCKET_COUNT", "2"))),
            ("EMPTY==", Some(("EMPTY", ""))),
            ("a b==c", None),
            ("no separator", None),
            ("==value", None),
        ];
        for &(line, expected) in TEST_CASES {
            assert_eq!(parse_key_value(line), expected, "line {line:?}");
        }
    }

    #[test]
    fn test_argv_with_wrappers() {
        let plain = ClientCommand::new("/bin/demo", "/tmp/log").with_args(["-e", "urn:dev"]);
        assert_eq!(plain.argv(), vec!["/bin/demo", "-e", "urn:dev"]);

        let wrapped = plain
            .clone()
            .with_record(true)
            .with_memcheck(Some(MemcheckWrapper {
                command: vec!["valgrind".into(), "--leak-check=full".into()],
                log_path: "/tmp/vg.log".into(),
            }));
        assert_eq!(
            wrapped.argv(),
            vec![
                "rr",
                "record",
                "valgrind",
                "--leak-check=full",
                "--log-file=/tmp/vg.log",
                "--error-exitcode=63",
                "/bin/demo",
                "-e",
                "urn:dev"
            ]
        );
    }

    #[tokio::test]
    async fn test_command_channel_with_cat() {
        let dir = tempfile::tempdir().unwrap();
        let command = ClientCommand::new("/bin/sh", dir.path().join("client.log"))
            .with_args(["-c", "cat"]);
        let mut client = ClientProcess::spawn(command).unwrap();

        let deadline = Deadline::after(Duration::from_secs(5));
        let pattern = Regex::new(r"^hello (\w+)$").unwrap();
        let groups = client
            .communicate("hello world", Some(&pattern), deadline)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(groups, vec!["hello world", "world"]);

        let port = client.query_value("PORT==1234", "PORT", deadline).await.unwrap();
        assert_eq!(port, "1234");

        client.terminate(Duration::from_secs(2)).await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("client.log")).unwrap();
        assert!(log.contains("hello world"));
        assert!(log.contains("[harness "));
        assert!(client.tail().contains("PORT==1234"));
    }

    #[tokio::test]
    async fn test_terminate_does_not_wait_for_inherited_output() {
        let dir = tempfile::tempdir().unwrap();
        let command = ClientCommand::new("/bin/sh", dir.path().join("client.log"))
            .with_args(["-c", "sleep 30 & cat; wait"]);
        let mut client = ClientProcess::spawn(command).unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(10), client.terminate(Duration::from_secs(1))).await;
        assert!(stopped.is_ok(), "terminate blocked on a background process holding stdout");
        assert!(client.readers.is_empty());
    }

    #[tokio::test]
    async fn test_crash_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let command = ClientCommand::new("/bin/sh", dir.path().join("client.log"))
            .with_args(["-c", "echo dying; exit 3"]);
        let mut client = ClientProcess::spawn(command).unwrap();
        let pattern = Regex::new("never printed").unwrap();
        let err = client
            .read_until(&pattern, Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap_err();
        match err {
            HarnessError::ClientCrashed { status, tail, .. } => {
                assert_eq!(status, "exit code 3");
                assert!(tail.contains("dying"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
