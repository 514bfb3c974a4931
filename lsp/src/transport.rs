//! Transport launchers: bring a language server up and hand back its byte
//! streams.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use url::Url;

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Receives server log output (stderr lines, socket errors).
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Raw byte streams to one server.
pub struct Transport {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Transport {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Starts and stops one server instance. The runtime treats it as opaque.
pub trait ConnectionProvider: Send {
    fn start(&mut self) -> BoxFuture<'_, Result<Transport>>;

    /// Release the process or socket. Must not block.
    fn stop(&mut self);

    fn is_alive(&mut self) -> bool;

    fn pid(&self) -> Option<u32> {
        None
    }

    fn command_line(&self) -> Option<String> {
        None
    }

    fn initialization_options(&self, _root: Option<&Url>) -> Option<Value> {
        None
    }

    fn set_log_sink(&mut self, _sink: LogSink) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Stdio,
    /// Connect to `host:port`, after spawning the command if there is one.
    Tcp(String),
}

/// How to launch a server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaunchConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub include_system_env: bool,
    pub transport: TransportKind,
    pub initialization_options: Option<Value>,
}

impl LaunchConfig {
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Child process ────────────────────────────────────────────────────────

/// Runs the server as a child process and talks to it over stdin/stdout.
pub struct ProcessProvider {
    server: String,
    config: LaunchConfig,
    cwd: Option<PathBuf>,
    child: Option<Child>,
    log_sink: Option<LogSink>,
}

impl ProcessProvider {
    pub fn new(server: impl Into<String>, config: LaunchConfig, cwd: Option<PathBuf>) -> Self {
        Self {
            server: server.into(),
            config,
            cwd,
            child: None,
            log_sink: None,
        }
    }

    fn spawn(&mut self, stdio: bool) -> Result<&mut Child> {
        let resolved = which::which(&self.config.command)
            .with_context(|| format!("{} not found in PATH", self.config.command))?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&self.config.args)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if stdio {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null()).stdout(Stdio::null());
        }
        if !self.config.include_system_env {
            cmd.env_clear();
        }
        cmd.envs(&self.config.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.config.command))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(self.server.clone(), stderr, self.log_sink.clone());
        }
        Ok(self.child.insert(child))
    }
}

fn drain_stderr(
    server: String,
    stderr: impl AsyncRead + Send + Unpin + 'static,
    sink: Option<LogSink>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %server, "{line}");
                    if let Some(sink) = &sink {
                        sink(&line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::trace!(server = %server, "stderr closed: {e}");
                    break;
                }
            }
        }
    });
}

impl ConnectionProvider for ProcessProvider {
    fn start(&mut self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            self.stop();
            let child = self.spawn(true)?;
            let stdout = child.stdout.take().context("no stdout from child")?;
            let stdin = child.stdin.take().context("no stdin from child")?;
            Ok(Transport::new(stdout, stdin))
        })
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!(server = %self.server, "kill failed: {e}");
        }
    }

    fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn command_line(&self) -> Option<String> {
        Some(self.config.command_line())
    }

    fn initialization_options(&self, _root: Option<&Url>) -> Option<Value> {
        self.config.initialization_options.clone()
    }

    fn set_log_sink(&mut self, sink: LogSink) {
        self.log_sink = Some(sink);
    }
}

// ── Socket ───────────────────────────────────────────────────────────────

/// Talks to the server over TCP. When a command is configured the process
/// is spawned first and the connection retried while it comes up.
pub struct SocketProvider {
    address: String,
    process: Option<ProcessProvider>,
    connected: bool,
    initialization_options: Option<Value>,
    log_sink: Option<LogSink>,
}

impl SocketProvider {
    pub fn new(address: impl Into<String>, process: Option<ProcessProvider>) -> Self {
        let initialization_options = process
            .as_ref()
            .and_then(|p| p.config.initialization_options.clone());
        Self {
            address: address.into(),
            process,
            connected: false,
            initialization_options,
            log_sink: None,
        }
    }

    #[must_use]
    pub fn with_initialization_options(mut self, options: Option<Value>) -> Self {
        self.initialization_options = options;
        self
    }
}

impl ConnectionProvider for SocketProvider {
    fn start(&mut self) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            self.stop();
            let attempts = match &mut self.process {
                Some(process) => {
                    process.spawn(false)?;
                    CONNECT_ATTEMPTS
                }
                None => 1,
            };

            let mut last_error = None;
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                match TcpStream::connect(&self.address).await {
                    Ok(stream) => {
                        self.connected = true;
                        let (reader, writer) = stream.into_split();
                        return Ok(Transport::new(reader, writer));
                    }
                    Err(e) => last_error = Some(e),
                }
            }
            let message = match last_error {
                Some(e) => format!("cannot connect to {}: {e}", self.address),
                None => format!("cannot connect to {}", self.address),
            };
            if let Some(sink) = &self.log_sink {
                sink(&message);
            }
            bail!(message)
        })
    }

    fn stop(&mut self) {
        self.connected = false;
        if let Some(process) = &mut self.process {
            process.stop();
        }
    }

    fn is_alive(&mut self) -> bool {
        match &mut self.process {
            Some(process) => self.connected && process.is_alive(),
            None => self.connected,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ConnectionProvider::pid)
    }

    fn command_line(&self) -> Option<String> {
        match &self.process {
            Some(process) => process.command_line(),
            None => Some(format!("tcp://{}", self.address)),
        }
    }

    fn initialization_options(&self, _root: Option<&Url>) -> Option<Value> {
        self.initialization_options.clone()
    }

    fn set_log_sink(&mut self, sink: LogSink) {
        if let Some(process) = &mut self.process {
            process.set_log_sink(Arc::clone(&sink));
        }
        self.log_sink = Some(sink);
    }
}
