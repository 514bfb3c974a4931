//! Shared test utilities and fixtures
//!
//! A scripted in-memory language server, a provider and factory that
//! launch it, and callbacks that record what the runtime reports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use berth_lsp::{
    ClientCallbacks, ConnectionProvider, FileIdentity, LanguageMapping, OpenDocument, Project, ServerDefinition,
    ServerError, ServerFactory, ServerStatus, TextBuffer, Transport,
};
use berth_lsp::codec::{MessageReader, MessageWriter};
use berth_lsp::position::{LineIndex, byte_index, range_to_offsets};
use berth_lsp::transport::LaunchConfig;
use futures_util::future::BoxFuture;
use lsp_types::{Diagnostic, MessageType};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

/// How the fake server answers.
#[derive(Debug, Clone)]
pub struct Script {
    pub capabilities: Value,
    /// Never answer `initialize`.
    pub hang_initialize: bool,
    pub initialize_error: Option<(i64, String)>,
    /// Results for other requests by method; unlisted requests get `null`.
    pub responses: HashMap<String, Value>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: json!({ "textDocumentSync": 2 }),
            hang_initialize: false,
            initialize_error: None,
            responses: HashMap::new(),
        }
    }
}

/// Everything the fake servers of one definition saw, across restarts.
#[derive(Default)]
pub struct FakeState {
    pub script: Mutex<Script>,
    received: Mutex<Vec<Value>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    failures_left: AtomicUsize,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    next_request_id: AtomicUsize,
}

impl FakeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capabilities(capabilities: Value) -> Arc<Self> {
        let state = Self::new();
        state.script.lock().capabilities = capabilities;
        state
    }

    /// The next `count` starts fail before any stream exists.
    pub fn fail_next_starts(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Close the current server's streams without `exit`.
    pub fn crash(&self) {
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Methods of every request and notification received, in order.
    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(String::from))
            .collect()
    }

    /// Params of every message with `method`.
    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .map(|m| m.get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.params_of(method).len()
    }

    /// The server's copy of `uri`: the last `didOpen` text with every
    /// later `didChange` applied in arrival order.
    pub fn server_text(&self, uri: &str) -> Option<String> {
        let mut text = None;
        for message in self.received() {
            let params = &message["params"];
            if params["textDocument"]["uri"] != uri {
                continue;
            }
            match message["method"].as_str() {
                Some("textDocument/didOpen") => {
                    text = params["textDocument"]["text"].as_str().map(String::from);
                }
                Some("textDocument/didChange") => {
                    let current = text.as_deref()?;
                    text = Some(apply_content_changes(current, &params["contentChanges"]));
                }
                _ => {}
            }
        }
        text
    }

    /// The client's answer to a request this server sent.
    pub fn response_to(&self, id: u64) -> Option<Value> {
        self.received()
            .into_iter()
            .find(|m| m.get("method").is_none() && m.get("id").and_then(Value::as_u64) == Some(id))
    }

    /// Send a server-initiated request; returns its id.
    pub fn send_request(&self, method: &str, params: Value) -> u64 {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst) as u64 + 1000;
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }));
        id
    }

    pub fn send_notification(&self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }));
    }

    fn send(&self, frame: Value) {
        let outbound = self.outbound.lock();
        let sent = outbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok());
        assert!(sent, "no fake server is running");
    }

    fn reply(&self, method: &str, id: &Value) -> Option<Value> {
        let script = self.script.lock();
        match method {
            "initialize" if script.hang_initialize => None,
            "initialize" => Some(match &script.initialize_error {
                Some((code, message)) => json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": { "code": code, "message": message },
                }),
                None => json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": { "capabilities": script.capabilities, "serverInfo": { "name": "fake" } },
                }),
            }),
            other => Some(json!({
                "jsonrpc": "2.0", "id": id,
                "result": script.responses.get(other).cloned().unwrap_or(Value::Null),
            })),
        }
    }
}

async fn serve(
    state: Arc<FakeState>,
    stream: DuplexStream,
    mut kill: oneshot::Receiver<()>,
    mut outbound: mpsc::UnboundedReceiver<Value>,
) {
    let (read, write) = tokio::io::split(stream);
    let mut writer = MessageWriter::new(write);
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        let mut reader = MessageReader::new(read);
        while let Ok(Some(frame)) = reader.read_frame().await {
            if inbound_tx.send(frame).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut kill => break,
            Some(frame) = outbound.recv() => {
                if writer.write_value(&frame).await.is_err() {
                    break;
                }
            }
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                state.received.lock().push(frame.clone());
                let method = frame.get("method").and_then(Value::as_str).map(String::from);
                match (method.as_deref(), frame.get("id")) {
                    (Some("exit"), None) => break,
                    (Some(method), Some(id)) => {
                        if let Some(reply) = state.reply(method, id)
                            && writer.write_value(&reply).await.is_err()
                        {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    reader_task.abort();
}

pub struct FakeProvider {
    state: Arc<FakeState>,
    running: bool,
}

impl ConnectionProvider for FakeProvider {
    fn start(&mut self) -> BoxFuture<'_, anyhow::Result<Transport>> {
        Box::pin(async move {
            self.state.starts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .state
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                bail!("fake-server: command not found");
            }

            let (client, server) = tokio::io::duplex(1 << 20);
            let (kill_tx, kill_rx) = oneshot::channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            *self.state.kill.lock() = Some(kill_tx);
            *self.state.outbound.lock() = Some(out_tx);
            tokio::spawn(serve(Arc::clone(&self.state), server, kill_rx, out_rx));
            self.running = true;

            let (read, write) = tokio::io::split(client);
            Ok(Transport::new(read, write))
        })
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_alive(&mut self) -> bool {
        self.running
    }

    fn pid(&self) -> Option<u32> {
        self.running.then_some(4242)
    }
}

pub struct FakeFactory {
    pub state: Arc<FakeState>,
}

impl ServerFactory for FakeFactory {
    fn connection_provider(&self, _definition: &ServerDefinition, _project: &Project) -> Box<dyn ConnectionProvider> {
        Box::new(FakeProvider {
            state: Arc::clone(&self.state),
            running: false,
        })
    }
}

/// A definition for `.rs` files served by `state`.
pub fn fake_definition(id: &str, state: &Arc<FakeState>) -> ServerDefinition {
    ServerDefinition::new(
        id,
        LaunchConfig {
            command: "fake-server".into(),
            include_system_env: true,
            ..LaunchConfig::default()
        },
    )
    .with_mappings(vec![LanguageMapping::new("rust").with_extensions(["rs"])])
    .with_factory(Arc::new(FakeFactory {
        state: Arc::clone(state),
    }))
    .with_initialize_timeout(Duration::from_secs(2))
    .with_request_timeout(Duration::from_secs(2))
}

pub fn file(path: &str) -> FileIdentity {
    FileIdentity::from_uri(&format!("file://{path}")).unwrap()
}

pub fn document(path: &str, text: &str, project: &Arc<Project>) -> OpenDocument {
    OpenDocument::new(file(path), TextBuffer::new(text), Arc::clone(project))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(String, ServerStatus),
    Diagnostics(String, Url, Vec<Diagnostic>),
    Log(String, String),
    ServerError(String, ServerError),
    InternalError(String, String),
}

#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<Event>>,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Status(_, status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn server_errors(&self) -> Vec<ServerError> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::ServerError(_, error) => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn internal_errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::InternalError(_, message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn diagnostics(&self) -> Vec<(Url, Vec<Diagnostic>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Diagnostics(_, uri, items) => Some((uri, items)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl ClientCallbacks for RecordingCallbacks {
    fn on_diagnostics(&self, server: &str, uri: &Url, diagnostics: &[Diagnostic]) {
        self.push(Event::Diagnostics(server.into(), uri.clone(), diagnostics.to_vec()));
    }

    fn on_log_message(&self, server: &str, _kind: MessageType, message: &str) {
        self.push(Event::Log(server.into(), message.into()));
    }

    fn on_status_changed(&self, server: &str, status: ServerStatus) {
        self.push(Event::Status(server.into(), status));
    }

    fn on_server_error(&self, server: &str, error: &ServerError) {
        self.push(Event::ServerError(server.into(), error.clone()));
    }

    fn on_internal_error(&self, server: &str, message: &str) {
        self.push(Event::InternalError(server.into(), message.into()));
    }
}

/// Apply `contentChanges` to `text` as a server would.
pub fn apply_content_changes(text: &str, changes: &Value) -> String {
    let mut text = text.to_string();
    for change in changes.as_array().into_iter().flatten() {
        let replacement = change["text"].as_str().unwrap_or_default();
        if change["range"].is_null() {
            text = replacement.to_string();
            continue;
        }
        let index = LineIndex::new(&text);
        let range: lsp_types::Range = serde_json::from_value(change["range"].clone()).unwrap();
        let offsets = range_to_offsets(&index, &range).unwrap();
        let start = byte_index(&text, offsets.start);
        let end = byte_index(&text, offsets.end);
        text.replace_range(start..end, replacement);
    }
    text
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
