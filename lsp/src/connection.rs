//! Server connection: one server definition running for one project.
//!
//! ```text
//!   None ──start()──▶ Starting ──initialize ok──▶ Started
//!                        │                           │
//!                        │ failure                   │ stop() / idle / crash
//!                        ▼                           ▼
//!                     Stopping ──teardown done──▶ Stopped ──start()──▶ Starting
//! ```
//!
//! Every start creates a fresh run: provider, RPC session, notification
//! dispatcher and init signal. `stop()` detaches the run synchronously
//! and tears it down on a background task, so a restart never waits for
//! the previous process to exit. A failed start or an unexpected exit is
//! recorded as the connection's [`ServerError`] until the next successful
//! start.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use lsp_types::{
    Diagnostic, LogMessageParams, MessageType, Registration, RegistrationParams, ShowMessageParams,
    UnregistrationParams,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use url::Url;

use crate::callbacks::ClientCallbacks;
use crate::capabilities::{CapabilityState, Feature, ServerCapabilities};
use crate::config::{RuntimeMode, RuntimeSettings};
use crate::definition::ServerDefinition;
use crate::diagnostics::{DiagnosticsStore, validate};
use crate::dispatch::{Dispatcher, InitSignal};
use crate::error::{ConnectError, RegistrationError, RpcError, ServerError};
use crate::notifier::ErrorNotifier;
use crate::protocol::{
    ResponseError, WorkspaceFolder, did_change_watched_files_params, execute_command_params,
    file_operation_params, initialize_params, normalize_uri, rename_files_params,
};
use crate::rpc::{InboundHandler, RpcSession, Termination};
use crate::signal::Signal;
use crate::sync::{DocumentSynchronizer, SyncChannel};
use crate::transport::{ConnectionProvider, LogSink};
use crate::watchers::{FileChangeKind, FileOperation};
use crate::workspace::{FileIdentity, OpenDocument, Project};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerStatus {
    #[default]
    None,
    Starting,
    Started,
    Stopping,
    Stopped,
}

type SharedProvider = Arc<tokio::sync::Mutex<Box<dyn ConnectionProvider>>>;

/// One start of the server.
struct Running {
    generation: u64,
    init: InitSignal,
    dispatcher: Dispatcher,
    dispatcher_task: JoinHandle<()>,
    start_task: JoinHandle<()>,
    provider: SharedProvider,
    /// Shared with this run's synchronizers; cleared when stopping begins.
    alive: Arc<AtomicBool>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.start_task.abort();
        self.dispatcher_task.abort();
    }
}

/// A document routed to this connection.
pub struct ConnectedDocument {
    document: OpenDocument,
    sync: Arc<DocumentSynchronizer>,
}

impl ConnectedDocument {
    pub fn document(&self) -> &OpenDocument {
        &self.document
    }

    pub fn synchronizer(&self) -> &Arc<DocumentSynchronizer> {
        &self.sync
    }
}

fn document_key(file: &FileIdentity) -> Result<String, ConnectError> {
    normalize_uri(file.key()).ok_or_else(|| ConnectError::InvalidUri(file.to_string()))
}

/// Spawn on the ambient runtime, if there is one.
fn spawn_detached<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            tracing::warn!("No Tokio runtime; background task dropped");
            None
        }
    }
}

pub struct ServerConnection {
    definition: Arc<ServerDefinition>,
    project: Arc<Project>,
    settings: RuntimeSettings,
    callbacks: Arc<dyn ClientCallbacks>,
    notifier: Arc<ErrorNotifier>,

    status: RwLock<ServerStatus>,
    server_error: RwLock<Option<ServerError>>,
    run: Mutex<Option<Running>>,
    generation: AtomicU64,
    failed_starts: AtomicU32,

    capabilities: RwLock<Option<CapabilityState>>,
    documents: RwLock<HashMap<String, ConnectedDocument>>,
    /// Serializes the check-and-insert half of `connect`.
    connect_lock: Mutex<()>,
    /// Highest version sent per URI, kept across disconnects.
    versions: Mutex<HashMap<String, i32>>,
    diagnostics: Mutex<DiagnosticsStore>,

    keep_alive: AtomicUsize,
    pinned: AtomicBool,
    /// Armed idle timer, tagged with the number it was armed under.
    idle_timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    idle_timers: AtomicU64,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server", &self.definition.id())
            .field("project", &self.project.id())
            .field("status", &self.status())
            .field("documents", &self.documents.read().len())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    pub fn new(
        definition: Arc<ServerDefinition>,
        project: Arc<Project>,
        callbacks: Arc<dyn ClientCallbacks>,
        notifier: Arc<ErrorNotifier>,
        settings: RuntimeSettings,
    ) -> Arc<Self> {
        let callbacks = definition
            .factory()
            .client_callbacks(&definition, &project, callbacks);
        Arc::new(Self {
            definition,
            project,
            settings,
            callbacks,
            notifier,
            status: RwLock::new(ServerStatus::None),
            server_error: RwLock::new(None),
            run: Mutex::new(None),
            generation: AtomicU64::new(0),
            failed_starts: AtomicU32::new(0),
            capabilities: RwLock::new(None),
            documents: RwLock::new(HashMap::new()),
            connect_lock: Mutex::new(()),
            versions: Mutex::new(HashMap::new()),
            diagnostics: Mutex::new(DiagnosticsStore::new()),
            keep_alive: AtomicUsize::new(0),
            pinned: AtomicBool::new(false),
            idle_timer: Mutex::new(None),
            idle_timers: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        self.definition.id()
    }

    pub fn definition(&self) -> &Arc<ServerDefinition> {
        &self.definition
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    /// Why the last start failed or the server went away, until the next
    /// successful start.
    pub fn server_error(&self) -> Option<ServerError> {
        self.server_error.read().clone()
    }

    /// Consecutive failed starts, including unexpected exits.
    pub fn failed_starts(&self) -> u32 {
        self.failed_starts.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        let run = self.run.lock();
        let provider = run.as_ref()?.provider.try_lock().ok()?;
        provider.pid()
    }

    /// Singleton servers take any file. Others take files of their own
    /// project, or any file while nothing is connected yet.
    pub fn can_operate(&self, document: &OpenDocument) -> bool {
        self.definition.is_singleton()
            || self.project.same(document.project())
            || self.documents.read().is_empty()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Start the server if it is not running and wait for initialization.
    /// Concurrent callers share one start. Returns `None` if the definition
    /// is disabled or the start failed; see [`server_error`].
    ///
    /// [`server_error`]: Self::server_error
    pub async fn start(self: &Arc<Self>) -> Option<LanguageServerHandle> {
        let init = self.ensure_started()?;
        let session = init.wait().await.ok()?;
        self.handle(session)
    }

    /// Begin a start unless one is running. Returns the run's init signal.
    fn ensure_started(self: &Arc<Self>) -> Option<InitSignal> {
        if !self.definition.is_enabled_for(&self.project) {
            return None;
        }
        let init = {
            let mut run = self.run.lock();
            if let Some(running) = run.as_ref() {
                return Some(running.init.clone());
            }
            // Reaching this point with the counter at the limit means the
            // definition was re-enabled explicitly.
            if self.failed_starts() >= self.definition.max_restart_attempts() {
                self.failed_starts.store(0, Ordering::Release);
            }

            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let init: InitSignal = Signal::new();

            let mut provider = self
                .definition
                .factory()
                .connection_provider(&self.definition, &self.project);
            provider.set_log_sink(self.log_sink());
            let provider: SharedProvider = Arc::new(tokio::sync::Mutex::new(provider));

            // The run lock is held until `Running` is stored, so the task
            // cannot observe a half-built run.
            let start_task = spawn_detached(Arc::clone(self).run_start(
                generation,
                init.clone(),
                Arc::clone(&provider),
            ))?;
            let (dispatcher, dispatcher_task) = Dispatcher::spawn(self.id().to_string(), init.clone());
            *run = Some(Running {
                generation,
                init: init.clone(),
                dispatcher,
                dispatcher_task,
                start_task,
                provider,
                alive: Arc::new(AtomicBool::new(true)),
            });
            *self.status.write() = ServerStatus::Starting;
            init
        };
        self.emit_status(ServerStatus::Starting);
        Some(init)
    }

    fn log_sink(&self) -> LogSink {
        let callbacks = Arc::clone(&self.callbacks);
        let server = self.id().to_string();
        Arc::new(move |line: &str| callbacks.on_log_message(&server, MessageType::LOG, line))
    }

    async fn run_start(self: Arc<Self>, generation: u64, init: InitSignal, provider: SharedProvider) {
        tracing::info!(server = %self.id(), project = %self.project.id(), "Starting language server");
        let session = match self.launch(generation, &provider).await {
            Ok(session) => session,
            Err(ServerError::Cancelled) => {
                init.complete(Err(ServerError::Cancelled));
                return;
            }
            Err(error) => {
                self.record_failure(&error);
                // Detach the run before waking waiters, so a retry starts fresh.
                self.stop_run(Some(generation), error.clone());
                init.complete(Err(error));
                return;
            }
        };

        let current = {
            let run = self.run.lock();
            let current = run.as_ref().is_some_and(|r| r.generation == generation);
            if current {
                *self.status.write() = ServerStatus::Started;
                init.complete(Ok(Arc::clone(&session)));
            }
            current
        };
        if !current {
            session.close().await;
            return;
        }

        self.failed_starts.store(0, Ordering::Release);
        *self.server_error.write() = None;
        self.notifier.clear(self.id());
        self.emit_status(ServerStatus::Started);
        self.watch_termination(generation, session.termination());
    }

    /// Bring up the transport and run the `initialize` handshake.
    async fn launch(self: &Arc<Self>, generation: u64, provider: &SharedProvider) -> Result<Arc<RpcSession>, ServerError> {
        let (transport, options) = {
            let mut provider = provider.lock().await;
            let transport = provider
                .start()
                .await
                .map_err(|e| ServerError::Launch(format!("{e:#}")))?;
            (transport, provider.initialization_options(self.project.root_uri()))
        };

        let router = Arc::new(InboundRouter {
            server: self.id().to_string(),
            connection: Arc::downgrade(self),
            callbacks: Arc::clone(&self.callbacks),
        });
        let session = RpcSession::spawn(self.id(), transport, router);

        let params = initialize_params(
            self.project.root_uri(),
            self.project.folders(),
            self.definition.factory().client_capabilities(&self.definition),
            options,
        );
        let timeout = self.definition.initialize_timeout();
        let result = match session.request("initialize", Some(params), timeout).await {
            Ok(result) => result,
            Err(e) => {
                session.close().await;
                return Err(match e {
                    RpcError::Timeout { .. } => ServerError::InitializeTimeout(timeout),
                    RpcError::Response(error) => ServerError::Initialize(error),
                    other => ServerError::Launch(format!("server exited during initialize: {other}")),
                });
            }
        };

        let capabilities = ServerCapabilities::new(
            result
                .get("capabilities")
                .cloned()
                .unwrap_or_else(|| json!({})),
        );
        let current = {
            let run = self.run.lock();
            let current = run.as_ref().is_some_and(|r| r.generation == generation);
            if current {
                *self.capabilities.write() = Some(CapabilityState::new(capabilities));
            }
            current
        };
        if !current {
            session.close().await;
            return Err(ServerError::Cancelled);
        }

        if let Err(e) = session.notify("initialized", Some(json!({}))).await {
            session.close().await;
            return Err(ServerError::Transport(e.to_string()));
        }
        Ok(session)
    }

    /// Stop the connection when the session ends without being asked to.
    fn watch_termination(self: &Arc<Self>, generation: u64, termination: Signal<Termination>) {
        let connection = Arc::downgrade(self);
        spawn_detached(async move {
            let reason = termination.wait().await;
            let message = match reason {
                Termination::Cancelled => return,
                Termination::Closed => "the server closed the connection".to_string(),
                Termination::Failed(message) => message,
            };
            let Some(this) = connection.upgrade() else {
                return;
            };
            if this.generation.load(Ordering::Acquire) != generation || !this.is_running() {
                return;
            }
            let error = ServerError::StoppedUnexpectedly(message);
            this.record_failure(&error);
            this.stop_run(Some(generation), error);
        });
    }

    fn record_failure(&self, error: &ServerError) {
        tracing::error!(server = %self.id(), "{error}");
        *self.server_error.write() = Some(error.clone());
        let failures = self.failed_starts.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.definition.max_restart_attempts() {
            self.definition.disable_after_failures();
        }
        if self.notifier.should_notify(self.id(), &error.to_string()) {
            self.callbacks.on_server_error(self.id(), error);
        }
    }

    /// Stop the server. Documents are dropped without `didClose`; the
    /// shutdown handshake runs on the returned background task. Returns
    /// `None` if nothing was running or a stop is already in progress.
    pub fn stop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.stop_run(None, ServerError::Cancelled)
    }

    /// Like [`stop`](Self::stop) but runs the teardown on the caller's
    /// task. Used when the owning project is closing.
    pub async fn shutdown(self: &Arc<Self>) {
        if let Some(teardown) = self.begin_stop(None, ServerError::Cancelled) {
            teardown.await;
        }
    }

    fn stop_run(self: &Arc<Self>, generation: Option<u64>, reason: ServerError) -> Option<JoinHandle<()>> {
        let teardown = self.begin_stop(generation, reason)?;
        spawn_detached(teardown)
    }

    /// Detach the current run (only `generation`, if given) and return its
    /// teardown. A start still in flight fails with `reason`.
    fn begin_stop(self: &Arc<Self>, generation: Option<u64>, reason: ServerError) -> Option<BoxFuture<'static, ()>> {
        let running = {
            let mut run = self.run.lock();
            let matches = run
                .as_ref()
                .is_some_and(|r| generation.is_none_or(|g| g == r.generation));
            if matches {
                *self.status.write() = ServerStatus::Stopping;
                run.take()
            } else {
                None
            }
        };
        let running = running?;

        tracing::info!(server = %self.id(), project = %self.project.id(), "Stopping language server");
        running.alive.store(false, Ordering::Release);
        running.init.complete(Err(reason));
        self.cancel_idle_timer();
        self.force_disconnect_all();
        *self.capabilities.write() = None;
        self.clear_diagnostics();
        self.emit_status(ServerStatus::Stopping);

        Some(Box::pin(Self::teardown(
            Arc::downgrade(self),
            self.id().to_string(),
            running,
            self.settings.shutdown_timeout,
        )))
    }

    async fn teardown(connection: Weak<Self>, server: String, running: Running, shutdown_timeout: Duration) {
        running.start_task.abort();

        if let Some(Ok(session)) = running.init.get() {
            // `didClose` from a final disconnect goes out before `shutdown`.
            if tokio::time::timeout(shutdown_timeout, running.dispatcher.drained())
                .await
                .is_err()
            {
                tracing::warn!(server = %server, "Pending notifications dropped at shutdown");
            }
            running.dispatcher_task.abort();
            if !session.is_closed() {
                if let Err(e) = session.request("shutdown", None, shutdown_timeout).await {
                    tracing::warn!(server = %server, "shutdown request failed: {e}");
                }
                if let Err(e) = session.notify("exit", None).await {
                    tracing::debug!(server = %server, "exit notification failed: {e}");
                }
            }
            session.close().await;
        }
        running.provider.lock().await.stop();
        tracing::info!(server = %server, "Language server stopped");

        if let Some(this) = connection.upgrade() {
            this.finish_stop(running.generation);
        }
    }

    fn finish_stop(&self, generation: u64) {
        let stopped = {
            let run = self.run.lock();
            let idle = run.is_none() && self.generation.load(Ordering::Acquire) == generation;
            if idle {
                *self.status.write() = ServerStatus::Stopped;
            }
            idle
        };
        if stopped {
            self.emit_status(ServerStatus::Stopped);
        }
    }

    /// Stop and start again, reconnecting the documents that were open.
    ///
    /// An explicit restart resets the failure count and lifts an
    /// auto-disable from repeated failed starts.
    pub fn restart(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.failed_starts.store(0, Ordering::Release);
        self.definition.clear_failures();
        let documents: Vec<OpenDocument> = self
            .documents
            .read()
            .values()
            .map(|d| d.document.clone())
            .collect();
        self.stop();
        let this = Arc::clone(self);
        spawn_detached(async move {
            if this.start().await.is_none() {
                return;
            }
            for document in documents {
                if let Err(e) = this.connect(&document, false).await {
                    tracing::debug!(server = %this.id(), uri = %document.file(), "Reconnect failed: {e}");
                }
            }
        })
    }

    fn emit_status(&self, status: ServerStatus) {
        tracing::debug!(server = %self.id(), ?status, "Status changed");
        self.callbacks.on_status_changed(self.id(), status);
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Route `document` to this server, starting it if needed, and send
    /// `didOpen`. With `wait`, resolves once `didOpen` has settled.
    ///
    /// Concurrent calls for one file share a single synchronizer and a
    /// single `didOpen`.
    pub async fn connect(self: &Arc<Self>, document: &OpenDocument, wait: bool) -> Result<LanguageServerHandle, ConnectError> {
        let key = document_key(document.file())?;
        self.cancel_idle_timer();

        if let Some(sync) = self.synchronizer_by_key(&key)
            && let Some(session) = self.session()
        {
            return self.finish_connect(&sync, session, wait).await;
        }

        let init = self.ensure_started().ok_or(ConnectError::NotStarted)?;
        let session = init.wait().await?;
        let sync = self.attach_document(&key, document, &init)?;
        self.finish_connect(&sync, session, wait).await
    }

    fn attach_document(
        &self,
        key: &str,
        document: &OpenDocument,
        init: &InitSignal,
    ) -> Result<Arc<DocumentSynchronizer>, ConnectError> {
        let _guard = self.connect_lock.lock();
        if let Some(existing) = self.synchronizer_by_key(key) {
            return Ok(existing);
        }

        let run = self.run.lock();
        let running = run
            .as_ref()
            .filter(|r| r.init.ptr_eq(init) && r.alive.load(Ordering::Acquire))
            .ok_or(ConnectError::NotStarted)?;

        let settings = self
            .capabilities
            .read()
            .as_ref()
            .map(CapabilityState::sync)
            .unwrap_or_default();
        let language_id = document
            .language_id()
            .map(String::from)
            .unwrap_or_else(|| self.definition.language_id_for(document.file()));
        let initial_version = self.versions.lock().get(key).copied().unwrap_or(0);

        let sync = DocumentSynchronizer::new(
            self.id(),
            key,
            language_id,
            document.buffer().clone(),
            settings,
            SyncChannel {
                dispatcher: running.dispatcher.clone(),
                alive: Arc::clone(&running.alive),
                mode: self.settings.mode,
            },
            initial_version,
        );
        sync.attach();
        sync.did_open();
        self.documents.write().insert(
            key.to_string(),
            ConnectedDocument {
                document: document.clone(),
                sync: Arc::clone(&sync),
            },
        );
        tracing::debug!(server = %self.id(), uri = %key, "Document connected");
        Ok(sync)
    }

    async fn finish_connect(
        self: &Arc<Self>,
        sync: &DocumentSynchronizer,
        session: Arc<RpcSession>,
        wait: bool,
    ) -> Result<LanguageServerHandle, ConnectError> {
        if wait {
            sync.did_open().wait().await.map_err(ConnectError::DidOpen)?;
        }
        self.handle(session).ok_or(ConnectError::NotStarted)
    }

    /// Send `didClose` and forget the document. May start the idle timer.
    pub fn disconnect(self: &Arc<Self>, file: &FileIdentity) -> bool {
        let Ok(key) = document_key(file) else {
            return false;
        };
        let Some(connected) = self.documents.write().remove(&key) else {
            return false;
        };
        connected.sync.detach();
        connected.sync.did_close();
        self.versions.lock().insert(key.clone(), connected.sync.version());
        self.diagnostics.lock().remove(&key);
        tracing::debug!(server = %self.id(), uri = %key, "Document disconnected");
        self.check_idle();
        true
    }

    /// Disconnect every document that belongs to `project`.
    pub fn disconnect_project(self: &Arc<Self>, project: &Project) {
        let files: Vec<FileIdentity> = self
            .documents
            .read()
            .values()
            .filter(|d| d.document.project().same(project))
            .map(|d| d.document.file().clone())
            .collect();
        for file in files {
            self.disconnect(&file);
        }
    }

    /// Drop all documents without `didClose`, keeping version high-water
    /// marks for the next connect.
    fn force_disconnect_all(&self) {
        let documents: Vec<(String, ConnectedDocument)> = self.documents.write().drain().collect();
        let mut versions = self.versions.lock();
        for (key, connected) in documents {
            connected.sync.detach();
            versions.insert(key, connected.sync.version());
        }
    }

    /// Disconnect `old` and connect `document` (the same buffer under its
    /// new identity). Returns `None` if `old` was not connected here.
    pub async fn rename(
        self: &Arc<Self>,
        old: &FileIdentity,
        document: &OpenDocument,
        timeout: Duration,
    ) -> Result<Option<LanguageServerHandle>, ConnectError> {
        if !self.is_connected(old) {
            return Ok(None);
        }
        let _keep = self.keep_alive();
        self.disconnect(old);
        self.file_moved(old, document.file());
        match tokio::time::timeout(timeout, self.connect(document, true)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                tracing::warn!(server = %self.id(), uri = %document.file(), "Timed out reconnecting renamed document");
                Err(ConnectError::Timeout(timeout))
            }
        }
    }

    pub fn is_connected(&self, file: &FileIdentity) -> bool {
        document_key(file).is_ok_and(|key| self.documents.read().contains_key(&key))
    }

    pub fn connected_files(&self) -> Vec<FileIdentity> {
        self.documents
            .read()
            .values()
            .map(|d| d.document.file().clone())
            .collect()
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    pub fn synchronizer(&self, file: &FileIdentity) -> Option<Arc<DocumentSynchronizer>> {
        self.synchronizer_by_key(&document_key(file).ok()?)
    }

    fn synchronizer_by_key(&self, key: &str) -> Option<Arc<DocumentSynchronizer>> {
        self.documents.read().get(key).map(|d| Arc::clone(&d.sync))
    }

    pub fn did_save(&self, file: &FileIdentity) -> bool {
        self.synchronizer(file).is_some_and(|sync| sync.did_save())
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    /// Enabled, and pinned, kept alive or serving documents.
    pub fn should_stay_alive(&self) -> bool {
        self.definition.is_enabled_for(&self.project)
            && (self.pinned.load(Ordering::Acquire)
                || self.keep_alive.load(Ordering::Acquire) > 0
                || !self.documents.read().is_empty())
    }

    pub fn keep_alive(self: &Arc<Self>) -> KeepAlive {
        self.keep_alive.fetch_add(1, Ordering::AcqRel);
        self.cancel_idle_timer();
        KeepAlive {
            connection: Arc::clone(self),
        }
    }

    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
        self.cancel_idle_timer();
    }

    pub fn unpin(self: &Arc<Self>) {
        self.pinned.store(false, Ordering::Release);
        self.check_idle();
    }

    fn cancel_idle_timer(&self) {
        if let Some((_, timer)) = self.idle_timer.lock().take() {
            timer.abort();
        }
    }

    /// Empty the timer slot if it still holds timer `armed`. Returns
    /// whether it did.
    fn clear_idle_timer(&self, armed: u64) -> bool {
        let mut slot = self.idle_timer.lock();
        if slot.as_ref().is_some_and(|(current, _)| *current == armed) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Stop now or after the idle timeout once nothing keeps the server up.
    fn check_idle(self: &Arc<Self>) {
        if self.should_stay_alive() || !self.is_running() {
            return;
        }
        let timeout = self.definition.idle_timeout();
        if !self.definition.is_enabled_for(&self.project)
            || self.settings.mode == RuntimeMode::Headless
            || timeout.is_zero()
        {
            self.stop();
            return;
        }

        let armed = self.idle_timers.fetch_add(1, Ordering::AcqRel) + 1;
        let connection = Arc::downgrade(self);
        let timer = spawn_detached(async move {
            tokio::time::sleep(timeout).await;
            let Some(this) = connection.upgrade() else {
                return;
            };
            // A newer timer owns the slot; leave the decision to it.
            if !this.clear_idle_timer(armed) {
                return;
            }
            if !this.should_stay_alive() {
                tracing::debug!(server = %this.id(), "Idle timeout elapsed");
                this.stop();
            }
        });
        let timer = timer.map(|timer| (armed, timer));
        if let Some((_, previous)) = std::mem::replace(&mut *self.idle_timer.lock(), timer) {
            previous.abort();
        }
    }

    pub fn has_idle_timer(&self) -> bool {
        self.idle_timer.lock().is_some()
    }

    // ── Capabilities ─────────────────────────────────────────────────────

    /// Static capabilities from `initialize`, while running.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities
            .read()
            .as_ref()
            .map(|c| c.static_capabilities().clone())
    }

    pub fn with_capabilities<R>(&self, f: impl FnOnce(&CapabilityState) -> R) -> Option<R> {
        self.capabilities.read().as_ref().map(f)
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.with_capabilities(|c| c.supports(feature)).unwrap_or(false)
    }

    /// [`supports`](Self::supports), with dynamic registrations filtered by
    /// their document selector.
    pub fn supports_for(&self, feature: Feature, document: &OpenDocument) -> bool {
        let language_id = document
            .language_id()
            .map(String::from)
            .unwrap_or_else(|| self.definition.language_id_for(document.file()));
        self.with_capabilities(|c| c.supports_for(feature, document, &language_id))
            .unwrap_or(false)
    }

    fn register_capabilities(&self, registrations: Vec<Registration>) -> Result<(), ResponseError> {
        let errors = {
            let mut capabilities = self.capabilities.write();
            let Some(state) = capabilities.as_mut() else {
                return Err(ResponseError::internal("server is not initialized"));
            };
            state.register_all(registrations)
        };

        let mut duplicate = None;
        for error in errors {
            match &error {
                RegistrationError::DuplicateId(id) => {
                    tracing::error!(server = %self.id(), id = %id, "Duplicate registration id");
                    self.callbacks.on_internal_error(self.id(), &error.to_string());
                    duplicate = Some(error);
                }
                RegistrationError::Malformed { .. } => {
                    tracing::warn!(server = %self.id(), "{error}");
                }
            }
        }
        match duplicate {
            Some(error) => Err(ResponseError::invalid_params(error.to_string())),
            None => Ok(()),
        }
    }

    fn unregister_capabilities(&self, params: &UnregistrationParams) {
        if let Some(state) = self.capabilities.write().as_mut() {
            state.unregister_all(&params.unregisterations);
        }
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    fn publish_diagnostics(&self, uri: &str, items: Vec<Diagnostic>) {
        let Ok(url) = Url::parse(uri) else {
            tracing::warn!(server = %self.id(), uri, "publishDiagnostics with invalid URI");
            return;
        };
        let key = url.to_string();
        let text = self
            .documents
            .read()
            .get(&key)
            .map(|d| d.document.buffer().text());
        let items = match text {
            Some(text) => {
                let valid = validate(self.id(), &key, &text, items);
                let errors = {
                    let mut store = self.diagnostics.lock();
                    store.update(key.clone(), valid.clone());
                    store.error_count()
                };
                tracing::trace!(server = %self.id(), uri = %key, items = valid.len(), errors, "Diagnostics updated");
                valid
            }
            None => items,
        };
        self.callbacks.on_diagnostics(self.id(), &url, &items);
    }

    pub fn diagnostics(&self, file: &FileIdentity) -> Vec<Diagnostic> {
        document_key(file)
            .map(|key| self.diagnostics.lock().get(&key))
            .unwrap_or_default()
    }

    pub fn diagnostics_snapshot(&self) -> Vec<(String, Vec<Diagnostic>)> {
        self.diagnostics.lock().snapshot()
    }

    /// Error-severity diagnostics across all connected documents.
    pub fn diagnostic_error_count(&self) -> usize {
        self.diagnostics.lock().error_count()
    }

    fn clear_diagnostics(&self) {
        let cleared = {
            let mut store = self.diagnostics.lock();
            let uris: Vec<String> = store.snapshot().into_iter().map(|(uri, _)| uri).collect();
            store.clear();
            uris
        };
        for uri in cleared {
            if let Ok(url) = Url::parse(&uri) {
                self.callbacks.on_diagnostics(self.id(), &url, &[]);
            }
        }
    }

    // ── Workspace traffic ────────────────────────────────────────────────

    fn session(&self) -> Option<Arc<RpcSession>> {
        self.run.lock().as_ref()?.init.get()?.ok()
    }

    fn dispatcher(&self) -> Option<Dispatcher> {
        self.run.lock().as_ref().map(|r| r.dispatcher.clone())
    }

    fn handle(self: &Arc<Self>, session: Arc<RpcSession>) -> Option<LanguageServerHandle> {
        let dispatcher = self.dispatcher()?;
        Some(LanguageServerHandle {
            connection: Arc::clone(self),
            session,
            dispatcher,
        })
    }

    /// One `didChangeWatchedFiles` with the events a registered watcher
    /// asked for. Returns whether anything was sent.
    pub fn notify_file_events(&self, events: &[(FileIdentity, FileChangeKind)]) -> bool {
        let changes: Vec<(String, u8)> = {
            let capabilities = self.capabilities.read();
            let Some(state) = capabilities.as_ref() else {
                return false;
            };
            events
                .iter()
                .filter(|(file, kind)| file.path().is_some_and(|path| state.watches(path, *kind)))
                .map(|(file, kind)| (file.key().to_string(), kind.as_lsp()))
                .collect()
        };
        if changes.is_empty() {
            return false;
        }
        self.dispatcher().is_some_and(|d| {
            d.enqueue(
                "workspace/didChangeWatchedFiles",
                did_change_watched_files_params(&changes),
            )
        })
    }

    /// A move reported to watchers as delete then create.
    pub fn file_moved(&self, old: &FileIdentity, new: &FileIdentity) -> bool {
        self.notify_file_events(&[
            (old.clone(), FileChangeKind::Deleted),
            (new.clone(), FileChangeKind::Created),
        ])
    }

    /// Files accepted by the server's filters for `op`.
    fn filtered<'a, T>(&self, op: FileOperation, items: &'a [T], file: impl Fn(&T) -> &FileIdentity) -> Vec<&'a T> {
        let Some(filters) = self.with_capabilities(|c| c.file_operation_filters(op)).flatten() else {
            return Vec::new();
        };
        items.iter().filter(|item| filters.matches(file(item))).collect()
    }

    fn file_params(&self, op: FileOperation, files: &[FileIdentity]) -> Option<Value> {
        let uris: Vec<&str> = self
            .filtered(op, files, |f| f)
            .into_iter()
            .map(FileIdentity::key)
            .collect();
        (!uris.is_empty()).then(|| file_operation_params(&uris))
    }

    fn rename_params(&self, op: FileOperation, renames: &[(FileIdentity, FileIdentity)]) -> Option<Value> {
        let pairs: Vec<(&str, &str)> = self
            .filtered(op, renames, |(old, _)| old)
            .into_iter()
            .map(|(old, new)| (old.key(), new.key()))
            .collect();
        (!pairs.is_empty()).then(|| rename_files_params(&pairs))
    }

    fn send_file_operation(&self, op: FileOperation, params: Option<Value>) -> bool {
        match (params, self.dispatcher()) {
            (Some(params), Some(dispatcher)) => dispatcher.enqueue(op.method(), params),
            _ => false,
        }
    }

    async fn request_file_operation(&self, op: FileOperation, params: Option<Value>) -> Result<Option<Value>, RpcError> {
        let Some(params) = params else {
            return Ok(None);
        };
        let session = self.session().ok_or(RpcError::Closed)?;
        let edit = session
            .request(op.method(), Some(params), self.definition.request_timeout())
            .await?;
        Ok((!edit.is_null()).then_some(edit))
    }

    pub fn did_create_files(&self, files: &[FileIdentity]) -> bool {
        self.send_file_operation(FileOperation::DidCreate, self.file_params(FileOperation::DidCreate, files))
    }

    pub fn did_delete_files(&self, files: &[FileIdentity]) -> bool {
        self.send_file_operation(FileOperation::DidDelete, self.file_params(FileOperation::DidDelete, files))
    }

    pub fn did_rename_files(&self, renames: &[(FileIdentity, FileIdentity)]) -> bool {
        self.send_file_operation(FileOperation::DidRename, self.rename_params(FileOperation::DidRename, renames))
    }

    /// The server's `WorkspaceEdit`, if it wants to edit anything.
    pub async fn will_create_files(&self, files: &[FileIdentity]) -> Result<Option<Value>, RpcError> {
        self.request_file_operation(FileOperation::WillCreate, self.file_params(FileOperation::WillCreate, files))
            .await
    }

    pub async fn will_delete_files(&self, files: &[FileIdentity]) -> Result<Option<Value>, RpcError> {
        self.request_file_operation(FileOperation::WillDelete, self.file_params(FileOperation::WillDelete, files))
            .await
    }

    pub async fn will_rename_files(&self, renames: &[(FileIdentity, FileIdentity)]) -> Result<Option<Value>, RpcError> {
        self.request_file_operation(FileOperation::WillRename, self.rename_params(FileOperation::WillRename, renames))
            .await
    }

    /// `workspace/executeCommand`, only for commands the server declared
    /// statically or registered.
    pub async fn execute_command(&self, command: &str, arguments: &[Value]) -> Result<Value, RpcError> {
        let supported = self
            .with_capabilities(|c| c.supports_command(command))
            .unwrap_or(false);
        if !supported {
            return Err(RpcError::Unsupported(command.to_string()));
        }
        let session = self.session().ok_or(RpcError::Closed)?;
        session
            .request(
                "workspace/executeCommand",
                Some(execute_command_params(command, arguments)),
                self.definition.request_timeout(),
            )
            .await
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Some((_, timer)) = self.idle_timer.get_mut().take() {
            timer.abort();
        }
        for (_, connected) in self.documents.get_mut().drain() {
            connected.sync.detach();
        }
    }
}

/// Holds the connection up while it has no documents. Dropping the last
/// guard lets the idle policy run again.
#[must_use = "the connection may stop as soon as the guard is dropped"]
pub struct KeepAlive {
    connection: Arc<ServerConnection>,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if self.connection.keep_alive.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.connection.check_idle();
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────

/// A started server, as handed to feature code.
#[derive(Clone)]
pub struct LanguageServerHandle {
    connection: Arc<ServerConnection>,
    session: Arc<RpcSession>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for LanguageServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageServerHandle")
            .field("server", &self.connection.id())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl LanguageServerHandle {
    pub fn server_id(&self) -> &str {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    pub fn is_alive(&self) -> bool {
        !self.session.is_closed()
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.connection.supports(feature)
    }

    pub async fn request<R>(&self, params: R::Params) -> Result<R::Result, RpcError>
    where
        R: lsp_types::request::Request,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        self.session
            .request_typed::<R>(params, self.connection.definition.request_timeout())
            .await
    }

    pub async fn request_raw(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.session
            .request(method, params, self.connection.definition.request_timeout())
            .await
    }

    /// Queued behind any pending document notifications.
    pub async fn notify<N>(&self, params: N::Params) -> Result<(), RpcError>
    where
        N: lsp_types::notification::Notification,
        N::Params: Serialize,
    {
        if self.session.is_closed() {
            return Err(RpcError::Closed);
        }
        let params = serde_json::to_value(params).map_err(|e| RpcError::Serialize(e.to_string()))?;
        self.dispatcher
            .enqueue_acked(N::METHOD, params)
            .await
            .unwrap_or(Err(RpcError::Closed))
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────

/// Server-initiated requests and notifications for one connection.
struct InboundRouter {
    server: String,
    connection: Weak<ServerConnection>,
    callbacks: Arc<dyn ClientCallbacks>,
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ResponseError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| ResponseError::invalid_params(e.to_string()))
}

impl InboundRouter {
    fn connection(&self) -> Result<Arc<ServerConnection>, ResponseError> {
        self.connection
            .upgrade()
            .ok_or_else(|| ResponseError::internal("connection is gone"))
    }
}

impl InboundHandler for InboundRouter {
    fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, ResponseError> {
        match method {
            "client/registerCapability" => {
                let params: RegistrationParams = parse_params(params)?;
                self.connection()?
                    .register_capabilities(params.registrations)
                    .map(|()| Value::Null)
            }
            "client/unregisterCapability" => {
                let params: UnregistrationParams = parse_params(params)?;
                self.connection()?.unregister_capabilities(&params);
                Ok(Value::Null)
            }
            "workspace/configuration" => {
                let items = params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Ok(Value::Array(self.callbacks.configuration(&self.server, &items)))
            }
            "workspace/applyEdit" => Ok(self
                .callbacks
                .apply_edit(&self.server, &params.unwrap_or(Value::Null))),
            "window/showMessageRequest" => Ok(self
                .callbacks
                .show_message_request(&self.server, &params.unwrap_or(Value::Null))),
            "window/workDoneProgress/create" => Ok(Value::Null),
            "workspace/workspaceFolders" => {
                let connection = self.connection()?;
                let folders = connection.project().folders();
                if folders.is_empty() {
                    return Ok(Value::Null);
                }
                Ok(Value::Array(folders.iter().map(WorkspaceFolder::to_json).collect()))
            }
            other => Err(ResponseError::method_not_found(other)),
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else {
                    return;
                };
                let Some(uri) = params.get("uri").and_then(Value::as_str) else {
                    tracing::warn!(server = %self.server, "publishDiagnostics without uri");
                    return;
                };
                let items: Vec<Diagnostic> = match params
                    .get("diagnostics")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                {
                    Ok(items) => items.unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!(server = %self.server, uri, "Malformed diagnostics: {e}");
                        return;
                    }
                };
                if let Some(connection) = self.connection.upgrade() {
                    connection.publish_diagnostics(uri, items);
                }
            }
            "window/logMessage" => match parse_params::<LogMessageParams>(params) {
                Ok(p) => self.callbacks.on_log_message(&self.server, p.typ, &p.message),
                Err(e) => tracing::debug!(server = %self.server, "Bad logMessage: {}", e.message),
            },
            "window/showMessage" => match parse_params::<ShowMessageParams>(params) {
                Ok(p) => self.callbacks.on_show_message(&self.server, p.typ, &p.message),
                Err(e) => tracing::debug!(server = %self.server, "Bad showMessage: {}", e.message),
            },
            "$/progress" => self
                .callbacks
                .on_progress(&self.server, &params.unwrap_or(Value::Null)),
            "telemetry/event" => self
                .callbacks
                .on_telemetry(&self.server, &params.unwrap_or(Value::Null)),
            other => tracing::trace!(server = %self.server, method = other, "Ignoring notification"),
        }
    }

    fn on_error(&self, message: &str) {
        tracing::warn!(server = %self.server, "{message}");
        self.callbacks.on_internal_error(&self.server, message);
    }
}
