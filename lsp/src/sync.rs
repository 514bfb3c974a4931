//! Per (server, document) text synchronization.
//!
//! A [`DocumentSynchronizer`] listens to a [`TextBuffer`] and turns its edit
//! stream into `didOpen`/`didChange`/`didSave`/`didClose` in the sync mode
//! the server negotiated. Everything goes through the connection's
//! [`Dispatcher`], so notifications reach the server in the order they
//! were produced.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use lsp_types::{Range, TextDocumentContentChangeEvent};
use parking_lot::Mutex;

use crate::capabilities::{SyncKind, SyncSettings};
use crate::config::RuntimeMode;
use crate::dispatch::Dispatcher;
use crate::error::RpcError;
use crate::position::{LineIndex, to_position};
use crate::protocol::{did_change_params, did_close_params, did_open_params, did_save_params};
use crate::signal::Signal;
use crate::text::{BufferListener, ListenerId, TextBuffer, TextChange};

/// Settle time after `didOpen` is written, before feature requests go out.
pub const DID_OPEN_SETTLE: Duration = Duration::from_millis(500);

pub type DidOpenSignal = Signal<Result<(), RpcError>>;

#[derive(Default)]
struct Pending {
    changes: Vec<TextDocumentContentChangeEvent>,
    /// An edit could not be expressed as a range; the next flush sends
    /// the whole text instead.
    resync_full: bool,
}

/// State the synchronizer shares with its connection's current run.
#[derive(Clone)]
pub(crate) struct SyncChannel {
    pub dispatcher: Dispatcher,
    /// Cleared as soon as the connection begins stopping.
    pub alive: Arc<AtomicBool>,
    pub mode: RuntimeMode,
}

pub struct DocumentSynchronizer {
    server: String,
    uri: String,
    language_id: String,
    buffer: TextBuffer,
    settings: SyncSettings,
    channel: SyncChannel,
    version: AtomicI32,
    pending: Mutex<Pending>,
    did_open: OnceLock<DidOpenSignal>,
    /// Set once `didOpen` is queued; changes wait in `pending` until then.
    opened: AtomicBool,
    /// Buffer text at the moment `attach` subscribed.
    snapshot: Mutex<Option<String>>,
    closed: AtomicBool,
    listener: Mutex<Option<ListenerId>>,
}

impl std::fmt::Debug for DocumentSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSynchronizer")
            .field("server", &self.server)
            .field("uri", &self.uri)
            .field("version", &self.version())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DocumentSynchronizer {
    /// `initial_version` is the highest version this connection already
    /// used for the URI, so a reconnect never repeats one.
    pub(crate) fn new(
        server: impl Into<String>,
        uri: impl Into<String>,
        language_id: impl Into<String>,
        buffer: TextBuffer,
        settings: SyncSettings,
        channel: SyncChannel,
        initial_version: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            server: server.into(),
            uri: uri.into(),
            language_id: language_id.into(),
            buffer,
            settings,
            channel,
            version: AtomicI32::new(initial_version),
            pending: Mutex::new(Pending::default()),
            did_open: OnceLock::new(),
            opened: AtomicBool::new(false),
            snapshot: Mutex::new(None),
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn sync_kind(&self) -> SyncKind {
        self.settings.kind
    }

    /// Last version sent to the server.
    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn buffer(&self) -> &TextBuffer {
        &self.buffer
    }

    /// Attach to the buffer's edit stream.
    ///
    /// The text seen at subscription becomes the `didOpen` content, so
    /// every later edit is reported exactly once.
    pub(crate) fn attach(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.is_none() {
            let this: Arc<dyn BufferListener> = Arc::clone(self) as Arc<dyn BufferListener>;
            let (id, text) = self.buffer.subscribe_with_snapshot(this);
            *listener = Some(id);
            *self.snapshot.lock() = Some(text);
        }
    }

    /// Stop listening. Must run before the synchronizer is discarded; the
    /// buffer holds a strong reference until then.
    pub(crate) fn detach(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.buffer.unsubscribe(id);
        }
    }

    /// Queue `didOpen` on first call; every call returns the same signal.
    ///
    /// The signal completes when the notification is written (plus the
    /// settle delay in interactive mode) or rejected.
    pub fn did_open(&self) -> DidOpenSignal {
        let mut queued = false;
        let signal = self
            .did_open
            .get_or_init(|| {
                queued = true;
                let signal = DidOpenSignal::new();
                // Under the pending lock so no didChange can slip ahead.
                let pending = self.pending.lock();
                let text = self.snapshot.lock().take().unwrap_or_else(|| self.buffer.text());
                let version = self.next_version();
                let params = did_open_params(&self.uri, &self.language_id, version, &text);
                tracing::debug!(server = %self.server, uri = %self.uri, version, "didOpen");
                let sent = self
                    .channel
                    .dispatcher
                    .enqueue_acked("textDocument/didOpen", params);
                self.opened.store(true, Ordering::Release);
                drop(pending);

                let settle = matches!(self.channel.mode, RuntimeMode::Interactive);
                let done = signal.clone();
                tokio::spawn(async move {
                    let result = sent.await.unwrap_or(Err(RpcError::Closed));
                    if settle && result.is_ok() {
                        tokio::time::sleep(DID_OPEN_SETTLE).await;
                    }
                    done.complete(result);
                });
                signal
            })
            .clone();
        // Edits made between attach and didOpen were held back.
        if queued {
            self.flush();
        }
        signal
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Send buffered changes as a single `didChange`. Returns the version
    /// used, or `None` if nothing was buffered.
    pub fn flush(&self) -> Option<i32> {
        let mut pending = self.pending.lock();
        if pending.changes.is_empty() || !self.opened.load(Ordering::Acquire) {
            return None;
        }
        let changes = std::mem::take(&mut pending.changes);
        let version = self.next_version();
        tracing::trace!(server = %self.server, uri = %self.uri, version, changes = changes.len(), "didChange");
        self.channel.dispatcher.enqueue(
            "textDocument/didChange",
            did_change_params(&self.uri, version, &changes),
        );
        Some(version)
    }

    pub fn pending_changes(&self) -> usize {
        self.pending.lock().changes.len()
    }

    /// `didSave` with the current text, if the server asked for saves.
    pub fn did_save(&self) -> bool {
        if !self.settings.send_save || !self.is_opened() {
            return false;
        }
        self.flush();
        self.channel.dispatcher.enqueue(
            "textDocument/didSave",
            did_save_params(&self.uri, Some(&self.buffer.text())),
        )
    }

    /// `didClose`, at most once, and only while the connection is running
    /// and after `didOpen` went out.
    pub fn did_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if !self.channel.alive.load(Ordering::Acquire) || !self.is_opened() {
            return false;
        }
        self.flush();
        tracing::debug!(server = %self.server, uri = %self.uri, "didClose");
        self.channel
            .dispatcher
            .enqueue("textDocument/didClose", did_close_params(&self.uri))
    }

    fn next_version(&self) -> i32 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn full_text_change(text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: text.to_string(),
        }
    }
}

/// Range change for `change`, computed against the text before the edit.
///
/// `None` when the edit has no position form: it runs past the end, or an
/// endpoint splits a `\r\n`.
fn incremental_change(before: &str, change: &TextChange) -> Option<TextDocumentContentChangeEvent> {
    let index = LineIndex::new(before);
    let end = change.offset.checked_add(change.old_len)?;
    if end > index.len() || index.is_inside_terminator(change.offset) || index.is_inside_terminator(end) {
        return None;
    }
    let start = to_position(&index, change.offset as i64);
    let end = to_position(&index, end as i64);
    Some(TextDocumentContentChangeEvent {
        range: Some(Range::new(start, end)),
        range_length: Some(change.old_len as u32),
        text: change.new_text.clone(),
    })
}

impl BufferListener for DocumentSynchronizer {
    fn before_change(&self, text: &str, change: &TextChange) {
        if self.settings.kind != SyncKind::Incremental {
            return;
        }
        let mut pending = self.pending.lock();
        if pending.resync_full {
            return;
        }
        match incremental_change(text, change) {
            Some(event) => pending.changes.push(event),
            None => {
                tracing::warn!(server = %self.server, uri = %self.uri, "Edit has no range form; resyncing full text");
                pending.changes.clear();
                pending.resync_full = true;
            }
        }
    }

    fn after_change(&self, text: &str, _change: &TextChange) {
        match self.settings.kind {
            SyncKind::None => return,
            SyncKind::Full => {
                let mut pending = self.pending.lock();
                pending.changes.clear();
                pending.changes.push(Self::full_text_change(text));
            }
            SyncKind::Incremental => {
                let mut pending = self.pending.lock();
                if pending.resync_full {
                    pending.resync_full = false;
                    pending.changes.clear();
                    pending.changes.push(Self::full_text_change(text));
                }
            }
        }
        if matches!(self.channel.mode, RuntimeMode::Headless) {
            self.flush();
        }
    }

    fn committed(&self, _text: &str) {
        if matches!(self.channel.mode, RuntimeMode::Interactive) {
            self.flush();
        }
    }
}
