//! JSON-RPC session over a [`Transport`].
//!
//! One writer task owns the output stream and writes frames in the order
//! they were queued. One reader task owns the input stream: responses are
//! matched against pending requests, notifications are handed to a single
//! ordered worker, and every inbound request gets its own task so a slow
//! handler never stalls the read loop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{MessageReader, MessageWriter};
use crate::error::RpcError;
use crate::protocol::{Message, Notification, Request, RequestId, Response, ResponseError};
use crate::signal::Signal;
use crate::transport::Transport;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Handles traffic the server initiates.
///
/// Handlers run on runtime tasks, never on the reader loop. Panics are
/// caught and reported through [`on_error`](Self::on_error).
pub trait InboundHandler: Send + Sync + 'static {
    fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, ResponseError>;

    fn handle_notification(&self, method: &str, params: Option<Value>);

    /// Single sink for handler failures and undecodable frames.
    fn on_error(&self, message: &str);
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The server closed its output stream.
    Closed,
    /// Reading or writing failed.
    Failed(String),
    /// [`RpcSession::close`] was called.
    Cancelled,
}

enum WriterCommand {
    Send(Value),
    Shutdown,
}

type ResponseSlot = oneshot::Sender<Result<Value, ResponseError>>;
type PendingMap = Arc<tokio::sync::Mutex<HashMap<RequestId, ResponseSlot>>>;

pub struct RpcSession {
    server: String,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicI64,
    pending: PendingMap,
    termination: Signal<Termination>,
    /// Reader and notification worker.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("server", &self.server)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcSession {
    /// Start the reader, writer and notification tasks. Must be called
    /// inside a Tokio runtime.
    pub fn spawn(
        server: impl Into<String>,
        transport: Transport,
        handler: Arc<dyn InboundHandler>,
    ) -> Arc<Self> {
        let server = server.into();
        let pending: PendingMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let termination = Signal::new();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_termination = termination.clone();
        let writer_server = server.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = MessageWriter::new(transport.writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_value(&frame).await {
                            tracing::warn!(server = %writer_server, "LSP write error: {e:#}");
                            writer_termination.complete(Termination::Failed(format!("{e:#}")));
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        if let Err(e) = writer.shutdown().await {
                            tracing::trace!(server = %writer_server, "closing writer: {e:#}");
                        }
                        break;
                    }
                }
            }
        });

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notification>();
        let notify_handler = Arc::clone(&handler);
        let notify_handle = tokio::spawn(async move {
            while let Some(notification) = notify_rx.recv().await {
                let Notification { method, params } = notification;
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    notify_handler.handle_notification(&method, params);
                }));
                if outcome.is_err() {
                    notify_handler.on_error(&format!("handler for '{method}' panicked"));
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_termination = termination.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_server = server.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = MessageReader::new(transport.reader);
            let reason = loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        let message = match Message::parse(frame) {
                            Ok(message) => message,
                            Err(e) => {
                                tracing::warn!(server = %reader_server, "Dropping frame: {e}");
                                handler.on_error(&format!("undecodable frame: {e}"));
                                continue;
                            }
                        };
                        Self::route(
                            &reader_server,
                            message,
                            &reader_pending,
                            &notify_tx,
                            &reader_writer_tx,
                            &handler,
                        )
                        .await;
                    }
                    Ok(None) => {
                        tracing::debug!(server = %reader_server, "LSP server closed its output");
                        break Termination::Closed;
                    }
                    Err(e) => {
                        tracing::warn!(server = %reader_server, "LSP reader error: {e:#}");
                        break Termination::Failed(format!("{e:#}"));
                    }
                }
            };
            reader_termination.complete(reason);
            // Dropping the slots fails every waiter with `Closed`.
            reader_pending.lock().await.clear();
        });

        Arc::new(Self {
            server,
            writer_tx,
            next_id: AtomicI64::new(1),
            pending,
            termination,
            tasks: Mutex::new(vec![reader_handle, notify_handle]),
            writer_task: Mutex::new(Some(writer_handle)),
        })
    }

    async fn route(
        server: &str,
        message: Message,
        pending: &tokio::sync::Mutex<HashMap<RequestId, ResponseSlot>>,
        notify_tx: &mpsc::UnboundedSender<Notification>,
        writer_tx: &mpsc::Sender<WriterCommand>,
        handler: &Arc<dyn InboundHandler>,
    ) {
        match message {
            Message::Response(Response { id, result }) => {
                let slot = pending.lock().await.remove(&id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => tracing::trace!(server, %id, "Response for unknown request"),
                }
            }
            Message::Notification(notification) => {
                tracing::trace!(server, method = %notification.method, "<- notification");
                let _ = notify_tx.send(notification);
            }
            Message::Request(Request { id, method, params }) => {
                tracing::trace!(server, %id, method = %method, "<- request");
                let handler = Arc::clone(handler);
                let writer_tx = writer_tx.clone();
                tokio::spawn(async move {
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| handler.handle_request(&method, params)));
                    let result = outcome.unwrap_or_else(|_| {
                        handler.on_error(&format!("handler for '{method}' panicked"));
                        Err(ResponseError::internal(format!("handler for '{method}' failed")))
                    });
                    let response = Message::Response(Response { id, result });
                    let _ = writer_tx.send(WriterCommand::Send(response.to_value())).await;
                });
            }
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.termination.is_complete()
    }

    /// Completes once, when the session ends for any reason.
    pub fn termination(&self) -> Signal<Termination> {
        self.termination.clone()
    }

    /// Send a request and wait up to `timeout` for its response. On timeout
    /// the server is sent `$/cancelRequest`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        tracing::trace!(server = %self.server, %id, method, "-> request");
        let frame = Message::request(id.clone(), method, params).to_value();
        if self.writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(RpcError::Response(error)),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                let _ = self
                    .notify("$/cancelRequest", Some(json!({ "id": id })))
                    .await;
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// [`request`](Self::request) with `lsp_types` request typing.
    pub async fn request_typed<R>(&self, params: R::Params, timeout: Duration) -> Result<R::Result, RpcError>
    where
        R: lsp_types::request::Request,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        let params = encode_params(params)?;
        let result = self.request(R::METHOD, params, timeout).await?;
        serde_json::from_value(result).map_err(|e| RpcError::Deserialize(e.to_string()))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        tracing::trace!(server = %self.server, method, "-> notification");
        let frame = Message::notification(method, params).to_value();
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| RpcError::Closed)
    }

    pub async fn notify_typed<N>(&self, params: N::Params) -> Result<(), RpcError>
    where
        N: lsp_types::notification::Notification,
        N::Params: Serialize,
    {
        let params = encode_params(params)?;
        self.notify(N::METHOD, params).await
    }

    /// End the session. Frames queued before this call are still written;
    /// pending requests fail with [`RpcError::Closed`].
    pub async fn close(&self) {
        self.termination.complete(Termination::Cancelled);
        if self.writer_tx.try_send(WriterCommand::Shutdown).is_err() {
            tracing::trace!(server = %self.server, "Writer busy or gone; dropping it");
        }
        self.pending.lock().await.clear();
        // The writer is left running so queued frames (`exit`) still go out.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.termination.complete(Termination::Cancelled);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(writer) = self.writer_task.lock().take() {
            writer.abort();
        }
    }
}

/// `()` params serialize to `null`, which is sent as absent params.
fn encode_params(params: impl Serialize) -> Result<Option<Value>, RpcError> {
    let value = serde_json::to_value(params).map_err(|e| RpcError::Serialize(e.to_string()))?;
    Ok((!value.is_null()).then_some(value))
}
