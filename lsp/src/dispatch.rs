//! Sequential outbound notification queue.
//!
//! One per started server. Notifications are queued synchronously (edit
//! listeners cannot await) and written in queue order once initialization
//! finishes. If initialization fails everything queued is rejected.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{RpcError, ServerError};
use crate::rpc::RpcSession;
use crate::signal::Signal;

/// Resolves to the live session once `initialized` has been sent.
pub(crate) type InitSignal = Signal<Result<Arc<RpcSession>, ServerError>>;

struct Outbound {
    method: &'static str,
    params: Value,
    sent: Option<oneshot::Sender<Result<(), RpcError>>>,
}

enum Command {
    Notify(Outbound),
    /// Answered once everything queued before it was handled.
    Drain(oneshot::Sender<()>),
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl Dispatcher {
    pub fn spawn(server: String, init: InitSignal) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let handle = tokio::spawn(async move {
            let session = init.wait().await;
            while let Some(command) = rx.recv().await {
                let outbound = match command {
                    Command::Notify(outbound) => outbound,
                    Command::Drain(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let params = (!outbound.params.is_null()).then_some(outbound.params);
                let result = match &session {
                    Ok(session) => session.notify(outbound.method, params).await,
                    Err(_) => Err(RpcError::Closed),
                };
                if let Err(e) = &result {
                    tracing::debug!(server = %server, method = outbound.method, "Notification not sent: {e}");
                }
                if let Some(sent) = outbound.sent {
                    let _ = sent.send(result);
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Returns `false` if the dispatcher is gone.
    pub fn enqueue(&self, method: &'static str, params: Value) -> bool {
        self.tx
            .send(Command::Notify(Outbound {
                method,
                params,
                sent: None,
            }))
            .is_ok()
    }

    /// Like [`enqueue`](Self::enqueue), resolving once the notification is
    /// written or rejected.
    pub fn enqueue_acked(
        &self,
        method: &'static str,
        params: Value,
    ) -> oneshot::Receiver<Result<(), RpcError>> {
        let (sent, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(Command::Notify(outbound))) = self.tx.send(Command::Notify(Outbound {
            method,
            params,
            sent: Some(sent),
        })) && let Some(sent) = outbound.sent
        {
            let _ = sent.send(Err(RpcError::Closed));
        }
        rx
    }

    /// Wait until everything queued so far has been written or rejected.
    /// Returns at once if the dispatcher is gone.
    pub async fn drained(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Command::Drain(done)).is_ok() {
            let _ = rx.await;
        }
    }

    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let outbound = match command {
                    Command::Notify(outbound) => outbound,
                    Command::Drain(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let _ = out_tx.send((outbound.method.to_string(), outbound.params));
                if let Some(sent) = outbound.sent {
                    let _ = sent.send(Ok(()));
                }
            }
        });
        (Self { tx }, out_rx)
    }
}
