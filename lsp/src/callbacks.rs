//! What the host receives from language servers.

use lsp_types::{Diagnostic, MessageType};
use serde_json::{Value, json};
use url::Url;

use crate::connection::ServerStatus;
use crate::error::ServerError;

/// Host hooks for server-originated traffic and connection events.
///
/// Every method has a default so hosts implement only what they render.
/// Calls arrive on runtime tasks and must not block for long.
pub trait ClientCallbacks: Send + Sync {
    /// Validated diagnostics for a connected document.
    fn on_diagnostics(&self, _server: &str, _uri: &Url, _diagnostics: &[Diagnostic]) {}

    fn on_log_message(&self, _server: &str, _kind: MessageType, _message: &str) {}

    fn on_show_message(&self, _server: &str, _kind: MessageType, _message: &str) {}

    fn on_progress(&self, _server: &str, _params: &Value) {}

    fn on_telemetry(&self, _server: &str, _params: &Value) {}

    fn on_status_changed(&self, _server: &str, _status: ServerStatus) {}

    /// A start failure or unexpected stop, already de-duplicated.
    fn on_server_error(&self, _server: &str, _error: &ServerError) {}

    /// Handler failures, protocol violations and other bugs.
    fn on_internal_error(&self, _server: &str, _message: &str) {}

    /// `workspace/configuration`: one value per requested item.
    fn configuration(&self, _server: &str, items: &[Value]) -> Vec<Value> {
        vec![Value::Null; items.len()]
    }

    /// `workspace/applyEdit`. Returns an `ApplyWorkspaceEditResult`.
    fn apply_edit(&self, _server: &str, _params: &Value) -> Value {
        json!({ "applied": false })
    }

    /// `window/showMessageRequest`. Returns the chosen action or `null`.
    fn show_message_request(&self, _server: &str, _params: &Value) -> Value {
        Value::Null
    }
}

/// Callbacks that drop everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl ClientCallbacks for NoopCallbacks {}
