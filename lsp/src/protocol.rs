//! JSON-RPC envelopes and the LSP parameter shapes this client sends.
//!
//! Inbound frames are classified into [`Message`] by shape (`id` + `method`
//! is a request, `method` alone a notification, `id` + `result`/`error` a
//! response). Outbound params are built with `serde_json::json!` so the
//! wire shape is visible at the call site.

use std::fmt;
use std::path::{Path, PathBuf};

use lsp_types::TextDocumentContentChangeEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use url::Url;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes used by this client.
pub mod error_codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_CANCELLED: i64 = -32800;
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// Request id. LSP allows both integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Result<Value, ResponseError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Ok(result),
        }
    }

    pub fn error(id: RequestId, error: ResponseError) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

/// One JSON-RPC message, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Why a JSON value was not accepted as a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("message has neither a method nor a result")]
    Unclassifiable,
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid error object: {0}")]
    InvalidError(String),
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Self::Request(r) => r.params.as_ref(),
            Self::Notification(n) => n.params.as_ref(),
            Self::Response(_) => None,
        }
    }

    /// Classify a decoded frame.
    ///
    /// `result: null` is kept as `Value::Null` (a successful `shutdown`
    /// reply), which is why this does not go through serde's `Option`.
    pub fn parse(value: Value) -> Result<Self, MessageError> {
        let Value::Object(mut obj) = value else {
            return Err(MessageError::NotAnObject);
        };

        let id = obj.remove("id").filter(|id| !id.is_null());
        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            _ => None,
        };
        let params = obj.remove("params");

        let parse_id = |raw: Value| {
            serde_json::from_value::<RequestId>(raw.clone())
                .map_err(|_| MessageError::InvalidId(raw.to_string()))
        };

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request(Request {
                id: parse_id(id)?,
                method,
                params,
            })),
            (None, Some(method)) => Ok(Self::Notification(Notification { method, params })),
            (Some(id), None) => {
                let id = parse_id(id)?;
                if let Some(error) = obj.remove("error").filter(|e| !e.is_null()) {
                    let error = serde_json::from_value(error)
                        .map_err(|e| MessageError::InvalidError(e.to_string()))?;
                    return Ok(Self::Response(Response::error(id, error)));
                }
                match obj.remove("result") {
                    Some(result) => Ok(Self::Response(Response::ok(id, result))),
                    None => Err(MessageError::Unclassifiable),
                }
            }
            (None, None) => Err(MessageError::Unclassifiable),
        }
    }

    /// Encode with the `jsonrpc` tag. Absent params are omitted, not `null`.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request(r) => {
                obj.insert("id".into(), id_value(&r.id));
                obj.insert("method".into(), Value::from(r.method.as_str()));
                if let Some(params) = &r.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification(n) => {
                obj.insert("method".into(), Value::from(n.method.as_str()));
                if let Some(params) = &n.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response(r) => {
                obj.insert("id".into(), id_value(&r.id));
                match &r.result {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert(
                            "error".into(),
                            serde_json::to_value(error).unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        Value::Object(obj)
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

// ── Workspace folders ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFolder {
    pub uri: Url,
    pub name: String,
}

impl WorkspaceFolder {
    pub fn to_json(&self) -> Value {
        json!({ "uri": self.uri.as_str(), "name": self.name })
    }
}

// ── Outbound params ──────────────────────────────────────────────────────

/// Capabilities advertised in `initialize`.
///
/// Dynamic registration is advertised for exactly the registrations the
/// connection knows how to apply.
pub fn client_capabilities() -> Value {
    json!({
        "general": {
            "positionEncodings": ["utf-16"]
        },
        "workspace": {
            "applyEdit": true,
            "workspaceEdit": { "documentChanges": true },
            "workspaceFolders": true,
            "configuration": true,
            "didChangeWatchedFiles": {
                "dynamicRegistration": true,
                "relativePatternSupport": true
            },
            "executeCommand": { "dynamicRegistration": true },
            "fileOperations": {
                "dynamicRegistration": false,
                "didCreate": true,
                "willCreate": true,
                "didRename": true,
                "willRename": true,
                "didDelete": true,
                "willDelete": true
            }
        },
        "textDocument": {
            "synchronization": {
                "dynamicRegistration": true,
                "willSave": false,
                "willSaveWaitUntil": false,
                "didSave": true
            },
            "publishDiagnostics": {
                "relatedInformation": true,
                "versionSupport": true
            },
            "formatting": { "dynamicRegistration": true },
            "rangeFormatting": { "dynamicRegistration": true },
            "codeAction": { "dynamicRegistration": true },
            "completion": { "dynamicRegistration": true },
            "hover": { "dynamicRegistration": true },
            "signatureHelp": { "dynamicRegistration": true },
            "definition": { "dynamicRegistration": true },
            "references": { "dynamicRegistration": true },
            "documentSymbol": { "dynamicRegistration": true },
            "rename": { "dynamicRegistration": true, "prepareSupport": true },
            "inlayHint": { "dynamicRegistration": true }
        },
        "window": {
            "workDoneProgress": true,
            "showMessage": {}
        }
    })
}

pub fn initialize_params(
    root_uri: Option<&Url>,
    folders: &[WorkspaceFolder],
    capabilities: Value,
    initialization_options: Option<Value>,
) -> Value {
    let mut params = json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri.map(Url::as_str),
        "capabilities": capabilities,
        "workspaceFolders": folders.iter().map(WorkspaceFolder::to_json).collect::<Vec<_>>(),
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options;
    }
    params
}

pub fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub fn did_change_params(
    uri: &str,
    version: i32,
    changes: &[TextDocumentContentChangeEvent],
) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": changes
    })
}

pub fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = json!({ "textDocument": { "uri": uri } });
    if let Some(text) = text {
        params["text"] = Value::from(text);
    }
    params
}

pub fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

/// `changes` are `(uri, FileChangeType)` pairs.
pub fn did_change_watched_files_params(changes: &[(String, u8)]) -> Value {
    json!({
        "changes": changes
            .iter()
            .map(|(uri, kind)| json!({ "uri": uri, "type": kind }))
            .collect::<Vec<_>>()
    })
}

pub fn file_operation_params(uris: &[&str]) -> Value {
    json!({
        "files": uris.iter().map(|uri| json!({ "uri": uri })).collect::<Vec<_>>()
    })
}

pub fn rename_files_params(renames: &[(&str, &str)]) -> Value {
    json!({
        "files": renames
            .iter()
            .map(|(old, new)| json!({ "oldUri": old, "newUri": new }))
            .collect::<Vec<_>>()
    })
}

pub fn execute_command_params(command: &str, arguments: &[Value]) -> Value {
    json!({ "command": command, "arguments": arguments })
}

// ── URIs ─────────────────────────────────────────────────────────────────

pub fn path_to_file_uri(path: &Path) -> Result<Url, PathToUriError> {
    Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}

/// Canonical string form used as the key for connected documents.
///
/// Parsing through [`Url`] lowercases the scheme and host and
/// percent-encodes consistently, so `file:///a%20b` and `file:///a b`
/// map to the same key.
pub fn normalize_uri(uri: &str) -> Option<String> {
    Url::parse(uri).ok().map(String::from)
}
