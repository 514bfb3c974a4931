//! Error types surfaced by the runtime.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::ResponseError;

/// Error recorded on a connection when a start attempt fails or the server
/// goes away on its own. Kept until the next successful start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    /// The process or socket could not be brought up.
    #[error("cannot start language server: {0}")]
    Launch(String),
    #[error("initialize failed: {0}")]
    Initialize(ResponseError),
    #[error("initialize timed out after {0:?}")]
    InitializeTimeout(Duration),
    /// The server exited or closed its streams without being asked to.
    #[error("language server stopped unexpectedly: {0}")]
    StoppedUnexpectedly(String),
    #[error("transport error: {0}")]
    Transport(String),
    /// The start sequence was abandoned because `stop()` ran first.
    #[error("start cancelled")]
    Cancelled,
}

impl ServerError {
    #[must_use]
    pub fn is_unexpected_stop(&self) -> bool {
        matches!(self, Self::StoppedUnexpectedly(_))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Response(ResponseError),
    #[error("server does not support '{0}'")]
    Unsupported(String),
    #[error("cannot encode params: {0}")]
    Serialize(String),
    #[error("cannot decode result: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectError {
    #[error("'{0}' is not a valid document URI")]
    InvalidUri(String),
    /// The definition is disabled or the connection was stopped while
    /// connecting.
    #[error("language server is not running")]
    NotStarted,
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("didOpen was not delivered: {0}")]
    DidOpen(RpcError),
    #[error("timed out after {0:?} waiting for the document to open")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("registration id '{0}' is already in use")]
    DuplicateId(String),
    #[error("malformed '{method}' registration: {message}")]
    Malformed { method: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("server '{id}': {message}")]
    Invalid { id: String, message: String },
}

impl ConfigError {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => Some(path),
            Self::Invalid { .. } => None,
        }
    }
}
