//! LSP client runtime: starts language servers, keeps open documents in
//! sync with them and routes their traffic back to the host.
//!
//! A host builds one [`ServerDefinitions`] per process and one
//! [`ConnectionRegistry`] per project, then asks the registry for the
//! servers of each open document.

pub mod callbacks;
pub mod capabilities;
pub mod codec;
pub mod config;
pub mod connection;
pub mod definition;
pub mod diagnostics;
pub mod error;
pub mod notifier;
pub mod position;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod signal;
pub mod sync;
pub mod text;
pub mod transport;
pub mod watchers;
pub mod workspace;

pub(crate) mod dispatch;
mod registration;

pub use callbacks::{ClientCallbacks, NoopCallbacks};
pub use capabilities::{CapabilityState, Feature, ServerCapabilities, SyncKind, SyncSettings};
pub use config::{LspConfig, RuntimeMode, RuntimeSettings, ServerConfig};
pub use connection::{KeepAlive, LanguageServerHandle, ServerConnection, ServerStatus};
pub use definition::{
    DefaultFactory, DefinitionChanges, DefinitionEvent, DefinitionListener, DefinitionUpdate,
    DocumentMatcher, LanguageMapping, ServerDefinition, ServerDefinitions, ServerFactory,
};
pub use error::{ConfigError, ConnectError, RegistrationError, RpcError, ServerError};
pub use notifier::ErrorNotifier;
pub use protocol::{ResponseError, WorkspaceFolder};
pub use registry::{ConnectionRegistry, LanguageServerItem, RenameOutcome};
pub use rpc::{InboundHandler, RpcSession, Termination};
pub use signal::Signal;
pub use sync::DocumentSynchronizer;
pub use text::{TextBuffer, TextChange};
pub use transport::{ConnectionProvider, LaunchConfig, ProcessProvider, SocketProvider, Transport, TransportKind};
pub use watchers::{FileChangeKind, FileOperation};
pub use workspace::{FileIdentity, OpenDocument, Project};
