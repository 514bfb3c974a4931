//! Connection registry: the live server connections of one project.
//!
//! Resolves which definitions handle a document, reuses or creates their
//! connections, and fans host file events out to them. Definition changes
//! arrive through [`DefinitionListener`] and restart or stop the affected
//! connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;

use crate::callbacks::ClientCallbacks;
use crate::capabilities::{Feature, ServerCapabilities};
use crate::config::RuntimeSettings;
use crate::connection::{LanguageServerHandle, ServerConnection, ServerStatus};
use crate::definition::{DefinitionEvent, DefinitionListener, ServerDefinition, ServerDefinitions};
use crate::error::{ConnectError, RpcError};
use crate::notifier::ErrorNotifier;
use crate::watchers::FileChangeKind;
use crate::workspace::{FileIdentity, OpenDocument, Project};

/// Bound on reconnecting a renamed document.
pub const RENAME_TIMEOUT: Duration = Duration::from_secs(10);

/// A started server that accepted a document, with the capabilities it
/// had when the item was produced.
#[derive(Debug, Clone)]
pub struct LanguageServerItem {
    handle: LanguageServerHandle,
    capabilities: Option<ServerCapabilities>,
}

impl LanguageServerItem {
    fn new(handle: LanguageServerHandle) -> Self {
        let capabilities = handle.connection().capabilities();
        Self { handle, capabilities }
    }

    pub fn server_id(&self) -> &str {
        self.handle.server_id()
    }

    pub fn handle(&self) -> &LanguageServerHandle {
        &self.handle
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        self.handle.connection()
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.as_ref()
    }

    /// Live answer, including dynamic registrations.
    pub fn supports(&self, feature: Feature) -> bool {
        self.connection().supports(feature)
    }

    pub fn supports_for(&self, feature: Feature, document: &OpenDocument) -> bool {
        self.connection().supports_for(feature, document)
    }
}

/// Result of [`ConnectionRegistry::file_renamed`].
#[derive(Debug, Default)]
pub struct RenameOutcome {
    pub reconnected: Vec<LanguageServerHandle>,
    /// Servers that dropped the old document but did not take the new one.
    pub failed: Vec<(String, ConnectError)>,
}

pub struct ConnectionRegistry {
    project: Arc<Project>,
    definitions: Arc<ServerDefinitions>,
    callbacks: Arc<dyn ClientCallbacks>,
    notifier: Arc<ErrorNotifier>,
    settings: RuntimeSettings,
    rename_timeout: Duration,
    /// Keyed by definition id.
    connections: RwLock<HashMap<String, Vec<Arc<ServerConnection>>>>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("project", &self.project.id())
            .field("connections", &self.connections().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    pub fn new(
        project: Arc<Project>,
        definitions: Arc<ServerDefinitions>,
        callbacks: Arc<dyn ClientCallbacks>,
        settings: RuntimeSettings,
    ) -> Arc<Self> {
        Self::with_rename_timeout(project, definitions, callbacks, settings, RENAME_TIMEOUT)
    }

    pub fn with_rename_timeout(
        project: Arc<Project>,
        definitions: Arc<ServerDefinitions>,
        callbacks: Arc<dyn ClientCallbacks>,
        settings: RuntimeSettings,
        rename_timeout: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            project,
            definitions: Arc::clone(&definitions),
            callbacks,
            notifier: Arc::new(ErrorNotifier::new(settings.error_notification_expiry)),
            settings,
            rename_timeout,
            connections: RwLock::new(HashMap::new()),
        });
        let weak: Weak<Self> = Arc::downgrade(&registry);
        let listener: Weak<dyn DefinitionListener> = weak;
        definitions.add_listener(listener);
        registry
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn definitions(&self) -> &Arc<ServerDefinitions> {
        &self.definitions
    }

    // ── Matching ─────────────────────────────────────────────────────────

    /// Definitions for `document`: the synchronous phase plus the
    /// asynchronous matchers, unioned by id.
    pub async fn matching_definitions(&self, document: &OpenDocument) -> Vec<Arc<ServerDefinition>> {
        let mut matched = self.definitions.definitions_for(document);
        let (pending, answers): (Vec<_>, Vec<_>) = self
            .definitions
            .definitions_for_async(document)
            .into_iter()
            .unzip();
        let answers = join_all(answers).await;
        for (definition, accepted) in pending.into_iter().zip(answers) {
            if accepted && !matched.iter().any(|d| d.id() == definition.id()) {
                matched.push(definition);
            }
        }
        matched
    }

    fn new_connection(&self, definition: &Arc<ServerDefinition>) -> Arc<ServerConnection> {
        ServerConnection::new(
            Arc::clone(definition),
            Arc::clone(&self.project),
            Arc::clone(&self.callbacks),
            Arc::clone(&self.notifier),
            self.settings,
        )
    }

    /// The connection of `definition` that takes `document`, created if
    /// none can.
    pub fn get_or_create(&self, definition: &Arc<ServerDefinition>, document: &OpenDocument) -> Arc<ServerConnection> {
        if definition.is_singleton() {
            let connection = self
                .definitions
                .singleton_connection(definition.id(), || self.new_connection(definition));
            let mut connections = self.connections.write();
            let list = connections.entry(definition.id().to_string()).or_default();
            if !list.iter().any(|c| Arc::ptr_eq(c, &connection)) {
                list.push(Arc::clone(&connection));
            }
            return connection;
        }

        let mut connections = self.connections.write();
        let list = connections.entry(definition.id().to_string()).or_default();
        if let Some(existing) = list
            .iter()
            .find(|c| Arc::ptr_eq(c.definition(), definition) && c.can_operate(document))
        {
            return Arc::clone(existing);
        }
        let connection = self.new_connection(definition);
        list.push(Arc::clone(&connection));
        tracing::debug!(server = %definition.id(), project = %self.project.id(), "Created server connection");
        connection
    }

    /// Connect `document` to every matching server, starting them as
    /// needed, and return those that accept `filter`. Servers that fail
    /// to start or to open the document are left out.
    pub async fn get_language_servers(
        &self,
        document: &OpenDocument,
        filter: impl Fn(&LanguageServerItem) -> bool,
    ) -> Vec<LanguageServerItem> {
        if self.project.is_disposed() {
            return Vec::new();
        }
        let connections: Vec<Arc<ServerConnection>> = self
            .matching_definitions(document)
            .await
            .iter()
            .map(|definition| self.get_or_create(definition, document))
            .collect();

        let results = join_all(connections.iter().map(|c| c.connect(document, true))).await;
        connections
            .iter()
            .zip(results)
            .filter_map(|(connection, result)| match result {
                Ok(handle) => Some(LanguageServerItem::new(handle)),
                Err(e) => {
                    tracing::debug!(server = %connection.id(), uri = %document.file(), "Server skipped: {e}");
                    None
                }
            })
            .filter(|item| filter(item))
            .collect()
    }

    /// Servers supporting `feature` for `document`.
    pub async fn servers_for(&self, document: &OpenDocument, feature: Feature) -> Vec<LanguageServerItem> {
        self.get_language_servers(document, |item| item.supports_for(feature, document))
            .await
    }

    /// Whether a started server already holding `document` accepts
    /// `filter`. Never starts anything.
    pub fn has_any(&self, document: &OpenDocument, filter: impl Fn(&ServerConnection) -> bool) -> bool {
        self.connections().iter().any(|c| {
            c.status() == ServerStatus::Started && c.is_connected(document.file()) && filter(c)
        })
    }

    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.connections.read().values().flatten().cloned().collect()
    }

    pub fn started_servers(&self) -> Vec<Arc<ServerConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| c.status() == ServerStatus::Started)
            .collect()
    }

    /// Status of the definition's connection in this project, `None` if it
    /// has none.
    pub fn server_status(&self, definition_id: &str) -> ServerStatus {
        self.connections
            .read()
            .get(definition_id)
            .and_then(|list| list.first())
            .map_or(ServerStatus::None, |c| c.status())
    }

    // ── File events ──────────────────────────────────────────────────────

    pub fn file_closed(&self, file: &FileIdentity) {
        for connection in self.connections() {
            connection.disconnect(file);
        }
    }

    pub fn file_saved(&self, file: &FileIdentity) {
        for connection in self.connections() {
            connection.did_save(file);
        }
    }

    pub fn file_created(&self, file: &FileIdentity) {
        for connection in self.started_servers() {
            connection.notify_file_events(&[(file.clone(), FileChangeKind::Created)]);
            connection.did_create_files(std::slice::from_ref(file));
        }
    }

    pub fn file_changed(&self, file: &FileIdentity) {
        for connection in self.started_servers() {
            connection.notify_file_events(&[(file.clone(), FileChangeKind::Changed)]);
        }
    }

    pub fn file_deleted(&self, file: &FileIdentity) {
        for connection in self.started_servers() {
            connection.notify_file_events(&[(file.clone(), FileChangeKind::Deleted)]);
            connection.did_delete_files(std::slice::from_ref(file));
        }
    }

    /// The edits servers want before `renames` happen, per server.
    pub async fn will_rename_files(&self, renames: &[(FileIdentity, FileIdentity)]) -> Vec<(String, Value)> {
        let connections = self.started_servers();
        let results = join_all(connections.iter().map(|c| c.will_rename_files(renames))).await;
        collect_edits(&connections, results)
    }

    pub async fn will_create_files(&self, files: &[FileIdentity]) -> Vec<(String, Value)> {
        let connections = self.started_servers();
        let results = join_all(connections.iter().map(|c| c.will_create_files(files))).await;
        collect_edits(&connections, results)
    }

    pub async fn will_delete_files(&self, files: &[FileIdentity]) -> Vec<(String, Value)> {
        let connections = self.started_servers();
        let results = join_all(connections.iter().map(|c| c.will_delete_files(files))).await;
        collect_edits(&connections, results)
    }

    /// A file moved from `old` to `document.file()`. Servers holding the
    /// old document close it and open the new one; the others only see
    /// the watched-file events. All of them get `didRenameFiles`.
    pub async fn file_renamed(&self, old: &FileIdentity, document: &OpenDocument) -> RenameOutcome {
        let connections = self.connections();
        let (holding, others): (Vec<_>, Vec<_>) = connections.iter().partition(|c| c.is_connected(old));

        for connection in &others {
            connection.file_moved(old, document.file());
        }

        let results = join_all(
            holding
                .iter()
                .map(|c| c.rename(old, document, self.rename_timeout)),
        )
        .await;
        let mut outcome = RenameOutcome::default();
        for (connection, result) in holding.iter().zip(results) {
            match result {
                Ok(Some(handle)) => outcome.reconnected.push(handle),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(server = %connection.id(), uri = %document.file(), "Rename reconnect failed: {e}");
                    outcome.failed.push((connection.id().to_string(), e));
                }
            }
        }

        let renames = [(old.clone(), document.file().clone())];
        for connection in self.started_servers() {
            connection.did_rename_files(&renames);
        }
        outcome
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// The project is closing: stop its own connections with the teardown
    /// run inline, and release its documents from shared singletons.
    pub async fn dispose(&self) {
        self.project.mark_disposed();
        let connections: Vec<Arc<ServerConnection>> = self
            .connections
            .write()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        tracing::info!(project = %self.project.id(), count = connections.len(), "Disposing server connections");

        let (singletons, owned): (Vec<_>, Vec<_>) = connections
            .into_iter()
            .partition(|c| c.definition().is_singleton());
        for connection in &singletons {
            connection.disconnect_project(&self.project);
        }
        join_all(owned.iter().map(|c| c.shutdown())).await;
    }

    fn for_definition(&self, id: &str, f: impl Fn(&Arc<ServerConnection>)) {
        let list = self.connections.read().get(id).cloned().unwrap_or_default();
        for connection in list.iter().filter(|c| !c.definition().is_singleton()) {
            f(connection);
        }
    }
}

fn collect_edits(
    connections: &[Arc<ServerConnection>],
    results: Vec<Result<Option<Value>, RpcError>>,
) -> Vec<(String, Value)> {
    connections
        .iter()
        .zip(results)
        .filter_map(|(connection, result)| match result {
            Ok(edit) => edit.map(|edit| (connection.id().to_string(), edit)),
            Err(e) => {
                tracing::warn!(server = %connection.id(), "File operation request failed: {e}");
                None
            }
        })
        .collect()
}

// Singleton connections are restarted and stopped by `ServerDefinitions`.
impl DefinitionListener for ConnectionRegistry {
    fn definition_changed(&self, event: &DefinitionEvent) {
        match event {
            DefinitionEvent::Added { .. } => {}
            DefinitionEvent::Removed { id } => {
                let removed = self.connections.write().remove(id).unwrap_or_default();
                for connection in removed.iter().filter(|c| !c.definition().is_singleton()) {
                    connection.stop();
                }
            }
            DefinitionEvent::Changed { id, changes } => {
                if changes.requires_restart() {
                    self.for_definition(id, |c| {
                        c.restart();
                    });
                }
            }
            DefinitionEvent::Enablement { id, project, enabled } => {
                let ours = project.as_deref().is_none_or(|p| p == self.project.id());
                if *enabled || !ours {
                    return;
                }
                if project.is_some() {
                    let singletons = self.connections.read().get(id).cloned().unwrap_or_default();
                    for connection in singletons.iter().filter(|c| c.definition().is_singleton()) {
                        connection.disconnect_project(&self.project);
                    }
                }
                self.for_definition(id, |c| {
                    c.stop();
                });
            }
        }
    }
}
