//! Server definitions and the process-wide definitions registry.
//!
//! A [`ServerDefinition`] says how to launch one kind of language server
//! and which files it handles. [`ServerDefinitions`] owns every definition
//! for the process and tells listeners (one [`ConnectionRegistry`] per
//! project) when one is added, removed, reconfigured or toggled.
//!
//! [`ConnectionRegistry`]: crate::registry::ConnectionRegistry

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use globset::{GlobBuilder, GlobMatcher};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::callbacks::ClientCallbacks;
use crate::config::{LspConfig, ServerConfig};
use crate::connection::ServerConnection;
use crate::error::ConfigError;
use crate::protocol::client_capabilities;
use crate::transport::{ConnectionProvider, LaunchConfig, ProcessProvider, SocketProvider, TransportKind};
use crate::workspace::{FileIdentity, OpenDocument, Project};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RESTART_ATTEMPTS: u32 = 20;

// ── Language mappings ────────────────────────────────────────────────────

/// Files that map to one language id.
#[derive(Debug, Clone)]
pub struct LanguageMapping {
    language_id: String,
    extensions: Vec<String>,
    patterns: Vec<GlobMatcher>,
}

impl PartialEq for LanguageMapping {
    fn eq(&self, other: &Self) -> bool {
        self.language_id == other.language_id
            && self.extensions == other.extensions
            && self
                .patterns
                .iter()
                .map(|p| p.glob().glob())
                .eq(other.patterns.iter().map(|p| p.glob().glob()))
    }
}

impl LanguageMapping {
    pub fn new(language_id: impl Into<String>) -> Self {
        Self {
            language_id: language_id.into(),
            extensions: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Extensions are matched without the dot and case-insensitively.
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions.extend(
            extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase()),
        );
        self
    }

    /// Glob matched against the file name.
    pub fn with_file_pattern(mut self, pattern: &str) -> Result<Self, globset::Error> {
        let glob = GlobBuilder::new(pattern).literal_separator(true).build()?;
        self.patterns.push(glob.compile_matcher());
        Ok(self)
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    fn matches_pattern(&self, file: &FileIdentity) -> bool {
        file.file_name()
            .is_some_and(|name| self.patterns.iter().any(|p| p.is_match(Path::new(&name))))
    }

    fn matches_extension(&self, file: &FileIdentity) -> bool {
        file.extension()
            .is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }

    pub fn matches(&self, file: &FileIdentity) -> bool {
        self.matches_pattern(file) || self.matches_extension(file)
    }
}

// ── Customization seams ──────────────────────────────────────────────────

/// Extra per-definition predicate on documents.
///
/// A matcher either answers synchronously, or reports [`is_async`] and
/// answers through [`matches_async`] when the answer needs real work
/// (e.g. looking through the project).
///
/// [`is_async`]: Self::is_async
/// [`matches_async`]: Self::matches_async
pub trait DocumentMatcher: Send + Sync {
    fn matches(&self, _document: &OpenDocument) -> bool {
        true
    }

    fn is_async(&self) -> bool {
        false
    }

    fn matches_async(&self, document: OpenDocument) -> BoxFuture<'static, bool> {
        let matched = self.matches(&document);
        Box::pin(async move { matched })
    }
}

/// What a definition produces for each new run.
pub trait ServerFactory: Send + Sync {
    /// A fresh provider per start, so a restart never shares a process
    /// with the teardown of the previous run.
    fn connection_provider(&self, definition: &ServerDefinition, project: &Project) -> Box<dyn ConnectionProvider>;

    fn client_callbacks(
        &self,
        _definition: &ServerDefinition,
        _project: &Project,
        default: Arc<dyn ClientCallbacks>,
    ) -> Arc<dyn ClientCallbacks> {
        default
    }

    /// Capabilities sent in `initialize`.
    fn client_capabilities(&self, _definition: &ServerDefinition) -> Value {
        client_capabilities()
    }
}

/// Launches the definition's command over stdio or TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFactory;

impl ServerFactory for DefaultFactory {
    fn connection_provider(&self, definition: &ServerDefinition, project: &Project) -> Box<dyn ConnectionProvider> {
        let launch = definition.launch_config();
        let cwd = project.root().map(Path::to_path_buf);
        match launch.transport.clone() {
            TransportKind::Stdio => Box::new(ProcessProvider::new(definition.id(), launch, cwd)),
            TransportKind::Tcp(address) => {
                let options = launch.initialization_options.clone();
                let process = (!launch.command.trim().is_empty())
                    .then(|| ProcessProvider::new(definition.id(), launch, cwd));
                Box::new(SocketProvider::new(address, process).with_initialization_options(options))
            }
        }
    }
}

// ── Definition ───────────────────────────────────────────────────────────

pub struct ServerDefinition {
    id: String,
    name: String,
    singleton: bool,
    launch: RwLock<LaunchConfig>,
    mappings: RwLock<Vec<LanguageMapping>>,
    idle_timeout: Duration,
    initialize_timeout: Duration,
    request_timeout: Duration,
    max_restart_attempts: u32,
    enabled: AtomicBool,
    /// Set when starts kept failing; cleared by re-enabling.
    disabled_by_failures: AtomicBool,
    project_enabled: RwLock<HashMap<String, bool>>,
    factory: Arc<dyn ServerFactory>,
    matcher: Option<Arc<dyn DocumentMatcher>>,
}

impl std::fmt::Debug for ServerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("singleton", &self.singleton)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl ServerDefinition {
    pub fn new(id: impl Into<String>, launch: LaunchConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            singleton: false,
            launch: RwLock::new(launch),
            mappings: RwLock::new(Vec::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            initialize_timeout: DEFAULT_INITIALIZE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_restart_attempts: MAX_RESTART_ATTEMPTS,
            enabled: AtomicBool::new(true),
            disabled_by_failures: AtomicBool::new(false),
            project_enabled: RwLock::new(HashMap::new()),
            factory: Arc::new(DefaultFactory),
            matcher: None,
        }
    }

    pub fn from_config(id: &str, config: &ServerConfig) -> Result<Self, ConfigError> {
        let launch = config.launch_config(id)?;
        let mut mappings = Vec::with_capacity(config.languages.len());
        for language in &config.languages {
            let mut mapping = LanguageMapping::new(&language.language_id).with_extensions(&language.extensions);
            for pattern in &language.file_patterns {
                mapping = mapping
                    .with_file_pattern(pattern)
                    .map_err(|e| ConfigError::Invalid {
                        id: id.to_string(),
                        message: format!("invalid file pattern '{pattern}': {e}"),
                    })?;
            }
            mappings.push(mapping);
        }

        let mut definition = Self::new(id, launch)
            .with_mappings(mappings)
            .with_singleton(config.singleton)
            .with_idle_timeout(config.idle_timeout())
            .with_initialize_timeout(config.initialize_timeout())
            .with_request_timeout(config.request_timeout())
            .with_max_restart_attempts(config.max_restart_attempts);
        if let Some(name) = &config.name {
            definition = definition.with_name(name);
        }
        definition.enabled.store(config.enabled, Ordering::Release);
        Ok(definition)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    #[must_use]
    pub fn with_mappings(self, mappings: Vec<LanguageMapping>) -> Self {
        *self.mappings.write() = mappings;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn ServerFactory>) -> Self {
        self.factory = factory;
        self
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: Arc<dyn DocumentMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn launch_config(&self) -> LaunchConfig {
        self.launch.read().clone()
    }

    pub fn mappings(&self) -> Vec<LanguageMapping> {
        self.mappings.read().clone()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn initialize_timeout(&self) -> Duration {
        self.initialize_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_restart_attempts(&self) -> u32 {
        self.max_restart_attempts
    }

    pub fn factory(&self) -> &Arc<dyn ServerFactory> {
        &self.factory
    }

    /// Globally enabled and not disabled by repeated start failures.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.disabled_by_failures.load(Ordering::Acquire)
    }

    pub fn is_disabled_by_failures(&self) -> bool {
        self.disabled_by_failures.load(Ordering::Acquire)
    }

    /// [`is_enabled`](Self::is_enabled), narrowed by any per-project
    /// override.
    pub fn is_enabled_for(&self, project: &Project) -> bool {
        self.is_enabled()
            && self
                .project_enabled
                .read()
                .get(project.id())
                .copied()
                .unwrap_or(true)
    }

    pub(crate) fn disable_after_failures(&self) {
        if !self.disabled_by_failures.swap(true, Ordering::AcqRel) {
            tracing::warn!(server = %self.id, "Too many failed starts; disabling");
        }
    }

    /// Forget an auto-disable; an explicit restart gets a fresh budget.
    pub(crate) fn clear_failures(&self) {
        if self.disabled_by_failures.swap(false, Ordering::AcqRel) {
            tracing::info!(server = %self.id, "Re-enabled after failed starts");
        }
    }

    fn set_enabled(&self, enabled: bool, project: Option<&str>) {
        match project {
            Some(project) => {
                self.project_enabled.write().insert(project.to_string(), enabled);
            }
            None => self.enabled.store(enabled, Ordering::Release),
        }
        if enabled {
            self.disabled_by_failures.store(false, Ordering::Release);
        }
    }

    /// Whether the language mappings accept `file`. A definition without
    /// mappings leaves the decision to its matcher.
    pub fn handles(&self, file: &FileIdentity) -> bool {
        let mappings = self.mappings.read();
        if mappings.is_empty() {
            return self.matcher.is_some();
        }
        mappings.iter().any(|m| m.matches(file))
    }

    /// Language id sent in `didOpen`.
    pub fn language_id_for(&self, file: &FileIdentity) -> String {
        let mappings = self.mappings.read();
        let mapped = mappings
            .iter()
            .find(|m| m.matches_pattern(file))
            .or_else(|| mappings.iter().find(|m| m.matches_extension(file)));
        if let Some(mapping) = mapped {
            return mapping.language_id.clone();
        }
        file.extension()
            .or_else(|| file.file_name())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Synchronous phase of document matching.
    fn matches_sync(&self, document: &OpenDocument) -> Option<bool> {
        if !self.handles(document.file()) {
            return Some(false);
        }
        match &self.matcher {
            None => Some(true),
            Some(matcher) if matcher.is_async() => None,
            Some(matcher) => Some(matcher.matches(document)),
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Which launch-relevant parts of a definition an update touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefinitionChanges {
    pub command: bool,
    pub env: bool,
    pub mappings: bool,
}

impl DefinitionChanges {
    /// Running connections have to be restarted to pick these up.
    pub fn requires_restart(&self) -> bool {
        self.command || self.env || self.mappings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionEvent {
    Added { id: String },
    Removed { id: String },
    Changed { id: String, changes: DefinitionChanges },
    /// `project` is `None` for the global switch.
    Enablement {
        id: String,
        project: Option<String>,
        enabled: bool,
    },
}

pub trait DefinitionListener: Send + Sync {
    fn definition_changed(&self, event: &DefinitionEvent);
}

/// New launch settings and mappings for an existing definition. `None`
/// keeps the current value.
#[derive(Debug, Default, Clone)]
pub struct DefinitionUpdate {
    pub launch: Option<LaunchConfig>,
    pub mappings: Option<Vec<LanguageMapping>>,
}

/// Every server definition known to the process.
#[derive(Default)]
pub struct ServerDefinitions {
    definitions: RwLock<BTreeMap<String, Arc<ServerDefinition>>>,
    listeners: Mutex<Vec<Weak<dyn DefinitionListener>>>,
    /// Connections of singleton definitions, shared by every project.
    singletons: Mutex<HashMap<String, Arc<ServerConnection>>>,
}

impl std::fmt::Debug for ServerDefinitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDefinitions")
            .field("definitions", &self.definitions.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ServerDefinitions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn from_config(config: &LspConfig) -> Result<Arc<Self>, ConfigError> {
        let definitions = Self::new();
        for (id, server) in &config.servers {
            definitions.add(ServerDefinition::from_config(id, server)?);
        }
        Ok(definitions)
    }

    /// Add or replace a definition. Replacing removes the old one first.
    pub fn add(&self, definition: ServerDefinition) -> Arc<ServerDefinition> {
        let id = definition.id.clone();
        if self.definitions.read().contains_key(&id) {
            self.remove(&id);
        }
        let definition = Arc::new(definition);
        self.definitions.write().insert(id.clone(), Arc::clone(&definition));
        tracing::debug!(server = %id, "Server definition added");
        self.emit(&DefinitionEvent::Added { id });
        definition
    }

    /// Remove a definition. Live connections are stopped by the listeners.
    pub fn remove(&self, id: &str) -> Option<Arc<ServerDefinition>> {
        let removed = self.definitions.write().remove(id)?;
        if let Some(connection) = self.singletons.lock().remove(id) {
            connection.stop();
        }
        tracing::debug!(server = %id, "Server definition removed");
        self.emit(&DefinitionEvent::Removed { id: id.to_string() });
        Some(removed)
    }

    /// Apply new launch settings or mappings. Returns what changed, or
    /// `None` for an unknown id.
    pub fn update(&self, id: &str, update: DefinitionUpdate) -> Option<DefinitionChanges> {
        let definition = self.get(id)?;
        let mut changes = DefinitionChanges::default();

        if let Some(launch) = update.launch {
            let mut current = definition.launch.write();
            changes.command = current.command != launch.command
                || current.args != launch.args
                || current.transport != launch.transport;
            changes.env = current.env != launch.env || current.include_system_env != launch.include_system_env;
            *current = launch;
        }
        if let Some(mappings) = update.mappings {
            let mut current = definition.mappings.write();
            changes.mappings = *current != mappings;
            *current = mappings;
        }

        if changes.requires_restart() {
            tracing::info!(server = %id, ?changes, "Server definition changed");
            let singleton = self.singletons.lock().get(id).cloned();
            if let Some(connection) = singleton {
                connection.restart();
            }
            self.emit(&DefinitionEvent::Changed {
                id: id.to_string(),
                changes,
            });
        }
        Some(changes)
    }

    /// Toggle a definition globally (`project` is `None`) or for one
    /// project. Enabling also clears a disable caused by failed starts.
    pub fn set_enabled(&self, id: &str, enabled: bool, project: Option<&Project>) -> bool {
        let Some(definition) = self.get(id) else {
            return false;
        };
        definition.set_enabled(enabled, project.map(Project::id));
        if !enabled && project.is_none() {
            let singleton = self.singletons.lock().get(id).cloned();
            if let Some(connection) = singleton {
                connection.stop();
            }
        }
        self.emit(&DefinitionEvent::Enablement {
            id: id.to_string(),
            project: project.map(|p| p.id().to_string()),
            enabled,
        });
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServerDefinition>> {
        self.definitions.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ServerDefinition>> {
        self.definitions.read().values().cloned().collect()
    }

    /// Enabled definitions accepted by the synchronous phase of matching.
    pub fn definitions_for(&self, document: &OpenDocument) -> Vec<Arc<ServerDefinition>> {
        self.enabled_for(document.project())
            .filter(|d| d.matches_sync(document) == Some(true))
            .collect()
    }

    /// Enabled definitions whose matcher answers asynchronously, paired
    /// with the pending answer.
    pub fn definitions_for_async(
        &self,
        document: &OpenDocument,
    ) -> Vec<(Arc<ServerDefinition>, BoxFuture<'static, bool>)> {
        self.enabled_for(document.project())
            .filter(|d| d.matches_sync(document).is_none())
            .filter_map(|d| {
                let pending = d.matcher.as_ref()?.matches_async(document.clone());
                Some((d, pending))
            })
            .collect()
    }

    fn enabled_for<'a>(&self, project: &'a Project) -> impl Iterator<Item = Arc<ServerDefinition>> + 'a {
        self.all().into_iter().filter(move |d| d.is_enabled_for(project))
    }

    pub fn add_listener(&self, listener: Weak<dyn DefinitionListener>) {
        self.listeners.lock().push(listener);
    }

    fn emit(&self, event: &DefinitionEvent) {
        let listeners: Vec<Arc<dyn DefinitionListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.definition_changed(event);
        }
    }

    /// The shared connection of a singleton definition, created by
    /// `create` on first use.
    pub(crate) fn singleton_connection(
        &self,
        id: &str,
        create: impl FnOnce() -> Arc<ServerConnection>,
    ) -> Arc<ServerConnection> {
        Arc::clone(self.singletons.lock().entry(id.to_string()).or_insert_with(create))
    }
}
