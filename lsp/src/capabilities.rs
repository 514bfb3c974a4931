//! Server capability lookups.
//!
//! Static capabilities are kept as the raw JSON the server sent and
//! inspected structurally: a provider is supported when it is `true` or an
//! options object, and unsupported when it is absent, `null` or `false`.
//! Resolve variants additionally need `resolveProvider: true` in the
//! options. Dynamic registrations are layered on top in
//! [`CapabilityState`].

use std::collections::HashMap;

use globset::{GlobBuilder, GlobMatcher};
use lsp_types::{TextDocumentSyncCapability, TextDocumentSyncKind};
use serde_json::Value;

use crate::registration::Unregister;
use crate::watchers::{FileChangeKind, FileOperation, FileOperationFilters, FileSystemWatcher};
use crate::workspace::OpenDocument;

/// A client-visible LSP operation whose availability depends on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Completion,
    CompletionResolve,
    Hover,
    SignatureHelp,
    Declaration,
    Definition,
    TypeDefinition,
    Implementation,
    References,
    DocumentHighlight,
    DocumentSymbol,
    CodeAction,
    CodeActionResolve,
    CodeLens,
    CodeLensResolve,
    DocumentLink,
    DocumentLinkResolve,
    DocumentColor,
    Formatting,
    RangeFormatting,
    OnTypeFormatting,
    Rename,
    PrepareRename,
    FoldingRange,
    SelectionRange,
    LinkedEditingRange,
    CallHierarchy,
    TypeHierarchy,
    SemanticTokens,
    InlayHint,
    InlayHintResolve,
    Diagnostic,
    WorkspaceSymbol,
    ExecuteCommand,
}

impl Feature {
    pub const ALL: [Self; 34] = [
        Self::Completion,
        Self::CompletionResolve,
        Self::Hover,
        Self::SignatureHelp,
        Self::Declaration,
        Self::Definition,
        Self::TypeDefinition,
        Self::Implementation,
        Self::References,
        Self::DocumentHighlight,
        Self::DocumentSymbol,
        Self::CodeAction,
        Self::CodeActionResolve,
        Self::CodeLens,
        Self::CodeLensResolve,
        Self::DocumentLink,
        Self::DocumentLinkResolve,
        Self::DocumentColor,
        Self::Formatting,
        Self::RangeFormatting,
        Self::OnTypeFormatting,
        Self::Rename,
        Self::PrepareRename,
        Self::FoldingRange,
        Self::SelectionRange,
        Self::LinkedEditingRange,
        Self::CallHierarchy,
        Self::TypeHierarchy,
        Self::SemanticTokens,
        Self::InlayHint,
        Self::InlayHintResolve,
        Self::Diagnostic,
        Self::WorkspaceSymbol,
        Self::ExecuteCommand,
    ];

    /// Protocol method used to register the feature dynamically.
    pub const fn method(self) -> &'static str {
        match self {
            Self::Completion => "textDocument/completion",
            Self::CompletionResolve => "completionItem/resolve",
            Self::Hover => "textDocument/hover",
            Self::SignatureHelp => "textDocument/signatureHelp",
            Self::Declaration => "textDocument/declaration",
            Self::Definition => "textDocument/definition",
            Self::TypeDefinition => "textDocument/typeDefinition",
            Self::Implementation => "textDocument/implementation",
            Self::References => "textDocument/references",
            Self::DocumentHighlight => "textDocument/documentHighlight",
            Self::DocumentSymbol => "textDocument/documentSymbol",
            Self::CodeAction => "textDocument/codeAction",
            Self::CodeActionResolve => "codeAction/resolve",
            Self::CodeLens => "textDocument/codeLens",
            Self::CodeLensResolve => "codeLens/resolve",
            Self::DocumentLink => "textDocument/documentLink",
            Self::DocumentLinkResolve => "documentLink/resolve",
            Self::DocumentColor => "textDocument/documentColor",
            Self::Formatting => "textDocument/formatting",
            Self::RangeFormatting => "textDocument/rangeFormatting",
            Self::OnTypeFormatting => "textDocument/onTypeFormatting",
            Self::Rename => "textDocument/rename",
            Self::PrepareRename => "textDocument/prepareRename",
            Self::FoldingRange => "textDocument/foldingRange",
            Self::SelectionRange => "textDocument/selectionRange",
            Self::LinkedEditingRange => "textDocument/linkedEditingRange",
            Self::CallHierarchy => "textDocument/prepareCallHierarchy",
            Self::TypeHierarchy => "textDocument/prepareTypeHierarchy",
            Self::SemanticTokens => "textDocument/semanticTokens",
            Self::InlayHint => "textDocument/inlayHint",
            Self::InlayHintResolve => "inlayHint/resolve",
            Self::Diagnostic => "textDocument/diagnostic",
            Self::WorkspaceSymbol => "workspace/symbol",
            Self::ExecuteCommand => "workspace/executeCommand",
        }
    }

    /// Key of the provider in `ServerCapabilities`.
    pub const fn provider_key(self) -> &'static str {
        match self {
            Self::Completion | Self::CompletionResolve => "completionProvider",
            Self::Hover => "hoverProvider",
            Self::SignatureHelp => "signatureHelpProvider",
            Self::Declaration => "declarationProvider",
            Self::Definition => "definitionProvider",
            Self::TypeDefinition => "typeDefinitionProvider",
            Self::Implementation => "implementationProvider",
            Self::References => "referencesProvider",
            Self::DocumentHighlight => "documentHighlightProvider",
            Self::DocumentSymbol => "documentSymbolProvider",
            Self::CodeAction | Self::CodeActionResolve => "codeActionProvider",
            Self::CodeLens | Self::CodeLensResolve => "codeLensProvider",
            Self::DocumentLink | Self::DocumentLinkResolve => "documentLinkProvider",
            Self::DocumentColor => "colorProvider",
            Self::Formatting => "documentFormattingProvider",
            Self::RangeFormatting => "documentRangeFormattingProvider",
            Self::OnTypeFormatting => "documentOnTypeFormattingProvider",
            Self::Rename | Self::PrepareRename => "renameProvider",
            Self::FoldingRange => "foldingRangeProvider",
            Self::SelectionRange => "selectionRangeProvider",
            Self::LinkedEditingRange => "linkedEditingRangeProvider",
            Self::CallHierarchy => "callHierarchyProvider",
            Self::TypeHierarchy => "typeHierarchyProvider",
            Self::SemanticTokens => "semanticTokensProvider",
            Self::InlayHint | Self::InlayHintResolve => "inlayHintProvider",
            Self::Diagnostic => "diagnosticProvider",
            Self::WorkspaceSymbol => "workspaceSymbolProvider",
            Self::ExecuteCommand => "executeCommandProvider",
        }
    }

    /// The options flag a resolve variant requires, if this is one.
    const fn resolve_flag(self) -> Option<&'static str> {
        match self {
            Self::CompletionResolve
            | Self::CodeActionResolve
            | Self::CodeLensResolve
            | Self::DocumentLinkResolve
            | Self::InlayHintResolve => Some("resolveProvider"),
            Self::PrepareRename => Some("prepareProvider"),
            _ => None,
        }
    }

    /// The base feature a resolve variant refines.
    const fn base(self) -> Self {
        match self {
            Self::CompletionResolve => Self::Completion,
            Self::CodeActionResolve => Self::CodeAction,
            Self::CodeLensResolve => Self::CodeLens,
            Self::DocumentLinkResolve => Self::DocumentLink,
            Self::InlayHintResolve => Self::InlayHint,
            Self::PrepareRename => Self::Rename,
            other => other,
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.method() == method)
    }
}

/// `Either<bool, Options>` check.
pub fn is_supported(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true) | Value::Object(_)))
}

/// A resolve flag counts only when it is literally `true`.
pub fn is_resolve_supported(options: Option<&Value>, flag: &str) -> bool {
    options
        .and_then(|o| o.get(flag))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

// ── Text document sync ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    None,
    Full,
    Incremental,
}

/// Negotiated text sync behavior for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub kind: SyncKind,
    /// Whether `didSave` goes out at all.
    pub send_save: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            kind: SyncKind::Full,
            send_save: true,
        }
    }
}

impl SyncSettings {
    /// Read `textDocumentSync`. A missing or unparseable value means full
    /// sync. With the options form, a missing `save` suppresses `didSave`.
    pub fn from_capability(value: Option<&Value>) -> Self {
        let Some(parsed) = value
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value::<TextDocumentSyncCapability>(v.clone()).ok())
        else {
            return Self::default();
        };
        match parsed {
            TextDocumentSyncCapability::Kind(kind) => Self {
                kind: sync_kind(Some(kind)),
                send_save: true,
            },
            TextDocumentSyncCapability::Options(options) => Self {
                kind: sync_kind(options.change),
                send_save: options.save.is_some(),
            },
        }
    }
}

fn sync_kind(kind: Option<TextDocumentSyncKind>) -> SyncKind {
    match kind {
        Some(k) if k == TextDocumentSyncKind::NONE => SyncKind::None,
        Some(k) if k == TextDocumentSyncKind::INCREMENTAL => SyncKind::Incremental,
        _ => SyncKind::Full,
    }
}

// ── Static capabilities ──────────────────────────────────────────────────

/// The `capabilities` object from the `initialize` result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerCapabilities {
    raw: Value,
}

impl ServerCapabilities {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn supports(&self, feature: Feature) -> bool {
        let provider = self.raw.get(feature.base().provider_key());
        match feature.resolve_flag() {
            Some(flag) => is_resolve_supported(provider, flag),
            None => is_supported(provider),
        }
    }

    pub fn sync(&self) -> SyncSettings {
        SyncSettings::from_capability(self.raw.get("textDocumentSync"))
    }

    pub fn workspace_folders_supported(&self) -> bool {
        self.raw
            .pointer("/workspace/workspaceFolders/supported")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn commands(&self) -> Vec<String> {
        self.raw
            .pointer("/executeCommandProvider/commands")
            .and_then(Value::as_array)
            .map(|cmds| {
                cmds.iter()
                    .filter_map(|c| c.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn file_operation_options(&self, op: FileOperation) -> Option<&Value> {
        self.raw
            .pointer(&format!("/workspace/fileOperations/{}", op.capability_key()))
    }
}

// ── Document selectors ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DocumentFilter {
    language: Option<String>,
    scheme: Option<String>,
    pattern: Option<GlobMatcher>,
}

impl DocumentFilter {
    pub fn parse(value: &Value) -> Result<Self, String> {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(String::from);
        let pattern = match field("pattern") {
            Some(glob) => Some(
                GlobBuilder::new(&glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| format!("invalid pattern '{glob}': {e}"))?
                    .compile_matcher(),
            ),
            None => None,
        };
        Ok(Self {
            language: field("language"),
            scheme: field("scheme"),
            pattern,
        })
    }

    pub fn matches(&self, document: &OpenDocument, language_id: &str) -> bool {
        if let Some(language) = &self.language
            && language != language_id
        {
            return false;
        }
        if let Some(scheme) = &self.scheme
            && scheme != document.file().uri().scheme()
        {
            return false;
        }
        if let Some(pattern) = &self.pattern {
            return document
                .file()
                .path()
                .is_some_and(|path| pattern.is_match(path));
        }
        true
    }
}

/// `None` means "any document".
#[derive(Debug, Clone, Default)]
pub struct DocumentSelector(Option<Vec<DocumentFilter>>);

impl DocumentSelector {
    pub fn any() -> Self {
        Self(None)
    }

    /// Parse the `documentSelector` of registration options.
    pub fn from_options(options: Option<&Value>) -> Result<Self, String> {
        let Some(selector) = options
            .and_then(|o| o.get("documentSelector"))
            .filter(|s| !s.is_null())
        else {
            return Ok(Self::any());
        };
        let filters = selector
            .as_array()
            .ok_or_else(|| "documentSelector is not an array".to_string())?
            .iter()
            .map(DocumentFilter::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(Some(filters)))
    }

    pub fn matches(&self, document: &OpenDocument, language_id: &str) -> bool {
        match &self.0 {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(document, language_id)),
        }
    }
}

// ── Live state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct DynamicFeature {
    pub id: String,
    pub feature: Feature,
    pub options: Value,
    pub selector: DocumentSelector,
}

/// Static capabilities plus everything registered at runtime. One per
/// running server; cleared on stop.
#[derive(Default)]
pub struct CapabilityState {
    pub(crate) static_caps: ServerCapabilities,
    pub(crate) dynamic: Vec<DynamicFeature>,
    /// Static `workspaceFolders.supported`.
    pub(crate) workspace_folders: bool,
    pub(crate) workspace_folder_registrations: usize,
    /// Static commands followed by dynamically registered ones.
    pub(crate) commands: Vec<String>,
    /// Live registrations per dynamic command.
    pub(crate) command_registrations: HashMap<String, usize>,
    pub(crate) watchers: HashMap<String, Vec<FileSystemWatcher>>,
    pub(crate) registrations: HashMap<String, Unregister>,
}

impl CapabilityState {
    pub fn new(caps: ServerCapabilities) -> Self {
        Self {
            workspace_folders: caps.workspace_folders_supported(),
            commands: caps.commands(),
            static_caps: caps,
            ..Self::default()
        }
    }

    pub fn static_capabilities(&self) -> &ServerCapabilities {
        &self.static_caps
    }

    /// Supported statically or through any dynamic registration.
    pub fn supports(&self, feature: Feature) -> bool {
        self.static_caps.supports(feature) || self.dynamic_options(feature).next().is_some()
    }

    /// Like [`supports`](Self::supports), but dynamic registrations only
    /// count when their document selector matches `document`.
    pub fn supports_for(&self, feature: Feature, document: &OpenDocument, language_id: &str) -> bool {
        if self.static_caps.supports(feature) {
            return true;
        }
        let base = feature.base();
        self.dynamic.iter().any(|d| {
            d.feature == base
                && d.selector.matches(document, language_id)
                && match feature.resolve_flag() {
                    Some(flag) => is_resolve_supported(Some(&d.options), flag),
                    None => true,
                }
        })
    }

    fn dynamic_options(&self, feature: Feature) -> impl Iterator<Item = &Value> {
        let base = feature.base();
        let flag = feature.resolve_flag();
        self.dynamic
            .iter()
            .filter(move |d| {
                d.feature == base
                    && flag.is_none_or(|flag| is_resolve_supported(Some(&d.options), flag))
            })
            .map(|d| &d.options)
    }

    pub fn sync(&self) -> SyncSettings {
        self.static_caps.sync()
    }

    pub fn workspace_folders_supported(&self) -> bool {
        self.workspace_folders || self.workspace_folder_registrations > 0
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn supports_command(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }

    /// Whether any registered watcher wants `kind` events for `path`.
    pub fn watches(&self, path: &std::path::Path, kind: FileChangeKind) -> bool {
        self.watchers
            .values()
            .flatten()
            .any(|w| w.matches(path, kind))
    }

    pub fn file_operation_filters(&self, op: FileOperation) -> Option<FileOperationFilters> {
        self.static_caps
            .file_operation_options(op)
            .and_then(FileOperationFilters::from_options)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }
}
