//! File watchers registered through `workspace/didChangeWatchedFiles`, and
//! the filters that gate `workspace/{did,will}{Create,Rename,Delete}Files`.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use serde_json::Value;
use url::Url;

use crate::workspace::FileIdentity;

pub const WATCH_CREATE: u8 = 1;
pub const WATCH_CHANGE: u8 = 2;
pub const WATCH_DELETE: u8 = 4;
pub const WATCH_ANY: u8 = WATCH_CREATE | WATCH_CHANGE | WATCH_DELETE;

/// LSP `FileChangeType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

impl FileChangeKind {
    pub const fn as_lsp(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Changed => 2,
            Self::Deleted => 3,
        }
    }

    const fn watch_bit(self) -> u8 {
        match self {
            Self::Created => WATCH_CREATE,
            Self::Changed => WATCH_CHANGE,
            Self::Deleted => WATCH_DELETE,
        }
    }
}

fn compile_glob(pattern: &str, case_insensitive: bool) -> Result<GlobMatcher, String> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .case_insensitive(case_insensitive)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| format!("invalid glob '{pattern}': {e}"))
}

#[derive(Debug, Clone)]
pub struct FileSystemWatcher {
    matcher: GlobMatcher,
    base: Option<PathBuf>,
    kind: u8,
}

impl FileSystemWatcher {
    /// Parse one entry of `DidChangeWatchedFilesRegistrationOptions.watchers`.
    ///
    /// `globPattern` is a string or a relative pattern
    /// `{ baseUri: Uri | WorkspaceFolder, pattern }`.
    pub fn parse(value: &Value) -> Result<Self, String> {
        let glob = value
            .get("globPattern")
            .ok_or_else(|| "watcher has no globPattern".to_string())?;

        let (pattern, base) = match glob {
            Value::String(pattern) => (pattern.as_str(), None),
            Value::Object(relative) => {
                let pattern = relative
                    .get("pattern")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "relative pattern has no pattern".to_string())?;
                let base_uri = match relative.get("baseUri") {
                    Some(Value::String(uri)) => Some(uri.as_str()),
                    Some(Value::Object(folder)) => folder.get("uri").and_then(Value::as_str),
                    _ => None,
                };
                let base = base_uri
                    .and_then(|uri| Url::parse(uri).ok())
                    .and_then(|uri| uri.to_file_path().ok());
                (pattern, base)
            }
            other => return Err(format!("unsupported globPattern {other}")),
        };

        let kind = match value.get("kind").and_then(Value::as_u64) {
            Some(kind) if kind > 0 && kind <= u64::from(WATCH_ANY) => kind as u8,
            _ => WATCH_ANY,
        };

        Ok(Self {
            matcher: compile_glob(pattern, false)?,
            base,
            kind,
        })
    }

    pub fn matches(&self, path: &Path, change: FileChangeKind) -> bool {
        if self.kind & change.watch_bit() == 0 {
            return false;
        }
        match &self.base {
            Some(base) => path
                .strip_prefix(base)
                .is_ok_and(|relative| self.matcher.is_match(relative)),
            None => self.matcher.is_match(path),
        }
    }
}

// ── File operations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOperation {
    WillCreate,
    DidCreate,
    WillRename,
    DidRename,
    WillDelete,
    DidDelete,
}

impl FileOperation {
    pub const fn capability_key(self) -> &'static str {
        match self {
            Self::WillCreate => "willCreate",
            Self::DidCreate => "didCreate",
            Self::WillRename => "willRename",
            Self::DidRename => "didRename",
            Self::WillDelete => "willDelete",
            Self::DidDelete => "didDelete",
        }
    }

    pub const fn method(self) -> &'static str {
        match self {
            Self::WillCreate => "workspace/willCreateFiles",
            Self::DidCreate => "workspace/didCreateFiles",
            Self::WillRename => "workspace/willRenameFiles",
            Self::DidRename => "workspace/didRenameFiles",
            Self::WillDelete => "workspace/willDeleteFiles",
            Self::DidDelete => "workspace/didDeleteFiles",
        }
    }

    /// `will*` operations are requests answered with a `WorkspaceEdit`.
    pub const fn is_request(self) -> bool {
        matches!(self, Self::WillCreate | Self::WillRename | Self::WillDelete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    File,
    Folder,
}

#[derive(Debug, Clone)]
struct FileOperationFilter {
    scheme: Option<String>,
    matcher: GlobMatcher,
    kind: Option<MatchKind>,
}

impl FileOperationFilter {
    fn parse(value: &Value) -> Result<Self, String> {
        let pattern = value
            .get("pattern")
            .ok_or_else(|| "filter has no pattern".to_string())?;
        let glob = pattern
            .get("glob")
            .and_then(Value::as_str)
            .ok_or_else(|| "filter pattern has no glob".to_string())?;
        let kind = match pattern.get("matches").and_then(Value::as_str) {
            Some("file") => Some(MatchKind::File),
            Some("folder") => Some(MatchKind::Folder),
            _ => None,
        };
        let ignore_case = pattern
            .pointer("/options/ignoreCase")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            scheme: value.get("scheme").and_then(Value::as_str).map(String::from),
            matcher: compile_glob(glob, ignore_case)?,
            kind,
        })
    }

    fn matches(&self, file: &FileIdentity) -> bool {
        if let Some(scheme) = &self.scheme
            && scheme != file.uri().scheme()
        {
            return false;
        }
        match self.kind {
            Some(MatchKind::File) if file.is_folder() => return false,
            Some(MatchKind::Folder) if !file.is_folder() => return false,
            _ => {}
        }
        match file.path() {
            Some(path) => self.matcher.is_match(path),
            None => self.matcher.is_match(file.uri().path()),
        }
    }
}

/// Compiled `FileOperationRegistrationOptions.filters`.
#[derive(Debug, Clone)]
pub struct FileOperationFilters(Vec<FileOperationFilter>);

impl FileOperationFilters {
    /// `None` when the options have no usable filters, which means the
    /// operation is not wanted at all.
    pub fn from_options(options: &Value) -> Option<Self> {
        let filters: Vec<_> = options
            .get("filters")?
            .as_array()?
            .iter()
            .filter_map(|f| match FileOperationFilter::parse(f) {
                Ok(filter) => Some(filter),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping file operation filter");
                    None
                }
            })
            .collect();
        (!filters.is_empty()).then_some(Self(filters))
    }

    pub fn matches(&self, file: &FileIdentity) -> bool {
        self.0.iter().any(|f| f.matches(file))
    }
}
