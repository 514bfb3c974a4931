//! Host-side identities: projects, files and open documents.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use url::Url;

use crate::protocol::{PathToUriError, WorkspaceFolder, path_to_file_uri};
use crate::text::TextBuffer;

/// A workspace opened by the host. Non-singleton connections are bound to
/// exactly one project.
pub struct Project {
    id: String,
    root: Option<PathBuf>,
    root_uri: Option<Url>,
    folders: Vec<WorkspaceFolder>,
    disposed: AtomicBool,
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Project {
    /// Project rooted at `root`, which becomes its single workspace folder.
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Arc<Self> {
        let root = root.into();
        let root_uri = path_to_file_uri(&root).ok();
        let folders = root_uri
            .iter()
            .map(|uri| WorkspaceFolder {
                uri: uri.clone(),
                name: root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| root.display().to_string()),
            })
            .collect();
        Arc::new(Self {
            id: id.into(),
            root: Some(root),
            root_uri,
            folders,
            disposed: AtomicBool::new(false),
        })
    }

    /// Project with no root on disk, e.g. for loose files.
    pub fn detached(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            root: None,
            root_uri: None,
            folders: Vec::new(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn root_uri(&self) -> Option<&Url> {
        self.root_uri.as_ref()
    }

    pub fn folders(&self) -> &[WorkspaceFolder] {
        &self.folders
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mark the project closed. Connections stopped afterwards tear down
    /// inline.
    pub fn mark_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn same(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Canonical identity of a file or folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    uri: Url,
    path: Option<PathBuf>,
    is_folder: bool,
}

impl FileIdentity {
    pub fn from_path(path: &Path) -> Result<Self, PathToUriError> {
        let uri = path_to_file_uri(path)?;
        Ok(Self {
            uri,
            path: Some(path.to_path_buf()),
            is_folder: false,
        })
    }

    pub fn from_uri(uri: &str) -> Result<Self, url::ParseError> {
        let uri = Url::parse(uri)?;
        let path = (uri.scheme() == "file")
            .then(|| uri.to_file_path().ok())
            .flatten();
        Ok(Self {
            uri,
            path,
            is_folder: false,
        })
    }

    #[must_use]
    pub fn with_folder(mut self, is_folder: bool) -> Self {
        self.is_folder = is_folder;
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Key for the connected-documents map.
    pub fn key(&self) -> &str {
        self.uri.as_str()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    pub fn file_name(&self) -> Option<String> {
        match &self.path {
            Some(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            None => self
                .uri
                .path()
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .map(String::from),
        }
    }

    pub fn extension(&self) -> Option<String> {
        let name = self.file_name()?;
        let (_, ext) = name.rsplit_once('.')?;
        (!ext.is_empty()).then(|| ext.to_string())
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri.as_str())
    }
}

/// A file the host has open in an editor.
#[derive(Debug, Clone)]
pub struct OpenDocument {
    file: FileIdentity,
    buffer: TextBuffer,
    project: Arc<Project>,
    language_id: Option<String>,
}

impl OpenDocument {
    pub fn new(file: FileIdentity, buffer: TextBuffer, project: Arc<Project>) -> Self {
        Self {
            file,
            buffer,
            project,
            language_id: None,
        }
    }

    /// Override language-id resolution for this document.
    #[must_use]
    pub fn with_language_id(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = Some(language_id.into());
        self
    }

    pub fn file(&self) -> &FileIdentity {
        &self.file
    }

    pub fn buffer(&self) -> &TextBuffer {
        &self.buffer
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn language_id(&self) -> Option<&str> {
        self.language_id.as_deref()
    }

    /// Same buffer and project under a new identity, used for renames.
    #[must_use]
    pub fn renamed(&self, file: FileIdentity) -> Self {
        Self {
            file,
            ..self.clone()
        }
    }
}
