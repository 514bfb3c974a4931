//! Diagnostics store: the latest `publishDiagnostics` per document, for
//! one connection.

use std::collections::HashMap;

use lsp_types::{Diagnostic, DiagnosticSeverity};

use crate::position::{LineIndex, range_to_offsets};

fn is_error(diagnostic: &Diagnostic) -> bool {
    diagnostic.severity == Some(DiagnosticSeverity::ERROR)
}

/// Drop diagnostics whose range does not fit `text`.
pub fn validate(server: &str, uri: &str, text: &str, items: Vec<Diagnostic>) -> Vec<Diagnostic> {
    let index = LineIndex::new(text);
    items
        .into_iter()
        .filter(|d| {
            let ok = range_to_offsets(&index, &d.range).is_some();
            if !ok {
                tracing::debug!(server, uri, range = ?d.range, "Dropping diagnostic with invalid range");
            }
            ok
        })
        .collect()
}

#[derive(Debug, Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<String, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, uri: String, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(&uri);
        } else {
            self.data.insert(uri, items);
        }
    }

    pub fn get(&self, uri: &str) -> Vec<Diagnostic> {
        self.data.get(uri).cloned().unwrap_or_default()
    }

    pub fn remove(&mut self, uri: &str) {
        self.data.remove(uri);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Documents with errors first, then by URI.
    pub fn snapshot(&self) -> Vec<(String, Vec<Diagnostic>)> {
        let mut files: Vec<(String, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(is_error);
            let b_has_errors = b.1.iter().any(is_error);
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });
        files
    }

    pub fn error_count(&self) -> usize {
        self.data.values().flatten().filter(|d| is_error(d)).count()
    }
}
