//! Shared text buffer with edit listeners.
//!
//! This is the host-facing "text buffer" primitive: the editor applies
//! edits through [`TextBuffer::apply`] and commits them with
//! [`TextBuffer::commit`]; document synchronizers subscribe as
//! [`BufferListener`]s. Offsets are UTF-16 code units.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::position::{LineIndex, byte_index};

/// Replace `old_len` units at `offset` with `new_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub offset: usize,
    pub old_len: usize,
    pub new_text: String,
}

impl TextChange {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            old_len: 0,
            new_text: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            old_len: len,
            new_text: String::new(),
        }
    }

    pub fn replace(offset: usize, old_len: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            old_len,
            new_text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("edit {offset}..{end} is outside the document (length {len})")]
pub struct EditOutOfBounds {
    pub offset: usize,
    pub end: usize,
    pub len: usize,
}

/// Receives a buffer's edit stream.
///
/// `before_change` sees the text as it was, `after_change` as it is now.
/// `committed` fires when the host finishes an undoable unit of edits.
pub trait BufferListener: Send + Sync {
    fn before_change(&self, _text: &str, _change: &TextChange) {}
    fn after_change(&self, _text: &str, _change: &TextChange) {}
    fn committed(&self, _text: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    /// Held for a whole edit, listener calls included, and while a
    /// listener subscribes with a snapshot.
    edit: Mutex<()>,
    text: RwLock<String>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn BufferListener>)>>,
    next_listener: AtomicU64,
}

/// Cheaply clonable handle; clones share the same text and listeners.
#[derive(Clone)]
pub struct TextBuffer {
    inner: Arc<Inner>,
}

impl fmt::Debug for TextBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextBuffer")
            .field("len", &self.len())
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                edit: Mutex::new(()),
                text: RwLock::new(text.into()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn text(&self) -> String {
        self.inner.text.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.text.read().encode_utf16().count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.text.read().is_empty()
    }

    pub fn line_index(&self) -> LineIndex {
        LineIndex::new(&self.inner.text.read())
    }

    pub fn line_count(&self) -> usize {
        self.line_index().line_count()
    }

    pub fn line_start_offset(&self, line: usize) -> Option<usize> {
        self.line_index().line_start(line)
    }

    pub fn line_end_offset(&self, line: usize) -> Option<usize> {
        self.line_index().line_end(line)
    }

    pub fn line_of_offset(&self, offset: usize) -> usize {
        self.line_index().line_of(offset)
    }

    /// Apply one edit, notifying listeners before and after.
    ///
    /// Edits are serialized, and listeners run under the edit lock, so a
    /// listener must not edit the buffer it listens to.
    pub fn apply(&self, change: &TextChange) -> Result<(), EditOutOfBounds> {
        let _edit = self.inner.edit.lock();
        self.apply_locked(change)
    }

    fn apply_locked(&self, change: &TextChange) -> Result<(), EditOutOfBounds> {
        let before = self.text();
        let len = before.encode_utf16().count();
        let end = change.offset.saturating_add(change.old_len);
        if end > len {
            return Err(EditOutOfBounds {
                offset: change.offset,
                end,
                len,
            });
        }

        let listeners = self.listeners();
        for listener in &listeners {
            listener.before_change(&before, change);
        }

        let after = {
            let mut text = self.inner.text.write();
            let start = byte_index(&text, change.offset);
            let stop = byte_index(&text, end);
            text.replace_range(start..stop, &change.new_text);
            text.clone()
        };

        for listener in &listeners {
            listener.after_change(&after, change);
        }
        Ok(())
    }

    pub fn insert(&self, offset: usize, text: &str) -> Result<(), EditOutOfBounds> {
        self.apply(&TextChange::insert(offset, text))
    }

    pub fn delete(&self, offset: usize, len: usize) -> Result<(), EditOutOfBounds> {
        self.apply(&TextChange::delete(offset, len))
    }

    /// Replace the whole content as a single edit.
    pub fn set_text(&self, text: &str) {
        let _edit = self.inner.edit.lock();
        let len = self.len();
        // Covers the whole document, so it cannot be out of bounds.
        let _ = self.apply_locked(&TextChange::replace(0, len, text));
    }

    /// Signal the end of an edit unit.
    pub fn commit(&self) {
        let text = self.text();
        for listener in self.listeners() {
            listener.committed(&text);
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn BufferListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, listener));
        id
    }

    /// Subscribe and copy the text in one step: every edit after the
    /// returned text reaches `listener`, and no earlier one does.
    pub fn subscribe_with_snapshot(&self, listener: Arc<dyn BufferListener>) -> (ListenerId, String) {
        let _edit = self.inner.edit.lock();
        let text = self.text();
        (self.subscribe(listener), text)
    }

    /// Returns whether a listener was removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn listeners(&self) -> Vec<Arc<dyn BufferListener>> {
        self.inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}
