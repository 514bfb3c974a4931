//! One-shot completion signal.
//!
//! A [`Signal`] is completed at most once and can be awaited by any number
//! of waiters, including ones that subscribe after completion. Clones share
//! the same slot, so handing out clones never re-runs the work behind it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

pub struct Signal<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("complete", &self.slot.borrow().is_some())
            .finish()
    }
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` unless the signal already completed. Returns whether
    /// this call completed it.
    pub fn complete(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            // The sender lives in `self.slot`, so this only fails after
            // `self` is gone, which cannot happen while we borrow it.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Whether both handles share one slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}
