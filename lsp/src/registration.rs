//! `client/registerCapability` and `client/unregisterCapability`.
//!
//! Each registration is routed by method name to one of a fixed set of
//! handlers. A handler mutates [`CapabilityState`] and returns the closure
//! that undoes exactly that mutation; the closure is stored under the
//! registration id.

use lsp_types::{Registration, Unregistration};
use serde_json::Value;

use crate::capabilities::{CapabilityState, DocumentSelector, DynamicFeature, Feature};
use crate::error::RegistrationError;
use crate::watchers::FileSystemWatcher;

/// Undo closure for one registration.
pub(crate) type Unregister = Box<dyn FnOnce(&mut CapabilityState) + Send + Sync>;

const WORKSPACE_FOLDERS: &str = "workspace/didChangeWorkspaceFolders";
const WATCHED_FILES: &str = "workspace/didChangeWatchedFiles";
const EXECUTE_COMMAND: &str = "workspace/executeCommand";

/// Parsed form of one registration, before it touches any state.
enum RegisteredCapability {
    WorkspaceFolders,
    WatchedFiles(Vec<FileSystemWatcher>),
    Commands(Vec<String>),
    Feature(Feature, Value, DocumentSelector),
    /// Known to the protocol but nothing here consumes it.
    Ignored,
}

impl RegisteredCapability {
    fn parse(registration: &Registration) -> Result<Self, RegistrationError> {
        let malformed = |message: String| RegistrationError::Malformed {
            method: registration.method.clone(),
            message,
        };
        let options = registration.register_options.as_ref();

        match registration.method.as_str() {
            WORKSPACE_FOLDERS => Ok(Self::WorkspaceFolders),
            WATCHED_FILES => {
                let watchers = options
                    .and_then(|o| o.get("watchers"))
                    .and_then(Value::as_array)
                    .ok_or_else(|| malformed("missing watchers".into()))?;
                let mut parsed = Vec::with_capacity(watchers.len());
                for watcher in watchers {
                    match FileSystemWatcher::parse(watcher) {
                        Ok(w) => parsed.push(w),
                        Err(e) => tracing::warn!(id = %registration.id, error = %e, "Skipping file watcher"),
                    }
                }
                Ok(Self::WatchedFiles(parsed))
            }
            EXECUTE_COMMAND => {
                let commands = options
                    .and_then(|o| o.get("commands"))
                    .and_then(Value::as_array)
                    .ok_or_else(|| malformed("missing commands".into()))?
                    .iter()
                    .filter_map(|c| c.as_str().map(String::from))
                    .collect();
                Ok(Self::Commands(commands))
            }
            method => match Feature::from_method(method) {
                Some(feature) => {
                    let selector = DocumentSelector::from_options(options).map_err(malformed)?;
                    let options = options.cloned().unwrap_or(Value::Object(Default::default()));
                    Ok(Self::Feature(feature, options, selector))
                }
                None => Ok(Self::Ignored),
            },
        }
    }
}

impl CapabilityState {
    /// Apply one registration. Duplicate ids are rejected before anything
    /// is changed.
    pub fn register(&mut self, registration: Registration) -> Result<(), RegistrationError> {
        if self.registrations.contains_key(&registration.id) {
            return Err(RegistrationError::DuplicateId(registration.id));
        }
        let id = registration.id.clone();

        let unregister: Unregister = match RegisteredCapability::parse(&registration)? {
            RegisteredCapability::WorkspaceFolders => {
                self.workspace_folder_registrations += 1;
                Box::new(|state| {
                    state.workspace_folder_registrations = state.workspace_folder_registrations.saturating_sub(1);
                })
            }
            RegisteredCapability::WatchedFiles(watchers) => {
                self.watchers.insert(id.clone(), watchers);
                let key = id.clone();
                Box::new(move |state| {
                    state.watchers.remove(&key);
                })
            }
            RegisteredCapability::Commands(mut commands) => {
                commands.sort();
                commands.dedup();
                for command in &commands {
                    *self.command_registrations.entry(command.clone()).or_default() += 1;
                    if !self.commands.contains(command) {
                        self.commands.push(command.clone());
                    }
                }
                Box::new(move |state| state.release_commands(&commands))
            }
            RegisteredCapability::Feature(feature, options, selector) => {
                self.dynamic.push(DynamicFeature {
                    id: id.clone(),
                    feature,
                    options,
                    selector,
                });
                let key = id.clone();
                Box::new(move |state| state.dynamic.retain(|d| d.id != key))
            }
            RegisteredCapability::Ignored => {
                tracing::debug!(id = %id, method = %registration.method, "Ignoring registration");
                Box::new(|_| {})
            }
        };

        self.registrations.insert(id, unregister);
        Ok(())
    }

    /// Drop one registration's hold on `commands`. A command leaves the
    /// list with its last registration, unless the server declared it
    /// statically.
    fn release_commands(&mut self, commands: &[String]) {
        let declared = self.static_caps.commands();
        for command in commands {
            let Some(count) = self.command_registrations.get_mut(command) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.command_registrations.remove(command);
                if !declared.contains(command) {
                    self.commands.retain(|c| c != command);
                }
            }
        }
    }

    /// Returns whether `id` was registered. Unknown ids are a no-op.
    pub fn unregister(&mut self, id: &str) -> bool {
        match self.registrations.remove(id) {
            Some(undo) => {
                undo(self);
                true
            }
            None => false,
        }
    }

    /// Apply a `client/registerCapability` batch. Every entry is attempted;
    /// failures are returned alongside without stopping the rest.
    pub fn register_all(&mut self, registrations: Vec<Registration>) -> Vec<RegistrationError> {
        registrations
            .into_iter()
            .filter_map(|r| self.register(r).err())
            .collect()
    }

    pub fn unregister_all(&mut self, unregistrations: &[Unregistration]) {
        for u in unregistrations {
            if !self.unregister(&u.id) {
                tracing::debug!(id = %u.id, "Unregistering unknown id");
            }
        }
    }
}
