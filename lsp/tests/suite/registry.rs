//! Connection registry across several definitions and projects.

use std::sync::Arc;

use berth_lsp::{
    ConnectionRegistry, DefinitionUpdate, Feature, Project, RuntimeSettings, ServerDefinitions, ServerStatus,
};
use serde_json::json;

use crate::common::{FakeState, RecordingCallbacks, document, eventually, fake_definition, file, init_tracing};

fn registry(definitions: &Arc<ServerDefinitions>, project: &Arc<Project>) -> Arc<ConnectionRegistry> {
    init_tracing();
    ConnectionRegistry::new(
        Arc::clone(project),
        Arc::clone(definitions),
        RecordingCallbacks::new(),
        RuntimeSettings::headless(),
    )
}

#[tokio::test]
async fn servers_are_filtered_by_what_they_support() {
    let plain = FakeState::new();
    let hover = FakeState::with_capabilities(json!({ "textDocumentSync": 2, "hoverProvider": true }));
    let definitions = ServerDefinitions::new();
    definitions.add(fake_definition("plain", &plain));
    definitions.add(fake_definition("hover", &hover));
    let project = Project::detached("p");
    let registry = registry(&definitions, &project);
    let doc = document("/p/main.rs", "fn main() {}\n", &project);

    let all = registry.get_language_servers(&doc, |_| true).await;
    assert_eq!(all.len(), 2);

    let hovering = registry.servers_for(&doc, Feature::Hover).await;
    assert_eq!(hovering.len(), 1);
    assert_eq!(hovering[0].server_id(), "hover");
    assert!(hovering[0].capabilities().is_some_and(|c| c.supports(Feature::Hover)));

    // Connections are reused on the second lookup.
    assert_eq!(plain.starts(), 1);
    assert_eq!(hover.starts(), 1);
    assert_eq!(registry.connections().len(), 2);
    assert_eq!(registry.started_servers().len(), 2);
    assert_eq!(registry.server_status("hover"), ServerStatus::Started);
    assert_eq!(registry.server_status("missing"), ServerStatus::None);

    assert!(registry.has_any(&doc, |c| c.supports(Feature::Hover)));
    assert!(!registry.has_any(&doc, |c| c.supports(Feature::Rename)));
    let unopened = document("/p/other.rs", "", &project);
    assert!(!registry.has_any(&unopened, |_| true));

    let python = document("/p/main.py", "", &project);
    assert!(registry.get_language_servers(&python, |_| true).await.is_empty());
}

#[tokio::test]
async fn close_and_save_reach_every_holder() {
    let state = FakeState::new();
    let definitions = ServerDefinitions::new();
    definitions.add(fake_definition("rust", &state));
    let project = Project::detached("p");
    let registry = registry(&definitions, &project);
    let doc = document("/p/main.rs", "x", &project);
    let servers = registry.get_language_servers(&doc, |_| true).await;
    servers[0].connection().pin();

    registry.file_saved(doc.file());
    registry.file_closed(doc.file());
    eventually("didClose", || state.count("textDocument/didClose") == 1).await;
    assert_eq!(state.count("textDocument/didSave"), 1);
    assert!(!servers[0].connection().is_connected(doc.file()));
}

#[tokio::test]
async fn rename_moves_the_document_and_notifies_matching_servers() {
    let state = FakeState::with_capabilities(json!({
        "textDocumentSync": 2,
        "workspace": {
            "fileOperations": {
                "didRename": { "filters": [{ "pattern": { "glob": "**/*.rs" } }] }
            }
        }
    }));
    let definitions = ServerDefinitions::new();
    definitions.add(fake_definition("rust", &state));
    let project = Project::detached("p");
    let registry = registry(&definitions, &project);
    let doc = document("/p/old.rs", "fn main() {}\n", &project);
    registry.get_language_servers(&doc, |_| true).await;

    let moved = doc.renamed(file("/p/new.rs"));
    let outcome = registry.file_renamed(doc.file(), &moved).await;
    assert_eq!(outcome.reconnected.len(), 1);
    assert!(outcome.failed.is_empty());

    let connection = registry.connections().remove(0);
    assert!(connection.is_connected(moved.file()));
    assert!(!connection.is_connected(doc.file()));
    assert_eq!(connection.status(), ServerStatus::Started, "rename never stops the server");

    eventually("didRenameFiles", || state.count("workspace/didRenameFiles") == 1).await;
    assert_eq!(
        state.params_of("textDocument/didClose")[0]["textDocument"]["uri"],
        "file:///p/old.rs"
    );
    let opened = state.params_of("textDocument/didOpen");
    assert_eq!(opened[1]["textDocument"]["uri"], "file:///p/new.rs");
    assert_eq!(opened[1]["textDocument"]["text"], "fn main() {}\n");
    assert_eq!(
        state.params_of("workspace/didRenameFiles")[0],
        json!({ "files": [{ "oldUri": "file:///p/old.rs", "newUri": "file:///p/new.rs" }] })
    );
}

#[tokio::test]
async fn dispose_shuts_servers_down_before_returning() {
    let state = FakeState::new();
    let definitions = ServerDefinitions::new();
    definitions.add(fake_definition("rust", &state));
    let project = Project::detached("p");
    let registry = registry(&definitions, &project);
    let doc = document("/p/main.rs", "", &project);
    let servers = registry.get_language_servers(&doc, |_| true).await;
    let connection = Arc::clone(servers[0].connection());

    registry.dispose().await;
    assert_eq!(connection.status(), ServerStatus::Stopped);
    assert_eq!(state.count("shutdown"), 1);
    assert_eq!(state.stops(), 1);
    assert!(project.is_disposed());
    assert!(registry.connections().is_empty());
    assert!(registry.get_language_servers(&doc, |_| true).await.is_empty());
    assert_eq!(state.starts(), 1);
}

#[tokio::test]
async fn launch_change_restarts_running_connections() {
    let state = FakeState::new();
    let definitions = ServerDefinitions::new();
    let definition = definitions.add(fake_definition("rust", &state));
    let project = Project::detached("p");
    let registry = registry(&definitions, &project);
    let doc = document("/p/main.rs", "", &project);
    registry.get_language_servers(&doc, |_| true).await;

    let mut launch = definition.launch_config();
    launch.args.push("--verbose".into());
    let changes = definitions
        .update(
            "rust",
            DefinitionUpdate {
                launch: Some(launch),
                ..DefinitionUpdate::default()
            },
        )
        .unwrap();
    assert!(changes.command);

    eventually("restart", || {
        state.starts() == 2 && state.count("textDocument/didOpen") == 2
    })
    .await;
    assert_eq!(registry.server_status("rust"), ServerStatus::Started);

    // Only initialization options changed: nothing to restart.
    let mut launch = definition.launch_config();
    launch.initialization_options = Some(json!({ "checkOnSave": false }));
    let changes = definitions
        .update(
            "rust",
            DefinitionUpdate {
                launch: Some(launch),
                ..DefinitionUpdate::default()
            },
        )
        .unwrap();
    assert!(!changes.requires_restart());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(state.starts(), 2);
}

#[tokio::test]
async fn removing_a_definition_stops_its_connections() {
    let state = FakeState::new();
    let definitions = ServerDefinitions::new();
    definitions.add(fake_definition("rust", &state));
    let project = Project::detached("p");
    let registry = registry(&definitions, &project);
    let doc = document("/p/main.rs", "", &project);
    let servers = registry.get_language_servers(&doc, |_| true).await;
    let connection = Arc::clone(servers[0].connection());

    assert!(definitions.remove("rust").is_some());
    assert!(registry.connections().is_empty());
    eventually("stopped", || connection.status() == ServerStatus::Stopped).await;
    eventually("exit", || state.count("exit") == 1).await;
    assert!(registry.get_language_servers(&doc, |_| true).await.is_empty());
}

#[tokio::test]
async fn disabling_for_one_project_leaves_the_other_running() {
    let state = FakeState::new();
    let definitions = ServerDefinitions::new();
    definitions.add(fake_definition("rust", &state));
    let a = Project::detached("a");
    let b = Project::detached("b");
    let registry_a = registry(&definitions, &a);
    let registry_b = registry(&definitions, &b);
    let doc_a = document("/a/main.rs", "", &a);
    let doc_b = document("/b/main.rs", "", &b);
    registry_a.get_language_servers(&doc_a, |_| true).await;
    registry_b.get_language_servers(&doc_b, |_| true).await;
    assert_eq!(state.starts(), 2, "each project has its own connection");

    assert!(definitions.set_enabled("rust", false, Some(&a)));
    eventually("a stopped", || registry_a.server_status("rust") == ServerStatus::Stopped).await;
    assert_eq!(registry_b.server_status("rust"), ServerStatus::Started);
    assert!(registry_a.get_language_servers(&doc_a, |_| true).await.is_empty());
    assert_eq!(registry_b.get_language_servers(&doc_b, |_| true).await.len(), 1);

    assert!(definitions.set_enabled("rust", true, Some(&a)));
    assert_eq!(registry_a.get_language_servers(&doc_a, |_| true).await.len(), 1);
    assert_eq!(state.starts(), 3);
}
