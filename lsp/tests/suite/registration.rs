//! Server-initiated traffic: dynamic registration, workspace requests and
//! diagnostics.

use std::sync::Arc;

use berth_lsp::{
    ErrorNotifier, Feature, FileChangeKind, Project, RpcError, RuntimeSettings, ServerConnection,
};
use serde_json::{Value, json};

use crate::common::{
    FakeState, RecordingCallbacks, document, eventually, fake_definition, file, init_tracing,
};

async fn started(
    state: &Arc<FakeState>,
    project: Arc<Project>,
) -> (Arc<ServerConnection>, Arc<RecordingCallbacks>) {
    init_tracing();
    let callbacks = RecordingCallbacks::new();
    let conn = ServerConnection::new(
        Arc::new(fake_definition("rust", state)),
        project,
        callbacks.clone(),
        Arc::new(ErrorNotifier::default()),
        RuntimeSettings::headless(),
    );
    conn.pin();
    conn.start().await.unwrap();
    (conn, callbacks)
}

/// Send a request from the server and wait for the client's answer.
async fn ask(state: &FakeState, method: &str, params: Value) -> Value {
    let id = state.send_request(method, params);
    eventually(method, || state.response_to(id).is_some()).await;
    state.response_to(id).unwrap()
}

fn register(registrations: Value) -> Value {
    json!({ "registrations": registrations })
}

#[tokio::test]
async fn dynamic_feature_follows_its_document_selector() {
    let state = FakeState::new();
    let project = Project::detached("p");
    let (conn, _) = started(&state, Arc::clone(&project)).await;
    let rust = document("/p/main.rs", "", &project);
    let python = document("/p/main.py", "", &project).with_language_id("python");
    assert!(!conn.supports(Feature::Hover));

    let reply = ask(
        &state,
        "client/registerCapability",
        register(json!([{
            "id": "hover-1",
            "method": "textDocument/hover",
            "registerOptions": { "documentSelector": [{ "language": "rust" }] }
        }])),
    )
    .await;
    assert!(reply.get("error").is_none(), "{reply}");
    assert!(conn.supports(Feature::Hover));
    assert!(conn.supports_for(Feature::Hover, &rust));
    assert!(!conn.supports_for(Feature::Hover, &python));

    let reply = ask(
        &state,
        "client/unregisterCapability",
        json!({ "unregisterations": [{ "id": "hover-1", "method": "textDocument/hover" }] }),
    )
    .await;
    assert!(reply.get("error").is_none(), "{reply}");
    assert!(!conn.supports(Feature::Hover));
    assert!(!conn.supports_for(Feature::Hover, &rust));
}

#[tokio::test]
async fn duplicate_registration_id_is_rejected() {
    let state = FakeState::new();
    let (conn, callbacks) = started(&state, Project::detached("p")).await;
    let hover = json!([{ "id": "same", "method": "textDocument/hover" }]);

    let first = ask(&state, "client/registerCapability", register(hover.clone())).await;
    assert!(first.get("error").is_none());

    let second = ask(&state, "client/registerCapability", register(hover)).await;
    assert_eq!(second["error"]["code"], -32602);
    assert_eq!(callbacks.internal_errors().len(), 1);
    assert_eq!(conn.with_capabilities(|c| c.registration_count()), Some(1));
}

#[tokio::test]
async fn malformed_registration_does_not_block_its_siblings() {
    let state = FakeState::new();
    let (conn, _) = started(&state, Project::detached("p")).await;

    let reply = ask(
        &state,
        "client/registerCapability",
        register(json!([
            { "id": "bad", "method": "textDocument/hover", "registerOptions": { "documentSelector": {} } },
            { "id": "good", "method": "textDocument/definition" },
        ])),
    )
    .await;
    assert!(reply.get("error").is_none(), "{reply}");
    assert!(!conn.supports(Feature::Hover));
    assert!(conn.supports(Feature::Definition));
}

#[tokio::test]
async fn watched_files_only_get_the_kinds_they_asked_for() {
    let state = FakeState::new();
    let (conn, _) = started(&state, Project::detached("p")).await;
    assert!(!conn.notify_file_events(&[(file("/p/src/lib.rs"), FileChangeKind::Created)]));

    ask(
        &state,
        "client/registerCapability",
        register(json!([{
            "id": "watch",
            "method": "workspace/didChangeWatchedFiles",
            "registerOptions": { "watchers": [{ "globPattern": "**/*.rs", "kind": 1 }] }
        }])),
    )
    .await;

    assert!(!conn.notify_file_events(&[(file("/p/src/lib.rs"), FileChangeKind::Changed)]));
    assert!(!conn.notify_file_events(&[(file("/p/Cargo.toml"), FileChangeKind::Created)]));
    assert!(conn.notify_file_events(&[
        (file("/p/src/lib.rs"), FileChangeKind::Created),
        (file("/p/src/new.rs"), FileChangeKind::Deleted),
    ]));

    eventually("didChangeWatchedFiles", || {
        state.count("workspace/didChangeWatchedFiles") == 1
    })
    .await;
    let params = &state.params_of("workspace/didChangeWatchedFiles")[0];
    assert_eq!(
        params["changes"],
        json!([{ "uri": "file:///p/src/lib.rs", "type": 1 }])
    );
}

#[tokio::test]
async fn commands_come_from_static_and_dynamic_capabilities() {
    let state = FakeState::with_capabilities(json!({
        "textDocumentSync": 2,
        "executeCommandProvider": { "commands": ["fake.static"] }
    }));
    state
        .script
        .lock()
        .responses
        .insert("workspace/executeCommand".into(), json!("done"));
    let (conn, _) = started(&state, Project::detached("p")).await;

    assert_eq!(conn.execute_command("fake.static", &[json!(1)]).await.unwrap(), json!("done"));
    let err = conn.execute_command("fake.dynamic", &[]).await.unwrap_err();
    assert!(matches!(err, RpcError::Unsupported(command) if command == "fake.dynamic"));

    ask(
        &state,
        "client/registerCapability",
        register(json!([{
            "id": "cmd",
            "method": "workspace/executeCommand",
            "registerOptions": { "commands": ["fake.dynamic"] }
        }])),
    )
    .await;
    assert_eq!(conn.execute_command("fake.dynamic", &[]).await.unwrap(), json!("done"));

    let sent = state.params_of("workspace/executeCommand");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], json!({ "command": "fake.static", "arguments": [1] }));
    assert_eq!(sent[1]["command"], "fake.dynamic");
}

#[tokio::test]
async fn workspace_requests_are_answered() {
    let state = FakeState::new();
    let (_conn, _) = started(&state, Project::new("work", "/work")).await;

    let configuration = ask(
        &state,
        "workspace/configuration",
        json!({ "items": [{ "section": "a" }, { "section": "b" }] }),
    )
    .await;
    assert_eq!(configuration["result"], json!([null, null]));

    let folders = ask(&state, "workspace/workspaceFolders", Value::Null).await;
    assert_eq!(folders["result"][0]["uri"], "file:///work");
    assert_eq!(folders["result"][0]["name"], "work");

    let progress = ask(&state, "window/workDoneProgress/create", json!({ "token": "t" })).await;
    assert!(progress.get("error").is_none());

    let unknown = ask(&state, "fake/unknownRequest", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);
}

#[tokio::test]
async fn published_diagnostics_are_validated_against_the_document() {
    let state = FakeState::new();
    let project = Project::detached("p");
    let (conn, callbacks) = started(&state, Arc::clone(&project)).await;
    let doc = document("/p/main.rs", "fn main() {}\n", &project);
    conn.connect(&doc, true).await.unwrap();

    let diagnostic = |line: u32, message: &str| {
        json!({
            "range": {
                "start": { "line": line, "character": 0 },
                "end": { "line": line, "character": 2 }
            },
            "severity": 1,
            "message": message
        })
    };
    state.send_notification(
        "textDocument/publishDiagnostics",
        json!({
            "uri": "file:///p/main.rs",
            "diagnostics": [diagnostic(0, "kept"), diagnostic(9, "out of range")]
        }),
    );
    eventually("diagnostics", || !callbacks.diagnostics().is_empty()).await;

    let (uri, items) = &callbacks.diagnostics()[0];
    assert_eq!(uri.as_str(), "file:///p/main.rs");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].message, "kept");
    assert_eq!(conn.diagnostics(doc.file()).len(), 1);
    assert_eq!(conn.diagnostic_error_count(), 1, "dropped diagnostics are not counted");

    // Files that are not connected are forwarded but not cached.
    state.send_notification(
        "textDocument/publishDiagnostics",
        json!({ "uri": "file:///p/other.rs", "diagnostics": [diagnostic(9, "elsewhere")] }),
    );
    eventually("second publish", || callbacks.diagnostics().len() == 2).await;
    assert_eq!(callbacks.diagnostics()[1].1.len(), 1);
    assert!(conn.diagnostics(&file("/p/other.rs")).is_empty());
    assert_eq!(conn.diagnostics_snapshot().len(), 1);
    assert_eq!(conn.diagnostic_error_count(), 1);
}
