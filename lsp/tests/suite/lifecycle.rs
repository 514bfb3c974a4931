//! Start, stop, failure and idle behavior of a single server connection.

use std::sync::Arc;
use std::time::Duration;

use berth_lsp::{
    ErrorNotifier, Project, RuntimeSettings, ServerConnection, ServerDefinition, ServerDefinitions, ServerError,
    ServerStatus,
};
use futures_util::future::join_all;
use serde_json::json;

use crate::common::{FakeState, RecordingCallbacks, document, eventually, fake_definition, init_tracing};

fn connect_to(
    definition: ServerDefinition,
    settings: RuntimeSettings,
) -> (Arc<ServerConnection>, Arc<Project>, Arc<RecordingCallbacks>) {
    init_tracing();
    let project = Project::detached("p");
    let callbacks = RecordingCallbacks::new();
    let connection = ServerConnection::new(
        Arc::new(definition),
        Arc::clone(&project),
        callbacks.clone(),
        Arc::new(ErrorNotifier::default()),
        settings,
    );
    (connection, project, callbacks)
}

#[tokio::test]
async fn open_edit_close_round_trip() {
    let state = FakeState::new();
    let (conn, project, _) = connect_to(fake_definition("rust", &state), RuntimeSettings::headless());
    let doc = document("/p/main.rs", "fn main() {}\n", &project);

    let handle = conn.connect(&doc, true).await.unwrap();
    assert!(handle.is_alive());
    assert_eq!(conn.status(), ServerStatus::Started);
    eventually("didOpen", || state.count("textDocument/didOpen") == 1).await;
    assert_eq!(state.methods(), vec!["initialize", "initialized", "textDocument/didOpen"]);

    let opened = &state.params_of("textDocument/didOpen")[0]["textDocument"];
    assert_eq!(opened["uri"], "file:///p/main.rs");
    assert_eq!(opened["languageId"], "rust");
    assert_eq!(opened["version"], 1);
    assert_eq!(opened["text"], "fn main() {}\n");

    doc.buffer().insert(3, "x").unwrap();
    eventually("didChange", || state.count("textDocument/didChange") == 1).await;
    let change = &state.params_of("textDocument/didChange")[0];
    assert_eq!(change["textDocument"]["version"], 2);
    assert_eq!(
        change["contentChanges"][0]["range"],
        json!({ "start": { "line": 0, "character": 3 }, "end": { "line": 0, "character": 3 } })
    );
    assert_eq!(change["contentChanges"][0]["text"], "x");

    assert!(conn.disconnect(doc.file()));
    eventually("didClose", || state.count("textDocument/didClose") == 1).await;

    // Headless: the last disconnect stops the server right away.
    eventually("stopped", || conn.status() == ServerStatus::Stopped).await;
    doc.buffer().insert(0, "y").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.count("textDocument/didChange"), 1);
    assert_eq!(doc.buffer().listener_count(), 0);
}

#[tokio::test]
async fn concurrent_starts_share_one_initialize() {
    let state = FakeState::new();
    let (conn, _, callbacks) = connect_to(fake_definition("rust", &state), RuntimeSettings::headless());

    let handles = join_all((0..5).map(|_| conn.start())).await;
    assert!(handles.iter().all(Option::is_some));
    assert_eq!(state.starts(), 1);
    assert_eq!(state.count("initialize"), 1);
    assert_eq!(callbacks.statuses(), vec![ServerStatus::Starting, ServerStatus::Started]);
}

#[tokio::test]
async fn initialize_carries_folders_and_capabilities() {
    init_tracing();
    let state = FakeState::new();
    let project = Project::new("work", "/work");
    let conn = ServerConnection::new(
        Arc::new(fake_definition("rust", &state)),
        project,
        RecordingCallbacks::new(),
        Arc::new(ErrorNotifier::default()),
        RuntimeSettings::headless(),
    );
    conn.start().await.unwrap();

    let params = &state.params_of("initialize")[0];
    assert_eq!(params["rootUri"], "file:///work");
    assert_eq!(params["workspaceFolders"][0]["uri"], "file:///work");
    assert_eq!(params["workspaceFolders"][0]["name"], "work");
    assert!(params["capabilities"]["textDocument"]["synchronization"].is_object());
}

#[tokio::test]
async fn start_failures_disable_the_definition_until_re_enabled() {
    init_tracing();
    let state = FakeState::new();
    state.fail_next_starts(10);
    let definitions = ServerDefinitions::new();
    let definition = definitions.add(fake_definition("rust", &state).with_max_restart_attempts(3));
    let project = Project::detached("p");
    let callbacks = RecordingCallbacks::new();
    let conn = ServerConnection::new(
        Arc::clone(&definition),
        project,
        callbacks.clone(),
        Arc::new(ErrorNotifier::default()),
        RuntimeSettings::headless(),
    );

    for attempt in 1..=3 {
        assert!(conn.start().await.is_none());
        assert_eq!(conn.failed_starts(), attempt);
        assert!(matches!(conn.server_error(), Some(ServerError::Launch(_))));
    }
    assert!(definition.is_disabled_by_failures());

    assert!(conn.start().await.is_none());
    assert_eq!(state.starts(), 3, "a disabled definition is not started");
    // Identical failures are reported once.
    assert_eq!(callbacks.server_errors().len(), 1);

    state.fail_next_starts(0);
    assert!(definitions.set_enabled("rust", true, None));
    assert!(conn.start().await.is_some());
    assert_eq!(conn.failed_starts(), 0);
    assert!(conn.server_error().is_none());
}

#[tokio::test]
async fn restart_lifts_the_failure_disable() {
    init_tracing();
    let state = FakeState::new();
    state.fail_next_starts(2);
    let definitions = ServerDefinitions::new();
    let definition = definitions.add(fake_definition("rust", &state).with_max_restart_attempts(2));
    let conn = ServerConnection::new(
        Arc::clone(&definition),
        Project::detached("p"),
        RecordingCallbacks::new(),
        Arc::new(ErrorNotifier::default()),
        RuntimeSettings::headless(),
    );
    assert!(conn.start().await.is_none());
    assert!(conn.start().await.is_none());
    assert!(definition.is_disabled_by_failures());
    assert!(conn.start().await.is_none());
    assert_eq!(state.starts(), 2);

    state.fail_next_starts(0);
    conn.restart().unwrap().await.unwrap();
    assert_eq!(conn.status(), ServerStatus::Started);
    assert_eq!(state.starts(), 3);
    assert_eq!(conn.failed_starts(), 0);
    assert!(!definition.is_disabled_by_failures());
    assert!(definition.is_enabled());
}

#[tokio::test]
async fn crash_is_recorded_and_next_start_recovers() {
    let state = FakeState::new();
    let (conn, _, callbacks) = connect_to(fake_definition("rust", &state), RuntimeSettings::headless());
    conn.start().await.unwrap();

    state.crash();
    eventually("unexpected stop", || {
        conn.status() == ServerStatus::Stopped && conn.server_error().is_some_and(|e| e.is_unexpected_stop())
    })
    .await;
    assert_eq!(conn.failed_starts(), 1);
    assert!(callbacks.server_errors().iter().any(ServerError::is_unexpected_stop));
    assert_eq!(state.count("shutdown"), 0, "no handshake with a dead server");

    assert!(conn.start().await.is_some());
    assert_eq!(state.starts(), 2);
    assert_eq!(conn.failed_starts(), 0);
    assert!(conn.server_error().is_none());
}

#[tokio::test]
async fn stop_runs_shutdown_then_exit_without_did_close() {
    let state = FakeState::new();
    let (conn, project, callbacks) = connect_to(fake_definition("rust", &state), RuntimeSettings::headless());
    let doc = document("/p/main.rs", "", &project);
    conn.connect(&doc, true).await.unwrap();

    conn.stop().unwrap().await.unwrap();
    assert_eq!(conn.status(), ServerStatus::Stopped);
    assert!(conn.connected_files().is_empty());
    assert!(conn.capabilities().is_none());
    eventually("exit", || state.count("exit") == 1).await;

    let methods = state.methods();
    let shutdown = methods.iter().position(|m| m == "shutdown").unwrap();
    let exit = methods.iter().position(|m| m == "exit").unwrap();
    assert!(shutdown < exit);
    assert_eq!(state.count("textDocument/didClose"), 0);
    assert_eq!(state.stops(), 1);
    assert_eq!(
        callbacks.statuses(),
        vec![
            ServerStatus::Starting,
            ServerStatus::Started,
            ServerStatus::Stopping,
            ServerStatus::Stopped
        ]
    );
    assert!(conn.stop().is_none(), "second stop is a no-op");
}

#[tokio::test]
async fn initialize_timeout_is_a_start_failure() {
    let state = FakeState::new();
    state.script.lock().hang_initialize = true;
    let definition = fake_definition("rust", &state).with_initialize_timeout(Duration::from_millis(100));
    let (conn, _, _) = connect_to(definition, RuntimeSettings::headless());

    assert!(conn.start().await.is_none());
    assert_eq!(
        conn.server_error(),
        Some(ServerError::InitializeTimeout(Duration::from_millis(100)))
    );
    assert_eq!(conn.failed_starts(), 1);
}

#[tokio::test]
async fn initialize_error_is_a_start_failure() {
    let state = FakeState::new();
    state.script.lock().initialize_error = Some((-32603, "no workspace".into()));
    let (conn, _, _) = connect_to(fake_definition("rust", &state), RuntimeSettings::headless());

    assert!(conn.start().await.is_none());
    match conn.server_error() {
        Some(ServerError::Initialize(error)) => {
            assert_eq!(error.code, -32603);
            assert_eq!(error.message, "no workspace");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn idle_timer_stops_after_last_disconnect() {
    let state = FakeState::new();
    let definition = fake_definition("rust", &state).with_idle_timeout(Duration::from_millis(50));
    let (conn, project, _) = connect_to(definition, RuntimeSettings::default());
    let doc = document("/p/main.rs", "", &project);
    conn.connect(&doc, false).await.unwrap();

    conn.disconnect(doc.file());
    assert!(conn.has_idle_timer());
    assert_eq!(conn.status(), ServerStatus::Started);
    eventually("idle stop", || conn.status() == ServerStatus::Stopped).await;
    assert!(!conn.has_idle_timer());
}

#[tokio::test]
async fn reconnect_cancels_idle_timer() {
    let state = FakeState::new();
    let definition = fake_definition("rust", &state).with_idle_timeout(Duration::from_millis(100));
    let (conn, project, _) = connect_to(definition, RuntimeSettings::default());
    let doc = document("/p/main.rs", "", &project);
    conn.connect(&doc, false).await.unwrap();

    conn.disconnect(doc.file());
    assert!(conn.has_idle_timer());
    conn.connect(&doc, false).await.unwrap();
    assert!(!conn.has_idle_timer());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(conn.status(), ServerStatus::Started);
    assert_eq!(state.starts(), 1);
}

#[tokio::test]
async fn keep_alive_guard_holds_an_idle_server() {
    let state = FakeState::new();
    let definition = fake_definition("rust", &state).with_idle_timeout(Duration::from_millis(50));
    let (conn, project, _) = connect_to(definition, RuntimeSettings::default());
    let doc = document("/p/main.rs", "", &project);
    conn.connect(&doc, false).await.unwrap();

    let guard = conn.keep_alive();
    conn.disconnect(doc.file());
    assert!(conn.should_stay_alive());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(conn.status(), ServerStatus::Started);

    drop(guard);
    eventually("idle stop", || conn.status() == ServerStatus::Stopped).await;
}

#[tokio::test]
async fn pin_overrides_headless_idle_stop() {
    let state = FakeState::new();
    let (conn, project, _) = connect_to(fake_definition("rust", &state), RuntimeSettings::headless());
    let doc = document("/p/main.rs", "", &project);
    conn.connect(&doc, true).await.unwrap();

    conn.pin();
    conn.disconnect(doc.file());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.status(), ServerStatus::Started);

    conn.unpin();
    eventually("stop after unpin", || conn.status() == ServerStatus::Stopped).await;
}

#[tokio::test]
async fn restart_reopens_documents_with_higher_versions() {
    let state = FakeState::new();
    let (conn, project, _) = connect_to(fake_definition("rust", &state), RuntimeSettings::headless());
    let doc = document("/p/main.rs", "fn main() {}\n", &project);
    conn.connect(&doc, true).await.unwrap();
    eventually("first didOpen", || state.count("textDocument/didOpen") == 1).await;

    conn.restart().unwrap().await.unwrap();
    assert_eq!(state.starts(), 2);
    eventually("second didOpen", || state.count("textDocument/didOpen") == 2).await;
    let versions: Vec<_> = state
        .params_of("textDocument/didOpen")
        .iter()
        .map(|p| p["textDocument"]["version"].as_i64().unwrap())
        .collect();
    assert_eq!(versions, vec![1, 2]);
    assert!(conn.is_connected(doc.file()));
}
