//! Document synchronization against a live session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use berth_lsp::{ErrorNotifier, Project, RuntimeSettings, ServerConnection, SyncKind};
use futures_util::future::join_all;
use serde_json::{Value, json};

use crate::common::{FakeState, RecordingCallbacks, document, eventually, fake_definition, init_tracing};

fn connection(state: &Arc<FakeState>, settings: RuntimeSettings) -> (Arc<ServerConnection>, Arc<Project>) {
    init_tracing();
    let project = Project::detached("p");
    let connection = ServerConnection::new(
        Arc::new(fake_definition("rust", state)),
        Arc::clone(&project),
        RecordingCallbacks::new(),
        Arc::new(ErrorNotifier::default()),
        settings,
    );
    (connection, project)
}

fn versions(state: &FakeState, method: &str) -> Vec<i64> {
    state
        .params_of(method)
        .iter()
        .map(|p| p["textDocument"]["version"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn concurrent_connects_share_one_synchronizer() {
    let state = FakeState::new();
    let (conn, project) = connection(&state, RuntimeSettings::headless());
    let doc = document("/p/main.rs", "fn main() {}\n", &project);

    let results = join_all((0..8).map(|_| conn.connect(&doc, true))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(conn.document_count(), 1);

    let sync = conn.synchronizer(doc.file()).unwrap();
    assert!(Arc::ptr_eq(&sync, &conn.synchronizer(doc.file()).unwrap()));
    assert!(sync.did_open().ptr_eq(&sync.did_open()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.count("textDocument/didOpen"), 1);
    assert_eq!(doc.buffer().listener_count(), 1);
}

#[tokio::test]
async fn versions_increase_once_per_flush() {
    let state = FakeState::new();
    let (conn, project) = connection(&state, RuntimeSettings::default());
    let doc = document("/p/main.rs", "abc", &project);
    conn.connect(&doc, false).await.unwrap();
    let sync = conn.synchronizer(doc.file()).unwrap();
    assert_eq!(sync.sync_kind(), SyncKind::Incremental);

    doc.buffer().insert(3, "d").unwrap();
    doc.buffer().insert(4, "e").unwrap();
    doc.buffer().delete(0, 1).unwrap();
    assert_eq!(sync.pending_changes(), 3);
    doc.buffer().commit();
    assert_eq!(sync.pending_changes(), 0);
    assert_eq!(sync.version(), 2);

    doc.buffer().commit();
    doc.buffer().insert(0, "z").unwrap();
    doc.buffer().commit();

    eventually("two didChange", || state.count("textDocument/didChange") == 2).await;
    assert_eq!(versions(&state, "textDocument/didOpen"), vec![1]);
    assert_eq!(versions(&state, "textDocument/didChange"), vec![2, 3]);
    let first = &state.params_of("textDocument/didChange")[0];
    assert_eq!(first["contentChanges"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn full_sync_sends_only_the_latest_text() {
    let state = FakeState::with_capabilities(json!({ "textDocumentSync": 1 }));
    let (conn, project) = connection(&state, RuntimeSettings::default());
    let doc = document("/p/main.rs", "", &project);
    conn.connect(&doc, false).await.unwrap();
    let sync = conn.synchronizer(doc.file()).unwrap();

    for (offset, text) in ["a", "b", "c"].into_iter().enumerate() {
        doc.buffer().insert(offset, text).unwrap();
    }
    assert_eq!(sync.pending_changes(), 1);
    doc.buffer().commit();

    eventually("didChange", || state.count("textDocument/didChange") == 1).await;
    let change = &state.params_of("textDocument/didChange")[0];
    let changes = change["contentChanges"].as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["text"], "abc");
    assert!(changes[0].get("range").is_none_or(Value::is_null));
}

#[tokio::test]
async fn no_sync_reports_no_edits() {
    let state = FakeState::with_capabilities(json!({ "textDocumentSync": 0 }));
    let (conn, project) = connection(&state, RuntimeSettings::headless());
    let doc = document("/p/main.rs", "", &project);
    conn.connect(&doc, true).await.unwrap();

    doc.buffer().insert(0, "x").unwrap();
    doc.buffer().commit();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.count("textDocument/didChange"), 0);
}

#[tokio::test]
async fn save_follows_the_negotiated_options() {
    let state = FakeState::with_capabilities(json!({
        "textDocumentSync": { "openClose": true, "change": 2, "save": { "includeText": true } }
    }));
    let (conn, project) = connection(&state, RuntimeSettings::headless());
    let doc = document("/p/main.rs", "saved", &project);
    conn.connect(&doc, true).await.unwrap();

    assert!(conn.did_save(doc.file()));
    eventually("didSave", || state.count("textDocument/didSave") == 1).await;
    assert_eq!(state.params_of("textDocument/didSave")[0]["text"], "saved");

    let quiet = FakeState::with_capabilities(json!({
        "textDocumentSync": { "openClose": true, "change": 2 }
    }));
    let (conn, project) = connection(&quiet, RuntimeSettings::headless());
    let doc = document("/p/main.rs", "saved", &project);
    conn.connect(&doc, true).await.unwrap();
    assert!(!conn.did_save(doc.file()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(quiet.count("textDocument/didSave"), 0);
}

#[tokio::test]
async fn reconnect_never_reuses_a_version() {
    let state = FakeState::new();
    let (conn, project) = connection(&state, RuntimeSettings::headless());
    conn.pin();
    let doc = document("/p/main.rs", "", &project);

    conn.connect(&doc, true).await.unwrap();
    doc.buffer().insert(0, "x").unwrap();
    conn.disconnect(doc.file());
    conn.connect(&doc, true).await.unwrap();

    eventually("second didOpen", || state.count("textDocument/didOpen") == 2).await;
    assert_eq!(versions(&state, "textDocument/didOpen"), vec![1, 3]);
    assert_eq!(versions(&state, "textDocument/didChange"), vec![2]);
    assert_eq!(state.count("textDocument/didClose"), 1);
}

#[tokio::test]
async fn notifications_keep_queue_order() {
    let state = FakeState::new();
    let (conn, project) = connection(&state, RuntimeSettings::headless());
    let doc = document("/p/main.rs", "", &project);

    // Edit while didOpen may still be queued.
    conn.connect(&doc, false).await.unwrap();
    for i in 0..5 {
        doc.buffer().insert(i, "x").unwrap();
    }

    eventually("all edits", || state.count("textDocument/didChange") == 5).await;
    let methods: Vec<String> = state
        .methods()
        .into_iter()
        .filter(|m| m != "initialize")
        .collect();
    assert_eq!(methods[0], "initialized");
    assert_eq!(methods[1], "textDocument/didOpen");
    assert_eq!(versions(&state, "textDocument/didChange"), vec![2, 3, 4, 5, 6]);
    let starts: Vec<Value> = state
        .params_of("textDocument/didChange")
        .iter()
        .map(|p| p["contentChanges"][0]["range"]["start"]["character"].clone())
        .collect();
    assert_eq!(starts, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edits_racing_the_attach_reach_the_server() {
    for round in 0..20 {
        let state = FakeState::new();
        let (conn, project) = connection(&state, RuntimeSettings::headless());
        conn.start().await.unwrap();
        let doc = document("/p/main.rs", "", &project);

        let stop = Arc::new(AtomicBool::new(false));
        let typist = {
            let buffer = doc.buffer().clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    buffer.insert(0, "x").unwrap();
                    std::thread::yield_now();
                }
            })
        };
        conn.connect(&doc, true).await.unwrap();
        stop.store(true, Ordering::Relaxed);
        typist.join().unwrap();

        let expected = doc.buffer().text();
        eventually(&format!("server text, round {round}"), || {
            state.server_text("file:///p/main.rs").as_deref() == Some(expected.as_str())
        })
        .await;
        conn.disconnect(doc.file());
    }
}
