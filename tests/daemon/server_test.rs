//! Control socket server tests.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use telos::protocol::MAX_MESSAGE_BYTES;
use telos::server::{ControlServer, SOCKET_MODE};
use tokio::sync::watch;

use super::support::{memory_handler, RawConn};

async fn serve_in(
    dir: &std::path::Path,
) -> (
    std::path::PathBuf,
    watch::Sender<bool>,
    tokio::task::JoinHandle<u64>,
) {
    let path = dir.join("ctl.sock");
    let server = ControlServer::bind(&path).expect("bind");
    let (_, handler) = memory_handler();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(server.serve(handler, rx));
    (path, tx, task)
}

#[tokio::test]
async fn ping_answers_pong() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _tx, _task) = serve_in(dir.path()).await;

    let mut conn = RawConn::connect(&path).await;
    let response = conn.request(r#"{"command":"PING","data":{}}"#).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["data"], "pong");
}

#[tokio::test]
async fn unknown_command_keeps_connection_usable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _tx, _task) = serve_in(dir.path()).await;

    let mut conn = RawConn::connect(&path).await;
    let response = conn.request(r#"{"command":"FOO","data":{}}"#).await;
    assert_eq!(
        response,
        serde_json::json!({"success": false, "error": "Unknown command: FOO"})
    );

    let response = conn.request(r#"{"command":"PING","data":{}}"#).await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn malformed_lines_get_validation_failures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _tx, _task) = serve_in(dir.path()).await;

    let mut conn = RawConn::connect(&path).await;
    let response = conn.request("this is not json").await;
    assert_eq!(response["success"], false);
    assert!(response["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("Invalid JSON: ")));

    let response = conn
        .request(r#"{"command":"UPDATE_TAINT","data":{"pid":1}}"#)
        .await;
    assert_eq!(response["error"], "Missing or invalid 'taint_level'");

    conn.write(b"\xff\xfe\n").await;
    let response = conn.read().await.expect("response");
    assert_eq!(response["success"], false);

    let state = conn.request(r#"{"command":"GET_STATE"}"#).await;
    assert_eq!(state["data"]["count"], 0);
}

#[tokio::test]
async fn data_must_be_an_object() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _tx, _task) = serve_in(dir.path()).await;

    let mut conn = RawConn::connect(&path).await;
    for line in [
        r#"{"command":"PING","data":[1,2]}"#,
        r#"{"command":"PING","data":"x"}"#,
    ] {
        let response = conn.request(line).await;
        assert_eq!(response["success"], false, "{line}");
        assert!(response["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("Invalid JSON: ")));
    }

    let response = conn.request(r#"{"command":"PING","data":null}"#).await;
    assert_eq!(response["data"], "pong");
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _tx, _task) = serve_in(dir.path()).await;

    let mut conn = RawConn::connect(&path).await;
    conn.write(
        concat!(
            r#"{"command":"REGISTER_AGENT","data":{"pid":100,"comm":"agent"}}"#,
            "\n",
            r#"{"command":"FOO"}"#,
            "\n",
            r#"{"command":"GET_STATE"}"#,
            "\n",
        )
        .as_bytes(),
    )
    .await;

    let first = conn.read().await.expect("first");
    let second = conn.read().await.expect("second");
    let third = conn.read().await.expect("third");
    assert_eq!(first, serde_json::json!({"success": true}));
    assert_eq!(second["error"], "Unknown command: FOO");
    assert_eq!(third["data"]["count"], 1);
    assert_eq!(third["data"]["processes"]["100"]["comm"], "agent");
}

#[tokio::test]
async fn oversize_line_closes_only_that_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _tx, _task) = serve_in(dir.path()).await;

    let mut big = RawConn::connect(&path).await;
    let mut other = RawConn::connect(&path).await;

    let mut line = vec![b'x'; MAX_MESSAGE_BYTES.saturating_add(10)];
    line.push(b'\n');
    big.write(&line).await;
    let response = big.read().await.expect("failure response");
    assert_eq!(response["success"], false);
    assert!(big.read().await.is_none(), "connection should be closed");

    let response = other.request(r#"{"command":"PING"}"#).await;
    assert_eq!(response["data"], "pong");
}

#[tokio::test]
async fn bind_replaces_stale_socket_and_sets_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("ctl.sock");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, b"stale").expect("stale file");

    let server = ControlServer::bind(&path).expect("bind");
    let mode = std::fs::metadata(server.path())
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, SOCKET_MODE);
}

#[tokio::test]
async fn shutdown_removes_socket_and_drops_clients() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, tx, task) = serve_in(dir.path()).await;

    let mut conn = RawConn::connect(&path).await;
    assert_eq!(conn.request(r#"{"command":"PING"}"#).await["success"], true);

    tx.send(true).expect("signal");
    let accepted = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server stops")
        .expect("join");
    assert_eq!(accepted, 1);
    assert!(!path.exists());
    assert!(conn.read().await.is_none());
}
