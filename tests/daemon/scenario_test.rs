//! End-to-end enforcement: commands over the socket, decisions from the
//! simulated engine host.

use std::time::Duration;

use telos::client::ControlClient;
use telos::engine::{Caller, TaintLevel, Verdict};

use super::support::{start_simulated, test_config};

#[tokio::test]
async fn exec_follows_taint_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let (host, daemon) = start_simulated(&config);
    let mut client = ControlClient::connect(daemon.socket_path())
        .await
        .expect("connect");
    let agent = Caller::new(100, Some(1), "agent");

    client.register_agent(100, "agent").await.expect("register");
    assert_eq!(host.exec(&agent), Verdict::Allow);

    client
        .update_taint(100, TaintLevel::High)
        .await
        .expect("update");
    assert_eq!(host.exec(&agent), Verdict::Deny);

    client
        .update_taint(100, TaintLevel::Low)
        .await
        .expect("update");
    assert_eq!(host.exec(&agent), Verdict::Allow);

    daemon.shutdown().await;
}

#[tokio::test]
async fn clearing_taint_returns_process_to_untracked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let (host, daemon) = start_simulated(&config);
    let mut client = ControlClient::connect(daemon.socket_path())
        .await
        .expect("connect");
    let caller = Caller::new(200, None, "tool");

    client
        .update_taint(200, TaintLevel::Critical)
        .await
        .expect("update");
    assert_eq!(host.exec(&caller), Verdict::Deny);

    client.clear_taint(200).await.expect("clear");
    assert_eq!(host.exec(&caller), Verdict::Allow);
    assert_eq!(client.get_state().await.expect("state").count, 0);

    daemon.shutdown().await;
}

#[tokio::test]
async fn untracked_child_inherits_parent_taint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let (host, daemon) = start_simulated(&config);
    let mut client = ControlClient::connect(daemon.socket_path())
        .await
        .expect("connect");

    client
        .update_taint(300, TaintLevel::High)
        .await
        .expect("update");
    assert_eq!(host.exec(&Caller::new(301, Some(300), "sh")), Verdict::Deny);
    // Only one hop is followed.
    assert_eq!(host.exec(&Caller::new(302, Some(301), "sh")), Verdict::Allow);

    daemon.shutdown().await;
}

#[tokio::test]
async fn critical_process_cannot_open_ssh_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let (host, daemon) = start_simulated(&config);
    let mut client = ControlClient::connect(daemon.socket_path())
        .await
        .expect("connect");
    let caller = Caller::new(400, None, "cat");

    client
        .update_taint(400, TaintLevel::High)
        .await
        .expect("update");
    assert_eq!(host.open(&caller, "id_rsa"), Verdict::Allow);

    client
        .update_taint(400, TaintLevel::Critical)
        .await
        .expect("update");
    assert_eq!(host.open(&caller, "id_rsa"), Verdict::Deny);
    assert_eq!(host.open(&caller, "notes.txt"), Verdict::Allow);

    daemon.shutdown().await;
}

#[tokio::test]
async fn blocked_actions_reach_the_audit_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let (host, daemon) = start_simulated(&config);
    let mut client = ControlClient::connect(daemon.socket_path())
        .await
        .expect("connect");

    client
        .update_taint(500, TaintLevel::Critical)
        .await
        .expect("update");
    let caller = Caller::new(500, None, "curl");
    assert_eq!(host.exec(&caller), Verdict::Deny);
    assert_eq!(host.open(&caller, "id_ed25519"), Verdict::Deny);
    assert_eq!(host.exec(&Caller::new(501, None, "ls")), Verdict::Allow);

    let report = tokio::time::timeout(Duration::from_secs(10), daemon.shutdown())
        .await
        .expect("shutdown");
    assert_eq!(report.events, 2);

    let audit_path = config.daemon.audit_log.as_ref().expect("audit path");
    let log = std::fs::read_to_string(audit_path).expect("audit log");
    let entries: Vec<serde_json::Value> = log
        .lines()
        .map(|l| serde_json::from_str(l).expect("JSON line"))
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["action"], "execve");
    assert_eq!(entries[1]["action"], "open");
    assert!(entries.iter().all(|e| e["pid"] == 500 && e["comm"] == "curl"));
}

#[tokio::test]
async fn audit_mode_reports_without_denying() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.policy.enforce = false;
    let (host, daemon) = start_simulated(&config);
    let mut client = ControlClient::connect(daemon.socket_path())
        .await
        .expect("connect");

    client
        .update_taint(600, TaintLevel::Critical)
        .await
        .expect("update");
    assert_eq!(host.exec(&Caller::new(600, None, "sh")), Verdict::Allow);
    assert_eq!(host.emitted_events(), 1);

    let report = daemon.shutdown().await;
    assert_eq!(report.events, 1);
}

#[tokio::test]
async fn raised_exec_threshold_is_honoured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.policy.max_taint_for_exec = "HIGH".to_owned();
    let (host, daemon) = start_simulated(&config);
    let mut client = ControlClient::connect(daemon.socket_path())
        .await
        .expect("connect");

    client
        .update_taint(700, TaintLevel::High)
        .await
        .expect("update");
    assert_eq!(host.exec(&Caller::new(700, None, "sh")), Verdict::Allow);
    client
        .update_taint(700, TaintLevel::Critical)
        .await
        .expect("update");
    assert_eq!(host.exec(&Caller::new(700, None, "sh")), Verdict::Deny);

    daemon.shutdown().await;
}
