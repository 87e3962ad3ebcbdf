//! Command-line surface of `telosd`.

use assert_cmd::Command;
use telos::server::ControlServer;
use telos::store::PROCESS_MAP_PIN;

fn telosd() -> Command {
    Command::cargo_bin("telosd").expect("telosd binary")
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn help_lists_subcommands() {
    let output = telosd().arg("--help").output().expect("run");
    assert!(output.status.success());
    let stdout = stdout_of(&output);
    for subcommand in ["start", "clean-pins", "ctl"] {
        assert!(stdout.contains(subcommand), "missing {subcommand}");
    }
}

#[test]
fn clean_pins_removes_pinned_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pin_dir = dir.path().join("telos");
    std::fs::create_dir_all(&pin_dir).expect("mkdir");
    std::fs::write(pin_dir.join(PROCESS_MAP_PIN), b"").expect("pin");

    let output = telosd()
        .arg("clean-pins")
        .arg("--pin-dir")
        .arg(&pin_dir)
        .output()
        .expect("run");
    assert!(output.status.success());
    assert!(stdout_of(&output).contains(PROCESS_MAP_PIN));
    assert!(!pin_dir.exists());
}

#[test]
fn ctl_fails_without_daemon() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = telosd()
        .arg("ctl")
        .arg("--socket")
        .arg(dir.path().join("absent.sock"))
        .arg("ping")
        .output()
        .expect("run");
    assert!(!output.status.success());
}

#[test]
fn start_with_unknown_config_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = telosd()
        .arg("start")
        .arg("--simulate")
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .output()
        .expect("run");
    assert!(!output.status.success());
}

#[tokio::test(flavor = "multi_thread")]
async fn ctl_talks_to_a_running_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("ctl.sock");
    let server = ControlServer::bind(&socket).expect("bind");
    let state = std::sync::Arc::new(telos::store::MemoryState::new());
    let handler = telos::handler::CommandHandler::new(state);
    let (tx, rx) = tokio::sync::watch::channel(false);
    let serving = tokio::spawn(server.serve(handler, rx));

    let ctl = |args: Vec<String>| {
        let socket = socket.clone();
        tokio::task::spawn_blocking(move || {
            telosd()
                .arg("ctl")
                .arg("--socket")
                .arg(&socket)
                .args(args)
                .output()
                .expect("run")
        })
    };

    let ping = ctl(vec!["ping".into()]).await.expect("join");
    assert!(ping.status.success());
    assert_eq!(stdout_of(&ping).trim(), "pong");

    let update = ctl(vec!["update-taint".into(), "42".into(), "high".into()])
        .await
        .expect("join");
    assert!(update.status.success());

    let bad = ctl(vec!["update-taint".into(), "42".into(), "severe".into()])
        .await
        .expect("join");
    assert!(!bad.status.success());

    let state = ctl(vec!["state".into()]).await.expect("join");
    assert!(state.status.success());
    let snapshot: serde_json::Value =
        serde_json::from_str(&stdout_of(&state)).expect("state JSON");
    assert_eq!(snapshot["count"], 1);
    assert_eq!(snapshot["processes"]["42"]["taint_level"], 3);

    tx.send(true).expect("signal");
    serving.await.expect("join");
}
