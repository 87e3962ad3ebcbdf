//! Bootstrap ordering, fatal and best-effort failures, shutdown.

use telos::daemon::{BootstrapError, Daemon};
use telos::engine::{Caller, EngineConfig, TaintLevel, Verdict};
use telos::host::{Hook, SensitiveFiles, SimulatedHost};
use telos::store::SharedState;

use super::support::{start_simulated, test_config};

#[tokio::test]
async fn start_attaches_all_hooks_and_writes_policy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let (host, daemon) = start_simulated(&config);

    assert_eq!(daemon.attached_hooks(), &Hook::ALL);
    for hook in Hook::ALL {
        assert!(host.is_attached(hook), "{hook} should be attached");
    }
    assert_eq!(
        daemon.state().load_config().expect("config"),
        Some(EngineConfig::DEFAULT)
    );
    assert!(daemon.socket_path().exists());
    // The simulated host has nothing to pin.
    assert!(daemon.pinned_path().is_none());

    daemon.shutdown().await;
}

#[tokio::test]
async fn mandatory_attach_failure_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let host = SimulatedHost::new(SensitiveFiles::default()).fail_attach(Hook::ExecGate);

    let result = Daemon::start(Box::new(host.clone()), &config);
    assert!(matches!(result, Err(BootstrapError::MandatoryAttach(_))));
    assert!(!config.daemon.socket_path.exists(), "nothing may be served");
    assert!(host.state().load_config().expect("config").is_none());
}

#[tokio::test]
async fn optional_attach_failure_reduces_surface() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let host = SimulatedHost::new(SensitiveFiles::default()).fail_attach(Hook::FileOpenGate);

    let daemon = Daemon::start(Box::new(host.clone()), &config).expect("bootstrap");
    assert_eq!(daemon.attached_hooks(), &[Hook::ExecGate, Hook::TaskAlloc]);

    daemon
        .state()
        .upsert_process(telos::engine::ProcessInfo::new(
            9,
            TaintLevel::Critical,
            "cat",
        ))
        .expect("insert");
    let caller = Caller::new(9, None, "cat");
    assert_eq!(host.exec(&caller), Verdict::Deny);
    assert_eq!(host.open(&caller, "id_rsa"), Verdict::Allow);

    daemon.shutdown().await;
}

#[tokio::test]
async fn listen_failure_unwinds_hooks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").expect("file");
    config.daemon.socket_path = blocker.join("telos.sock");
    let host = SimulatedHost::new(SensitiveFiles::default());

    let result = Daemon::start(Box::new(host.clone()), &config);
    assert!(matches!(result, Err(BootstrapError::Listen { .. })));
    for hook in Hook::ALL {
        assert!(!host.is_attached(hook));
    }
}

#[tokio::test]
async fn invalid_policy_is_rejected_before_any_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.policy.max_taint_for_exec = "SEVERE".to_owned();
    let host = SimulatedHost::new(SensitiveFiles::default());

    let result = Daemon::start(Box::new(host.clone()), &config);
    assert!(matches!(result, Err(BootstrapError::Policy(_))));
    assert!(!host.is_attached(Hook::ExecGate));
}

#[tokio::test]
async fn shutdown_detaches_and_removes_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let (host, daemon) = start_simulated(&config);
    let socket = daemon.socket_path().to_path_buf();

    let report = daemon.shutdown().await;
    assert_eq!(report.detached.len(), 3);
    assert!(report.detach_failures.is_empty());
    assert!(!socket.exists());
    for hook in Hook::ALL {
        assert!(!host.is_attached(hook));
    }
    // Tables outlive the daemon, like a pinned kernel map.
    assert!(host.state().load_config().expect("config").is_some());
}
