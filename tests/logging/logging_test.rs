//! Tests for `src/logging.rs`.

use telos::logging::{LoggingGuard, LOG_FILE_NAME};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

// The global subscriber can be installed once per process, so this is the
// only test in this binary that initialises logging.
#[test]
fn init_daemon_creates_logs_dir_and_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    let guard = telos::logging::init_daemon(Some(&logs_dir)).expect("init logging");
    assert!(guard.is_some());
    tracing::info!(pid = 1, "logging smoke test");
    drop(guard);

    assert!(logs_dir.exists(), "logs directory should be created");
    let has_log = std::fs::read_dir(&logs_dir)
        .expect("read logs dir")
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().starts_with(LOG_FILE_NAME));
    assert!(has_log, "a rotated log file should exist");
}
