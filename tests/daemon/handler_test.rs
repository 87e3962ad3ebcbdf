//! Command handler semantics.

use telos::engine::TaintLevel;
use telos::protocol::Request;
use telos::store::SharedState;

use super::support::memory_handler;

#[test]
fn register_stores_clean_entry_with_comm() {
    let (state, handler) = memory_handler();
    let response =
        handler.handle_line(r#"{"command":"REGISTER_AGENT","data":{"pid":100,"comm":"agent"}}"#);
    assert!(response.success);

    let entry = state.lookup_process(100).expect("lookup").expect("tracked");
    assert_eq!(entry.taint(), TaintLevel::Clean);
    assert_eq!(entry.comm_str(), "agent");
    assert!(!entry.sandboxed());
}

#[test]
fn update_writes_a_fresh_record() {
    let (state, handler) = memory_handler();
    handler.execute(Request::RegisterAgent {
        pid: 100,
        comm: "agent".to_owned(),
    });
    let response = handler.execute(Request::UpdateTaint {
        pid: 100,
        level: TaintLevel::High,
    });
    assert!(response.success);

    let entry = state.lookup_process(100).expect("lookup").expect("tracked");
    assert_eq!(entry.taint(), TaintLevel::High);
    assert_eq!(entry.comm_str(), "");
}

#[test]
fn last_write_wins() {
    let (_, handler) = memory_handler();
    handler.execute(Request::RegisterAgent {
        pid: 100,
        comm: "agent".to_owned(),
    });
    handler.execute(Request::UpdateTaint {
        pid: 100,
        level: TaintLevel::High,
    });
    handler.execute(Request::UpdateTaint {
        pid: 100,
        level: TaintLevel::Low,
    });

    let snapshot = handler.snapshot().expect("snapshot");
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.taint_of(100), Some(TaintLevel::Low));
}

#[test]
fn clear_is_idempotent() {
    let (state, handler) = memory_handler();
    assert!(handler.execute(Request::ClearTaint { pid: 42 }).success);

    handler.execute(Request::UpdateTaint {
        pid: 42,
        level: TaintLevel::Critical,
    });
    assert!(handler.execute(Request::ClearTaint { pid: 42 }).success);
    assert!(state.lookup_process(42).expect("lookup").is_none());
    assert!(handler.execute(Request::ClearTaint { pid: 42 }).success);
}

#[test]
fn invalid_messages_do_not_mutate() {
    let (state, handler) = memory_handler();
    for line in [
        r#"{"command":"UPDATE_TAINT","data":{"pid":1,"taint_level":9}}"#,
        r#"{"command":"UPDATE_TAINT","data":{"taint_level":1}}"#,
        r#"{"command":"REGISTER_AGENT","data":{"pid":"1"}}"#,
        r#"{"command":"REGISTER_AGENT","data":{"pid":1,"comm":7}}"#,
        r#"[1,2,3]"#,
    ] {
        let response = handler.handle_line(line);
        assert!(!response.success, "{line} should fail");
        assert!(response.error.is_some());
    }
    assert!(state.processes().expect("iterate").is_empty());
}

#[test]
fn get_state_reports_every_entry() {
    let (_, handler) = memory_handler();
    for pid in [10, 20, 30] {
        handler.execute(Request::UpdateTaint {
            pid,
            level: TaintLevel::Medium,
        });
    }
    let response = handler.handle_line(r#"{"command":"GET_STATE","data":{}}"#);
    let data = response.data.expect("payload");
    assert_eq!(data["count"], 3);
    assert_eq!(data["processes"]["20"]["taint_level"], 2);
    assert_eq!(data["processes"]["20"]["is_sandboxed"], false);
}

#[test]
fn long_comm_is_truncated_on_storage() {
    let (state, handler) = memory_handler();
    handler.execute(Request::RegisterAgent {
        pid: 5,
        comm: "a-very-long-agent-process-name".to_owned(),
    });
    let entry = state.lookup_process(5).expect("lookup").expect("tracked");
    assert_eq!(entry.comm_str(), "a-very-long-age");
}
