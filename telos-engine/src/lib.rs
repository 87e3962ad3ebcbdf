//! Telos engine: taint-based enforcement decisions.
//!
//! The hook logic that gates `execve` and sensitive file opens, expressed
//! as pure functions over a read-only [`StateView`]. Nothing here blocks,
//! allocates or loops over unbounded input, so the same code drives the
//! kernel LSM program and the in-process host used by the control plane.
//!
//! Record layouts in [`record`] are the fixed cross-boundary schema shared
//! with the kernel maps.

#![no_std]
#![forbid(unsafe_code)]

/// Sensitive file name patterns for the file-open gate.
pub mod denylist;
/// Hook entry points and the effective-taint resolver.
pub mod engine;
/// Fixed-layout records stored in the shared tables.
pub mod record;
/// Ordered taint labels.
pub mod taint;

pub use denylist::{Denylist, FilePattern, DEFAULT_SENSITIVE_PATTERNS, MAX_FILE_NAME};
pub use engine::{
    check_exec, check_file_open, on_task_alloc, resolve_effective_taint, Caller, Decision,
    Resolution, StateView, TaintSource, Verdict, EPERM,
};
pub use record::{decode_comm, encode_comm, Action, EngineConfig, EventRecord, ProcessInfo};
pub use taint::{ParseTaintLevelError, TaintLevel};
