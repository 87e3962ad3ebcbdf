//! Telos LSM program.
//!
//! Runs the `telos-engine` hook decisions inside the kernel. The maps are
//! the shared tables `telosd` creates, pins and writes:
//!
//! - `process_map`: pid -> [`ProcessInfo`], 4096 entries
//! - `config_map`: one [`EngineConfig`]
//! - `events`: 256 KiB ring buffer of [`telos_engine::EventRecord`]s
//!
//! Building needs a nightly toolchain with `rust-src`, `bpf-linker` and
//! `aya-tool` (see `build.rs`):
//!
//! ```text
//! cd telos-ebpf && cargo build --release
//! cp target/bpfel-unknown-none/release/telos-ebpf ../bin/bpf_lsm.o
//! ```

#![no_std]
#![no_main]

use core::ptr::addr_of;

use aya_ebpf::helpers::{
    bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_task, bpf_probe_read_kernel,
    bpf_probe_read_kernel_str_bytes,
};
use aya_ebpf::macros::{lsm, map};
use aya_ebpf::maps::{Array, HashMap, RingBuf};
use aya_ebpf::programs::LsmContext;
use telos_engine::{
    check_exec, check_file_open, on_task_alloc, Caller, Decision, Denylist, EngineConfig,
    ProcessInfo, StateView, MAX_FILE_NAME,
};

#[allow(
    clippy::all,
    dead_code,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals
)]
mod vmlinux {
    include!(concat!(env!("OUT_DIR"), "/vmlinux.rs"));
}

use vmlinux::{dentry, file, task_struct};

const PROCESS_TABLE_CAPACITY: u32 = 4096;
const EVENTS_BYTES: u32 = 256 * 1024;

#[map(name = "process_map")]
static PROCESS_MAP: HashMap<u32, ProcessInfo> =
    HashMap::with_max_entries(PROCESS_TABLE_CAPACITY, 0);

#[map(name = "config_map")]
static CONFIG_MAP: Array<EngineConfig> = Array::with_max_entries(1, 0);

#[map(name = "events")]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_BYTES, 0);

/// The kernel maps seen through the engine's read-only view.
struct KernelTables;

impl StateView for KernelTables {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        // SAFETY: the entry is copied out immediately; a concurrent delete
        // cannot free it before the program returns.
        unsafe { PROCESS_MAP.get(&pid) }.copied()
    }

    fn config(&self) -> Option<EngineConfig> {
        CONFIG_MAP.get(0).copied()
    }
}

fn current_tgid() -> u32 {
    (bpf_get_current_pid_tgid() >> 32) as u32
}

fn current_caller(parent_pid: Option<u32>) -> Caller {
    Caller {
        pid: current_tgid(),
        parent_pid,
        comm: bpf_get_current_comm().unwrap_or_default(),
    }
}

fn parent_tgid() -> Option<u32> {
    // SAFETY: every dereference goes through bpf_probe_read_kernel, which
    // fails instead of faulting on a bad pointer.
    unsafe {
        let task = bpf_get_current_task() as *const task_struct;
        if task.is_null() {
            return None;
        }
        let parent: *mut task_struct = bpf_probe_read_kernel(addr_of!((*task).real_parent)).ok()?;
        if parent.is_null() {
            return None;
        }
        let tgid = bpf_probe_read_kernel(addr_of!((*parent).tgid)).ok()?;
        u32::try_from(tgid).ok()
    }
}

/// Final path component of `file`, NUL excluded.
fn file_name(file: *const file, buf: &mut [u8; MAX_FILE_NAME]) -> Option<&[u8]> {
    // SAFETY: as in parent_tgid.
    unsafe {
        let dentry: *mut dentry = bpf_probe_read_kernel(addr_of!((*file).f_path.dentry)).ok()?;
        if dentry.is_null() {
            return None;
        }
        let name: *const u8 = bpf_probe_read_kernel(addr_of!((*dentry).d_name.name)).ok()?;
        bpf_probe_read_kernel_str_bytes(name, buf).ok()
    }
}

/// Queue the decision's event, if any, and return the hook's errno.
///
/// A full ring buffer drops the event; the verdict stands.
fn submit(decision: &Decision) -> i32 {
    if let Some(event) = decision.event {
        let _ = EVENTS.output(&event, 0);
    }
    decision.verdict.errno()
}

#[lsm(hook = "bprm_check_security")]
pub fn telos_check_exec(ctx: LsmContext) -> i32 {
    // A denial from an earlier LSM program stands.
    let previous: i32 = unsafe { ctx.arg(1) };
    if previous != 0 {
        return previous;
    }
    submit(&check_exec(&KernelTables, &current_caller(parent_tgid())))
}

#[lsm(hook = "file_open")]
pub fn telos_check_file(ctx: LsmContext) -> i32 {
    let previous: i32 = unsafe { ctx.arg(1) };
    if previous != 0 {
        return previous;
    }
    let caller = current_caller(None);
    // Untracked callers never pay for the name read.
    if KernelTables.process(caller.pid).is_none() {
        return 0;
    }

    let file: *const file = unsafe { ctx.arg(0) };
    let mut buf = [0u8; MAX_FILE_NAME];
    let Some(name) = file_name(file, &mut buf) else {
        return 0;
    };
    submit(&check_file_open(
        &KernelTables,
        &caller,
        name,
        &Denylist::default(),
    ))
}

#[lsm(hook = "task_alloc")]
pub fn telos_task_alloc(ctx: LsmContext) -> i32 {
    let previous: i32 = unsafe { ctx.arg(2) };
    if previous != 0 {
        return previous;
    }
    on_task_alloc(&KernelTables, current_tgid()).errno()
}

#[no_mangle]
#[link_section = "license"]
pub static LICENSE: [u8; 4] = *b"GPL\0";

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
