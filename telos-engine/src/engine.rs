//! Hook decisions.
//!
//! Every function here is total: it returns exactly one verdict per call,
//! makes at most three table lookups (self, parent, config) and never
//! writes to the tables. Events are returned to the caller, which appends
//! them to the event channel or drops them if the channel is full.

use crate::denylist::Denylist;
use crate::record::{Action, EngineConfig, EventRecord, ProcessInfo, COMM_LEN};
use crate::taint::TaintLevel;

/// `EPERM`, returned negated from a denying LSM hook.
pub const EPERM: i32 = 1;

/// Read-only access to the shared tables, as seen from a hook.
///
/// A lookup that fails for any reason (table missing, backend error) must
/// be reported as `None`; the hooks treat that as untracked / default.
pub trait StateView {
    /// Direct process-table entry for `pid`.
    fn process(&self, pid: u32) -> Option<ProcessInfo>;

    /// The config singleton.
    fn config(&self) -> Option<EngineConfig>;
}

/// The allow/deny outcome of one hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the operation proceed.
    Allow,
    /// Refuse the operation.
    Deny,
}

impl Verdict {
    /// Hook return value: `0` or `-EPERM`.
    pub const fn errno(self) -> i32 {
        match self {
            Verdict::Allow => 0,
            Verdict::Deny => -EPERM,
        }
    }
}

/// A verdict plus the event to append, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Allow or deny.
    pub verdict: Verdict,
    /// Audit event produced by a crossed threshold.
    pub event: Option<EventRecord>,
}

impl Decision {
    const ALLOW: Decision = Decision {
        verdict: Verdict::Allow,
        event: None,
    };
}

/// The process performing the gated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Calling process id (tgid).
    pub pid: u32,
    /// Parent tgid, when the host can read it.
    pub parent_pid: Option<u32>,
    /// Current process name.
    pub comm: [u8; COMM_LEN],
}

impl Caller {
    /// A caller with a known parent.
    pub fn new(pid: u32, parent_pid: Option<u32>, comm: &str) -> Self {
        Self {
            pid,
            parent_pid,
            comm: crate::record::encode_comm(comm),
        }
    }
}

/// Where an effective taint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintSource {
    /// The caller's own entry.
    Direct,
    /// The immediate parent's entry.
    Parent,
    /// Neither is tracked.
    Untracked,
}

/// Result of [`resolve_effective_taint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Taint used for the decision.
    pub level: TaintLevel,
    /// Which lookup produced it.
    pub source: TaintSource,
}

/// Resolve the taint an exec decision should use.
///
/// Two steps, single hop: the caller's own entry, else the parent's entry,
/// else `Clean`. Grandparents are never consulted.
pub fn resolve_effective_taint<V: StateView + ?Sized>(
    view: &V,
    pid: u32,
    parent_pid: Option<u32>,
) -> Resolution {
    if let Some(info) = view.process(pid) {
        return Resolution {
            level: info.taint(),
            source: TaintSource::Direct,
        };
    }
    if let Some(info) = parent_pid.and_then(|ppid| view.process(ppid)) {
        return Resolution {
            level: info.taint(),
            source: TaintSource::Parent,
        };
    }
    Resolution {
        level: TaintLevel::Clean,
        source: TaintSource::Untracked,
    }
}

/// Pre-execution gate (`bprm_check_security`).
///
/// Emits a blocked event whenever the effective taint exceeds
/// `max_taint_for_exec`; denies only in enforce mode.
pub fn check_exec<V: StateView + ?Sized>(view: &V, caller: &Caller) -> Decision {
    let config = view.config().unwrap_or(EngineConfig::FALLBACK);
    let effective = resolve_effective_taint(view, caller.pid, caller.parent_pid);

    if effective.level <= config.exec_threshold() {
        return Decision::ALLOW;
    }

    Decision {
        verdict: enforce(&config),
        event: Some(EventRecord::blocked(
            caller.pid,
            effective.level,
            caller.comm,
            Action::Exec,
        )),
    }
}

/// File-open gate (`file_open`).
///
/// Only direct entries are considered. Below `Critical` every open is
/// allowed; at `Critical`, names on the denylist are blocked.
pub fn check_file_open<V: StateView + ?Sized>(
    view: &V,
    caller: &Caller,
    file_name: &[u8],
    denylist: &Denylist<'_>,
) -> Decision {
    let Some(info) = view.process(caller.pid) else {
        return Decision::ALLOW;
    };

    let level = info.taint();
    if level < TaintLevel::Critical || !denylist.matches(file_name) {
        return Decision::ALLOW;
    }

    let config = view.config().unwrap_or(EngineConfig::FALLBACK);
    Decision {
        verdict: enforce(&config),
        event: Some(EventRecord::blocked(
            caller.pid,
            level,
            caller.comm,
            Action::Open,
        )),
    }
}

/// Process-creation observer (`task_alloc`).
///
/// Attachment point only. The child gets no entry of its own, so taint
/// reaches it solely through the exec gate's parent lookup.
pub fn on_task_alloc<V: StateView + ?Sized>(_view: &V, _parent_pid: u32) -> Verdict {
    Verdict::Allow
}

fn enforce(config: &EngineConfig) -> Verdict {
    if config.enforcing() {
        Verdict::Deny
    } else {
        Verdict::Allow
    }
}
