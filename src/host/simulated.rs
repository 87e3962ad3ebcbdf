//! In-process engine host.
//!
//! Runs the `telos-engine` hooks directly against [`MemoryState`]. The
//! daemon uses it for `telosd start --simulate`; tests use it to drive
//! exec and open decisions without a kernel.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use telos_engine::{
    check_exec, check_file_open, on_task_alloc, Caller, Decision, Denylist, EventRecord, Verdict,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{EngineHost, Hook, HostError, SensitiveFiles, Tables};
use crate::store::MemoryState;

/// In-process host. Clones share the same tables, hooks and counters.
#[derive(Clone)]
pub struct SimulatedHost {
    inner: Arc<Inner>,
}

struct Inner {
    state: Arc<MemoryState>,
    sensitive: SensitiveFiles,
    attached: Mutex<HashSet<Hook>>,
    failing: Mutex<HashSet<Hook>>,
    events: Mutex<Option<mpsc::Sender<EventRecord>>>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl SimulatedHost {
    /// Host over fresh tables with the given sensitive file patterns.
    pub fn new(sensitive: SensitiveFiles) -> Self {
        Self::with_state(Arc::new(MemoryState::new()), sensitive)
    }

    /// Host over existing tables.
    pub fn with_state(state: Arc<MemoryState>, sensitive: SensitiveFiles) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                sensitive,
                attached: Mutex::new(HashSet::new()),
                failing: Mutex::new(HashSet::new()),
                events: Mutex::new(None),
                emitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Make every future attach of `hook` fail.
    pub fn fail_attach(self, hook: Hook) -> Self {
        if let Ok(mut failing) = self.inner.failing.lock() {
            failing.insert(hook);
        }
        self
    }

    /// The tables the hooks read.
    pub fn state(&self) -> Arc<MemoryState> {
        Arc::clone(&self.inner.state)
    }

    /// Whether `hook` is currently attached.
    pub fn is_attached(&self, hook: Hook) -> bool {
        self.inner
            .attached
            .lock()
            .map(|set| set.contains(&hook))
            .unwrap_or(false)
    }

    /// Events handed to the channel.
    pub fn emitted_events(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    /// Events dropped because the channel was full or gone.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Run the exec gate for `caller`, as the kernel would before `execve`.
    ///
    /// Returns `Allow` when the gate is not attached.
    pub fn exec(&self, caller: &Caller) -> Verdict {
        if !self.is_attached(Hook::ExecGate) {
            return Verdict::Allow;
        }
        let decision = check_exec(self.inner.state.as_ref(), caller);
        trace!(pid = caller.pid, verdict = ?decision.verdict, "exec gate");
        self.settle(decision)
    }

    /// Run the file-open gate for `caller` opening `file_name`.
    pub fn open(&self, caller: &Caller, file_name: &str) -> Verdict {
        if !self.is_attached(Hook::FileOpenGate) {
            return Verdict::Allow;
        }
        let patterns = self.inner.sensitive.to_engine_patterns();
        let denylist = Denylist::new(&patterns);
        let decision = check_file_open(
            self.inner.state.as_ref(),
            caller,
            file_name.as_bytes(),
            &denylist,
        );
        trace!(pid = caller.pid, file = file_name, verdict = ?decision.verdict, "file gate");
        self.settle(decision)
    }

    /// Run the process-creation observer for a fork by `parent_pid`.
    pub fn task_alloc(&self, parent_pid: u32) -> Verdict {
        if !self.is_attached(Hook::TaskAlloc) {
            return Verdict::Allow;
        }
        on_task_alloc(self.inner.state.as_ref(), parent_pid)
    }

    fn settle(&self, decision: Decision) -> Verdict {
        if let Some(event) = decision.event {
            self.publish(event);
        }
        decision.verdict
    }

    fn publish(&self, event: EventRecord) {
        let sent = match self.inner.events.lock() {
            Ok(guard) => guard
                .as_ref()
                .is_some_and(|tx| tx.try_send(event).is_ok()),
            Err(_) => false,
        };
        if sent {
            self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(pid = event.pid, "event channel full, event dropped");
        }
    }
}

impl EngineHost for SimulatedHost {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn raise_memlock_limit(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    fn create_state(&mut self, _pin_dir: &Path) -> Result<Tables, HostError> {
        Ok(Tables {
            state: self.state(),
            pinned: Err(HostError::Unsupported("pinning")),
        })
    }

    fn attach(&mut self, hook: Hook) -> Result<(), HostError> {
        let failing = self
            .inner
            .failing
            .lock()
            .map(|set| set.contains(&hook))
            .unwrap_or(false);
        if failing {
            return Err(HostError::Attach {
                hook,
                detail: "attach refused".to_owned(),
            });
        }
        let mut attached = self.inner.attached.lock().map_err(|_| HostError::Attach {
            hook,
            detail: "hook registry poisoned".to_owned(),
        })?;
        attached.insert(hook);
        Ok(())
    }

    fn detach(&mut self, hook: Hook) -> Result<(), HostError> {
        let mut attached = self.inner.attached.lock().map_err(|_| HostError::Detach {
            hook,
            detail: "hook registry poisoned".to_owned(),
        })?;
        if attached.remove(&hook) {
            Ok(())
        } else {
            Err(HostError::NotAttached(hook))
        }
    }

    fn forward_events(&mut self, events: mpsc::Sender<EventRecord>) -> Result<(), HostError> {
        let mut slot = self
            .inner
            .events
            .lock()
            .map_err(|_| HostError::Events("event slot poisoned".to_owned()))?;
        *slot = Some(events);
        Ok(())
    }

    fn release_events(&mut self) {
        if let Ok(mut slot) = self.inner.events.lock() {
            slot.take();
        }
    }
}
