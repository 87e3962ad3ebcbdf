//! Engine hosts: where the enforcement hooks actually run.
//!
//! [`EngineHost`] is the seam between the daemon's bootstrap sequence and
//! the environment executing the hooks: the kernel via aya
//! ([`bpf::BpfHost`], feature `bpf`) or in-process
//! ([`simulated::SimulatedHost`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use telos_engine::{EventRecord, FilePattern};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::SharedState;

#[cfg(feature = "bpf")]
pub mod bpf;
pub mod simulated;

pub use simulated::SimulatedHost;

/// Process-table map name in the engine object.
pub const PROCESS_MAP: &str = "process_map";
/// Config map name in the engine object.
pub const CONFIG_MAP: &str = "config_map";
/// Ring-buffer map name in the engine object.
pub const EVENTS_MAP: &str = "events";

/// The three hook attachment points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// `lsm/bprm_check_security`: pre-execution gate.
    ExecGate,
    /// `lsm/file_open`: sensitive file gate.
    FileOpenGate,
    /// `lsm/task_alloc`: process-creation observer.
    TaskAlloc,
}

impl Hook {
    /// Attach order used at bootstrap. The mandatory hook comes first.
    pub const ALL: [Hook; 3] = [Hook::ExecGate, Hook::FileOpenGate, Hook::TaskAlloc];

    /// Program name in the engine object.
    pub const fn program_name(self) -> &'static str {
        match self {
            Hook::ExecGate => "telos_check_exec",
            Hook::FileOpenGate => "telos_check_file",
            Hook::TaskAlloc => "telos_task_alloc",
        }
    }

    /// Kernel LSM hook the program attaches to.
    pub const fn lsm_hook(self) -> &'static str {
        match self {
            Hook::ExecGate => "bprm_check_security",
            Hook::FileOpenGate => "file_open",
            Hook::TaskAlloc => "task_alloc",
        }
    }

    /// Whether failing to attach aborts startup.
    pub const fn is_mandatory(self) -> bool {
        matches!(self, Hook::ExecGate)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsm/{}", self.lsm_hook())
    }
}

/// Failure inside an engine host.
#[derive(Debug, Error)]
pub enum HostError {
    /// `RLIMIT_MEMLOCK` could not be lifted.
    #[error("failed to raise memlock limit: {0}")]
    Memlock(#[source] std::io::Error),

    /// The engine object could not be loaded.
    #[error("failed to load engine object {path}: {detail}")]
    Load {
        /// Object path.
        path: PathBuf,
        /// Loader error text.
        detail: String,
    },

    /// The engine object lacks a required map.
    #[error("engine object has no map '{0}'")]
    MissingMap(&'static str),

    /// The engine object lacks a hook program.
    #[error("engine object has no program '{0}'")]
    MissingProgram(&'static str),

    /// Tables were used before [`EngineHost::create_state`].
    #[error("engine tables have not been created")]
    NotLoaded,

    /// Pinning the process table failed.
    #[error("failed to pin {path}: {detail}")]
    Pin {
        /// Pin path.
        path: PathBuf,
        /// Error text.
        detail: String,
    },

    /// Loading or attaching a hook failed.
    #[error("failed to attach {hook}: {detail}")]
    Attach {
        /// Hook being attached.
        hook: Hook,
        /// Error text.
        detail: String,
    },

    /// Detaching a hook failed.
    #[error("failed to detach {hook}: {detail}")]
    Detach {
        /// Hook being detached.
        hook: Hook,
        /// Error text.
        detail: String,
    },

    /// The hook was never attached.
    #[error("{0} is not attached")]
    NotAttached(Hook),

    /// The host cannot perform this operation.
    #[error("{0} is not supported by this host")]
    Unsupported(&'static str),

    /// The event channel could not be wired up.
    #[error("event forwarding failed: {0}")]
    Events(String),
}

/// Tables produced by [`EngineHost::create_state`].
pub struct Tables {
    /// Handle to the process table and config singleton.
    pub state: Arc<dyn SharedState>,
    /// Where the process table was pinned, or why it was not.
    pub pinned: Result<PathBuf, HostError>,
}

/// An environment that owns the shared tables and runs the hooks.
///
/// The daemon drives these calls in bootstrap order; see
/// [`crate::daemon::Daemon::start`].
pub trait EngineHost: Send {
    /// Short host name for logs.
    fn name(&self) -> &'static str;

    /// Lift resource limits needed to create the tables.
    fn raise_memlock_limit(&mut self) -> Result<(), HostError>;

    /// Create the tables and pin the process table under `pin_dir`.
    ///
    /// A pin failure is reported in [`Tables::pinned`], not as an error.
    fn create_state(&mut self, pin_dir: &Path) -> Result<Tables, HostError>;

    /// Load and attach one hook.
    fn attach(&mut self, hook: Hook) -> Result<(), HostError>;

    /// Detach a previously attached hook.
    fn detach(&mut self, hook: Hook) -> Result<(), HostError>;

    /// Start delivering engine events to `events`.
    ///
    /// Delivery never waits: when the channel is full the event is dropped.
    fn forward_events(&mut self, events: mpsc::Sender<EventRecord>) -> Result<(), HostError>;

    /// Stop delivering events and release the sender.
    fn release_events(&mut self);
}

/// Sensitive file patterns in their owned, configurable form.
///
/// Each entry is a glob with at most one leading or trailing `*`:
/// `id_*` is a prefix, `*.pem` a suffix, `shadow` an exact name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveFiles {
    patterns: Vec<(PatternKind, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    Prefix,
    Exact,
    Suffix,
}

/// A sensitive-file entry that is not a supported glob.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid sensitive file pattern '{0}': use NAME, PREFIX* or *SUFFIX")]
pub struct InvalidPattern(pub String);

impl SensitiveFiles {
    /// Parse glob entries.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPattern`] for empty patterns, a bare `*`, or a `*`
    /// anywhere but the first or last position.
    pub fn from_globs<S: AsRef<str>>(globs: &[S]) -> Result<Self, InvalidPattern> {
        let mut patterns = Vec::with_capacity(globs.len());
        for glob in globs {
            let glob = glob.as_ref();
            let invalid = || InvalidPattern(glob.to_owned());
            let (kind, body) = if let Some(body) = glob.strip_suffix('*') {
                (PatternKind::Prefix, body)
            } else if let Some(body) = glob.strip_prefix('*') {
                (PatternKind::Suffix, body)
            } else {
                (PatternKind::Exact, glob)
            };
            if body.is_empty() || body.contains('*') || body.contains('/') {
                return Err(invalid());
            }
            patterns.push((kind, body.as_bytes().to_vec()));
        }
        Ok(Self { patterns })
    }

    /// Borrowed engine patterns, in configuration order.
    pub fn to_engine_patterns(&self) -> Vec<FilePattern<'_>> {
        self.patterns
            .iter()
            .map(|(kind, bytes)| match kind {
                PatternKind::Prefix => FilePattern::Prefix(bytes),
                PatternKind::Exact => FilePattern::Exact(bytes),
                PatternKind::Suffix => FilePattern::Suffix(bytes),
            })
            .collect()
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for SensitiveFiles {
    fn default() -> Self {
        Self {
            patterns: vec![(PatternKind::Prefix, b"id_".to_vec())],
        }
    }
}
