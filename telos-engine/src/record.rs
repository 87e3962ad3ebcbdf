//! Records stored in the shared tables. Layouts are fixed: the kernel
//! program and the control plane read each other's writes byte for byte.

use crate::taint::TaintLevel;

/// Size of the fixed `comm` and `action` text fields.
pub const COMM_LEN: usize = 16;

/// Longest process name that fits alongside the terminating NUL.
const MAX_COMM_BYTES: usize = 15;

/// Per-process security state, keyed by pid in the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ProcessInfo {
    /// Process id (tgid).
    pub pid: u32,
    /// Stored [`TaintLevel`] value.
    pub taint_level: u32,
    /// 1 if the process runs inside a sandbox, 0 otherwise.
    pub is_sandboxed: u32,
    /// NUL-terminated process name.
    pub comm: [u8; COMM_LEN],
}

impl ProcessInfo {
    /// Build a record for `pid` at `level`. `comm` is truncated to 15 bytes.
    pub fn new(pid: u32, level: TaintLevel, comm: &str) -> Self {
        Self {
            pid,
            taint_level: level.as_u32(),
            is_sandboxed: 0,
            comm: encode_comm(comm),
        }
    }

    /// Stored taint, saturating out-of-range values to `Critical`.
    pub fn taint(&self) -> TaintLevel {
        TaintLevel::from_raw(self.taint_level)
    }

    /// Whether the sandbox flag is set.
    pub fn sandboxed(&self) -> bool {
        self.is_sandboxed != 0
    }

    /// Process name up to the first NUL.
    pub fn comm_str(&self) -> &str {
        decode_comm(&self.comm)
    }
}

/// The singleton enforcement configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct EngineConfig {
    /// Highest taint allowed to `execve`.
    pub max_taint_for_exec: u32,
    /// Highest taint allowed to open files.
    pub max_taint_for_open: u32,
    /// 1 = enforce, 0 = audit only.
    pub enabled: u32,
}

impl EngineConfig {
    /// Values written at bootstrap.
    pub const DEFAULT: EngineConfig = EngineConfig {
        max_taint_for_exec: TaintLevel::Medium.as_u32(),
        max_taint_for_open: TaintLevel::High.as_u32(),
        enabled: 1,
    };

    /// Values the hooks use when the config table cannot be read.
    pub const FALLBACK: EngineConfig = EngineConfig::DEFAULT;

    /// Build a config from typed thresholds.
    pub const fn new(max_exec: TaintLevel, max_open: TaintLevel, enforce: bool) -> Self {
        Self {
            max_taint_for_exec: max_exec.as_u32(),
            max_taint_for_open: max_open.as_u32(),
            enabled: if enforce { 1 } else { 0 },
        }
    }

    /// Threshold for the exec gate.
    pub fn exec_threshold(&self) -> TaintLevel {
        TaintLevel::from_raw(self.max_taint_for_exec)
    }

    /// Threshold for file opens.
    pub fn open_threshold(&self) -> TaintLevel {
        TaintLevel::from_raw(self.max_taint_for_open)
    }

    /// True in enforce mode, false in audit-only mode.
    pub fn enforcing(&self) -> bool {
        self.enabled != 0
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Program execution (`bprm_check_security`).
    Exec,
    /// File open (`file_open`).
    Open,
}

impl Action {
    /// Text stored in the event's `action` field.
    pub const fn label(self) -> &'static str {
        match self {
            Action::Exec => "execve",
            Action::Open => "open",
        }
    }

    /// Fixed-width, NUL-padded form of [`Action::label`].
    pub fn to_field(self) -> [u8; COMM_LEN] {
        encode_comm(self.label())
    }

    /// Parse the fixed-width field back.
    pub fn from_field(field: &[u8; COMM_LEN]) -> Option<Self> {
        match decode_comm(field) {
            "execve" => Some(Action::Exec),
            "open" => Some(Action::Open),
            _ => None,
        }
    }
}

/// Audit event appended to the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct EventRecord {
    /// Acting process id.
    pub pid: u32,
    /// Effective taint at decision time.
    pub taint_level: u32,
    /// 1 if the threshold was crossed.
    pub blocked: u32,
    /// Acting process name.
    pub comm: [u8; COMM_LEN],
    /// `"execve"` or `"open"`.
    pub action: [u8; COMM_LEN],
}

impl EventRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 44;

    /// Build a blocked-action event.
    pub fn blocked(pid: u32, level: TaintLevel, comm: [u8; COMM_LEN], action: Action) -> Self {
        Self {
            pid,
            taint_level: level.as_u32(),
            blocked: 1,
            comm,
            action: action.to_field(),
        }
    }

    /// Taint carried by the event.
    pub fn taint(&self) -> TaintLevel {
        TaintLevel::from_raw(self.taint_level)
    }

    /// Whether the event records a crossed threshold.
    pub fn is_blocked(&self) -> bool {
        self.blocked != 0
    }

    /// Decoded action, if recognised.
    pub fn action_kind(&self) -> Option<Action> {
        Action::from_field(&self.action)
    }

    /// Process name up to the first NUL.
    pub fn comm_str(&self) -> &str {
        decode_comm(&self.comm)
    }

    /// Native-endian encoding matching the `#[repr(C)]` layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        out[4..8].copy_from_slice(&self.taint_level.to_ne_bytes());
        out[8..12].copy_from_slice(&self.blocked.to_ne_bytes());
        out[12..28].copy_from_slice(&self.comm);
        out[28..44].copy_from_slice(&self.action);
        out
    }

    /// Decode a ring-buffer payload. Returns `None` if it is too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE)?;
        Some(Self {
            pid: u32::from_ne_bytes(bytes[0..4].try_into().ok()?),
            taint_level: u32::from_ne_bytes(bytes[4..8].try_into().ok()?),
            blocked: u32::from_ne_bytes(bytes[8..12].try_into().ok()?),
            comm: bytes[12..28].try_into().ok()?,
            action: bytes[28..44].try_into().ok()?,
        })
    }
}

/// Encode a name into a NUL-terminated 16-byte field.
///
/// Truncates to at most 15 bytes without splitting a UTF-8 character.
pub fn encode_comm(name: &str) -> [u8; COMM_LEN] {
    let mut out = [0u8; COMM_LEN];
    let mut end = name.len().min(MAX_COMM_BYTES);
    while !name.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    out[..end].copy_from_slice(&name.as_bytes()[..end]);
    out
}

/// Decode a fixed-width text field up to the first NUL.
///
/// Invalid UTF-8 is cut at the last valid character.
pub fn decode_comm(field: &[u8; COMM_LEN]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
    let text = &field[..end];
    match core::str::from_utf8(text) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&text[..e.valid_up_to()]).unwrap_or(""),
    }
}
