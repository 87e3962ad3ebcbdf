//! Control protocol: one JSON object per line in each direction.
//!
//! A client sends [`CommandMessage`]s and receives exactly one
//! [`Response`] per line, in order. Parsing validates every field before
//! anything touches the tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use telos_engine::TaintLevel;
use thiserror::Error;

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/telos.sock";

/// Longest accepted message line, newline excluded.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// A command as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Command name (`PING`, `UPDATE_TAINT`, ...).
    pub command: String,
    /// Command arguments. Absent and `null` both mean no arguments; any
    /// other non-object is rejected as invalid JSON.
    #[serde(default, deserialize_with = "object_or_null")]
    pub data: Arguments,
}

/// Argument object of a [`CommandMessage`].
pub type Arguments = serde_json::Map<String, serde_json::Value>;

fn object_or_null<'de, D>(deserializer: D) -> Result<Arguments, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Arguments>::deserialize(deserializer)?.unwrap_or_default())
}

impl CommandMessage {
    /// Message with an argument object.
    pub fn new(command: impl Into<String>, data: Arguments) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }
}

/// Reply to a single command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the command succeeded.
    pub success: bool,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Command result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// Success without payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    /// Success with payload.
    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    /// Failure with a reason.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

/// A validated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Liveness check.
    Ping,
    /// Set a process's taint, replacing any existing entry.
    UpdateTaint {
        /// Target process.
        pid: u32,
        /// New level.
        level: TaintLevel,
    },
    /// Forget a process.
    ClearTaint {
        /// Target process.
        pid: u32,
    },
    /// Start tracking an agent process at `CLEAN`.
    RegisterAgent {
        /// Agent process.
        pid: u32,
        /// Agent process name.
        comm: String,
    },
    /// Snapshot of the process table.
    GetState,
}

impl Request {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "PING",
            Request::UpdateTaint { .. } => "UPDATE_TAINT",
            Request::ClearTaint { .. } => "CLEAR_TAINT",
            Request::RegisterAgent { .. } => "REGISTER_AGENT",
            Request::GetState => "GET_STATE",
        }
    }

    /// Parse and validate one message line.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] whose `Display` is the exact error
    /// string sent back to the client.
    pub fn parse(line: &str) -> Result<Self, ValidationError> {
        let message: CommandMessage = serde_json::from_str(line)
            .map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
        Self::from_message(&message)
    }

    /// Validate an already-decoded message.
    ///
    /// # Errors
    ///
    /// See [`Request::parse`].
    pub fn from_message(message: &CommandMessage) -> Result<Self, ValidationError> {
        let data = &message.data;
        match message.command.as_str() {
            "PING" => Ok(Request::Ping),
            "UPDATE_TAINT" => Ok(Request::UpdateTaint {
                pid: field_pid(data)?,
                level: field_taint(data)?,
            }),
            "CLEAR_TAINT" => Ok(Request::ClearTaint {
                pid: field_pid(data)?,
            }),
            "REGISTER_AGENT" => Ok(Request::RegisterAgent {
                pid: field_pid(data)?,
                comm: field_comm(data)?,
            }),
            "GET_STATE" => Ok(Request::GetState),
            other => Err(ValidationError::UnknownCommand(other.to_owned())),
        }
    }

    /// Encode as a wire message.
    pub fn to_message(&self) -> CommandMessage {
        let mut data = Arguments::new();
        match self {
            Request::Ping | Request::GetState => {}
            Request::UpdateTaint { pid, level } => {
                data.insert("pid".to_owned(), (*pid).into());
                data.insert("taint_level".to_owned(), level.as_u32().into());
            }
            Request::ClearTaint { pid } => {
                data.insert("pid".to_owned(), (*pid).into());
            }
            Request::RegisterAgent { pid, comm } => {
                data.insert("pid".to_owned(), (*pid).into());
                data.insert("comm".to_owned(), comm.clone().into());
            }
        }
        CommandMessage::new(self.name(), data)
    }
}

/// A message that could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The line is not a command object.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// A required field is missing or has the wrong type or range.
    #[error("Missing or invalid '{0}'")]
    InvalidField(&'static str),

    /// The command name is not recognised.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

fn field_pid(data: &Arguments) -> Result<u32, ValidationError> {
    data.get("pid")
        .and_then(serde_json::Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .ok_or(ValidationError::InvalidField("pid"))
}

fn field_taint(data: &Arguments) -> Result<TaintLevel, ValidationError> {
    let invalid = ValidationError::InvalidField("taint_level");
    match data.get("taint_level") {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .and_then(TaintLevel::from_u32)
            .ok_or(invalid),
        Some(serde_json::Value::String(name)) => name.parse().map_err(|_| invalid),
        _ => Err(invalid),
    }
}

fn field_comm(data: &Arguments) -> Result<String, ValidationError> {
    match data.get("comm") {
        None | Some(serde_json::Value::Null) => Ok(String::new()),
        Some(serde_json::Value::String(comm)) => Ok(comm.clone()),
        Some(_) => Err(ValidationError::InvalidField("comm")),
    }
}

/// Connection-level failure. Ends that connection only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket read or write failed.
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A line exceeded [`MAX_MESSAGE_BYTES`].
    #[error("message exceeds {limit} bytes")]
    MessageTooLong {
        /// The limit that was exceeded.
        limit: usize,
    },

    /// A response could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One process in a [`StateSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    /// Stored taint level (0-4).
    pub taint_level: u32,
    /// Sandbox flag.
    pub is_sandboxed: bool,
    /// Process name, empty if never registered.
    #[serde(default)]
    pub comm: String,
}

/// `GET_STATE` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Tracked processes keyed by pid.
    pub processes: BTreeMap<u32, ProcessSnapshot>,
    /// Number of tracked processes.
    pub count: usize,
}

impl StateSnapshot {
    /// Taint of `pid`, if tracked.
    pub fn taint_of(&self, pid: u32) -> Option<TaintLevel> {
        self.processes
            .get(&pid)
            .map(|p| TaintLevel::from_raw(p.taint_level))
    }
}
