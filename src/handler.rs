//! Command execution against the shared tables.

use std::sync::Arc;

use telos_engine::{ProcessInfo, TaintLevel};
use tracing::{debug, info, warn};

use crate::protocol::{ProcessSnapshot, Request, Response, StateSnapshot};
use crate::store::{SharedState, StoreError};

/// Executes control commands. Cheap to clone; clones share the tables.
#[derive(Clone)]
pub struct CommandHandler {
    state: Arc<dyn SharedState>,
}

impl CommandHandler {
    /// Handler over `state`.
    pub fn new(state: Arc<dyn SharedState>) -> Self {
        Self { state }
    }

    /// The tables this handler writes.
    pub fn state(&self) -> &Arc<dyn SharedState> {
        &self.state
    }

    /// Parse and execute one message line. Always yields a response.
    pub fn handle_line(&self, line: &str) -> Response {
        match Request::parse(line) {
            Ok(request) => self.execute(request),
            Err(e) => {
                debug!(error = %e, "rejected command");
                Response::failure(e.to_string())
            }
        }
    }

    /// Execute a validated request.
    pub fn execute(&self, request: Request) -> Response {
        let command = request.name();
        let result = match request {
            Request::Ping => Ok(Response::with_data(serde_json::json!("pong"))),
            Request::UpdateTaint { pid, level } => self.update_taint(pid, level),
            Request::ClearTaint { pid } => self.clear_taint(pid),
            Request::RegisterAgent { pid, comm } => self.register_agent(pid, &comm),
            Request::GetState => self.snapshot().and_then(|snapshot| {
                serde_json::to_value(snapshot)
                    .map(Response::with_data)
                    .map_err(|e| StoreError::Backend {
                        table: "process table",
                        detail: e.to_string(),
                    })
            }),
        };
        result.unwrap_or_else(|e| {
            warn!(command, error = %e, "state operation failed");
            Response::failure(e.to_string())
        })
    }

    fn update_taint(&self, pid: u32, level: TaintLevel) -> Result<Response, StoreError> {
        self.state.upsert_process(ProcessInfo::new(pid, level, ""))?;
        info!(pid, taint_level = level.name(), "taint updated");
        Ok(Response::ok())
    }

    fn clear_taint(&self, pid: u32) -> Result<Response, StoreError> {
        let existed = self.state.remove_process(pid)?;
        info!(pid, existed, "taint cleared");
        Ok(Response::ok())
    }

    fn register_agent(&self, pid: u32, comm: &str) -> Result<Response, StoreError> {
        let info = ProcessInfo::new(pid, TaintLevel::Clean, comm);
        self.state.upsert_process(info)?;
        info!(pid, comm = info.comm_str(), "agent registered");
        Ok(Response::ok())
    }

    /// Current process table as reported by `GET_STATE`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the table cannot be iterated.
    pub fn snapshot(&self) -> Result<StateSnapshot, StoreError> {
        let processes: std::collections::BTreeMap<u32, ProcessSnapshot> = self
            .state
            .processes()?
            .into_iter()
            .map(|p| {
                (
                    p.pid,
                    ProcessSnapshot {
                        taint_level: p.taint_level,
                        is_sandboxed: p.sandboxed(),
                        comm: p.comm_str().to_owned(),
                    },
                )
            })
            .collect();
        Ok(StateSnapshot {
            count: processes.len(),
            processes,
        })
    }
}
