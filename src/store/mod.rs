//! Shared state store: the tables both execution domains share.
//!
//! The process table and config singleton are exposed through
//! [`SharedState`]: atomic per-key get/put/delete with no cross-key
//! transactions. The event channel is not part of the trait; only the
//! engine produces events, and hosts forward them to the audit consumer.

use std::path::{Path, PathBuf};

use telos_engine::{EngineConfig, ProcessInfo, StateView};
use thiserror::Error;
use tracing::{debug, info};

pub mod memory;

pub use memory::MemoryState;

/// Maximum entries in the process table, matching the kernel hash map.
pub const PROCESS_TABLE_CAPACITY: usize = 4096;

/// File name of the pinned process table inside the pin directory.
pub const PROCESS_MAP_PIN: &str = "process_map";

/// Default pin directory on the BPF filesystem.
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/telos";

/// Failure of a single table operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The table has not been created (or could not be opened).
    #[error("{0} is not available")]
    Unavailable(&'static str),

    /// A new key could not be inserted into a full table.
    #[error("process table is full ({capacity} entries)")]
    CapacityExceeded {
        /// Table capacity.
        capacity: usize,
    },

    /// The backend rejected the operation.
    #[error("{table} operation failed: {detail}")]
    Backend {
        /// Table name.
        table: &'static str,
        /// Backend error text.
        detail: String,
    },
}

/// Typed key-value access to the process table and config singleton.
///
/// Every implementation is also a [`StateView`], so the engine reads the
/// same tables the control plane writes.
pub trait SharedState: StateView + Send + Sync {
    /// Entry for `pid`, if tracked.
    fn lookup_process(&self, pid: u32) -> Result<Option<ProcessInfo>, StoreError>;

    /// Insert or replace the entry for `info.pid`.
    fn upsert_process(&self, info: ProcessInfo) -> Result<(), StoreError>;

    /// Delete the entry for `pid`. Returns whether one existed.
    fn remove_process(&self, pid: u32) -> Result<bool, StoreError>;

    /// Point-in-time copy of all entries. Not atomic across keys.
    fn processes(&self) -> Result<Vec<ProcessInfo>, StoreError>;

    /// The config singleton, if written.
    fn load_config(&self) -> Result<Option<EngineConfig>, StoreError>;

    /// Replace the config singleton.
    fn store_config(&self, config: EngineConfig) -> Result<(), StoreError>;
}

/// Remove pinned tables left by the daemon.
///
/// Deletes the pinned process table and then the pin directory if it is
/// empty. Pins that are already gone are not an error. Returns the paths
/// actually removed.
///
/// # Errors
///
/// Returns an error if an existing pin cannot be removed.
pub fn remove_pins(pin_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    let pin = pin_dir.join(PROCESS_MAP_PIN);
    match std::fs::remove_file(&pin) {
        Ok(()) => {
            info!(path = %pin.display(), "removed pinned process table");
            removed.push(pin);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %pin.display(), "no pinned process table");
        }
        Err(e) => return Err(e),
    }

    let is_empty = match std::fs::read_dir(pin_dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };
    if is_empty {
        std::fs::remove_dir(pin_dir)?;
        info!(path = %pin_dir.display(), "removed pin directory");
        removed.push(pin_dir.to_path_buf());
    }

    Ok(removed)
}
