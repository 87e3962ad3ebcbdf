//! In-process tables for the simulated host and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use telos_engine::{EngineConfig, ProcessInfo, StateView};

use super::{SharedState, StoreError, PROCESS_TABLE_CAPACITY};

/// Process table and config singleton held in memory.
///
/// Each table sits behind its own lock, so every operation is atomic for
/// its key and nothing spans tables.
#[derive(Debug)]
pub struct MemoryState {
    processes: RwLock<HashMap<u32, ProcessInfo>>,
    config: RwLock<Option<EngineConfig>>,
    capacity: usize,
}

impl MemoryState {
    /// Empty tables with the kernel map's capacity.
    pub fn new() -> Self {
        Self::with_capacity(PROCESS_TABLE_CAPACITY)
    }

    /// Empty tables holding at most `capacity` processes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            config: RwLock::new(None),
            capacity,
        }
    }
}

impl Default for MemoryState {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned(table: &'static str) -> StoreError {
    StoreError::Backend {
        table,
        detail: "lock poisoned".to_owned(),
    }
}

impl SharedState for MemoryState {
    fn lookup_process(&self, pid: u32) -> Result<Option<ProcessInfo>, StoreError> {
        let table = self
            .processes
            .read()
            .map_err(|_| poisoned("process table"))?;
        Ok(table.get(&pid).copied())
    }

    fn upsert_process(&self, info: ProcessInfo) -> Result<(), StoreError> {
        let mut table = self
            .processes
            .write()
            .map_err(|_| poisoned("process table"))?;
        if !table.contains_key(&info.pid) && table.len() >= self.capacity {
            return Err(StoreError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        table.insert(info.pid, info);
        Ok(())
    }

    fn remove_process(&self, pid: u32) -> Result<bool, StoreError> {
        let mut table = self
            .processes
            .write()
            .map_err(|_| poisoned("process table"))?;
        Ok(table.remove(&pid).is_some())
    }

    fn processes(&self) -> Result<Vec<ProcessInfo>, StoreError> {
        let table = self
            .processes
            .read()
            .map_err(|_| poisoned("process table"))?;
        Ok(table.values().copied().collect())
    }

    fn load_config(&self) -> Result<Option<EngineConfig>, StoreError> {
        let slot = self.config.read().map_err(|_| poisoned("config"))?;
        Ok(*slot)
    }

    fn store_config(&self, config: EngineConfig) -> Result<(), StoreError> {
        let mut slot = self.config.write().map_err(|_| poisoned("config"))?;
        *slot = Some(config);
        Ok(())
    }
}

impl StateView for MemoryState {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        self.lookup_process(pid).ok().flatten()
    }

    fn config(&self) -> Option<EngineConfig> {
        self.load_config().ok().flatten()
    }
}
