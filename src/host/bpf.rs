//! Kernel engine host backed by aya.
//!
//! Loads the compiled LSM object, pins the process table, attaches the
//! hook programs with kernel BTF and drains the `events` ring buffer.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use aya::maps::{Array, HashMap as BpfHashMap, Map, MapData, RingBuf};
use aya::programs::lsm::LsmLinkId;
use aya::programs::Lsm;
use aya::{Btf, Ebpf};
use telos_engine::{EngineConfig, EventRecord, ProcessInfo, StateView};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EngineHost, Hook, HostError, Tables, CONFIG_MAP, EVENTS_MAP, PROCESS_MAP};
use crate::store::{SharedState, StoreError, PROCESS_MAP_PIN};

#[derive(Clone, Copy)]
#[repr(transparent)]
struct PodProcess(ProcessInfo);

// SAFETY: ProcessInfo is #[repr(C)], Copy, has no padding and every bit
// pattern is a valid value.
unsafe impl aya::Pod for PodProcess {}

#[derive(Clone, Copy)]
#[repr(transparent)]
struct PodConfig(EngineConfig);

// SAFETY: EngineConfig is #[repr(C)], Copy, three u32 fields, no padding.
unsafe impl aya::Pod for PodConfig {}

/// Host that runs the hooks in the kernel.
pub struct BpfHost {
    object_path: PathBuf,
    ebpf: Option<Ebpf>,
    btf: Option<Btf>,
    links: HashMap<Hook, LsmLinkId>,
    ring: Option<RingBuf<MapData>>,
    pump: Option<JoinHandle<()>>,
}

impl BpfHost {
    /// Host for the object file at `object_path`. Nothing is loaded yet.
    pub fn new(object_path: impl Into<PathBuf>) -> Self {
        Self {
            object_path: object_path.into(),
            ebpf: None,
            btf: None,
            links: HashMap::new(),
            ring: None,
            pump: None,
        }
    }

    fn load_error(&self, detail: impl ToString) -> HostError {
        HostError::Load {
            path: self.object_path.clone(),
            detail: detail.to_string(),
        }
    }
}

fn pin_process_table(ebpf: &mut Ebpf, pin_dir: &Path) -> Result<PathBuf, HostError> {
    let path = pin_dir.join(PROCESS_MAP_PIN);
    let pin_error = |detail: String| HostError::Pin {
        path: path.clone(),
        detail,
    };
    std::fs::create_dir_all(pin_dir).map_err(|e| pin_error(e.to_string()))?;
    match ebpf.map_mut(PROCESS_MAP) {
        Some(Map::HashMap(data)) => data.pin(&path).map_err(|e| pin_error(e.to_string()))?,
        Some(_) => return Err(pin_error("process_map is not a hash map".to_owned())),
        None => return Err(HostError::MissingMap(PROCESS_MAP)),
    }
    Ok(path)
}

impl EngineHost for BpfHost {
    fn name(&self) -> &'static str {
        "bpf"
    }

    fn raise_memlock_limit(&mut self) -> Result<(), HostError> {
        crate::sys::raise_memlock_limit().map_err(HostError::Memlock)
    }

    fn create_state(&mut self, pin_dir: &Path) -> Result<Tables, HostError> {
        let mut ebpf = Ebpf::load_file(&self.object_path).map_err(|e| self.load_error(e))?;
        let btf = Btf::from_sys_fs().map_err(|e| self.load_error(e))?;

        let pinned = pin_process_table(&mut ebpf, pin_dir);

        let processes = ebpf
            .take_map(PROCESS_MAP)
            .ok_or(HostError::MissingMap(PROCESS_MAP))?;
        let processes: BpfHashMap<MapData, u32, PodProcess> =
            BpfHashMap::try_from(processes).map_err(|e| self.load_error(e))?;

        let config = ebpf
            .take_map(CONFIG_MAP)
            .ok_or(HostError::MissingMap(CONFIG_MAP))?;
        let config: Array<MapData, PodConfig> =
            Array::try_from(config).map_err(|e| self.load_error(e))?;

        let events = ebpf
            .take_map(EVENTS_MAP)
            .ok_or(HostError::MissingMap(EVENTS_MAP))?;
        let ring = RingBuf::try_from(events).map_err(|e| self.load_error(e))?;

        info!(path = %self.object_path.display(), "engine object loaded");

        self.ebpf = Some(ebpf);
        self.btf = Some(btf);
        self.ring = Some(ring);

        Ok(Tables {
            state: Arc::new(BpfState {
                processes: Mutex::new(processes),
                config: Mutex::new(config),
            }),
            pinned,
        })
    }

    fn attach(&mut self, hook: Hook) -> Result<(), HostError> {
        let (Some(ebpf), Some(btf)) = (self.ebpf.as_mut(), self.btf.as_ref()) else {
            return Err(HostError::NotLoaded);
        };
        let attach_error = |detail: String| HostError::Attach { hook, detail };

        let program: &mut Lsm = ebpf
            .program_mut(hook.program_name())
            .ok_or(HostError::MissingProgram(hook.program_name()))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| attach_error(e.to_string()))?;
        program
            .load(hook.lsm_hook(), btf)
            .map_err(|e| attach_error(e.to_string()))?;
        let link = program.attach().map_err(|e| attach_error(e.to_string()))?;

        self.links.insert(hook, link);
        Ok(())
    }

    fn detach(&mut self, hook: Hook) -> Result<(), HostError> {
        let link = self.links.remove(&hook).ok_or(HostError::NotAttached(hook))?;
        let ebpf = self.ebpf.as_mut().ok_or(HostError::NotLoaded)?;
        let detach_error = |detail: String| HostError::Detach { hook, detail };

        let program: &mut Lsm = ebpf
            .program_mut(hook.program_name())
            .ok_or(HostError::MissingProgram(hook.program_name()))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| detach_error(e.to_string()))?;
        program
            .detach(link)
            .map_err(|e| detach_error(e.to_string()))
    }

    fn forward_events(&mut self, events: mpsc::Sender<EventRecord>) -> Result<(), HostError> {
        let ring = self.ring.take().ok_or(HostError::NotLoaded)?;
        // SAFETY: the ring buffer owns its map fd and keeps it open, unchanged,
        // until it is dropped together with the AsyncFd.
        let mut fd = unsafe { AsyncFd::register_with_interest(ring, Interest::READABLE) }
            .map_err(|e| HostError::Events(e.to_string()))?;

        self.pump = Some(tokio::spawn(async move {
            loop {
                let mut guard = match fd.readable_mut().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(error = %e, "event ring buffer poll failed");
                        break;
                    }
                };
                let ring = guard.get_inner_mut();
                while let Some(item) = ring.next() {
                    match EventRecord::from_bytes(&item) {
                        Some(event) => {
                            if events.try_send(event).is_err() {
                                debug!(pid = event.pid, "audit channel full, event dropped");
                            }
                        }
                        None => debug!(len = item.len(), "short ring buffer record ignored"),
                    }
                }
                guard.clear_ready();
            }
        }));
        Ok(())
    }

    fn release_events(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for BpfHost {
    fn drop(&mut self) {
        self.release_events();
    }
}

/// Kernel maps behind the [`SharedState`] interface.
///
/// The mutexes only satisfy aya's `&mut self` map API; the kernel already
/// makes each element operation atomic.
struct BpfState {
    processes: Mutex<BpfHashMap<MapData, u32, PodProcess>>,
    config: Mutex<Array<MapData, PodConfig>>,
}

fn backend(table: &'static str, detail: impl ToString) -> StoreError {
    StoreError::Backend {
        table,
        detail: detail.to_string(),
    }
}

impl SharedState for BpfState {
    fn lookup_process(&self, pid: u32) -> Result<Option<ProcessInfo>, StoreError> {
        let map = self
            .processes
            .lock()
            .map_err(|_| StoreError::Unavailable("process table"))?;
        match map.get(&pid, 0) {
            Ok(PodProcess(info)) => Ok(Some(info)),
            Err(aya::maps::MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(backend("process table", e)),
        }
    }

    fn upsert_process(&self, info: ProcessInfo) -> Result<(), StoreError> {
        let mut map = self
            .processes
            .lock()
            .map_err(|_| StoreError::Unavailable("process table"))?;
        map.insert(info.pid, PodProcess(info), 0)
            .map_err(|e| backend("process table", e))
    }

    fn remove_process(&self, pid: u32) -> Result<bool, StoreError> {
        let mut map = self
            .processes
            .lock()
            .map_err(|_| StoreError::Unavailable("process table"))?;
        let existed = map.get(&pid, 0).is_ok();
        match map.remove(&pid) {
            Ok(()) => Ok(true),
            Err(_) if !existed => Ok(false),
            Err(e) => Err(backend("process table", e)),
        }
    }

    fn processes(&self) -> Result<Vec<ProcessInfo>, StoreError> {
        let map = self
            .processes
            .lock()
            .map_err(|_| StoreError::Unavailable("process table"))?;
        map.iter()
            .map(|entry| {
                entry
                    .map(|(_, PodProcess(info))| info)
                    .map_err(|e| backend("process table", e))
            })
            .collect()
    }

    fn load_config(&self) -> Result<Option<EngineConfig>, StoreError> {
        let array = self
            .config
            .lock()
            .map_err(|_| StoreError::Unavailable("config"))?;
        match array.get(&0, 0) {
            Ok(PodConfig(config)) => Ok(Some(config)),
            Err(e) => Err(backend("config", e)),
        }
    }

    fn store_config(&self, config: EngineConfig) -> Result<(), StoreError> {
        let mut array = self
            .config
            .lock()
            .map_err(|_| StoreError::Unavailable("config"))?;
        array
            .set(0, PodConfig(config), 0)
            .map_err(|e| backend("config", e))
    }
}

impl StateView for BpfState {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        self.lookup_process(pid).ok().flatten()
    }

    fn config(&self) -> Option<EngineConfig> {
        self.load_config().ok().flatten()
    }
}
