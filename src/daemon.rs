//! Daemon bootstrap and lifecycle.
//!
//! Startup runs in a fixed order and stops at the first fatal step:
//!
//! 1. lift the memlock limit
//! 2. create the tables, pin the process table, wire the event channel
//! 3. attach the hooks (exec gate mandatory, the rest best-effort)
//! 4. write the policy into the config table
//! 5. bind the control socket and start serving
//!
//! Nothing is served until every step has succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::{run_event_consumer, AuditLogger};
use crate::config::Config;
use crate::handler::CommandHandler;
use crate::host::{EngineHost, Hook, HostError};
use crate::server::ControlServer;
use crate::store::{SharedState, StoreError};

/// How long shutdown waits for the audit consumer to drain.
const CONSUMER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A fatal startup failure. The daemon never serves after one.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Step 1.
    #[error("failed to raise memlock limit: {0}")]
    Memlock(#[source] HostError),

    /// Step 2.
    #[error("failed to create shared state: {0}")]
    CreateState(#[source] HostError),

    /// Step 3, for a mandatory hook.
    #[error("failed to attach mandatory hook: {0}")]
    MandatoryAttach(#[source] HostError),

    /// The configured policy is invalid.
    #[error("invalid policy: {0}")]
    Policy(String),

    /// Step 4.
    #[error("failed to write config: {0}")]
    WriteConfig(#[source] StoreError),

    /// Step 5.
    #[error("failed to listen on {path}: {source}")]
    Listen {
        /// Socket path.
        path: PathBuf,
        /// Bind error.
        #[source]
        source: std::io::Error,
    },
}

/// Entry point for starting the daemon.
pub struct Daemon;

impl Daemon {
    /// Run the bootstrap sequence on `host` with `config`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the [`BootstrapError`] of the first fatal step. Hooks
    /// attached before the failure are detached again.
    pub fn start(
        mut host: Box<dyn EngineHost>,
        config: &Config,
    ) -> Result<RunningDaemon, BootstrapError> {
        let policy = config
            .policy
            .engine_config()
            .map_err(|e| BootstrapError::Policy(format!("{e:#}")))?;
        info!(host = host.name(), "starting telos daemon");

        info!(step = 1, "raising memlock limit");
        host.raise_memlock_limit().map_err(BootstrapError::Memlock)?;

        info!(step = 2, pin_dir = %config.daemon.pin_dir.display(), "creating shared state");
        let tables = host
            .create_state(&config.daemon.pin_dir)
            .map_err(BootstrapError::CreateState)?;
        let pinned = match tables.pinned {
            Ok(path) => {
                info!(path = %path.display(), "process table pinned");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "process table not pinned");
                None
            }
        };
        let state = tables.state;
        let consumer = spawn_audit_consumer(host.as_mut(), config);

        info!(step = 3, "attaching hooks");
        let mut attached = Vec::with_capacity(Hook::ALL.len());
        for hook in Hook::ALL {
            match host.attach(hook) {
                Ok(()) => {
                    info!(%hook, program = hook.program_name(), "hook attached");
                    attached.push(hook);
                }
                Err(e) if hook.is_mandatory() => {
                    error!(%hook, error = %e, "mandatory hook failed to attach");
                    unwind(host.as_mut(), &attached);
                    return Err(BootstrapError::MandatoryAttach(e));
                }
                Err(e) => warn!(%hook, error = %e, "hook not attached, enforcement reduced"),
            }
        }

        info!(
            step = 4,
            max_taint_for_exec = policy.exec_threshold().name(),
            max_taint_for_open = policy.open_threshold().name(),
            enforce = policy.enforcing(),
            "writing config"
        );
        if let Err(e) = state.store_config(policy) {
            unwind(host.as_mut(), &attached);
            return Err(BootstrapError::WriteConfig(e));
        }

        info!(step = 5, socket = %config.daemon.socket_path.display(), "binding control socket");
        let server = match ControlServer::bind(&config.daemon.socket_path) {
            Ok(server) => server,
            Err(source) => {
                unwind(host.as_mut(), &attached);
                return Err(BootstrapError::Listen {
                    path: config.daemon.socket_path.clone(),
                    source,
                });
            }
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = CommandHandler::new(Arc::clone(&state));
        let server = tokio::spawn(server.serve(handler, shutdown_rx));

        info!(hooks = attached.len(), "telos daemon ready");
        Ok(RunningDaemon {
            host,
            state,
            attached,
            pinned,
            socket_path: config.daemon.socket_path.clone(),
            shutdown_tx,
            server,
            consumer,
        })
    }
}

fn spawn_audit_consumer(host: &mut dyn EngineHost, config: &Config) -> JoinHandle<u64> {
    let logger = config.daemon.audit_log.as_deref().and_then(|path| {
        match AuditLogger::new(path) {
            Ok(logger) => Some(Arc::new(logger)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "audit log unavailable");
                None
            }
        }
    });
    let (tx, rx) = mpsc::channel(config.daemon.event_queue_capacity.max(1));
    if let Err(e) = host.forward_events(tx) {
        warn!(error = %e, "engine events will not be audited");
    }
    tokio::spawn(run_event_consumer(rx, logger))
}

fn unwind(host: &mut dyn EngineHost, attached: &[Hook]) {
    for &hook in attached.iter().rev() {
        if let Err(e) = host.detach(hook) {
            warn!(%hook, error = %e, "detach during unwind failed");
        }
    }
    host.release_events();
}

/// A daemon that has completed bootstrap and is serving.
pub struct RunningDaemon {
    host: Box<dyn EngineHost>,
    state: Arc<dyn SharedState>,
    attached: Vec<Hook>,
    pinned: Option<PathBuf>,
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<u64>,
    consumer: JoinHandle<u64>,
}

/// What [`RunningDaemon::shutdown`] did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Connections accepted over the daemon's lifetime.
    pub connections: u64,
    /// Hooks detached cleanly.
    pub detached: Vec<Hook>,
    /// Hooks whose detach failed, with the error text.
    pub detach_failures: Vec<(Hook, String)>,
    /// Events the audit consumer processed.
    pub events: u64,
    /// Pin left in place for inspection or reuse.
    pub pin_left: Option<PathBuf>,
}

impl RunningDaemon {
    /// The shared tables.
    pub fn state(&self) -> &Arc<dyn SharedState> {
        &self.state
    }

    /// Control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Hooks that attached successfully, in attach order.
    pub fn attached_hooks(&self) -> &[Hook] {
        &self.attached
    }

    /// Where the process table is pinned, if pinning succeeded.
    pub fn pinned_path(&self) -> Option<&Path> {
        self.pinned.as_deref()
    }

    /// Stop serving, detach hooks and drain the audit channel.
    ///
    /// Pins are left in place; `telosd clean-pins` removes them.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            mut host,
            attached,
            pinned,
            shutdown_tx,
            server,
            consumer,
            ..
        } = self;
        info!("shutting down");
        let mut report = ShutdownReport::default();

        // Receivers may already be gone; the server treats that as shutdown.
        let _ = shutdown_tx.send(true);
        match server.await {
            Ok(connections) => report.connections = connections,
            Err(e) => warn!(error = %e, "control server task failed"),
        }

        for hook in attached.into_iter().rev() {
            match host.detach(hook) {
                Ok(()) => {
                    info!(%hook, "hook detached");
                    report.detached.push(hook);
                }
                Err(e) => {
                    warn!(%hook, error = %e, "hook detach failed");
                    report.detach_failures.push((hook, e.to_string()));
                }
            }
        }

        host.release_events();
        match tokio::time::timeout(CONSUMER_DRAIN_TIMEOUT, consumer).await {
            Ok(Ok(events)) => report.events = events,
            Ok(Err(e)) => warn!(error = %e, "audit consumer task failed"),
            Err(_) => warn!("audit consumer did not drain in time"),
        }

        if let Some(pin) = &pinned {
            info!(path = %pin.display(), "pinned process table left in place");
        }
        report.pin_left = pinned;
        info!(
            connections = report.connections,
            events = report.events,
            "telos daemon stopped"
        );
        report
    }
}
