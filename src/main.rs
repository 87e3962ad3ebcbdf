//! `telosd`: control-plane daemon for the Telos taint engine.
//!
//! Provides `start` for running the daemon, `ctl` for talking to a running
//! daemon, and `clean-pins` for removing pinned tables after a stop.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use telos::client::ControlClient;
use telos::config::load_or_default;
use telos::daemon::Daemon;
use telos::engine::TaintLevel;
use telos::host::{EngineHost, SimulatedHost};
use telos::protocol::DEFAULT_SOCKET_PATH;
use telos::store::{remove_pins, DEFAULT_PIN_DIR};

/// Telos: taint-based mandatory access control for AI agent processes.
#[derive(Parser)]
#[command(name = "telosd", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Command {
    /// Load the engine, attach the hooks and serve the control socket.
    Start {
        /// Control socket path (overrides the config file).
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Compiled engine object (overrides the config file).
        #[arg(long = "bpf-obj")]
        bpf_obj: Option<PathBuf>,
        /// Run the engine in-process instead of in the kernel.
        #[arg(long)]
        simulate: bool,
        /// Config file (default: /etc/telos/telos.toml if present).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove the pinned process table left by a stopped daemon.
    CleanPins {
        /// Pin directory on the BPF filesystem.
        #[arg(long, default_value = DEFAULT_PIN_DIR)]
        pin_dir: PathBuf,
    },
    /// Send a command to a running daemon.
    Ctl {
        /// Control socket path.
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
        /// Command to send.
        #[command(subcommand)]
        command: CtlCommand,
    },
}

/// Control commands.
#[derive(Subcommand)]
enum CtlCommand {
    /// Check that the daemon is alive.
    Ping,
    /// Set a process's taint level.
    UpdateTaint {
        /// Process id.
        pid: u32,
        /// CLEAN, LOW, MEDIUM, HIGH, CRITICAL or 0-4.
        level: String,
    },
    /// Stop tracking a process.
    ClearTaint {
        /// Process id.
        pid: u32,
    },
    /// Register an agent process at CLEAN.
    Register {
        /// Process id.
        pid: u32,
        /// Process name.
        #[arg(default_value = "")]
        comm: String,
    },
    /// Print the tracked processes as JSON.
    State,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            socket,
            bpf_obj,
            simulate,
            config,
        } => handle_start(socket, bpf_obj, simulate, config).await,
        Command::CleanPins { pin_dir } => {
            telos::logging::init_cli();
            handle_clean_pins(&pin_dir)
        }
        Command::Ctl { socket, command } => {
            telos::logging::init_cli();
            handle_ctl(socket, command).await
        }
    }
}

/// Run the daemon until SIGINT or SIGTERM.
async fn handle_start(
    socket: Option<PathBuf>,
    bpf_obj: Option<PathBuf>,
    simulate: bool,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        simulate || telos::sys::is_privileged(),
        "telosd start must run as root (effective uid 0); use --simulate for an unprivileged run"
    );

    let mut config = load_or_default(config_path.as_deref())?;
    if let Some(socket) = socket {
        config.daemon.socket_path = socket;
    }
    if let Some(bpf_obj) = bpf_obj {
        config.daemon.bpf_object = bpf_obj;
    }
    config.validate()?;

    let _logging_guard = telos::logging::init_daemon(config.daemon.logs_dir.as_deref())?;

    let host: Box<dyn EngineHost> = if simulate {
        Box::new(SimulatedHost::new(config.policy.sensitive_files()?))
    } else {
        kernel_host(&config.daemon.bpf_object)?
    };

    let daemon = Daemon::start(host, &config).context("bootstrap failed")?;
    wait_for_signal().await?;
    let report = daemon.shutdown().await;
    if !report.detach_failures.is_empty() {
        anyhow::bail!("{} hook(s) failed to detach", report.detach_failures.len());
    }
    Ok(())
}

#[cfg(feature = "bpf")]
fn kernel_host(object: &std::path::Path) -> anyhow::Result<Box<dyn EngineHost>> {
    Ok(Box::new(telos::host::bpf::BpfHost::new(object)))
}

#[cfg(not(feature = "bpf"))]
fn kernel_host(object: &std::path::Path) -> anyhow::Result<Box<dyn EngineHost>> {
    anyhow::bail!(
        "cannot load {}: telosd was built without the `bpf` feature; rebuild with it or use --simulate",
        object.display()
    )
}

async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            info!("received SIGINT");
        }
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

/// Remove pins and report what was removed.
fn handle_clean_pins(pin_dir: &std::path::Path) -> anyhow::Result<()> {
    let removed = remove_pins(pin_dir)
        .with_context(|| format!("failed to clean pins under {}", pin_dir.display()))?;
    if removed.is_empty() {
        println!("nothing to remove under {}", pin_dir.display());
    }
    for path in removed {
        println!("removed {}", path.display());
    }
    Ok(())
}

/// Send one control command and print the result.
async fn handle_ctl(socket: PathBuf, command: CtlCommand) -> anyhow::Result<()> {
    let mut client = ControlClient::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;

    match command {
        CtlCommand::Ping => println!("{}", client.ping().await?),
        CtlCommand::UpdateTaint { pid, level } => {
            let level: TaintLevel = level
                .parse()
                .with_context(|| format!("invalid taint level '{level}'"))?;
            client.update_taint(pid, level).await?;
            println!("pid {pid} taint set to {level}");
        }
        CtlCommand::ClearTaint { pid } => {
            client.clear_taint(pid).await?;
            println!("pid {pid} cleared");
        }
        CtlCommand::Register { pid, comm } => {
            client.register_agent(pid, &comm).await?;
            println!("pid {pid} registered");
        }
        CtlCommand::State => {
            let snapshot = client.get_state().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}
