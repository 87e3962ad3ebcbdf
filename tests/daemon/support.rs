//! Shared fixtures for the daemon tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use telos::config::Config;
use telos::daemon::{Daemon, RunningDaemon};
use telos::handler::CommandHandler;
use telos::host::{SensitiveFiles, SimulatedHost};
use telos::store::MemoryState;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Config with every path under `dir` and an audit log.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.daemon.socket_path = dir.join("telos.sock");
    config.daemon.pin_dir = dir.join("pins");
    config.daemon.audit_log = Some(dir.join("audit.jsonl"));
    config
}

/// Start a daemon on a fresh simulated host.
pub fn start_simulated(config: &Config) -> (SimulatedHost, RunningDaemon) {
    let host = SimulatedHost::new(SensitiveFiles::default());
    let daemon = Daemon::start(Box::new(host.clone()), config).expect("bootstrap");
    (host, daemon)
}

/// Handler over fresh in-memory tables.
pub fn memory_handler() -> (Arc<MemoryState>, CommandHandler) {
    let state = Arc::new(MemoryState::new());
    let handler = CommandHandler::new(state.clone());
    (state, handler)
}

/// Raw line-level connection to a control socket.
pub struct RawConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawConn {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("connect");
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    /// Next response line as JSON, or `None` at EOF.
    pub async fn read(&mut self) -> Option<serde_json::Value> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.expect("read");
        if read == 0 {
            return None;
        }
        Some(serde_json::from_str(line.trim_end()).expect("response is JSON"))
    }

    pub async fn request(&mut self, line: &str) -> serde_json::Value {
        self.write(format!("{line}\n").as_bytes()).await;
        self.read().await.expect("response")
    }
}
