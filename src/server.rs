//! Unix socket server for the control protocol.
//!
//! One task per connection. Each line is handled to completion before the
//! next one is read, so responses come back in request order. Commands on
//! different connections interleave freely; every command is a single
//! table operation.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::handler::CommandHandler;
use crate::protocol::{ProtocolError, Response, ValidationError, MAX_MESSAGE_BYTES};

/// Socket file mode: owner and group may connect.
pub const SOCKET_MODE: u32 = 0o660;

/// A bound control socket.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket at `path`.
    ///
    /// Removes a stale socket file, creates the parent directory and
    /// restricts the socket to mode `0660`. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the first step that fails.
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` turns true or its sender is
    /// dropped. Then closes the listener, removes the socket file and
    /// aborts connections still open. Returns the number of connections
    /// accepted.
    pub async fn serve(self, handler: CommandHandler, mut shutdown: watch::Receiver<bool>) -> u64 {
        let Self { listener, path } = self;
        let mut connections = JoinSet::new();
        let mut accepted: u64 = 0;

        while !*shutdown.borrow() {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        accepted = accepted.saturating_add(1);
                        let id = accepted;
                        debug!(connection = id, "client connected");
                        connections.spawn(serve_connection(
                            id,
                            stream,
                            handler.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        match std::fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "control socket removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket"),
        }
        connections.shutdown().await;
        info!(connections = accepted, "control server stopped");
        accepted
    }
}

async fn serve_connection(
    id: u64,
    stream: UnixStream,
    handler: CommandHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        result = run_connection(stream, &handler) => match result {
            Ok(commands) => debug!(connection = id, commands, "client disconnected"),
            Err(e) => warn!(connection = id, error = %e, "connection closed"),
        },
        () = stopped(&mut shutdown) => {
            debug!(connection = id, "connection closed for shutdown");
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum Frame {
    Line,
    TooLong,
    Eof,
}

async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = u64::try_from(MAX_MESSAGE_BYTES.saturating_add(1)).unwrap_or(u64::MAX);
    let read = reader.take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Ok(Frame::Line);
    }
    if buf.len() > MAX_MESSAGE_BYTES {
        return Ok(Frame::TooLong);
    }
    // Final line without a trailing newline.
    Ok(Frame::Line)
}

async fn run_connection(
    stream: UnixStream,
    handler: &CommandHandler,
) -> Result<u64, ProtocolError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let mut commands: u64 = 0;

    loop {
        let response = match read_frame(&mut reader, &mut buf).await? {
            Frame::Eof => return Ok(commands),
            Frame::TooLong => {
                let error = ProtocolError::MessageTooLong {
                    limit: MAX_MESSAGE_BYTES,
                };
                write_response(&mut write_half, &Response::failure(error.to_string())).await?;
                return Err(error);
            }
            Frame::Line => match std::str::from_utf8(&buf) {
                Ok(line) => handler.handle_line(line),
                Err(e) => Response::failure(ValidationError::InvalidJson(e.to_string()).to_string()),
            },
        };
        commands = commands.saturating_add(1);
        write_response(&mut write_half, &response).await?;
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
