//! Async client for the control socket.
//!
//! Used by `telosd ctl` and by upstream sensors that raise or clear taint.

use std::path::Path;

use telos_engine::TaintLevel;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::protocol::{CommandMessage, Request, Response, StateSnapshot};

/// Errors from control client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket I/O failed.
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or a reply decoded.
    #[error("control socket JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The daemon closed the connection before replying.
    #[error("daemon closed the connection")]
    Closed,

    /// The daemon answered with `success: false`.
    #[error("daemon rejected {command}: {message}")]
    Rejected {
        /// Command that failed.
        command: String,
        /// Error string from the daemon.
        message: String,
    },

    /// The reply lacked an expected payload.
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

/// One connection to the daemon. Requests are answered in order.
pub struct ControlClient {
    writer: OwnedWriteHalf,
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl ControlClient {
    /// Connect to the socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Io`] if the socket cannot be reached.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            writer: write_half,
            reader: BufReader::new(read_half),
            line: String::new(),
        })
    }

    /// Send one message and return the raw response, whatever its outcome.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, undecodable replies, or a closed connection.
    pub async fn send(&mut self, message: &CommandMessage) -> Result<Response, ClientError> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        self.send_raw(&bytes).await
    }

    /// Send pre-framed bytes and read one response line.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send`].
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<Response, ClientError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;

        self.line.clear();
        let read = self.reader.read_line(&mut self.line).await?;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(self.line.trim_end())?)
    }

    async fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        let response = self.send(&request.to_message()).await?;
        if response.success {
            Ok(response)
        } else {
            Err(ClientError::Rejected {
                command: request.name().to_owned(),
                message: response.error.unwrap_or_default(),
            })
        }
    }

    /// `PING`. Returns the daemon's reply payload (`"pong"`).
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send`]; also fails if the daemon rejects it.
    pub async fn ping(&mut self) -> Result<String, ClientError> {
        let response = self.request(&Request::Ping).await?;
        response
            .data
            .and_then(|d| d.as_str().map(str::to_owned))
            .ok_or(ClientError::UnexpectedReply("PING"))
    }

    /// `UPDATE_TAINT`.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send`]; also fails if the daemon rejects it.
    pub async fn update_taint(&mut self, pid: u32, level: TaintLevel) -> Result<(), ClientError> {
        self.request(&Request::UpdateTaint { pid, level })
            .await
            .map(drop)
    }

    /// `CLEAR_TAINT`.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send`].
    pub async fn clear_taint(&mut self, pid: u32) -> Result<(), ClientError> {
        self.request(&Request::ClearTaint { pid }).await.map(drop)
    }

    /// `REGISTER_AGENT`.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send`]; also fails if the daemon rejects it.
    pub async fn register_agent(&mut self, pid: u32, comm: &str) -> Result<(), ClientError> {
        self.request(&Request::RegisterAgent {
            pid,
            comm: comm.to_owned(),
        })
        .await
        .map(drop)
    }

    /// `GET_STATE`.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send`]; also fails if the payload is malformed.
    pub async fn get_state(&mut self) -> Result<StateSnapshot, ClientError> {
        let response = self.request(&Request::GetState).await?;
        let data = response
            .data
            .ok_or(ClientError::UnexpectedReply("GET_STATE"))?;
        Ok(serde_json::from_value(data)?)
    }
}
