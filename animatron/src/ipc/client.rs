//! IPC client for talking to a running assistant
//!
//! Used by the CLI and by tests; the dashboard bridge speaks the same protocol.

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::events::Event;

use super::MAX_MESSAGE_SIZE;
use super::get_socket_path;
use super::messages::{Request, Response};

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the assistant's control socket
#[derive(Debug, Clone)]
pub struct AssistantClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for AssistantClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AssistantClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self {
            socket_path: get_socket_path(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if the assistant is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("AssistantClient: pinging");
        let data = self.request(Request::Ping).await?.into_data()?;
        data.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| eyre::eyre!("Unexpected ping response"))
    }

    /// Submit a command object; returns the sequence id it was published with
    pub async fn send_command(&self, command: Value) -> Result<u64> {
        debug!(?command, "AssistantClient: sending command");
        let data = self.request(Request::Command { command }).await?.into_data()?;
        data.get("sequence_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| eyre::eyre!("Unexpected command response"))
    }

    /// Read the replay buffer
    pub async fn snapshot(&self, since: Option<u64>) -> Result<Vec<Event>> {
        debug!(?since, "AssistantClient: requesting snapshot");
        let mut data = self.request(Request::Snapshot { since }).await?.into_data()?;
        serde_json::from_value(take_field(&mut data, "events")).context("Failed to parse snapshot events")
    }

    pub async fn status(&self) -> Result<Value> {
        debug!("AssistantClient: requesting status");
        self.request(Request::Status).await?.into_data()
    }

    /// Request the assistant to shutdown gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("AssistantClient: requesting shutdown");
        self.request(Request::Shutdown).await?.into_data()?;
        Ok(())
    }

    /// Start following the live event stream
    pub async fn follow(&self, since: Option<u64>) -> Result<EventFollower> {
        debug!(?since, "AssistantClient: following");
        let stream = self.connect().await?;
        let (read_half, mut writer) = stream.into_split();
        self.write_request(&mut writer, &Request::Follow { since }).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .context("Read timeout")?
            .context("Failed to read follow response")?;
        let response: Response = serde_json::from_str(line.trim()).context("Failed to parse follow response")?;
        let mut data = response.into_data()?;

        let backlog: Vec<Event> =
            serde_json::from_value(take_field(&mut data, "events")).context("Failed to parse follow backlog")?;
        let cursor = data.get("cursor").and_then(Value::as_u64).unwrap_or(0);
        Ok(EventFollower {
            backlog,
            cursor,
            reader,
            _writer: writer,
        })
    }

    /// Send one request on a fresh connection and wait for its response
    pub async fn request(&self, request: Request) -> Result<Response> {
        let stream = self.connect().await?;
        let (read_half, mut writer) = stream.into_split();
        self.write_request(&mut writer, &request).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .context("Read timeout")?
            .context("Failed to read response")?;
        if line.is_empty() {
            return Err(eyre::eyre!("Connection closed without a response"));
        }

        let response: Response = serde_json::from_str(line.trim()).context("Failed to parse response")?;
        debug!(ok = response.is_ok(), "AssistantClient: received response");
        Ok(response)
    }

    async fn connect(&self) -> Result<UnixStream> {
        debug!(?self.socket_path, "AssistantClient: connecting");
        tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to assistant socket")
    }

    async fn write_request(&self, writer: &mut OwnedWriteHalf, request: &Request) -> Result<()> {
        let json = serde_json::to_string(request).context("Failed to serialize request")?;
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Message too large: {} bytes", json.len()));
        }

        tokio::time::timeout(self.timeout, async {
            writer.write_all(json.as_bytes()).await.context("Failed to write request")?;
            writer.write_all(b"\n").await.context("Failed to write newline")?;
            writer.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;
        Ok(())
    }
}

fn take_field(data: &mut Value, key: &str) -> Value {
    data.get_mut(key).map(Value::take).unwrap_or_default()
}

/// Live event stream opened by [`AssistantClient::follow`]
pub struct EventFollower {
    /// Events that were buffered when the stream was opened
    pub backlog: Vec<Event>,
    /// Last sequence id covered by the backlog (or the requested cursor)
    pub cursor: u64,
    reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
}

impl EventFollower {
    /// Next live event; `None` once the assistant closes the stream
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .context("Failed to read event")?;
        if bytes_read == 0 {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(line.trim()).context("Failed to parse event")?;
        if value.get("status").is_some() {
            // Error envelope, e.g. the follower lagged
            let response: Response = serde_json::from_value(value).context("Failed to parse stream error")?;
            response.into_data()?;
            return Ok(None);
        }
        let event: Event = serde_json::from_value(value).context("Failed to parse event")?;
        self.cursor = event.sequence_id;
        Ok(Some(event))
    }
}
