//! IPC server for the assistant side
//!
//! Binds the control socket and answers requests from the dashboard bridge and
//! the CLI. Each connection may send any number of requests; a `Follow` request
//! turns the connection into a one-way event stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::runtime::Assistant;

use super::MAX_MESSAGE_SIZE;
use super::messages::{Request, Response};

/// Create a listener at a specific path
///
/// Handles cleanup of stale socket files from previous runs.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener_at: creating IPC socket");

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    // Clean up stale socket if exists
    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    debug!(?socket_path, "create_listener_at: socket bound successfully");

    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Serves the control socket until shutdown is signalled
pub struct IpcServer {
    assistant: Arc<Assistant>,
    shutdown_tx: watch::Sender<bool>,
}

impl IpcServer {
    pub fn new(assistant: Arc<Assistant>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { assistant, shutdown_tx }
    }

    /// Resolves once a `Shutdown` request arrived or [`IpcServer::shutdown`] was called
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Accept connections until shutdown
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        info!("IPC server listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown_rx) => {
                    info!("IPC server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("IpcServer::serve: accepted connection");
                        let assistant = self.assistant.clone();
                        let shutdown_tx = self.shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, assistant, shutdown_tx).await {
                                debug!(error = %e, "Connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept IPC connection"),
                },
            }
        }
        Ok(())
    }
}

/// Answer a single non-streaming request
pub async fn handle_request(assistant: &Assistant, request: Request, shutdown_tx: &watch::Sender<bool>) -> Response {
    debug!(?request, "handle_request: called");
    match request {
        Request::Command { command } => match assistant.submit(&command).await {
            Ok(sequence_id) => Response::ok(json!({ "sequence_id": sequence_id })),
            Err(e) => e.into(),
        },
        Request::Snapshot { since } => match assistant.bus().snapshot(since) {
            Ok(events) => Response::ok(json!({
                "events": events,
                "last_sequence_id": assistant.bus().last_sequence_id(),
            })),
            Err(gap) => Response::error("gap", gap.to_string()),
        },
        Request::Status => match serde_json::to_value(assistant.status()) {
            Ok(status) => Response::ok(status),
            Err(e) => Response::error("internal", format!("failed to encode status: {}", e)),
        },
        Request::Ping => Response::ok(json!({ "version": env!("CARGO_PKG_VERSION") })),
        Request::Shutdown => {
            info!("Shutdown requested over IPC");
            shutdown_tx.send_replace(true);
            Response::ok(serde_json::Value::Null)
        }
        Request::Follow { .. } => Response::error("bad_request", "follow must be the last request on a connection"),
    }
}

async fn handle_connection(stream: UnixStream, assistant: Arc<Assistant>, shutdown_tx: watch::Sender<bool>) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = String::new();
        let bytes_read = (&mut reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_line(&mut line)
            .await
            .context("Failed to read IPC message")?;

        if bytes_read == 0 {
            debug!("handle_connection: client closed connection");
            return Ok(());
        }
        if bytes_read > MAX_MESSAGE_SIZE {
            let response = Response::error("bad_request", format!("request exceeds {} bytes", MAX_MESSAGE_SIZE));
            write_line(&mut writer, &response).await?;
            return Err(eyre::eyre!("Message too large: {} bytes", bytes_read));
        }
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                write_line(&mut writer, &Response::error("bad_request", format!("invalid request: {}", e))).await?;
                continue;
            }
        };

        if let Request::Follow { since } = request {
            return follow(&mut writer, &assistant, since, shutdown_tx.subscribe()).await;
        }
        let response = handle_request(&assistant, request, &shutdown_tx).await;
        write_line(&mut writer, &response).await?;
    }
}

/// Write the snapshot envelope, then every live event until the client leaves
async fn follow(
    writer: &mut OwnedWriteHalf,
    assistant: &Assistant,
    since: Option<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    debug!(?since, "follow: called");
    let attachment = match assistant.bus().attach(since) {
        Ok(attachment) => attachment,
        Err(gap) => return write_line(writer, &Response::error("gap", gap.to_string())).await,
    };
    let envelope = Response::ok(json!({
        "events": attachment.backlog,
        "cursor": attachment.cursor,
    }));
    write_line(writer, &envelope).await?;

    let mut live = attachment.live;
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown_rx) => return Ok(()),
            received = live.recv() => match received {
                Ok(event) => write_line(writer, &event).await?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Follower lagged, closing stream");
                    let response = Response::error("lagged", format!("observer lagged, {} events missed; resync with a snapshot", missed));
                    return write_line(writer, &response).await;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Completes once shutdown is signalled or the signal sender is gone
async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
    let json = serde_json::to_string(message).context("Failed to serialize response")?;
    writer.write_all(json.as_bytes()).await.context("Failed to write response")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush response")?;
    Ok(())
}
