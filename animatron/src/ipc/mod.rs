//! Inter-Process Communication for the control socket
//!
//! This module provides a Unix Domain Socket transport between the assistant and
//! its clients (the dashboard bridge and the `am` CLI). Clients submit commands,
//! read replay snapshots, follow the live event stream and query status.

use std::path::PathBuf;

use crate::config::Config;

pub mod client;
pub mod messages;
pub mod server;

pub use client::{AssistantClient, EventFollower};
pub use messages::{Request, Response};
pub use server::{IpcServer, cleanup_socket, create_listener_at, handle_request};

/// Maximum request line size
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Get the default socket path
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("animatron")
        .join("animatron.sock")
}

/// Socket path from configuration, falling back to the default
pub fn socket_path(config: &Config) -> PathBuf {
    config.ipc.socket_path.clone().unwrap_or_else(get_socket_path)
}
