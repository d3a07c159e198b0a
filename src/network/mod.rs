//! Network module - Handles TCP ingestion of framed events
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for sending events to a server
//! - Per-connection frame reading, decoding and dispatch

mod client;
mod connection;
mod server;
mod stats;

pub use client::*;
pub use connection::*;
pub use server::*;
pub use stats::*;

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_HOST, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};

/// How the accept loop admits connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AcceptMode {
    /// Any number of connections, each progressing independently
    #[default]
    Concurrent,
    /// One connection at a time; the next is accepted once it closes
    Sequential,
    /// Accept exactly one connection, then stop listening
    Single,
}

/// Configuration for the ingestion server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted frame payload in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Connection admission policy
    #[serde(default)]
    pub accept_mode: AcceptMode,
    /// How long in-flight dispatches may run after shutdown is requested
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Initial per-connection read buffer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Capacity of the server event channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_frame_size: default_max_frame_size(),
            accept_mode: AcceptMode::default(),
            shutdown_grace_ms: default_shutdown_grace(),
            read_buffer_size: default_read_buffer_size(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_accept_mode(mut self, mode: AcceptMode) -> Self {
        self.accept_mode = mode;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bind_address() {
        assert_eq!(ServerConfig::default().bind_address(), "127.0.0.1:5252");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("port = 6000\naccept_mode = \"single\"").unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.accept_mode, AcceptMode::Single);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }
}
