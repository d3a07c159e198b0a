//! Midiwire Client
//!
//! Connects to an ingestion server and sends framed events. Used by the
//! `send` command and by the server tests.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::protocol::schema::MidiEvent;
use crate::protocol::{encode_frame, encode_message, FrameError, Message, DEFAULT_MAX_FRAME_SIZE};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Sending side of an ingestion connection
pub struct Client {
    stream: TcpStream,
    server_addr: SocketAddr,
    max_frame_size: usize,
    write_buf: BytesMut,
    frames_sent: u64,
}

impl Client {
    /// Connect to a server
    pub async fn connect(server_addr: SocketAddr) -> ClientResult<Self> {
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {}", server_addr);

        Ok(Self {
            stream,
            server_addr,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_buf: BytesMut::with_capacity(4096),
            frames_sent: 0,
        })
    }

    /// Connect, giving up after `timeout`
    pub async fn connect_timeout(server_addr: SocketAddr, timeout: Duration) -> ClientResult<Self> {
        tokio::time::timeout(timeout, Self::connect(server_addr))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Send a typed event
    pub async fn send_event(&mut self, event: &MidiEvent) -> ClientResult<()> {
        self.send_message(&event.to_message()).await
    }

    /// Encode and send a message tree
    pub async fn send_message(&mut self, message: &Message) -> ClientResult<()> {
        let payload = encode_message(message);
        self.send_payload(&payload).await
    }

    /// Send an already-encoded payload as one frame
    pub async fn send_payload(&mut self, payload: &[u8]) -> ClientResult<()> {
        self.write_buf.clear();
        encode_frame(payload, self.max_frame_size, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.frames_sent += 1;
        tracing::debug!("Sent frame {} ({} bytes)", self.frames_sent, payload.len());
        Ok(())
    }

    /// Write bytes without framing them
    pub async fn send_raw(&mut self, bytes: &[u8]) -> ClientResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Close the sending half; the server sees a clean end of stream
    pub async fn close(mut self) -> ClientResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Access the underlying stream, e.g. to wait for the server to hang up
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
