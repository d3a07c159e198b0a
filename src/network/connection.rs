//! Connection handling for Midiwire
//!
//! One `Connection` per accepted socket. It owns the socket, the receive
//! buffer and the frame parse state; nothing here is shared with other
//! connections except through the read-only [`ConnectionHandle`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::protocol::{Frame, FrameError, FrameReader, WireError};

/// Connection errors. All of them end the connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Malformed wire data: {0}")]
    MalformedWire(#[from] WireError),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Socket accepted, not yet reading
    Accepted = 0,
    /// Waiting for frame bytes
    Reading = 1,
    /// A decoded frame is being handled
    Dispatching = 2,
    /// Terminal
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Accepted,
            1 => ConnectionState::Reading,
            2 => ConnectionState::Dispatching,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the socket at a frame boundary
    PeerClosed,
    /// Closed through [`ConnectionHandle::close`]
    Requested,
    /// Server shutdown
    Shutdown,
    /// Fatal framing, decoding or I/O error
    Failed(String),
}

impl CloseReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::Failed(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "connection closed by peer"),
            CloseReason::Requested => write!(f, "disconnect requested"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
            CloseReason::Failed(e) => write!(f, "error: {}", e),
        }
    }
}

/// State visible outside the connection task
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    close_tx: watch::Sender<bool>,
}

/// A connection being read by the server
pub struct Connection<S = TcpStream> {
    id: u64,
    peer: SocketAddr,
    stream: S,
    reader: FrameReader,
    read_buffer_size: usize,
    shared: Arc<Shared>,
    close_rx: watch::Receiver<bool>,
    connected_at: Instant,
    last_activity: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream
    pub fn new(id: u64, stream: S, peer: SocketAddr, max_frame_size: usize, read_buffer_size: usize) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        let now = Instant::now();

        Self {
            id,
            peer,
            stream,
            reader: FrameReader::with_capacity(max_frame_size, read_buffer_size),
            read_buffer_size: read_buffer_size.max(64),
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Accepted as u8),
                frames_received: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                close_tx,
            }),
            close_rx,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.swap(state as u8, Ordering::SeqCst);
        tracing::trace!(
            connection = self.id,
            "State {:?} -> {:?}",
            ConnectionState::from_u8(previous),
            state
        );
    }

    /// Handle for observing and closing this connection from elsewhere
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            peer: self.peer,
            connected_at: self.connected_at,
            shared: self.shared.clone(),
        }
    }

    /// Receiver that changes when a close is requested through a handle
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between frames. Safe to
    /// cancel: no bytes are lost if the future is dropped mid-read.
    pub async fn read_frame(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.reader.next_frame()? {
                self.shared.frames_received.fetch_add(1, Ordering::Relaxed);
                self.last_activity = Instant::now();
                return Ok(Some(frame));
            }

            let buf = self.reader.buffer_mut();
            if buf.capacity() - buf.len() < self.read_buffer_size {
                buf.reserve(self.read_buffer_size);
            }

            let n = self.stream.read_buf(buf).await?;
            if n == 0 {
                self.reader.finish()?;
                return Ok(None);
            }

            self.shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Bytes of an incomplete frame currently buffered
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }

    /// Get time since last complete frame
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Close the socket and mark the connection closed
    pub async fn close(&mut self) {
        self.set_state(ConnectionState::Closed);
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(connection = self.id, "Socket shutdown failed: {}", e);
        }
    }
}

/// Cloneable view of a live connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    connected_at: Instant,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn frames_received(&self) -> u64 {
        self.shared.frames_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Ask the connection task to close the socket
    pub fn close(&self) {
        self.shared.close_tx.send_replace(true);
    }

    /// Mark closed on behalf of a task that was aborted before it could
    pub(crate) fn mark_closed(&self) {
        self.shared.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.state() != ConnectionState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let stream = Builder::new()
            .read(&[0, 0])
            .read(&[0, 3, b'a'])
            .read(&[b'b'])
            .read(&[b'c', 0, 0, 0, 0])
            .build();
        let mut conn = Connection::new(1, stream, peer(), DEFAULT_MAX_FRAME_SIZE, 64);

        let first = conn.read_frame().await.unwrap().unwrap();
        assert_eq!(first.payload(), b"abc");
        assert_eq!(first.sequence, 0);

        let second = conn.read_frame().await.unwrap().unwrap();
        assert!(second.is_empty());
        assert_eq!(second.sequence, 1);

        assert!(conn.read_frame().await.unwrap().is_none());
        assert_eq!(conn.handle().frames_received(), 2);
        assert_eq!(conn.handle().bytes_received(), 11);
    }

    #[tokio::test]
    async fn test_close_mid_payload_is_truncated() {
        let stream = Builder::new().read(&[0, 0, 0, 10, 1, 2, 3]).build();
        let mut conn = Connection::new(1, stream, peer(), DEFAULT_MAX_FRAME_SIZE, 64);

        let err = conn.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Frame(FrameError::TruncatedStream { buffered: 7 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_header() {
        let stream = Builder::new().read(&[0, 0, 1, 0]).build();
        let mut conn = Connection::new(1, stream, peer(), 255, 64);

        let err = conn.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Frame(FrameError::FrameTooLarge { length: 256, max: 255 })
        ));
    }

    #[tokio::test]
    async fn test_handle_close_signal() {
        let stream = Builder::new().build();
        let conn = Connection::new(7, stream, peer(), DEFAULT_MAX_FRAME_SIZE, 64);
        let mut signal = conn.close_signal();
        let handle = conn.handle();

        assert_eq!(handle.state(), ConnectionState::Accepted);
        conn.set_state(ConnectionState::Reading);
        assert_eq!(handle.state(), ConnectionState::Reading);

        handle.close();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }
}
