//! Midiwire Server
//!
//! Accepts connections and runs one task per connection that reads frames,
//! decodes them and hands them to the dispatcher. A connection that fails
//! is closed on its own; the accept loop and other connections carry on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::{CloseReason, Connection, ConnectionHandle, ConnectionResult, ConnectionState};
use super::stats::{ServerStats, StatsSnapshot};
use super::{AcceptMode, ServerConfig};
use crate::dispatch::{DispatchOutcome, DispatchWarning, Dispatcher, EventContext};
use crate::protocol::{decode_message, Frame, MessageDescriptor};

/// Pause after a failed accept, so descriptor exhaustion doesn't spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Accept loop failed: {0}")]
    Task(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Listening socket bound
    Started { bind_addr: SocketAddr },
    /// A new connection was accepted
    ConnectionOpened { id: u64, peer: SocketAddr },
    /// A complete frame arrived
    FrameReceived { id: u64, sequence: u64, length: usize },
    /// A frame was dispatched with a non-fatal problem
    Warning {
        id: u64,
        sequence: u64,
        warning: DispatchWarning,
    },
    /// A connection reached `Closed`
    ConnectionClosed {
        id: u64,
        peer: SocketAddr,
        reason: CloseReason,
    },
    /// Listener closed and all connections finished
    Stopped,
}

/// State shared by the accept loop and every connection task.
/// Everything except the counters and the connection table is read-only.
struct ServerContext {
    config: ServerConfig,
    descriptor: Arc<MessageDescriptor>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<RwLock<HashMap<u64, ConnectionHandle>>>,
    stats: Arc<ServerStats>,
    event_tx: mpsc::Sender<ServerEvent>,
    next_id: AtomicU64,
}

impl ServerContext {
    /// Never blocks: a slow or absent event consumer must not stall ingestion
    fn emit(&self, event: ServerEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::trace!("Event channel full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Midiwire ingestion server
pub struct Server {
    context: Arc<ServerContext>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server. The dispatcher's registry is fixed from here on.
    pub fn new(config: ServerConfig, descriptor: Arc<MessageDescriptor>, dispatcher: Dispatcher) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));

        Self {
            context: Arc::new(ServerContext {
                config,
                descriptor,
                dispatcher: Arc::new(dispatcher),
                connections: Arc::new(RwLock::new(HashMap::new())),
                stats: Arc::new(ServerStats::default()),
                event_tx,
                next_id: AtomicU64::new(1),
            }),
            event_rx: Some(event_rx),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = self.context.config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Server listening on {} ({:?} mode, max frame {} bytes)",
            local_addr,
            self.context.config.accept_mode,
            self.context.config.max_frame_size
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        self.context.emit(ServerEvent::Started { bind_addr: local_addr });

        let context = self.context.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, context, shutdown_rx)));

        Ok(local_addr)
    }

    /// Stop accepting, close every connection and wait for in-flight
    /// dispatches up to the configured grace period
    pub async fn stop(&mut self) -> ServerResult<()> {
        let task = self.accept_task.take().ok_or(ServerError::NotRunning)?;

        if let Some(tx) = self.shutdown_tx.take() {
            tx.send_replace(true);
        }

        task.await.map_err(|e| ServerError::Task(e.to_string()))?;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Wait until the accept loop ends on its own (single-connection mode)
    pub async fn wait(&mut self) -> ServerResult<()> {
        let task = self.accept_task.take().ok_or(ServerError::NotRunning)?;
        task.await.map_err(|e| ServerError::Task(e.to_string()))?;
        self.shutdown_tx = None;
        Ok(())
    }

    /// Check if the accept loop is still running
    pub fn is_running(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.context.dispatcher
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Get a list of open connections
    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        let connections = self.context.connections.read().await;
        let mut handles: Vec<_> = connections.values().cloned().collect();
        handles.sort_by_key(ConnectionHandle::id);
        handles
    }

    /// Close one connection. Returns false if it is not open.
    pub async fn disconnect(&self, id: u64) -> bool {
        let connections = self.context.connections.read().await;
        match connections.get(&id) {
            Some(handle) => {
                tracing::info!("Disconnecting connection {} ({})", id, handle.peer());
                handle.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = &self.accept_task {
            if let Some(tx) = &self.shutdown_tx {
                tx.send_replace(true);
            } else {
                task.abort();
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<ServerContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let mode = context.config.accept_mode;
    let mut tasks = JoinSet::new();
    let mut accepted = 0u64;

    loop {
        if mode == AcceptMode::Single && accepted > 0 && tasks.is_empty() {
            tracing::info!("Single connection finished, closing listener");
            break;
        }

        let can_accept = match mode {
            AcceptMode::Concurrent => true,
            AcceptMode::Sequential => tasks.is_empty(),
            AcceptMode::Single => accepted == 0,
        };

        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::info!("Server shutdown requested");
                break;
            }
            result = listener.accept(), if can_accept => {
                match result {
                    Ok((stream, peer)) => {
                        accepted += 1;
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let conn = register_connection(&context, stream, peer).await;
                        tasks.spawn(handle_connection(conn, context.clone(), shutdown_rx.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!("Connection task panicked: {}", e);
                    }
                }
            }
        }
    }

    drop(listener);

    if !tasks.is_empty() {
        let grace = context.config.shutdown_grace();
        tracing::info!("Waiting up to {:?} for {} connection(s)", grace, tasks.len());

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("Grace period elapsed, aborting {} connection(s)", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            close_aborted(&context).await;
        }
    }

    context.emit(ServerEvent::Stopped);
}

/// Finish the bookkeeping that aborted connection tasks never reached
async fn close_aborted(context: &ServerContext) {
    let mut aborted: Vec<ConnectionHandle> = context
        .connections
        .write()
        .await
        .drain()
        .map(|(_, handle)| handle)
        .collect();
    aborted.sort_by_key(ConnectionHandle::id);

    for handle in aborted {
        handle.mark_closed();
        context.stats.connection_closed(false);
        tracing::info!("Connection {} from {} aborted at shutdown", handle.id(), handle.peer());
        context.emit(ServerEvent::ConnectionClosed {
            id: handle.id(),
            peer: handle.peer(),
            reason: CloseReason::Shutdown,
        });
    }
}

async fn register_connection(context: &ServerContext, stream: TcpStream, peer: SocketAddr) -> Connection {
    let id = context.next_id.fetch_add(1, Ordering::Relaxed);
    let conn = Connection::new(
        id,
        stream,
        peer,
        context.config.max_frame_size,
        context.config.read_buffer_size,
    );

    context.connections.write().await.insert(id, conn.handle());
    context.stats.connection_opened();
    conn
}

/// Handle one connection until it closes
async fn handle_connection(mut conn: Connection, context: Arc<ServerContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let id = conn.id();
    let peer = conn.peer();
    let mut close_rx = conn.close_signal();

    tracing::info!("New connection {} from {}", id, peer);
    context.emit(ServerEvent::ConnectionOpened { id, peer });
    conn.set_state(ConnectionState::Reading);

    let reason = loop {
        if *shutdown_rx.borrow() {
            break CloseReason::Shutdown;
        }

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break CloseReason::Shutdown,
            _ = close_rx.changed() => break CloseReason::Requested,
            result = conn.read_frame() => match result {
                Ok(Some(frame)) => {
                    if let Err(e) = process_frame(&conn, &context, frame).await {
                        break CloseReason::Failed(e.to_string());
                    }
                }
                Ok(None) => break CloseReason::PeerClosed,
                Err(e) => break CloseReason::Failed(e.to_string()),
            },
        }
    };

    conn.close().await;
    context.connections.write().await.remove(&id);
    context.stats.connection_closed(reason.is_failure());

    if reason.is_failure() {
        tracing::error!("Connection {} from {} closed: {}", id, peer, reason);
    } else {
        tracing::info!("Connection {} from {} closed: {}", id, peer, reason);
    }

    context.emit(ServerEvent::ConnectionClosed { id, peer, reason });
}

/// Decode and dispatch one frame. Errors are fatal to the connection.
async fn process_frame(conn: &Connection, context: &ServerContext, frame: Frame) -> ConnectionResult<()> {
    let id = conn.id();
    let sequence = frame.sequence;
    let length = frame.len();

    context.stats.frame_received(length);
    context.emit(ServerEvent::FrameReceived { id, sequence, length });
    tracing::debug!(connection = id, sequence, "Frame of {} bytes", length);

    let message = decode_message(&frame.into_payload(), &context.descriptor)?;

    conn.set_state(ConnectionState::Dispatching);
    let event_context = EventContext {
        connection_id: id,
        peer: conn.peer(),
        sequence,
    };
    let report = context.dispatcher.dispatch(&event_context, &message).await;
    conn.set_state(ConnectionState::Reading);

    match report.outcome {
        DispatchOutcome::Dispatched { field } => {
            tracing::debug!(connection = id, sequence, "Dispatched field {}", field);
            context.stats.event_dispatched();
        }
        DispatchOutcome::Dropped { .. } => context.stats.event_dropped(),
        DispatchOutcome::NoEvent => {}
    }

    for warning in report.warnings {
        match &warning {
            DispatchWarning::AmbiguousEvent { .. } => context.stats.ambiguous_event(),
            DispatchWarning::HandlerFailed { .. } => context.stats.handler_failed(),
            DispatchWarning::UnregisteredHandler { .. } => {}
        }
        tracing::warn!(connection = id, sequence, "{}", warning);
        context.emit(ServerEvent::Warning { id, sequence, warning });
    }

    Ok(())
}
