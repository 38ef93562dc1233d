//! Non-blocking TCP transport.
//!
//! [`TcpTransport`] owns the accept loop and spawns one task per accepted
//! connection; that task reads into pooled buffers and drives the read side
//! of the filter chain, so all parsing for a connection is serialized on it.
//! Writes leave through the per-connection write queue, the only cross-task
//! hand-off in the pipeline.

pub mod connection;
pub mod shutdown;
pub mod write_queue;

pub use connection::{CloseReason, Connection, ConnectionState};
pub use shutdown::{GracefulShutdownListener, ShutdownContext};
pub use write_queue::WriteQueueHandle;

use crate::config::ServerConfig;
use crate::filter::{FilterChain, TransportEvent};
use crate::memory::{Buffer, MemoryManager};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The write queue is full; the producer decides whether to wait
    #[error("write queue overflow")]
    QueueOverflow,

    /// The connection (or its write queue) is gone
    #[error("connection closed")]
    Closed,

    /// The transport is not in a state that allows the operation
    #[error("transport is not running")]
    NotRunning,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// A selector-driven TCP transport bound to one listen address.
pub struct TcpTransport {
    config: Arc<ServerConfig>,
    chain: FilterChain,
    memory: MemoryManager,
    state: watch::Sender<TransportState>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_listeners: Mutex<Vec<Box<dyn GracefulShutdownListener>>>,
    tracker: Arc<ConnectionTracker>,
    next_connection_id: Arc<AtomicU64>,
}

impl TcpTransport {
    pub fn new(config: ServerConfig, chain: FilterChain) -> Self {
        let (state, _) = watch::channel(TransportState::Idle);
        Self {
            memory: MemoryManager::new(config.read_buffer_size),
            config: Arc::new(config),
            chain,
            state,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown_listeners: Mutex::new(Vec::new()),
            tracker: Arc::new(ConnectionTracker::new()),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listen socket. Must be called before [`start`](Self::start).
    pub async fn bind(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.listener.lock().unwrap() = Some(listener);
        *self.local_addr.lock().unwrap() = Some(local_addr);
        info!(%local_addr, "transport bound");
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn add_shutdown_listener(&self, listener: Box<dyn GracefulShutdownListener>) {
        self.shutdown_listeners.lock().unwrap().push(listener);
    }

    /// Starts accepting connections.
    pub fn start(&self) -> Result<(), TransportError> {
        let listener = self.listener.lock().unwrap().take().ok_or(TransportError::NotRunning)?;
        self.state.send_replace(TransportState::Running);

        let chain = self.chain.clone();
        let config = self.config.clone();
        let memory = self.memory;
        let tracker = self.tracker.clone();
        let mut state_rx = self.state.subscribe();
        let ids = self.next_connection_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() || *state_rx.borrow() != TransportState::Running {
                            debug!("accept loop stopping, transport is draining");
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            let id = ids.fetch_add(1, Ordering::Relaxed);
                            trace!(connection = id, %peer_addr, "accepted");
                            let _ = stream.set_nodelay(true);
                            spawn_connection(
                                stream,
                                id,
                                chain.clone(),
                                config.clone(),
                                memory,
                                tracker.clone(),
                                state_rx.clone(),
                            );
                        }
                        Err(e) => {
                            warn!(cause = %e, "failed to accept");
                        }
                    }
                }
            }
            // dropping the listener refuses further connects
        });
        Ok(())
    }

    /// Establishes an outbound connection wired into the same filter chain.
    /// Returns the write-queue handle for pushing raw buffers to the peer.
    pub async fn connect(&self, addr: impl ToSocketAddrs) -> Result<WriteQueueHandle, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_connection(
            stream,
            id,
            self.chain.clone(),
            self.config.clone(),
            self.memory,
            self.tracker.clone(),
            self.state.subscribe(),
        );
        Ok(handle)
    }

    /// Graceful shutdown: stop accepting, let shutdown listeners finish
    /// within `grace`, then close everything.
    pub async fn shutdown(&self, grace: Duration) {
        info!("transport draining");
        self.state.send_replace(TransportState::Draining);

        let listeners = {
            let mut guard = self.shutdown_listeners.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        if !listeners.is_empty() {
            let (ready_tx, mut ready_rx) = mpsc::channel(listeners.len());
            for listener in &listeners {
                listener.shutdown_requested(ShutdownContext::new(self.config.server_name.clone(), ready_tx.clone()));
            }
            drop(ready_tx);

            let wait_all = async {
                for _ in 0..listeners.len() {
                    if ready_rx.recv().await.is_none() {
                        break;
                    }
                }
            };
            if timeout(grace, wait_all).await.is_err() {
                warn!("graceful shutdown deadline elapsed, forcing");
                for listener in &listeners {
                    listener.shutdown_forced();
                }
            }
        }

        self.state.send_replace(TransportState::Stopped);
        self.tracker.wait_idle().await;
        info!("transport stopped");
    }

    /// Immediate shutdown: close the listener and every connection now.
    pub async fn shutdown_now(&self) {
        self.state.send_replace(TransportState::Stopped);
        self.tracker.wait_idle().await;
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.count()
    }
}

fn spawn_connection(
    stream: TcpStream,
    id: u64,
    chain: FilterChain,
    config: Arc<ServerConfig>,
    memory: MemoryManager,
    tracker: Arc<ConnectionTracker>,
    state_rx: watch::Receiver<TransportState>,
) -> WriteQueueHandle {
    let peer_addr = stream.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let local_addr = stream.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let (read_half, write_half) = stream.into_split();

    let (write_queue, _drain_task) =
        WriteQueueHandle::spawn(write_half, config.write_queue_capacity, config.write_timeout);
    let handle = write_queue.clone();

    let guard = tracker.guard();
    tokio::spawn(async move {
        let _guard = guard;
        let mut conn = Connection::new(id, peer_addr, local_addr, write_queue, config);
        run_connection(read_half, &mut conn, chain, memory, state_rx).await;
    });

    handle
}

async fn run_connection(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    conn: &mut Connection,
    chain: FilterChain,
    memory: MemoryManager,
    mut state_rx: watch::Receiver<TransportState>,
) {
    use tokio::io::AsyncReadExt;

    if let Err(e) = chain.fire_connect(conn).await {
        error!(connection = conn.id(), cause = %e, "connect pass failed");
        conn.mark_closed();
        return;
    }

    let mut read_buf = memory.allocate(conn.config().read_buffer_size);

    while conn.is_open() {
        let read_buffer_size = conn.config().read_buffer_size;
        if read_buf.capacity() - read_buf.len() < read_buffer_size / 4 {
            read_buf.reserve(read_buffer_size);
        }

        // between messages the (longer) keep-alive deadline applies
        let deadline = if conn.is_idle() { conn.config().keep_alive_timeout } else { conn.config().read_timeout };

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == TransportState::Stopped {
                    debug!(connection = conn.id(), "transport stopped, cancelling connection");
                    conn.request_close(CloseReason::Cancelled);
                    break;
                }
            }
            read = timeout(deadline, read_half.read_buf(&mut read_buf)) => match read {
                Err(_elapsed) => {
                    debug!(connection = conn.id(), "read deadline expired");
                    if let Err(e) = chain.fire_event(conn, TransportEvent::Timeout).await {
                        warn!(connection = conn.id(), cause = %e, "timeout event pass failed");
                    }
                    conn.request_close(CloseReason::Timeout);
                    break;
                }
                Ok(Err(e)) => {
                    debug!(connection = conn.id(), cause = %e, "read failed");
                    conn.request_close(CloseReason::Error);
                    break;
                }
                Ok(Ok(0)) => {
                    trace!(connection = conn.id(), "peer closed");
                    conn.request_close(CloseReason::Remotely);
                    break;
                }
                Ok(Ok(n)) => {
                    trace!(connection = conn.id(), bytes = n, "read");
                    let data = read_buf.split().freeze();
                    if let Err(e) = chain.fire_read(conn, Buffer::from(data)).await {
                        error!(connection = conn.id(), cause = %e, "read pass failed");
                        conn.request_close(CloseReason::Error);
                        break;
                    }
                }
            }
        }
    }

    // push out whatever the chain managed to enqueue before closing
    if let Err(e) = conn.flush_writes().await {
        debug!(connection = conn.id(), cause = %e, "flush on close failed");
    }
    conn.mark_closed();
    chain.fire_close(conn).await;
    memory.release(read_buf);
    debug!(connection = conn.id(), reason = ?conn.close_reason(), "connection closed");
}

struct ConnectionTracker {
    count: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    fn new() -> Self {
        Self { count: AtomicUsize::new(0), idle: Notify::new() }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn guard(self: &Arc<Self>) -> TrackerGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        TrackerGuard { tracker: self.clone() }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct TrackerGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
