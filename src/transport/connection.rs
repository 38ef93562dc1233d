//! Per-peer connection handle.
//!
//! A [`Connection`] is owned by its connection task: all reads, parsing and
//! filter execution happen there, giving strict per-direction serialization.
//! The only cross-task hand-off is the write queue.

use crate::attributes::AttributeHolder;
use crate::config::ServerConfig;
use crate::filter::ChainState;
use crate::memory::Buffer;
use crate::transport::write_queue::WriteQueueHandle;
use crate::transport::TransportError;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Why a connection is going away; delivered alongside `handle_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end
    Remotely,
    /// This side decided to close (keep-alive exhausted, fatal response)
    Locally,
    /// An idle/read/write deadline expired
    Timeout,
    /// The transport is shutting down
    Cancelled,
    /// A protocol or I/O error
    Error,
}

pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: ConnectionState,
    close_reason: Option<CloseReason>,
    attributes: AttributeHolder,
    chain_state: ChainState,
    write_queue: WriteQueueHandle,
    config: Arc<ServerConfig>,
    /// Between messages: no partial parse is pending
    idle: bool,
    requests_served: u64,
}

impl Connection {
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        write_queue: WriteQueueHandle,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            state: ConnectionState::Open,
            close_reason: None,
            attributes: AttributeHolder::new(),
            chain_state: ChainState::new(),
            write_queue,
            config,
            idle: true,
            requests_served: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Requests an orderly close once pending writes are flushed.
    pub fn request_close(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Closing;
            self.close_reason = Some(reason);
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub(crate) fn set_close_reason(&mut self, reason: CloseReason) {
        self.close_reason.get_or_insert(reason);
    }

    pub fn attributes(&self) -> &AttributeHolder {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut AttributeHolder {
        &mut self.attributes
    }

    pub(crate) fn chain_state_mut(&mut self) -> &mut ChainState {
        &mut self.chain_state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn write_queue(&self) -> &WriteQueueHandle {
        &self.write_queue
    }

    /// Enqueues raw bytes for the peer, waiting under back-pressure.
    pub async fn enqueue_write(&self, buffer: Buffer) -> Result<(), TransportError> {
        self.write_queue.enqueue(buffer).await
    }

    /// Waits until everything enqueued so far has been written.
    pub async fn flush_writes(&self) -> Result<(), TransportError> {
        self.write_queue.flush().await
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn set_idle(&mut self, idle: bool) {
        self.idle = idle;
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn note_request(&mut self) -> u64 {
        self.requests_served += 1;
        self.requests_served
    }
}
