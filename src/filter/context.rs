use crate::attributes::AttributeHolder;
use crate::config::ServerConfig;
use crate::filter::{ChainMessage, Direction};
use crate::transport::Connection;

/// Execution context handed to each filter invocation.
///
/// Carries the current message, the pass direction and access to the
/// connection. Messages written through [`write`](Self::write) run the write
/// sub-chain strictly below the current filter once the filter returns.
pub struct FilterChainContext<'a> {
    connection: &'a mut Connection,
    direction: Direction,
    index: usize,
    message: Option<ChainMessage>,
    writes: Vec<ChainMessage>,
}

impl<'a> FilterChainContext<'a> {
    pub(crate) fn new(
        connection: &'a mut Connection,
        direction: Direction,
        index: usize,
        message: Option<ChainMessage>,
    ) -> Self {
        Self { connection, direction, index, message, writes: Vec::new() }
    }

    pub fn connection(&mut self) -> &mut Connection {
        self.connection
    }

    pub fn connection_ref(&self) -> &Connection {
        self.connection
    }

    pub fn attributes(&mut self) -> &mut AttributeHolder {
        self.connection.attributes_mut()
    }

    pub fn config(&self) -> &ServerConfig {
        self.connection.config()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Position of the current filter in the chain.
    pub fn filter_index(&self) -> usize {
        self.index
    }

    pub fn message(&self) -> Option<&ChainMessage> {
        self.message.as_ref()
    }

    /// Takes the current message out of the context; the pass continues
    /// without a message unless one is set back.
    pub fn take_message(&mut self) -> Option<ChainMessage> {
        self.message.take()
    }

    pub fn set_message(&mut self, message: ChainMessage) {
        self.message = Some(message);
    }

    /// Queues a message for the write sub-chain below this filter. Queued
    /// writes are processed in order as soon as the filter returns.
    pub fn write(&mut self, message: ChainMessage) {
        self.writes.push(message);
    }

    pub(crate) fn into_parts(self) -> (Option<ChainMessage>, Vec<ChainMessage>) {
        (self.message, self.writes)
    }
}
