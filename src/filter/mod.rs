//! The filter chain: an ordered pipeline of bidirectional message
//! processors.
//!
//! Bytes flow bottom-up on the read path (transport → framing → protocol →
//! application) and top-down on the write path; each filter tells the
//! runtime how to proceed by returning a [`NextAction`]. Remainder bytes a
//! filter could not consume are stashed per filter and re-fed, appended in
//! front of the next event's data, so framing filters never lose partial
//! frames across socket reads.

mod chain;
mod context;

pub use chain::ChainState;
pub use chain::FilterChain;
pub use chain::FilterChainBuilder;
pub use context::FilterChainContext;

use crate::memory::Buffer;
use crate::protocol::{EncodingError, HttpError, HttpRequestPacket, HttpResponsePacket, Message, ParseError, SendError};
use crate::transport::TransportError;
use async_trait::async_trait;
use thiserror::Error;

/// The direction of the pass a filter is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Event,
    Close,
}

/// Out-of-band events delivered through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// An idle, read or write deadline expired; the connection closes after
    /// the event pass.
    Timeout,
}

/// The message travelling through the chain.
///
/// Tagged variants instead of downcasting: a filter either understands the
/// variant or passes it along untouched.
pub enum ChainMessage {
    /// Raw wire bytes
    Buffer(Buffer),
    /// A decoded inbound message (head or payload piece)
    Request(Message<HttpRequestPacket>),
    /// An outbound message on its way to the serializer
    Response(Message<HttpResponsePacket>),
}

impl ChainMessage {
    pub fn is_buffer(&self) -> bool {
        matches!(self, ChainMessage::Buffer(_))
    }

    pub fn into_buffer(self) -> Option<Buffer> {
        match self {
            ChainMessage::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

/// What the runtime should do after a filter returns.
#[derive(Debug)]
pub enum NextAction {
    /// Proceed to the next filter. A remainder is re-fed to this same
    /// filter once the current pass completes.
    Invoke { remainder: Option<Buffer> },
    /// Terminate the pass. A remainder is stashed and re-driven when the
    /// next event arrives for this connection.
    Stop { remainder: Option<Buffer> },
    /// Pause the chain; resumption requires [`FilterChain::resume`].
    Suspend,
    /// Re-invoke the pass from the given filter position.
    Rerun(usize),
}

impl NextAction {
    pub fn invoke() -> Self {
        NextAction::Invoke { remainder: None }
    }

    pub fn invoke_with(remainder: Buffer) -> Self {
        NextAction::Invoke { remainder: Some(remainder) }
    }

    pub fn stop() -> Self {
        NextAction::Stop { remainder: None }
    }

    pub fn stop_with(remainder: Buffer) -> Self {
        NextAction::Stop { remainder: Some(remainder) }
    }

    pub fn suspend() -> Self {
        NextAction::Suspend
    }

    pub fn rerun(index: usize) -> Self {
        NextAction::Rerun(index)
    }
}

/// Errors aborting a chain pass.
///
/// A pass error is fatal to its connection: the runtime delivers
/// `handle_close` to the filters in reverse order and the transport closes
/// the socket. The transport itself survives.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Shutdown or timeout interrupted the pass
    #[error("cancelled")]
    Cancelled,

    /// An invariant violation inside the pipeline
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn internal<S: ToString>(reason: S) -> Self {
        Self::Internal(reason.to_string())
    }
}

/// A single stage of the chain.
///
/// Filters are shared across connections; per-connection state lives in the
/// connection's attribute holder, keyed by [`Attribute`](crate::attributes::Attribute)
/// handles the filter creates at construction time.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// A new connection was accepted (or established for outbound
    /// connects).
    async fn handle_connect(&self, _ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        Ok(NextAction::invoke())
    }

    /// Data arrived from the filter below.
    async fn handle_read(&self, _ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        Ok(NextAction::invoke())
    }

    /// A message is on its way down to the wire.
    async fn handle_write(&self, _ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        Ok(NextAction::invoke())
    }

    /// An out-of-band transport event.
    async fn handle_event(
        &self,
        _ctx: &mut FilterChainContext<'_>,
        _event: &TransportEvent,
    ) -> Result<NextAction, PipelineError> {
        Ok(NextAction::invoke())
    }

    /// The connection is going away; fired in reverse filter order.
    async fn handle_close(&self, _ctx: &mut FilterChainContext<'_>) -> Result<(), PipelineError> {
        Ok(())
    }
}
