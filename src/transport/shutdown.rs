//! Cooperative graceful-shutdown protocol.
//!
//! When a transport starts draining it hands a [`ShutdownContext`] to every
//! registered [`GracefulShutdownListener`]. The transport waits until each
//! listener calls [`ShutdownContext::ready`] or the grace deadline elapses,
//! then closes its listener socket and connections.

use tokio::sync::mpsc;

/// Handed to shutdown listeners when the transport begins draining.
pub struct ShutdownContext {
    transport_name: String,
    ready: mpsc::Sender<()>,
}

impl ShutdownContext {
    pub(crate) fn new(transport_name: String, ready: mpsc::Sender<()>) -> Self {
        Self { transport_name, ready }
    }

    /// The transport being shut down.
    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    /// Signals that it is safe to terminate the transport.
    pub fn ready(self) {
        let _ = self.ready.try_send(());
    }
}

/// Observer of the transport shutdown lifecycle.
pub trait GracefulShutdownListener: Send + Sync {
    /// The transport entered draining; call `ctx.ready()` once in-flight
    /// work is finished.
    fn shutdown_requested(&self, ctx: ShutdownContext);

    /// The grace deadline elapsed and the transport is closing anyway.
    fn shutdown_forced(&self);
}
