//! The chain runtime.
//!
//! A read pass runs the filters in ascending order; a write pass runs them
//! in descending order, ending at the transport where the final buffer is
//! enqueued for the wire. Invoke-remainders collected during a read pass are
//! re-driven through the owning filter as soon as the pass completes, which
//! is what keeps pipelined messages moving without waiting for more socket
//! data.

use crate::filter::{ChainMessage, Direction, Filter, FilterChainContext, NextAction, PipelineError, TransportEvent};
use crate::memory::Buffer;
use crate::transport::Connection;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

/// Per-connection chain bookkeeping: stashed read remainders and the
/// suspended position, if any.
pub struct ChainState {
    read_remainders: Vec<Option<Buffer>>,
    suspended: Option<Suspended>,
}

struct Suspended {
    index: usize,
    message: Option<ChainMessage>,
}

impl ChainState {
    pub fn new() -> Self {
        Self { read_remainders: Vec::new(), suspended: None }
    }

    fn stash_read_remainder(&mut self, index: usize, remainder: Buffer) {
        if index >= self.read_remainders.len() {
            self.read_remainders.resize_with(index + 1, || None);
        }
        let merged = match self.read_remainders[index].take() {
            Some(existing) => Buffer::append_buffers(Some(existing), remainder),
            None => remainder,
        };
        self.read_remainders[index] = Some(merged);
    }

    fn take_read_remainder(&mut self, index: usize) -> Option<Buffer> {
        self.read_remainders.get_mut(index)?.take()
    }

    fn suspend(&mut self, index: usize, message: Option<ChainMessage>) {
        self.suspended = Some(Suspended { index, message });
    }

    fn take_suspended(&mut self) -> Option<Suspended> {
        self.suspended.take()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}

/// An ordered, immutable pipeline of filters shared across connections.
#[derive(Clone)]
pub struct FilterChain {
    filters: Arc<Vec<Arc<dyn Filter>>>,
}

pub struct FilterChainBuilder {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChainBuilder {
    pub fn add(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn add_shared(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> FilterChain {
        FilterChain { filters: Arc::new(self.filters) }
    }
}

impl FilterChain {
    pub fn builder() -> FilterChainBuilder {
        FilterChainBuilder { filters: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Drives fresh wire bytes up the chain.
    pub async fn fire_read(&self, conn: &mut Connection, buffer: Buffer) -> Result<(), PipelineError> {
        self.drive_read(conn, 0, ChainMessage::Buffer(buffer)).await
    }

    /// Drives a message down the chain from above the topmost filter.
    pub async fn fire_write(&self, conn: &mut Connection, message: ChainMessage) -> Result<(), PipelineError> {
        self.run_write(conn, self.filters.len(), message).await
    }

    /// Notifies every filter of the new connection, bottom-up.
    pub async fn fire_connect(&self, conn: &mut Connection) -> Result<(), PipelineError> {
        self.run_simple(conn, Direction::Event, None).await
    }

    /// Delivers an out-of-band event, bottom-up.
    pub async fn fire_event(&self, conn: &mut Connection, event: TransportEvent) -> Result<(), PipelineError> {
        self.run_simple(conn, Direction::Event, Some(event)).await
    }

    /// Delivers `handle_close` to every filter in reverse order. Close
    /// handlers must not fail the teardown, so errors are logged and
    /// swallowed.
    pub async fn fire_close(&self, conn: &mut Connection) {
        for index in (0..self.filters.len()).rev() {
            let filter = &self.filters[index];
            let mut ctx = FilterChainContext::new(conn, Direction::Close, index, None);
            if let Err(e) = filter.handle_close(&mut ctx).await {
                warn!(filter = filter.name(), cause = %e, "close handler failed");
            }
            let (_, writes) = ctx.into_parts();
            for write in writes {
                if let Err(e) = self.run_write(conn, index, write).await {
                    warn!(cause = %e, "write during close failed");
                }
            }
        }
    }

    /// Continues a pass paused by [`NextAction::Suspend`].
    pub async fn resume(&self, conn: &mut Connection) -> Result<(), PipelineError> {
        let Some(suspended) = conn.chain_state_mut().take_suspended() else {
            return Ok(());
        };
        match suspended.message {
            Some(message) => self.drive_read(conn, suspended.index + 1, message).await,
            None => Ok(()),
        }
    }

    async fn drive_read(&self, conn: &mut Connection, start: usize, message: ChainMessage) -> Result<(), PipelineError> {
        let mut queue = VecDeque::new();
        queue.push_back((start, message));
        while let Some((index, message)) = queue.pop_front() {
            // a closing connection does not get to start more passes
            if !conn.is_open() {
                break;
            }
            let reruns = self.run_read_pass(conn, index, message).await?;
            for (index, buffer) in reruns {
                queue.push_back((index, ChainMessage::Buffer(buffer)));
            }
        }
        Ok(())
    }

    /// One ascending pass. Returns the invoke-remainders to re-drive.
    async fn run_read_pass(
        &self,
        conn: &mut Connection,
        start: usize,
        message: ChainMessage,
    ) -> Result<Vec<(usize, Buffer)>, PipelineError> {
        let mut reruns = Vec::new();
        let mut index = start;
        let mut message = Some(message);

        while index < self.filters.len() {
            let Some(mut current) = message.take() else { break };

            // merge the remainder stashed for this filter in front of fresh
            // wire bytes
            if let ChainMessage::Buffer(buffer) = current {
                current = match conn.chain_state_mut().take_read_remainder(index) {
                    Some(stashed) => ChainMessage::Buffer(Buffer::append_buffers(Some(stashed), buffer)),
                    None => ChainMessage::Buffer(buffer),
                };
            }

            let filter = &self.filters[index];
            let mut ctx = FilterChainContext::new(conn, Direction::Read, index, Some(current));
            let action = filter.handle_read(&mut ctx).await;
            let (message_out, writes) = ctx.into_parts();
            let action = action?;

            trace!(filter = filter.name(), action = ?action, "read pass step");

            for write in writes {
                self.run_write(conn, index, write).await?;
            }

            match action {
                NextAction::Invoke { remainder } => {
                    if let Some(remainder) = remainder {
                        if !remainder.is_empty() {
                            reruns.push((index, remainder));
                        }
                    }
                    message = message_out;
                    index += 1;
                }
                NextAction::Stop { remainder } => {
                    if let Some(remainder) = remainder {
                        if !remainder.is_empty() {
                            conn.chain_state_mut().stash_read_remainder(index, remainder);
                        }
                    }
                    break;
                }
                NextAction::Suspend => {
                    conn.chain_state_mut().suspend(index, message_out);
                    break;
                }
                NextAction::Rerun(position) => {
                    if position >= self.filters.len() {
                        return Err(PipelineError::internal(format!("rerun position {position} out of chain")));
                    }
                    message = message_out;
                    index = position;
                }
            }
        }

        Ok(reruns)
    }

    /// Descending pass starting below filter `below`; the buffer surviving
    /// filter 0 is enqueued on the connection's write queue.
    async fn run_write(&self, conn: &mut Connection, below: usize, message: ChainMessage) -> Result<(), PipelineError> {
        let mut queue = VecDeque::new();
        queue.push_back((below, message));

        while let Some((below, message)) = queue.pop_front() {
            let mut message = Some(message);
            let mut index = below as isize - 1;

            while index >= 0 {
                let Some(current) = message.take() else { break };

                let filter = &self.filters[index as usize];
                let mut ctx = FilterChainContext::new(conn, Direction::Write, index as usize, Some(current));
                let action = filter.handle_write(&mut ctx).await;
                let (message_out, writes) = ctx.into_parts();
                let action = action?;

                // nested writes continue below the filter that issued them
                for write in writes {
                    queue.push_back((index as usize, write));
                }

                match action {
                    NextAction::Invoke { .. } => {
                        message = message_out;
                        index -= 1;
                    }
                    NextAction::Stop { .. } => {
                        message = None;
                        break;
                    }
                    NextAction::Suspend => {
                        return Err(PipelineError::internal("suspend is not supported on the write path"));
                    }
                    NextAction::Rerun(position) => {
                        message = message_out;
                        index = position as isize;
                    }
                }
            }

            if let Some(message) = message {
                match message {
                    ChainMessage::Buffer(buffer) => {
                        if !buffer.is_empty() {
                            conn.enqueue_write(buffer).await?;
                        }
                    }
                    _ => return Err(PipelineError::internal("non-buffer message reached the transport")),
                }
            }
        }
        Ok(())
    }

    async fn run_simple(
        &self,
        conn: &mut Connection,
        direction: Direction,
        event: Option<TransportEvent>,
    ) -> Result<(), PipelineError> {
        let mut index = 0;
        while index < self.filters.len() {
            let filter = &self.filters[index];
            let mut ctx = FilterChainContext::new(conn, direction, index, None);
            let action = match event {
                Some(ref event) => filter.handle_event(&mut ctx, event).await,
                None => filter.handle_connect(&mut ctx).await,
            };
            let (_, writes) = ctx.into_parts();
            let action = action?;

            for write in writes {
                self.run_write(conn, index, write).await?;
            }

            match action {
                NextAction::Invoke { .. } => index += 1,
                NextAction::Stop { .. } | NextAction::Suspend => break,
                NextAction::Rerun(position) => index = position,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::transport::write_queue::WriteQueueHandle;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Records every invocation; optionally transforms buffers.
    struct TracingFilter {
        label: &'static str,
        journal: Journal,
    }

    #[async_trait]
    impl Filter for TracingFilter {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn handle_read(&self, _ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
            self.journal.lock().unwrap().push(format!("{}:read", self.label));
            Ok(NextAction::invoke())
        }

        async fn handle_write(&self, _ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
            self.journal.lock().unwrap().push(format!("{}:write", self.label));
            Ok(NextAction::invoke())
        }

        async fn handle_close(&self, _ctx: &mut FilterChainContext<'_>) -> Result<(), PipelineError> {
            self.journal.lock().unwrap().push(format!("{}:close", self.label));
            Ok(())
        }
    }

    /// Frames input into fixed-size records, stashing short reads.
    struct FramingFilter {
        frame_size: usize,
        journal: Journal,
    }

    #[async_trait]
    impl Filter for FramingFilter {
        fn name(&self) -> &'static str {
            "framing"
        }

        async fn handle_read(&self, ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
            let Some(ChainMessage::Buffer(mut buffer)) = ctx.take_message() else {
                return Ok(NextAction::invoke());
            };
            if buffer.len() < self.frame_size {
                return Ok(NextAction::stop_with(buffer));
            }
            let frame = buffer.split_to(self.frame_size);
            self.journal.lock().unwrap().push(format!("frame:{}", String::from_utf8_lossy(&frame.to_bytes())));
            ctx.set_message(ChainMessage::Buffer(frame));
            if buffer.is_empty() {
                Ok(NextAction::invoke())
            } else {
                Ok(NextAction::invoke_with(buffer))
            }
        }
    }

    fn test_connection() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (handle, _task) = WriteQueueHandle::spawn(client, 16, Duration::from_secs(1));
        let addr = "127.0.0.1:0".parse().unwrap();
        let conn = Connection::new(1, addr, addr, handle, Arc::new(ServerConfig::default()));
        (conn, server)
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn read_pass_runs_in_order_and_close_in_reverse() {
        let journal = journal();
        let chain = FilterChain::builder()
            .add(TracingFilter { label: "a", journal: journal.clone() })
            .add(TracingFilter { label: "b", journal: journal.clone() })
            .add(TracingFilter { label: "c", journal: journal.clone() })
            .build();

        let (mut conn, _server) = test_connection();
        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"x"))).await.unwrap();
        chain.fire_close(&mut conn).await;

        let entries = journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["a:read", "b:read", "c:read", "c:close", "b:close", "a:close"]);
    }

    #[tokio::test]
    async fn write_pass_runs_in_reverse_and_reaches_the_wire() {
        let journal = journal();
        let chain = FilterChain::builder()
            .add(TracingFilter { label: "bottom", journal: journal.clone() })
            .add(TracingFilter { label: "top", journal: journal.clone() })
            .build();

        let (mut conn, mut server) = test_connection();
        chain.fire_write(&mut conn, ChainMessage::Buffer(Buffer::from(Bytes::from_static(b"out")))).await.unwrap();
        conn.flush_writes().await.unwrap();

        let entries = journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["top:write", "bottom:write"]);

        let mut read = [0u8; 3];
        server.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"out");
    }

    #[tokio::test]
    async fn stop_remainder_is_refed_with_next_read() {
        let journal = journal();
        let chain = FilterChain::builder().add(FramingFilter { frame_size: 4, journal: journal.clone() }).build();

        let (mut conn, _server) = test_connection();
        // two short reads, then the rest of two frames
        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"ab"))).await.unwrap();
        assert!(journal.lock().unwrap().is_empty());

        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"cd"))).await.unwrap();
        assert_eq!(journal.lock().unwrap().clone(), vec!["frame:abcd"]);

        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"efghijkl"))).await.unwrap();
        assert_eq!(journal.lock().unwrap().clone(), vec!["frame:abcd", "frame:efgh", "frame:ijkl"]);
    }

    #[tokio::test]
    async fn invoke_remainder_redrives_pipelined_frames_immediately() {
        let journal = journal();
        let chain = FilterChain::builder().add(FramingFilter { frame_size: 2, journal: journal.clone() }).build();

        let (mut conn, _server) = test_connection();
        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"aabbcc"))).await.unwrap();
        assert_eq!(journal.lock().unwrap().clone(), vec!["frame:aa", "frame:bb", "frame:cc"]);
    }

    #[tokio::test]
    async fn suspend_parks_the_pass_until_resume() {
        struct SuspendingFilter;

        #[async_trait]
        impl Filter for SuspendingFilter {
            fn name(&self) -> &'static str {
                "suspending"
            }

            async fn handle_read(&self, _ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
                Ok(NextAction::suspend())
            }
        }

        let journal = journal();
        let chain = FilterChain::builder()
            .add(SuspendingFilter)
            .add(TracingFilter { label: "above", journal: journal.clone() })
            .build();

        let (mut conn, _server) = test_connection();
        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"zz"))).await.unwrap();
        assert!(journal.lock().unwrap().is_empty());

        chain.resume(&mut conn).await.unwrap();
        assert_eq!(journal.lock().unwrap().clone(), vec!["above:read"]);
    }

    #[tokio::test]
    async fn filter_error_aborts_the_pass() {
        struct FailingFilter;

        #[async_trait]
        impl Filter for FailingFilter {
            fn name(&self) -> &'static str {
                "failing"
            }

            async fn handle_read(&self, _ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
                Err(PipelineError::internal("boom"))
            }
        }

        let journal = journal();
        let chain = FilterChain::builder()
            .add(FailingFilter)
            .add(TracingFilter { label: "above", journal: journal.clone() })
            .build();

        let (mut conn, _server) = test_connection();
        let result = chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"zz"))).await;
        assert!(result.is_err());
        assert!(journal.lock().unwrap().is_empty());
    }
}
