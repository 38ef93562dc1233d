//! Asynchronous per-connection write queue.
//!
//! Producers enqueue `(buffer, completion)` records into a bounded MPSC
//! channel; a single drain task per connection is the sole consumer. Buffers
//! are written in enqueue order, partial writes keep the record at the head
//! until the socket accepts the rest, and completions fire in enqueue order.
//!
//! Back-pressure: [`WriteQueueHandle::enqueue`] waits for a free slot, while
//! [`WriteQueueHandle::try_enqueue`] refuses immediately when the queue is
//! full, leaving the producer to decide whether to drop or wait.

use crate::memory::Buffer;
use crate::transport::TransportError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

pub struct WriteRecord {
    buffer: Buffer,
    completion: Option<oneshot::Sender<io::Result<usize>>>,
}

/// Producer-side handle to a connection's write queue.
#[derive(Clone)]
pub struct WriteQueueHandle {
    tx: mpsc::Sender<WriteRecord>,
}

impl WriteQueueHandle {
    /// Starts the drain task for `writer` and returns the producer handle.
    pub fn spawn<W>(writer: W, capacity: usize, write_timeout: Duration) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(drain(writer, rx, write_timeout));
        (Self { tx }, task)
    }

    /// Enqueues a buffer, waiting for a slot when the queue is full.
    pub async fn enqueue(&self, buffer: Buffer) -> Result<(), TransportError> {
        self.tx
            .send(WriteRecord { buffer, completion: None })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Enqueues a buffer, refusing immediately when the queue is full.
    pub fn try_enqueue(&self, buffer: Buffer) -> Result<(), TransportError> {
        self.tx.try_send(WriteRecord { buffer, completion: None }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueOverflow,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Enqueues a buffer and returns a receiver resolved once the bytes hit
    /// the socket (or the write fails).
    pub async fn enqueue_with_completion(
        &self,
        buffer: Buffer,
    ) -> Result<oneshot::Receiver<io::Result<usize>>, TransportError> {
        let (completion_tx, completion_rx) = oneshot::channel();
        self.tx
            .send(WriteRecord { buffer, completion: Some(completion_tx) })
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(completion_rx)
    }

    /// Waits until everything enqueued so far has been written.
    pub async fn flush(&self) -> Result<(), TransportError> {
        let receiver = self.enqueue_with_completion(Buffer::empty()).await?;
        match receiver.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io { source: e }),
            Err(_) => Err(TransportError::Closed),
        }
    }
}

async fn drain<W>(mut writer: W, mut rx: mpsc::Receiver<WriteRecord>, write_timeout: Duration)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(record) = rx.recv().await {
        let total = record.buffer.len();
        let mut failure: Option<io::Error> = None;

        for segment in record.buffer.segments() {
            let result = timeout(write_timeout, writer.write_all(segment)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(_) => {
                    failure = Some(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
                    break;
                }
            }
        }

        match failure {
            None => {
                trace!(bytes = total, "drained write record");
                if let Some(completion) = record.completion {
                    let _ = completion.send(Ok(total));
                }
            }
            Some(e) => {
                debug!(cause = %e, "write failed, abandoning queue");
                if let Some(completion) = record.completion {
                    let _ = completion.send(Err(e));
                }
                break;
            }
        }
    }

    // fail any records that were enqueued behind a broken write
    rx.close();
    while let Ok(record) = rx.try_recv() {
        if let Some(completion) = record.completion {
            let _ = completion.send(Err(io::ErrorKind::BrokenPipe.into()));
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn writes_preserve_enqueue_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (handle, task) = WriteQueueHandle::spawn(client, 8, Duration::from_secs(1));

        for i in 0..5u8 {
            handle.enqueue(Buffer::from(Bytes::from(vec![b'0' + i; 3]))).await.unwrap();
        }
        handle.flush().await.unwrap();
        drop(handle);
        task.await.unwrap();

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"000111222333444");
    }

    #[tokio::test]
    async fn per_producer_order_is_preserved_across_tasks() {
        let producers = 4usize;
        let per_producer = 50usize;

        let (client, mut server) = tokio::io::duplex(64);
        let (handle, task) = WriteQueueHandle::spawn(client, 8, Duration::from_secs(5));

        let mut joins = Vec::new();
        for p in 0..producers {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                for k in 0..per_producer {
                    // record format: producer id, sequence number
                    let payload = format!("[{p}:{k:03}]");
                    handle.enqueue(Buffer::from(Bytes::from(payload.into_bytes()))).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            server.read_to_end(&mut out).await.unwrap();
            out
        });

        for join in joins {
            join.await.unwrap();
        }
        handle.flush().await.unwrap();
        drop(handle);
        task.await.unwrap();

        let out = String::from_utf8(reader.await.unwrap()).unwrap();

        // records must be intact (no interleaving within a buffer) and each
        // producer's sequence must be in order
        let mut next = vec![0usize; producers];
        for record in out.split_terminator(']') {
            let record = record.strip_prefix('[').unwrap();
            let (p, k) = record.split_once(':').unwrap();
            let p: usize = p.parse().unwrap();
            let k: usize = k.parse().unwrap();
            assert_eq!(k, next[p], "producer {p} out of order");
            next[p] += 1;
        }
        assert!(next.iter().all(|&n| n == per_producer));
    }

    #[tokio::test]
    async fn try_enqueue_refuses_when_full() {
        // a tiny duplex that nobody reads fills up immediately
        let (client, server) = tokio::io::duplex(1);
        let (handle, _task) = WriteQueueHandle::spawn(client, 1, Duration::from_secs(5));

        // first record sits in the stalled writer, second fills the queue
        handle.enqueue(Buffer::from(Bytes::from_static(b"aaaa"))).await.unwrap();
        let mut refused = false;
        for _ in 0..8 {
            match handle.try_enqueue(Buffer::from(Bytes::from_static(b"bbbb"))) {
                Err(TransportError::QueueOverflow) => {
                    refused = true;
                    break;
                }
                Ok(()) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(refused, "queue never reported overflow");
        drop(server);
    }

    #[tokio::test]
    async fn completions_fire_in_enqueue_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (handle, _task) = WriteQueueHandle::spawn(client, 8, Duration::from_secs(1));

        let first = handle.enqueue_with_completion(Buffer::from(Bytes::from_static(b"one"))).await.unwrap();
        let second = handle.enqueue_with_completion(Buffer::from(Bytes::from_static(b"two"))).await.unwrap();

        let mut read_buf = [0u8; 6];
        server.read_exact(&mut read_buf).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap(), 3);
        assert_eq!(second.await.unwrap().unwrap(), 3);
    }
}
