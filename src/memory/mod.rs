//! Buffer and memory management for the wire path.
//!
//! The [`MemoryManager`] hands out `BytesMut` scratch regions for socket
//! reads and codec output, recycling them through a small per-thread cache
//! backed by a shared overflow list. Cross-thread recycling goes through the
//! overflow list and is refilled in batches.

mod buffer;

pub use buffer::Buffer;

use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::sync::Mutex;

const MAX_THREAD_CACHED: usize = 16;
const MAX_OVERFLOW: usize = 64;
const REFILL_BATCH: usize = 4;

thread_local! {
    static LOCAL_CACHE: RefCell<Vec<BytesMut>> = const { RefCell::new(Vec::new()) };
}

static OVERFLOW: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

/// Allocator facade for pooled wire buffers.
///
/// `allocate` prefers the calling thread's cache, falling back to the shared
/// overflow list and finally the heap. `release` returns a region to the
/// pool; releasing is best-effort and regions beyond the pool bounds are
/// simply dropped.
#[derive(Debug, Clone, Copy)]
pub struct MemoryManager {
    buffer_size: usize,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self { buffer_size: Self::DEFAULT_BUFFER_SIZE }
    }
}

impl MemoryManager {
    pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    /// Returns a cleared scratch region with capacity for at least `size`
    /// bytes, reusing a pooled region when one fits.
    pub fn allocate(&self, size: usize) -> BytesMut {
        let wanted = size.max(self.buffer_size);

        let pooled = LOCAL_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if cache.is_empty() {
                Self::refill(&mut cache);
            }
            let position = cache.iter().position(|b| b.capacity() >= size)?;
            Some(cache.swap_remove(position))
        });

        match pooled {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(wanted),
        }
    }

    /// Zero-copy adapter from owned bytes to a pipeline [`Buffer`].
    pub fn wrap(&self, bytes: impl Into<Bytes>) -> Buffer {
        Buffer::from(bytes.into())
    }

    /// Returns a scratch region to the pool.
    pub fn release(&self, buf: BytesMut) {
        debug_assert!(buf.capacity() > 0, "released a zero-capacity buffer");

        let overflowed = LOCAL_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if cache.len() < MAX_THREAD_CACHED {
                cache.push(buf);
                None
            } else {
                Some(buf)
            }
        });

        if let Some(buf) = overflowed {
            let mut overflow = OVERFLOW.lock().unwrap();
            if overflow.len() < MAX_OVERFLOW {
                overflow.push(buf);
            }
        }
    }

    fn refill(cache: &mut Vec<BytesMut>) {
        let mut overflow = OVERFLOW.lock().unwrap();
        let take = overflow.len().min(REFILL_BATCH);
        let start = overflow.len() - take;
        cache.extend(overflow.drain(start..));
    }
}
