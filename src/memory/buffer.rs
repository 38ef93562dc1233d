//! A possibly-composite byte region flowing through the filter chain.
//!
//! A [`Buffer`] logically concatenates one or more [`Bytes`] segments without
//! copying. Splitting and appending are cheap segment-level operations; the
//! bytes themselves are only copied when a consumer asks for a contiguous
//! view of a composite buffer.

use bytes::{Buf, Bytes, BytesMut};
use std::ops::RangeBounds;

/// An ordered sequence of byte segments presented as one logical region.
///
/// Buffers are the unit of ownership in the pipeline: a buffer handed to a
/// filter is owned by that filter until it passes it on or drops it. Cloning
/// is shallow (segment reference counts), matching the split/append
/// discipline of the wire path.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    segments: Vec<Bytes>,
    len: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn empty() -> Self {
        Default::default()
    }

    /// Appends `tail` to `head`, treating a missing head as identity.
    ///
    /// This is the composite-building primitive of the pipeline:
    /// `append_buffers(None, x)` is `x`, and the result reads `head` bytes
    /// followed by `tail` bytes with no copying.
    pub fn append_buffers(head: Option<Buffer>, tail: Buffer) -> Buffer {
        match head {
            None => tail,
            Some(mut head) => {
                head.append(tail);
                head
            }
        }
    }

    /// Appends all segments of `other` after the current contents.
    pub fn append(&mut self, other: Buffer) {
        self.len += other.len;
        self.segments.extend(other.segments);
    }

    /// Appends a single segment, skipping empty ones.
    pub fn push_segment(&mut self, segment: Bytes) {
        if !segment.is_empty() {
            self.len += segment.len();
            self.segments.push(segment);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits off and returns the first `at` bytes; the receiver keeps the
    /// tail. Views held on either side stay valid.
    ///
    /// # Panics
    ///
    /// Panics if `at > self.len()`.
    pub fn split_to(&mut self, at: usize) -> Buffer {
        assert!(at <= self.len, "split point {at} out of bounds ({})", self.len);

        let mut head = Buffer::empty();
        let mut remaining = at;
        while remaining > 0 {
            let first = &mut self.segments[0];
            if first.len() <= remaining {
                remaining -= first.len();
                self.len -= first.len();
                head.push_segment(self.segments.remove(0));
            } else {
                let piece = first.split_to(remaining);
                self.len -= remaining;
                remaining = 0;
                head.push_segment(piece);
            }
        }
        self.segments.retain(|s| !s.is_empty());
        head
    }

    /// Returns a zero-copy sub-view of the buffer.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Buffer {
        use std::ops::Bound;
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => n + 1,
            Bound::Excluded(&n) => n,
            Bound::Unbounded => self.len,
        };
        assert!(start <= end && end <= self.len, "slice {start}..{end} out of bounds ({})", self.len);

        let mut out = Buffer::empty();
        let mut offset = 0;
        for segment in &self.segments {
            let seg_start = offset;
            let seg_end = offset + segment.len();
            offset = seg_end;
            if seg_end <= start {
                continue;
            }
            if seg_start >= end {
                break;
            }
            let from = start.saturating_sub(seg_start);
            let to = segment.len() - seg_end.saturating_sub(end);
            out.push_segment(segment.slice(from..to));
        }
        out
    }

    /// Returns an independent view sharing the same storage.
    pub fn duplicate(&self) -> Buffer {
        self.clone()
    }

    /// Returns the contents as a single `Bytes`, copying only when the
    /// buffer is composite.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for segment in &self.segments {
                    out.extend_from_slice(segment);
                }
                out.freeze()
            }
        }
    }

    /// Linearizes the buffer into a mutable scratch region.
    pub fn into_bytes_mut(self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }

    /// The underlying segments in logical byte order.
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.segments.first().map(|s| s.as_ref()).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.len, "advance {cnt} out of bounds ({})", self.len);
        self.len -= cnt;
        while cnt > 0 {
            let first = &mut self.segments[0];
            if first.len() <= cnt {
                cnt -= first.len();
                self.segments.remove(0);
            } else {
                first.advance(cnt);
                cnt = 0;
            }
        }
    }
}

impl From<Bytes> for Buffer {
    fn from(bytes: Bytes) -> Self {
        let mut buffer = Buffer::empty();
        buffer.push_segment(bytes);
        buffer
    }
}

impl From<BytesMut> for Buffer {
    fn from(bytes: BytesMut) -> Self {
        Buffer::from(bytes.freeze())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer::from(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Buffer {
    fn from(bytes: &'static [u8]) -> Self {
        Buffer::from(Bytes::from_static(bytes))
    }
}
