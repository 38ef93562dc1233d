//! Unified encoder for message payloads.
//!
//! Dispatches to the framing strategy chosen for the response:
//! - Content-Length based payloads
//! - Chunked transfer encoding
//! - No body (HEAD responses and bodiless statuses)

use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::protocol::{HttpContent, PayloadSize, SendError};
use bytes::BytesMut;
use tokio_util::codec::Encoder;

/// A unified encoder for handling message payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// Encode payload with a fixed content length
    Length(LengthEncoder),

    /// Encode payload using chunked transfer encoding
    Chunked(ChunkedEncoder),

    /// Swallow payload entirely
    NoBody { received_eof: bool },
}

impl PayloadEncoder {
    /// Creates a PayloadEncoder that swallows all content.
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody { received_eof: false } }
    }

    /// Creates a PayloadEncoder for chunked transfer encoding.
    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedEncoder::new()) }
    }

    /// Creates a PayloadEncoder for a fixed-length payload.
    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthEncoder::new(size)) }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(&self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.kind, Kind::NoBody { .. })
    }

    pub fn is_fix_length(&self) -> bool {
        matches!(&self.kind, Kind::Length(_))
    }

    /// Returns whether the encoder has seen the terminal content.
    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::NoBody { received_eof } => *received_eof,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => PayloadEncoder::fix_length(n),
            PayloadSize::Chunked => PayloadEncoder::chunked(),
            PayloadSize::Empty => PayloadEncoder::empty(),
        }
    }
}

impl Encoder<HttpContent> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: HttpContent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::NoBody { received_eof } => {
                if item.is_last() {
                    *received_eof = true;
                }
                Ok(())
            }
        }
    }
}
