//! Decoder for payloads framed by a `Content-Length` header.
//!
//! The decoder tracks the remaining bytes to be read and ensures the total
//! payload matches the declared content length; the piece that exhausts the
//! length is marked terminal.

use std::cmp;

use crate::protocol::{HttpContent, ParseError};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    /// The number of bytes remaining to be read from the payload
    length: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { length }
    }
}

impl Decoder for LengthDecoder {
    type Item = HttpContent;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.length == 0 {
            return Ok(Some(HttpContent::eof()));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let len = cmp::min(self.length, src.len() as u64);
        let bytes = src.split_to(len as usize).freeze();
        self.length -= bytes.len() as u64;

        if self.length == 0 {
            Ok(Some(HttpContent::last(bytes)))
        } else {
            Ok(Some(HttpContent::chunk(bytes)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_exactly_content_length_bytes() {
        let mut buffer: BytesMut = BytesMut::from(&b"1012345678rest"[..]);

        let mut decoder = LengthDecoder::new(10);
        let content = decoder.decode(&mut buffer).unwrap().unwrap();

        assert!(content.is_last());
        assert_eq!(&content.data()[..], b"1012345678");
        assert_eq!(&buffer[..], b"rest");
    }

    #[test]
    fn partial_payload_is_not_terminal() {
        let mut buffer: BytesMut = BytesMut::from(&b"abc"[..]);

        let mut decoder = LengthDecoder::new(5);
        let content = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(!content.is_last());
        assert_eq!(&content.data()[..], b"abc");

        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"de");
        let content = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(content.is_last());
        assert_eq!(&content.data()[..], b"de");
    }

    #[test]
    fn zero_length_is_immediate_eof() {
        let mut buffer = BytesMut::new();
        let content = LengthDecoder::new(0).decode(&mut buffer).unwrap().unwrap();
        assert!(content.is_last());
        assert!(content.data().is_empty());
    }
}
