//! Encoder for HTTP chunked transfer encoding.
//!
//! Each piece of content is emitted as `size CRLF payload CRLF`; the
//! terminal piece additionally emits the zero-sized chunk, any trailer
//! fields, and the closing blank line.

use crate::protocol::{HttpContent, SendError};
use bytes::BytesMut;
use std::io::Write;
use tokio_util::codec::Encoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedEncoder {
    /// Indicates if the final zero-length chunk has been sent
    eof: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self { eof: false }
    }

    /// Returns true if the final zero-length chunk has been sent.
    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl Default for ChunkedEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<HttpContent> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: HttpContent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        if !item.data().is_empty() {
            // chunk size in hex, data, terminating CRLF
            write!(helper::Writer(dst), "{:X}\r\n", item.data().len())?;
            dst.reserve(item.data().len() + 2);
            dst.extend_from_slice(item.data());
            dst.extend_from_slice(b"\r\n");
        }

        if item.is_last() {
            self.eof = true;
            dst.extend_from_slice(b"0\r\n");
            for (name, value) in item.trailers() {
                dst.extend_from_slice(name.as_ref());
                dst.extend_from_slice(b": ");
                dst.extend_from_slice(value.as_ref());
                dst.extend_from_slice(b"\r\n");
            }
            dst.extend_from_slice(b"\r\n");
        }

        Ok(())
    }
}

/// Writer adapter so `write!` can format chunk sizes straight into a
/// `BytesMut`.
mod helper {
    use bytes::{BufMut, BytesMut};
    use std::io;

    pub struct Writer<'a>(pub &'a mut BytesMut);

    impl io::Write for Writer<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.put_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
