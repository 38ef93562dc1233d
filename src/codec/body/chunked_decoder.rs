//! Decoder for HTTP chunked transfer encoding.
//!
//! This module decodes message bodies framed as specified in
//! [RFC 7230 Section 4.1](https://tools.ietf.org/html/rfc7230#section-4.1):
//! each chunk carries its size in hexadecimal before its data, a zero-sized
//! chunk ends the body, and optional trailer fields follow the last chunk.
//!
//! Trailer fields are collected and surfaced on the terminal
//! [`HttpContent`].

use crate::protocol::{HttpContent, ParseError};
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::io;
use std::io::ErrorKind;
use std::task::Poll;
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkedState::*;

const MAX_TRAILER_BYTES: usize = 8 * 1024;
const MAX_TRAILER_NUM: usize = 32;

/// A decoder for handling HTTP chunked transfer encoding.
///
/// The decoder processes incoming bytes according to the chunked format:
/// - Each chunk starts with its size in hexadecimal
/// - Followed by optional extensions and a line terminator
/// - Then the chunk data and CRLF
/// - A zero-sized chunk indicates the end of the message, optionally
///   followed by trailer fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining_size: u64,
    trailer: BytesMut,
}

impl ChunkedDecoder {
    /// Creates a new ChunkedDecoder, ready to read the size of the first
    /// chunk.
    pub fn new() -> Self {
        Self { state: Size, remaining_size: 0, trailer: BytesMut::new() }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Read the chunk size in hex
    Size,
    /// Handle whitespace after size
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// Read LF after chunk size
    SizeLf,
    /// Read chunk data
    Body,
    /// Read CR after chunk data
    BodyCr,
    /// Read LF after chunk data
    BodyLf,
    /// Read optional trailer fields
    Trailer,
    /// Read LF after trailer
    TrailerLf,
    /// Read final CR
    EndCr,
    /// Read final LF
    EndLf,
    /// Final state after reading last chunk
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = HttpContent;
    type Error = ParseError;

    /// Decodes chunked transfer encoded data from the input buffer.
    ///
    /// # Returns
    /// - `Ok(Some(content))` with `is_last == false` for a data chunk
    /// - `Ok(Some(content))` with `is_last == true` (carrying any trailers)
    ///   once the final chunk is processed
    /// - `Ok(None)` when more data is needed
    /// - `Err(ParseError)` if the chunked encoding is invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                trace!("finished reading chunked data");
                let trailers = parse_trailers(&mut self.trailer)?;
                return Ok(Some(HttpContent::last_with_trailers(Bytes::new(), trailers)));
            }

            if src.is_empty() {
                // need more data
                return Ok(None);
            }

            let mut buf = None;

            self.state = match self.state.step(src, &mut self.remaining_size, &mut buf, &mut self.trailer) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(ParseError::io(e)),
            };

            if self.trailer.len() > MAX_TRAILER_BYTES {
                return Err(ParseError::limit_exceeded("trailer", self.trailer.len(), MAX_TRAILER_BYTES));
            }

            if let Some(bytes) = buf {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(HttpContent::chunk(bytes)));
            }
        }
    }
}

/// Parses the accumulated trailer section into a header map.
fn parse_trailers(raw: &mut BytesMut) -> Result<HeaderMap, ParseError> {
    if raw.is_empty() {
        return Ok(HeaderMap::new());
    }

    // parse_headers needs the terminating blank line back
    raw.extend_from_slice(b"\r\n");
    let mut headers = [httparse::EMPTY_HEADER; MAX_TRAILER_NUM];
    let parsed = httparse::parse_headers(raw, &mut headers).map_err(|e| match e {
        httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_TRAILER_NUM),
        e => ParseError::invalid_header(format!("invalid trailer: {e}")),
    })?;

    let mut map = HeaderMap::new();
    if let httparse::Status::Complete((_, parsed_headers)) = parsed {
        for header in parsed_headers {
            let name =
                HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| ParseError::invalid_header("trailer name"))?;
            let value = HeaderValue::from_bytes(header.value).map_err(|_| ParseError::invalid_header("trailer value"))?;
            map.append(name, value);
        }
    }
    raw.clear();
    Ok(map)
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.len() > 0 {
            $src.get_u8()
        } else {
            return Poll::Pending;
        }
    }};
}

impl ChunkedState {
    fn step(
        &self,
        src: &mut BytesMut,
        remaining_size: &mut u64,
        buf: &mut Option<Bytes>,
        trailer: &mut BytesMut,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        match self {
            Size => ChunkedState::read_size(src, remaining_size),
            SizeLws => ChunkedState::read_size_lws(src),
            Extension => ChunkedState::read_extension(src),
            SizeLf => ChunkedState::read_size_lf(src, remaining_size),
            Body => ChunkedState::read_body(src, remaining_size, buf),
            BodyCr => ChunkedState::read_body_cr(src),
            BodyLf => ChunkedState::read_body_lf(src),
            Trailer => ChunkedState::read_trailer(src, trailer),
            TrailerLf => ChunkedState::read_trailer_lf(src, trailer),
            EndCr => ChunkedState::read_end_cr(src, trailer),
            EndLf => ChunkedState::read_end_lf(src),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// Reads and parses the chunk size in hexadecimal format.
    ///
    /// The size is read digit by digit until a delimiter is encountered;
    /// values that overflow 64 bits are rejected. Both `\r\n` and bare `\n`
    /// terminate the size line.
    fn read_size(src: &mut BytesMut, size_per_chunk: &mut u64) -> Poll<Result<ChunkedState, io::Error>> {
        macro_rules! or_overflow {
            ($e:expr) => {
                match $e {
                    Some(val) => val,
                    None => {
                        return Poll::Ready(Err(io::Error::new(
                            ErrorKind::InvalidInput,
                            "invalid overflow chunked length",
                        )))
                    }
                }
            };
        }

        let radix = 16;
        match try_next_byte!(src) {
            b @ b'0'..=b'9' => {
                *size_per_chunk = or_overflow!(size_per_chunk.checked_mul(radix));
                *size_per_chunk = or_overflow!(size_per_chunk.checked_add((b - b'0') as u64));
            }

            b @ b'a'..=b'f' => {
                *size_per_chunk = or_overflow!(size_per_chunk.checked_mul(radix));
                *size_per_chunk = or_overflow!(size_per_chunk.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size_per_chunk = or_overflow!(size_per_chunk.checked_mul(radix));
                *size_per_chunk = or_overflow!(size_per_chunk.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Poll::Ready(Ok(SizeLws)),
            b';' => return Poll::Ready(Ok(Extension)),
            b'\r' => return Poll::Ready(Ok(SizeLf)),
            b'\n' => return Poll::Ready(Ok(size_line_done(*size_per_chunk))),

            _ => {
                return Poll::Ready(Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "invalid chunk size line: Invalid Size",
                )))
            }
        }

        Poll::Ready(Ok(Size))
    }

    /// Processes linear whitespace after the chunk size: only tabs and
    /// spaces may follow, then extensions or the line terminator.
    fn read_size_lws(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, "invalid chunk size linear white space"))),
        }
    }

    /// Skips chunk extensions.
    ///
    /// Extensions "end" at the next CRLF. Some implementations do not check
    /// for the CR, so to save them from themselves, extensions containing a
    /// plain LF are rejected as well.
    fn read_extension(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => {
                Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, "invalid chunk extension contains newline")))
            }
            _ => Poll::Ready(Ok(Extension)), // no supported extensions
        }
    }

    /// Validates the LF completing the size line, then dispatches on the
    /// parsed size: zero means the final chunk.
    fn read_size_lf(src: &mut BytesMut, size_per_chunk: &mut u64) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(size_line_done(*size_per_chunk))),
            _ => Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, "invalid chunk size LF"))),
        }
    }

    /// Reads up to `size_per_chunk` bytes of chunk data from the buffer.
    fn read_body(
        src: &mut BytesMut,
        size_per_chunk: &mut u64,
        buf: &mut Option<Bytes>,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        if src.is_empty() {
            return Poll::Ready(Ok(Body));
        }

        if *size_per_chunk == 0 {
            return Poll::Ready(Ok(BodyCr));
        }

        // cap remaining bytes at the max capacity of usize
        let remaining = match *size_per_chunk {
            r if r > usize::MAX as u64 => usize::MAX,
            r => r as usize,
        };

        let read_size = std::cmp::min(remaining, src.len());

        *size_per_chunk -= read_size as u64;
        let bytes = src.split_to(read_size).freeze();
        *buf = Some(bytes);

        if *size_per_chunk > 0 {
            Poll::Ready(Ok(Body))
        } else {
            Poll::Ready(Ok(BodyCr))
        }
    }

    /// Validates the terminator after chunk data; a bare LF is accepted in
    /// place of CRLF.
    fn read_body_cr(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            b'\n' => Poll::Ready(Ok(Size)),
            _ => Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, "invalid chunk body CR"))),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(Size)),
            _ => Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, "invalid chunk body LF"))),
        }
    }

    /// Accumulates one trailer line; the line terminator is normalized to
    /// CRLF in the capture buffer.
    fn read_trailer(src: &mut BytesMut, trailer: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(TrailerLf)),
            b'\n' => {
                trailer.extend_from_slice(b"\r\n");
                Poll::Ready(Ok(EndCr))
            }
            b => {
                trailer.extend_from_slice(&[b]);
                Poll::Ready(Ok(Trailer))
            }
        }
    }

    fn read_trailer_lf(src: &mut BytesMut, trailer: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' => {
                trailer.extend_from_slice(b"\r\n");
                Poll::Ready(Ok(EndCr))
            }
            _ => Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, "invalid trailer end LF"))),
        }
    }

    /// After the zero-sized chunk: a CR (or bare LF) closes the message, any
    /// other byte starts a trailer field.
    fn read_end_cr(src: &mut BytesMut, trailer: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(EndLf)),
            b'\n' => Poll::Ready(Ok(End)),
            b => {
                trailer.extend_from_slice(&[b]);
                Poll::Ready(Ok(Trailer))
            }
        }
    }

    fn read_end_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(End)),
            _ => Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, "invalid chunk end LF"))),
        }
    }
}

fn size_line_done(size: u64) -> ChunkedState {
    if size == 0 {
        EndCr
    } else {
        Body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let mut buffer: BytesMut = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let content = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(!content.is_last());
        assert_eq!(&content.data()[..], b"1234567890abcdef");

        let last = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(last.is_last());
        assert!(last.data().is_empty());
        assert!(last.trailers().is_empty());
    }

    #[test]
    fn test_multiple_chunks() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.data()[..], b"hello");

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.data()[..], b", world");

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_last());
    }

    #[test]
    fn test_chunks_with_extensions() {
        let mut buffer: BytesMut = BytesMut::from(&b"5;chunk-ext=value\r\nhello\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.data()[..], b"hello");

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_last());
    }

    #[test]
    fn trailers_surface_on_terminal_content() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhello\r\n0\r\nTrailer: v\r\nX-Sum: 42\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.data()[..], b"hello");

        let last = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(last.is_last());
        assert_eq!(last.trailers().get("trailer"), Some(&HeaderValue::from_static("v")));
        assert_eq!(last.trailers().get("x-sum"), Some(&HeaderValue::from_static("42")));
    }

    #[test]
    fn test_incremental_feeding_yields_same_payload() {
        let wire = b"6\r\nabcdef\r\n4\r\nghij\r\n0\r\nDone: yes\r\n\r\n";

        // feed the whole stream at once
        let mut whole = Vec::new();
        {
            let mut buffer = BytesMut::from(&wire[..]);
            let mut decoder = ChunkedDecoder::new();
            loop {
                match decoder.decode(&mut buffer).unwrap() {
                    Some(content) => {
                        whole.extend_from_slice(content.data());
                        if content.is_last() {
                            break;
                        }
                    }
                    None => panic!("whole stream must decode"),
                }
            }
        }

        // feed it split at every possible position
        for split in 1..wire.len() {
            let mut decoder = ChunkedDecoder::new();
            let mut collected = Vec::new();
            let mut buffer = BytesMut::from(&wire[..split]);
            let mut finished = false;

            for round in 0..2 {
                loop {
                    match decoder.decode(&mut buffer).unwrap() {
                        Some(content) => {
                            collected.extend_from_slice(content.data());
                            if content.is_last() {
                                finished = true;
                                break;
                            }
                        }
                        None => break,
                    }
                }
                if round == 0 {
                    buffer.extend_from_slice(&wire[split..]);
                }
            }

            assert!(finished, "split at {split} did not finish");
            assert_eq!(collected, whole, "split at {split} produced different payload");
        }
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut buffer: BytesMut = BytesMut::from(&b"xyz\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn overflowing_chunk_size_is_rejected() {
        let mut buffer: BytesMut = BytesMut::from(&b"ffffffffffffffffff\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_missing_crlf() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhelloBad"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.data()[..], b"hello");

        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn bare_lf_terminators_are_accepted() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\nhello\n0\n\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&chunk.data()[..], b"hello");

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_last());
    }

    #[test]
    fn test_zero_size_chunk() {
        let mut buffer: BytesMut = BytesMut::from(&b"0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_last());
    }
}
