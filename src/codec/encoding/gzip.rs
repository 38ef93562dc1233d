//! GZIP content encoding.
//!
//! The encoder emits the fixed 10-byte member header before the first
//! non-empty deflate output, raw-deflate frames for the payload, and on
//! finish flushes the deflater and appends the 8-byte little-endian trailer
//! `(CRC32, ISIZE mod 2^32)`. The decoder consumes the member header
//! (skipping the optional FEXTRA/FNAME/FCOMMENT/FHCRC fields), inflates the
//! deflate stream, verifies CRC32 and ISIZE against the trailer, and
//! surfaces any bytes past the member.
//!
//! Per-connection transformer state lives in the connection attributes and
//! is reset whenever a member completes.

use crate::attributes::{default_attribute_builder, Attribute, AttributeHolder};
use crate::codec::encoding::{ContentEncoding, ParsingResult};
use crate::protocol::EncodingError;
use bytes::{Buf, Bytes, BytesMut};
use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::trace;

const NAME: &str = "gzip";
const ALIASES: &[&str] = &["gzip", "deflate"];

/// Fixed member header: magic, CM=deflate, no flags, zero mtime, no extra
/// flags, unknown OS.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

const TRAILER_SIZE: usize = 8;

const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;

/// Deflate no more than this many bytes of output space at a time.
const BUFFER_GROWTH: usize = 512;

pub struct GzipContentEncoding {
    encode_state: Attribute<GzipEncodeState>,
    decode_state: Attribute<GzipDecodeState>,
}

impl GzipContentEncoding {
    pub fn new(compression_level: u32) -> Self {
        let builder = default_attribute_builder();
        let level = compression_level.min(9);
        Self {
            encode_state: builder
                .attribute_with("gzip-content-encoding.encode-state", move || GzipEncodeState::new(level)),
            decode_state: builder.attribute_with("gzip-content-encoding.decode-state", GzipDecodeState::new),
        }
    }
}

impl ContentEncoding for GzipContentEncoding {
    fn name(&self) -> &'static str {
        NAME
    }

    fn aliases(&self) -> &'static [&'static str] {
        ALIASES
    }

    fn decode(&self, attributes: &mut AttributeHolder, input: Bytes) -> Result<ParsingResult, EncodingError> {
        let state = self.decode_state.get_or_insert(attributes);
        state.pending.extend_from_slice(&input);

        let mut produced: Vec<u8> = Vec::new();

        loop {
            match state.phase {
                DecodePhase::Header => {
                    match parse_member_header(&state.pending)? {
                        Some(consumed) => {
                            trace!(header_len = consumed, "parsed gzip member header");
                            state.pending.advance(consumed);
                            state.phase = DecodePhase::Deflate;
                        }
                        None => break,
                    }
                }

                DecodePhase::Deflate => {
                    if state.pending.is_empty() {
                        break;
                    }

                    let before_in = state.decompress.total_in();
                    let mut out = Vec::with_capacity(BUFFER_GROWTH.max(state.pending.len() * 2));
                    let status = state
                        .decompress
                        .decompress_vec(&state.pending, &mut out, FlushDecompress::None)
                        .map_err(|e| EncodingError::malformed(NAME, e.to_string()))?;

                    let consumed = (state.decompress.total_in() - before_in) as usize;
                    state.pending.advance(consumed);

                    if !out.is_empty() {
                        state.crc.update(&out);
                        produced.extend_from_slice(&out);
                    }

                    match status {
                        Status::StreamEnd => state.phase = DecodePhase::Trailer,
                        Status::Ok | Status::BufError => {
                            if consumed == 0 && out.is_empty() {
                                // no forward progress without more input
                                break;
                            }
                        }
                    }
                }

                DecodePhase::Trailer => {
                    if state.pending.len() < TRAILER_SIZE {
                        break;
                    }
                    let expected_crc = state.pending.get_u32_le();
                    let expected_size = state.pending.get_u32_le();

                    let computed_crc = state.crc.sum();
                    if expected_crc != computed_crc {
                        return Err(EncodingError::ChecksumMismatch {
                            encoding: NAME,
                            expected: expected_crc,
                            computed: computed_crc,
                        });
                    }
                    if expected_size != state.crc.amount() {
                        return Err(EncodingError::malformed(
                            NAME,
                            format!("trailer size {expected_size} != inflated size {}", state.crc.amount()),
                        ));
                    }
                    trace!(size = expected_size, "gzip member verified");
                    state.phase = DecodePhase::Done;
                }

                // bytes past the member are surfaced to the caller
                DecodePhase::Done => break,
            }
        }

        let remainder = match state.phase {
            DecodePhase::Done if !state.pending.is_empty() => Some(state.pending.split().freeze()),
            _ => None,
        };

        let content = if produced.is_empty() { None } else { Some(Bytes::from(produced)) };
        Ok(ParsingResult::new(content, remainder))
    }

    fn decode_complete(&self, attributes: &mut AttributeHolder) -> Result<(), EncodingError> {
        match self.decode_state.take(attributes) {
            None => Ok(()),
            Some(state) => match state.phase {
                DecodePhase::Done => Ok(()),
                // an untouched state means the payload was empty
                DecodePhase::Header if state.pending.is_empty() && state.crc.amount() == 0 => Ok(()),
                _ => Err(EncodingError::Truncated { encoding: NAME }),
            },
        }
    }

    fn encode(&self, attributes: &mut AttributeHolder, input: Bytes) -> Result<Option<Bytes>, EncodingError> {
        if input.is_empty() {
            return Ok(None);
        }

        let state = self.encode_state.get_or_insert(attributes);
        state.crc.update(&input);

        let mut out = Vec::new();
        deflate_all(&mut state.compress, &input, &mut out, FlushCompress::None)?;

        if out.is_empty() {
            return Ok(None);
        }

        Ok(Some(with_member_header(state, out)))
    }

    fn finish(&self, attributes: &mut AttributeHolder) -> Result<Option<Bytes>, EncodingError> {
        let Some(mut state) = self.encode_state.take(attributes) else {
            // nothing was ever fed to the encoder
            return Ok(None);
        };

        let mut out = Vec::new();
        deflate_all(&mut state.compress, &[], &mut out, FlushCompress::Finish)?;

        let mut tail = Vec::with_capacity(out.len() + TRAILER_SIZE);
        tail.extend_from_slice(&out);
        tail.extend_from_slice(&state.crc.sum().to_le_bytes());
        tail.extend_from_slice(&(state.compress.total_in() as u32).to_le_bytes());

        Ok(Some(with_member_header(&mut state, tail)))
    }
}

/// Prepends the fixed header before the first emitted bytes.
fn with_member_header(state: &mut GzipEncodeState, bytes: Vec<u8>) -> Bytes {
    if state.header_written {
        return Bytes::from(bytes);
    }
    state.header_written = true;
    let mut with_header = Vec::with_capacity(GZIP_HEADER.len() + bytes.len());
    with_header.extend_from_slice(&GZIP_HEADER);
    with_header.extend_from_slice(&bytes);
    Bytes::from(with_header)
}

fn deflate_all(
    compress: &mut Compress,
    mut input: &[u8],
    out: &mut Vec<u8>,
    flush: FlushCompress,
) -> Result<(), EncodingError> {
    loop {
        out.reserve(BUFFER_GROWTH);
        let before_in = compress.total_in();
        let status = compress.compress_vec(input, out, flush).map_err(|e| EncodingError::compression(e.to_string()))?;
        let consumed = (compress.total_in() - before_in) as usize;
        input = &input[consumed..];

        match (status, flush) {
            (Status::StreamEnd, _) => return Ok(()),
            (_, FlushCompress::Finish) => continue,
            _ if input.is_empty() => return Ok(()),
            _ => continue,
        }
    }
}

/// Parses the member header, returning the consumed length, or `None` when
/// more bytes are needed.
fn parse_member_header(buf: &[u8]) -> Result<Option<usize>, EncodingError> {
    if buf.len() < GZIP_HEADER.len() {
        return Ok(None);
    }
    if buf[0] != 0x1f || buf[1] != 0x8b {
        return Err(EncodingError::malformed(NAME, format!("bad magic {:#04x} {:#04x}", buf[0], buf[1])));
    }
    if buf[2] != 0x08 {
        return Err(EncodingError::malformed(NAME, format!("unsupported compression method {}", buf[2])));
    }

    let flags = buf[3];
    let mut index = GZIP_HEADER.len();

    if flags & FEXTRA != 0 {
        if buf.len() < index + 2 {
            return Ok(None);
        }
        let extra_len = u16::from_le_bytes([buf[index], buf[index + 1]]) as usize;
        index += 2 + extra_len;
        if buf.len() < index {
            return Ok(None);
        }
    }

    for flag in [FNAME, FCOMMENT] {
        if flags & flag != 0 {
            match buf[index..].iter().position(|&b| b == 0) {
                Some(position) => index += position + 1,
                None => return Ok(None),
            }
        }
    }

    if flags & FHCRC != 0 {
        index += 2;
        if buf.len() < index {
            return Ok(None);
        }
    }

    Ok(Some(index))
}

struct GzipEncodeState {
    compress: Compress,
    crc: Crc,
    header_written: bool,
}

impl GzipEncodeState {
    fn new(level: u32) -> Self {
        Self { compress: Compress::new(Compression::new(level), false), crc: Crc::new(), header_written: false }
    }
}

struct GzipDecodeState {
    phase: DecodePhase,
    pending: BytesMut,
    decompress: Decompress,
    crc: Crc,
}

impl GzipDecodeState {
    fn new() -> Self {
        Self { phase: DecodePhase::Header, pending: BytesMut::new(), decompress: Decompress::new(false), crc: Crc::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodePhase {
    Header,
    Deflate,
    Trailer,
    Done,
}
