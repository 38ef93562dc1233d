//! AJP message handling.
//!
//! Sits above the framing filter: demuxes packet types, decodes
//! FORWARD_REQUEST into the same [`HttpRequestPacket`] the HTTP codec
//! produces, pulls request body chunks with GET_BODY_CHUNK, and serializes
//! response messages into SEND_HEADERS / SEND_BODY_CHUNK / END_RESPONSE
//! packets. The layers above never see AJP.

use crate::attributes::{default_attribute_builder, Attribute};
use crate::codec::ajp::constants::*;
use crate::filter::{ChainMessage, Filter, FilterChainContext, NextAction, PipelineError};
use crate::memory::Buffer;
use crate::protocol::{HttpContent, HttpRequestPacket, HttpResponsePacket, Message, ParseError, SendError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Method, Uri, Version};
use tracing::{debug, trace, warn};

pub struct AjpHandlerFilter {
    state: Attribute<AjpState>,
    expected_secret: Option<String>,
}

#[derive(Default)]
struct AjpState {
    /// Request body bytes still expected from the web server
    content_remaining: Option<u64>,
    /// Connection reuse flag for END_RESPONSE
    reuse: bool,
    /// The active response carries no payload bytes (HEAD and friends)
    suppress_body: bool,
}

impl AjpHandlerFilter {
    pub fn new() -> Self {
        Self {
            state: default_attribute_builder().attribute_with("ajp-handler-filter.state", AjpState::default),
            expected_secret: None,
        }
    }

    /// Requires every FORWARD_REQUEST to carry this shared secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self { expected_secret: Some(secret.into()), ..Self::new() }
    }
}

impl Default for AjpHandlerFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Filter for AjpHandlerFilter {
    fn name(&self) -> &'static str {
        "ajp-handler"
    }

    async fn handle_read(&self, ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        let Some(message) = ctx.take_message() else {
            return Ok(NextAction::invoke());
        };
        let Some(buffer) = message.into_buffer() else {
            return Err(PipelineError::internal("ajp handler expects framed packets"));
        };
        let payload = buffer.to_bytes();

        let mut state = self.state.take(ctx.attributes()).unwrap_or_default();
        let result = self.read_packet(ctx, &mut state, payload);
        self.state.set(ctx.attributes(), state);
        result
    }

    async fn handle_write(&self, ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        let Some(message) = ctx.take_message() else {
            return Ok(NextAction::invoke());
        };

        let response = match message {
            ChainMessage::Response(response) => response,
            ChainMessage::Buffer(buffer) => {
                ctx.set_message(ChainMessage::Buffer(buffer));
                return Ok(NextAction::invoke());
            }
            ChainMessage::Request(_) => {
                return Err(PipelineError::internal("request messages cannot be written by a server"));
            }
        };

        let mut state = self.state.take(ctx.attributes()).unwrap_or_default();
        let result = self.write_response(ctx, &mut state, response);
        self.state.set(ctx.attributes(), state);
        result
    }
}

impl AjpHandlerFilter {
    fn read_packet(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut AjpState,
        payload: Bytes,
    ) -> Result<NextAction, PipelineError> {
        // while request content is pending, packets are body chunks
        if let Some(remaining) = state.content_remaining {
            return self.read_body_chunk(ctx, state, remaining, payload);
        }

        let Some(&packet_type) = payload.first() else {
            return Err(ParseError::invalid_frame("empty ajp packet").into());
        };

        match packet_type {
            FORWARD_REQUEST => {
                let packet = self.decode_forward_request(&payload[1..])?;
                trace!(method = %packet.method(), uri = %packet.uri(), "decoded forward request");

                match packet.content_length() {
                    Some(n) if n > 0 => state.content_remaining = Some(n),
                    _ => state.content_remaining = None,
                }

                ctx.set_message(ChainMessage::Request(Message::Header(packet)));
                Ok(NextAction::invoke())
            }

            CPING => {
                trace!("cping received, answering cpong");
                ctx.write(ChainMessage::Buffer(cpong_packet()));
                Ok(NextAction::stop())
            }

            PING => {
                debug!("ping packet ignored");
                Ok(NextAction::stop())
            }

            SHUTDOWN => {
                warn!("shutdown packet received from the web server");
                ctx.connection().request_close(crate::transport::CloseReason::Remotely);
                Ok(NextAction::stop())
            }

            other => Err(ParseError::invalid_frame(format!("unknown ajp packet type {other}")).into()),
        }
    }

    fn read_body_chunk(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut AjpState,
        remaining: u64,
        payload: Bytes,
    ) -> Result<NextAction, PipelineError> {
        // an empty data packet ends the body early
        if payload.is_empty() {
            state.content_remaining = None;
            ctx.set_message(ChainMessage::Request(Message::Content(HttpContent::eof())));
            return Ok(NextAction::invoke());
        }

        if payload.len() < 2 {
            return Err(ParseError::invalid_frame("truncated ajp body chunk").into());
        }
        let declared = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if declared == 0 {
            state.content_remaining = None;
            ctx.set_message(ChainMessage::Request(Message::Content(HttpContent::eof())));
            return Ok(NextAction::invoke());
        }
        if payload.len() < 2 + declared {
            return Err(ParseError::invalid_frame("ajp body chunk shorter than its length prefix").into());
        }

        let take = (declared as u64).min(remaining) as usize;
        let data = payload.slice(2..2 + take);
        let left = remaining - take as u64;

        if left == 0 {
            state.content_remaining = None;
            ctx.set_message(ChainMessage::Request(Message::Content(HttpContent::last(data))));
        } else {
            state.content_remaining = Some(left);
            ctx.set_message(ChainMessage::Request(Message::Content(HttpContent::chunk(data))));
            // pull the next chunk
            let requested = left.min(MAX_BODY_CHUNK_SIZE as u64) as u16;
            ctx.write(ChainMessage::Buffer(get_body_chunk_packet(requested)));
        }
        Ok(NextAction::invoke())
    }

    fn decode_forward_request(&self, payload: &[u8]) -> Result<HttpRequestPacket, ParseError> {
        let mut reader = PacketReader::new(payload);

        let method_code = reader.u8()?;
        let mut method_name = method_for_code(method_code).map(str::to_owned);

        let protocol = reader.string()?.unwrap_or_default();
        let request_uri = reader.string()?.unwrap_or_else(|| "/".to_owned());
        let remote_addr = reader.string()?;
        let remote_host = reader.string()?;
        let server_name = reader.string()?;
        let server_port = reader.u16()?;
        let is_ssl = reader.u8()? != 0;

        let header_count = reader.u16()? as usize;
        let mut headers = Vec::with_capacity(header_count);
        for _ in 0..header_count {
            let code = reader.u16()?;
            let name = match request_header_for_code(code) {
                Some(name) => name.to_owned(),
                None => reader.string_of_len(code as usize)?,
            };
            let value = reader.string()?.unwrap_or_default();
            headers.push((name, value));
        }

        let mut query_string = None;
        let mut request_attributes = Vec::new();
        let mut secret = None;

        loop {
            let code = reader.u8()?;
            if code == SC_A_ARE_DONE {
                break;
            }
            match code {
                SC_A_REQ_ATTRIBUTE => {
                    let name = reader.string()?.unwrap_or_default();
                    let value = reader.string()?.unwrap_or_default();
                    request_attributes.push((name, value));
                }
                SC_A_QUERY_STRING => query_string = reader.string()?,
                SC_A_STORED_METHOD => {
                    if let Some(stored) = reader.string()? {
                        method_name = Some(stored);
                    }
                }
                SC_A_SSL_KEY_SIZE => {
                    let key_size = reader.u16()?;
                    request_attributes.push(("ssl_key_size".to_owned(), key_size.to_string()));
                }
                SC_A_SECRET => secret = reader.string()?,
                SC_A_CONTEXT | SC_A_SERVLET_PATH | SC_A_REMOTE_USER | SC_A_AUTH_TYPE | SC_A_JVM_ROUTE
                | SC_A_SSL_CERT | SC_A_SSL_CIPHER | SC_A_SSL_SESSION => {
                    let name = match code {
                        SC_A_CONTEXT => "context",
                        SC_A_SERVLET_PATH => "servlet_path",
                        SC_A_REMOTE_USER => "remote_user",
                        SC_A_AUTH_TYPE => "auth_type",
                        SC_A_JVM_ROUTE => "route",
                        SC_A_SSL_CERT => "ssl_cert",
                        SC_A_SSL_CIPHER => "ssl_cipher",
                        SC_A_SSL_SESSION => "ssl_session",
                        _ => unreachable!(),
                    };
                    if let Some(value) = reader.string()? {
                        request_attributes.push((name.to_owned(), value));
                    }
                }
                other => {
                    // unrecognized attributes carry a string value
                    debug!(code = other, "skipping unknown ajp request attribute");
                    reader.string()?;
                }
            }
        }

        if let Some(expected) = &self.expected_secret {
            if secret.as_deref() != Some(expected.as_str()) {
                return Err(ParseError::invalid_frame("ajp secret mismatch"));
            }
        }

        let method_name = method_name.ok_or_else(|| ParseError::InvalidMethod)?;
        let method: Method = method_name.parse().map_err(|_| ParseError::InvalidMethod)?;

        let version = if protocol.eq_ignore_ascii_case("HTTP/1.0") { Version::HTTP_10 } else { Version::HTTP_11 };

        let uri: Uri = match &query_string {
            Some(query) if !query.is_empty() => format!("{request_uri}?{query}").parse().map_err(|_| ParseError::InvalidUri)?,
            _ => request_uri.parse().map_err(|_| ParseError::InvalidUri)?,
        };

        let mut packet = HttpRequestPacket::new(method, uri, version, Default::default());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ParseError::invalid_header(format!("invalid header name {name:?}")))?;
            let value =
                HeaderValue::from_str(&value).map_err(|_| ParseError::invalid_header("invalid header value"))?;
            packet.headers_mut().append(name, value);
        }

        if let Some(value) = packet.headers().get(CONTENT_LENGTH) {
            let text = value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            let length = text
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {text} is not u64")))?;
            packet.set_content_length(Some(length));
        }
        packet.set_chunked(packet.headers().contains_key(TRANSFER_ENCODING) && packet.content_length().is_none());

        packet.set_secure(is_ssl);
        packet.set_remote_addr(remote_addr);
        packet.set_remote_host(remote_host);
        packet.set_server_name(server_name);
        packet.set_server_port(Some(server_port));
        for (name, value) in request_attributes {
            packet.add_request_attribute(name, value);
        }

        packet.examine_expect();
        // connection persistence is decided at the AJP layer, not by the
        // client's hop-by-hop headers
        packet.processing_mut().keep_alive = true;

        Ok(packet)
    }

    fn write_response(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut AjpState,
        response: Message<HttpResponsePacket>,
    ) -> Result<NextAction, PipelineError> {
        match response {
            Message::Header(packet) => {
                // AJP has no interim responses; the web server handles Expect
                if packet.is_acknowledgment() {
                    return Ok(NextAction::stop());
                }

                state.reuse = packet.is_keep_alive();
                state.suppress_body = packet.is_suppress_body() || packet.status_forbids_body();

                ctx.set_message(ChainMessage::Buffer(send_headers_packet(&packet)?));
                Ok(NextAction::invoke())
            }

            Message::Content(content) => {
                let mut out = Buffer::empty();

                if !state.suppress_body && !content.data().is_empty() {
                    append_body_chunk_packets(&mut out, content.data());
                }
                if content.is_last() {
                    out.append(end_response_packet(state.reuse));
                }

                if out.is_empty() {
                    return Ok(NextAction::stop());
                }
                ctx.set_message(ChainMessage::Buffer(out));
                Ok(NextAction::invoke())
            }
        }
    }
}

/// Sequential reader over a packet payload.
struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        let byte = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        if self.pos + 2 > self.buf.len() {
            return Err(truncated());
        }
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    /// Reads a length-prefixed string; `0xFFFF` means absent.
    fn string(&mut self) -> Result<Option<String>, ParseError> {
        let len = self.u16()?;
        if len == 0xFFFF {
            return Ok(None);
        }
        Ok(Some(self.string_of_len(len as usize)?))
    }

    /// Reads `len` string bytes plus the trailing NUL.
    fn string_of_len(&mut self, len: usize) -> Result<String, ParseError> {
        if self.pos + len + 1 > self.buf.len() {
            return Err(truncated());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len + 1;
        String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::invalid_frame("non-utf8 string in ajp packet"))
    }
}

fn truncated() -> ParseError {
    ParseError::invalid_frame("truncated ajp packet")
}

/// Wraps a payload into a container-origin packet.
fn ajp_packet(payload: BytesMut) -> Buffer {
    debug_assert!(payload.len() + H_SIZE <= MAX_PACKET_SIZE);
    let mut out = BytesMut::with_capacity(H_SIZE + payload.len());
    out.put_u16(CONTAINER_MAGIC);
    out.put_u16(payload.len() as u16);
    out.extend_from_slice(&payload);
    Buffer::from(out)
}

fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_u16(value.len() as u16);
    dst.extend_from_slice(value.as_bytes());
    dst.put_u8(0);
}

fn send_headers_packet(packet: &HttpResponsePacket) -> Result<Buffer, SendError> {
    let mut payload = BytesMut::new();
    payload.put_u8(SEND_HEADERS);
    payload.put_u16(packet.status().as_u16());
    put_string(&mut payload, packet.reason());

    let mut headers: Vec<(String, String)> = Vec::new();
    for (name, value) in packet.headers() {
        let value = value.to_str().map_err(|_| SendError::invalid_body("non-ascii header value"))?;
        headers.push((name.as_str().to_owned(), value.to_owned()));
    }
    if !packet.headers().contains_key(CONTENT_LENGTH) {
        if let Some(length) = packet.content_length() {
            headers.push(("content-length".to_owned(), length.to_string()));
        }
    }

    payload.put_u16(headers.len() as u16);
    for (name, value) in &headers {
        match response_header_code(name) {
            Some(code) => payload.put_u16(code),
            None => put_string(&mut payload, name),
        }
        put_string(&mut payload, value);
    }

    if payload.len() + H_SIZE > MAX_PACKET_SIZE {
        return Err(SendError::invalid_body("response headers exceed the ajp packet size"));
    }
    Ok(ajp_packet(payload))
}

/// Splits outbound data into SEND_BODY_CHUNK packets of at most
/// [`MAX_BODY_CHUNK_SIZE`] payload bytes each.
fn append_body_chunk_packets(out: &mut Buffer, data: &[u8]) {
    for piece in data.chunks(MAX_BODY_CHUNK_SIZE) {
        let mut payload = BytesMut::with_capacity(piece.len() + 4);
        payload.put_u8(SEND_BODY_CHUNK);
        payload.put_u16(piece.len() as u16);
        payload.extend_from_slice(piece);
        payload.put_u8(0);
        out.append(ajp_packet(payload));
    }
}

fn end_response_packet(reuse: bool) -> Buffer {
    let mut payload = BytesMut::with_capacity(2);
    payload.put_u8(END_RESPONSE);
    payload.put_u8(reuse as u8);
    ajp_packet(payload)
}

fn get_body_chunk_packet(requested: u16) -> Buffer {
    let mut payload = BytesMut::with_capacity(3);
    payload.put_u8(GET_BODY_CHUNK);
    payload.put_u16(requested);
    ajp_packet(payload)
}

fn cpong_packet() -> Buffer {
    let mut payload = BytesMut::with_capacity(1);
    payload.put_u8(CPONG);
    ajp_packet(payload)
}
