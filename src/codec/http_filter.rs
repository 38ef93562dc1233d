//! The HTTP/1.x codec as a chain filter.
//!
//! On the read path the filter turns wire buffers into
//! [`Message`]`<`[`HttpRequestPacket`]`>` items, one per chain pass, handing
//! leftover bytes back to the runtime as invoke-remainders so pipelined
//! requests keep flowing. On the write path it serializes response messages
//! and applies the registered content encodings.
//!
//! Keep-alive accounting, the `Expect: 100-continue` acknowledgment packet
//! and the residual-payload skip policy live here too.

use crate::codec::encoding::{ContentEncoding, EncodingRegistry};
use crate::codec::request_decoder::RequestDecoder;
use crate::codec::response_encoder::ResponseEncoder;
use crate::filter::{ChainMessage, Filter, FilterChainContext, NextAction, PipelineError};
use crate::memory::Buffer;
use crate::protocol::{HttpContent, HttpRequestPacket, HttpResponsePacket, Message, ParseError, PayloadSize};
use crate::transport::CloseReason;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::CONNECTION;
use http::{HeaderValue, Version};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace, warn};

use crate::attributes::{default_attribute_builder, Attribute};

pub struct HttpCodecFilter {
    registry: EncodingRegistry,
    state: Attribute<HttpCodecState>,
}

struct HttpCodecState {
    decoder: RequestDecoder,
    encoder: ResponseEncoder,
    /// Decoders for the current request payload, outermost first
    active_decoders: Vec<Arc<dyn ContentEncoding>>,
    /// Encoders for the current response payload, in listed order
    active_encoders: Vec<Arc<dyn ContentEncoding>>,
    /// Remaining bytes of a committed-early request body we still swallow
    skip_budget: Option<u64>,
    reading_body: bool,
}

impl HttpCodecState {
    fn new(config: &crate::config::ServerConfig) -> Self {
        Self {
            decoder: RequestDecoder::with_config(config),
            encoder: ResponseEncoder::new(),
            active_decoders: Vec::new(),
            active_encoders: Vec::new(),
            skip_budget: None,
            reading_body: false,
        }
    }
}

impl HttpCodecFilter {
    pub fn new(registry: EncodingRegistry) -> Self {
        Self { registry, state: default_attribute_builder().attribute("http-codec-filter.state") }
    }
}

impl Default for HttpCodecFilter {
    fn default() -> Self {
        Self::new(EncodingRegistry::new())
    }
}

#[async_trait]
impl Filter for HttpCodecFilter {
    fn name(&self) -> &'static str {
        "http-codec"
    }

    async fn handle_read(&self, ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        let Some(message) = ctx.take_message() else {
            return Ok(NextAction::invoke());
        };
        let Some(buffer) = message.into_buffer() else {
            return Err(PipelineError::internal("http codec expects wire buffers on the read path"));
        };

        let mut state = match self.state.take(ctx.attributes()) {
            Some(state) => state,
            None => HttpCodecState::new(ctx.config()),
        };

        let result = self.read_step(ctx, &mut state, buffer).await;
        self.state.set(ctx.attributes(), state);
        result
    }

    async fn handle_write(&self, ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        let Some(message) = ctx.take_message() else {
            return Ok(NextAction::invoke());
        };

        // raw buffers pass through untouched
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

        let mut state = match self.state.take(ctx.attributes()) {
            Some(state) => state,
            None => HttpCodecState::new(ctx.config()),
        };

        let result = self.write_step(ctx, &mut state, response);
        self.state.set(ctx.attributes(), state);
        result
    }
}

impl HttpCodecFilter {
    async fn read_step(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut HttpCodecState,
        buffer: Buffer,
    ) -> Result<NextAction, PipelineError> {
        let mut src = buffer.into_bytes_mut();

        let decoded = match state.decoder.decode(&mut src) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.send_error_response(ctx, &e).await;
                ctx.connection().request_close(CloseReason::Error);
                return Err(e.into());
            }
        };

        match decoded {
            None => {
                let idle = state.decoder.is_idle() && src.is_empty();
                ctx.connection().set_idle(idle);
                Ok(stop_with_leftover(src))
            }

            Some(Message::Header((mut packet, payload_size))) => {
                ctx.connection().set_idle(false);
                let served = ctx.connection().note_request();
                if let Some(max) = ctx.config().max_keep_alive_requests {
                    if served >= max {
                        debug!(served, "keep-alive request budget exhausted");
                        packet.processing_mut().keep_alive = false;
                    }
                }

                state.reading_body = !payload_size.is_empty();
                state.active_decoders = resolve_decoders(&self.registry, &packet);
                trace!(method = %packet.method(), uri = %packet.uri(), "decoded request head");

                ctx.set_message(ChainMessage::Request(Message::Header(packet)));
                Ok(invoke_with_leftover(src))
            }

            Some(Message::Content(content)) => {
                if state.skip_budget.is_some() {
                    return self.skip_content(ctx, state, content, src);
                }

                let is_last = content.is_last();
                let decoded = self.apply_decoders(ctx, state, content)?;

                if is_last {
                    state.reading_body = false;
                    let idle = state.decoder.is_idle() && src.is_empty();
                    ctx.connection().set_idle(idle);
                }

                match decoded {
                    Some(content) => {
                        ctx.set_message(ChainMessage::Request(Message::Content(content)));
                        Ok(invoke_with_leftover(src))
                    }
                    // the decoders buffered everything; re-drive leftovers only
                    None => Ok(NextAction::Invoke { remainder: leftover(src) }),
                }
            }
        }
    }

    /// Swallows residual request-body bytes after the response was
    /// committed, within the configured budget.
    fn skip_content(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut HttpCodecState,
        content: HttpContent,
        src: BytesMut,
    ) -> Result<NextAction, PipelineError> {
        let budget = state.skip_budget.get_or_insert(0);
        let len = content.data().len() as u64;

        if *budget < len {
            warn!(skipped_over = len, "residual payload exceeds the skip budget, closing");
            ctx.connection().request_close(CloseReason::Locally);
            return Ok(NextAction::stop());
        }
        *budget -= len;

        if content.is_last() {
            state.skip_budget = None;
            state.reading_body = false;
            let idle = state.decoder.is_idle() && src.is_empty();
            ctx.connection().set_idle(idle);
        }
        Ok(NextAction::Invoke { remainder: leftover(src) })
    }

    fn apply_decoders(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut HttpCodecState,
        content: HttpContent,
    ) -> Result<Option<HttpContent>, PipelineError> {
        if state.active_decoders.is_empty() {
            return Ok(Some(content));
        }

        let is_last = content.is_last();
        let trailers = content.trailers().clone();
        let mut data = content.into_data();
        let mut surfaced: Option<Bytes> = None;

        for decoder in &state.active_decoders {
            if data.is_empty() && !is_last {
                break;
            }
            let result = decoder.decode(ctx.attributes(), data)?;
            data = result.content.unwrap_or_default();
            if let Some(remainder) = result.remainder {
                debug!(len = remainder.len(), "bytes past the encoded stream surfaced");
                surfaced = Some(match surfaced.take() {
                    Some(existing) => concat_bytes(existing, remainder),
                    None => remainder,
                });
            }
        }

        if is_last {
            for decoder in state.active_decoders.drain(..) {
                decoder.decode_complete(ctx.attributes())?;
            }
        }

        if let Some(extra) = surfaced {
            data = concat_bytes(data, extra);
        }

        if data.is_empty() && !is_last {
            return Ok(None);
        }
        Ok(Some(if is_last { HttpContent::last_with_trailers(data, trailers) } else { HttpContent::chunk(data) }))
    }

    fn write_step(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut HttpCodecState,
        response: Message<HttpResponsePacket>,
    ) -> Result<NextAction, PipelineError> {
        let mut dst = BytesMut::new();

        match response {
            Message::Header(mut packet) => {
                if packet.is_acknowledgment() {
                    state.encoder.encode(Message::Header((packet, PayloadSize::Empty)), &mut dst)?;
                    ctx.set_message(ChainMessage::Buffer(Buffer::from(dst)));
                    return Ok(NextAction::invoke());
                }

                // committing while the request body is still inbound arms
                // the residual skip policy
                if state.reading_body {
                    let allowed = ctx.config().max_payload_remainder_to_skip.unwrap_or(u64::MAX);
                    state.skip_budget = Some(allowed);
                    for decoder in state.active_decoders.drain(..) {
                        let _ = decoder.decode_complete(ctx.attributes());
                    }
                }

                apply_connection_header(&mut packet);

                state.active_encoders = resolve_encoders(&self.registry, &packet);
                if !state.active_encoders.is_empty() {
                    if packet.version() == Version::HTTP_11 && ctx.config().chunking_enabled {
                        // encoded output has no known length
                        packet.set_chunked(true);
                        packet.set_content_length(None);
                        packet.headers_mut().remove(http::header::CONTENT_LENGTH);
                    } else {
                        debug!("content encoding skipped, chunked framing unavailable");
                        state.active_encoders.clear();
                        packet.headers_mut().remove(http::header::CONTENT_ENCODING);
                    }
                }

                let payload_size = response_payload_size(&packet);
                state.encoder.encode(Message::Header((packet, payload_size)), &mut dst)?;
                ctx.set_message(ChainMessage::Buffer(Buffer::from(dst)));
                Ok(NextAction::invoke())
            }

            Message::Content(content) => {
                let encoded = self.apply_encoders(ctx, state, content)?;
                match encoded {
                    Some(content) => {
                        state.encoder.encode(Message::Content(content), &mut dst)?;
                        ctx.set_message(ChainMessage::Buffer(Buffer::from(dst)));
                        Ok(NextAction::invoke())
                    }
                    // everything is buffered inside the encoders
                    None => Ok(NextAction::stop()),
                }
            }
        }
    }

    fn apply_encoders(
        &self,
        ctx: &mut FilterChainContext<'_>,
        state: &mut HttpCodecState,
        content: HttpContent,
    ) -> Result<Option<HttpContent>, PipelineError> {
        if state.active_encoders.is_empty() {
            return Ok(Some(content));
        }

        let is_last = content.is_last();
        let trailers = content.trailers().clone();
        let mut data = content.into_data();

        for encoder in &state.active_encoders {
            data = encoder.encode(ctx.attributes(), data)?.unwrap_or_default();
        }

        if is_last {
            for encoder in state.active_encoders.drain(..) {
                if let Some(tail) = encoder.finish(ctx.attributes())? {
                    data = concat_bytes(data, tail);
                }
            }
            return Ok(Some(HttpContent::last_with_trailers(data, trailers)));
        }

        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(HttpContent::chunk(data)))
    }

    /// Emits a minimal error response before the connection is torn down.
    async fn send_error_response(&self, ctx: &mut FilterChainContext<'_>, error: &ParseError) {
        let status = error.response_status();
        error!(cause = %error, status = %status, "request parsing failed");
        let raw = format!(
            "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
            status.as_str(),
            status.canonical_reason().unwrap_or("Error")
        );
        if let Err(e) = ctx.connection().enqueue_write(Buffer::from(Bytes::from(raw.into_bytes()))).await {
            debug!(cause = %e, "could not enqueue error response");
        }
    }
}

fn resolve_decoders(registry: &EncodingRegistry, packet: &HttpRequestPacket) -> Vec<Arc<dyn ContentEncoding>> {
    if registry.is_empty() {
        return Vec::new();
    }

    let tokens: Vec<String> = packet
        .headers()
        .get_all(http::header::CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("identity"))
        .collect();

    // encodings apply right-to-left on the read path
    let mut decoders = Vec::new();
    for token in tokens.iter().rev() {
        match registry.lookup(token) {
            Some(encoding) if encoding.want_decode(packet.headers()) => decoders.push(encoding),
            Some(_) => {}
            None => {
                debug!(token = %token, "no decoder registered, passing payload through");
                return Vec::new();
            }
        }
    }
    decoders
}

fn resolve_encoders(registry: &EncodingRegistry, packet: &HttpResponsePacket) -> Vec<Arc<dyn ContentEncoding>> {
    if registry.is_empty() {
        return Vec::new();
    }
    registry.iter().filter(|e| e.want_encode(packet.headers())).cloned().collect()
}

fn apply_connection_header(packet: &mut HttpResponsePacket) {
    if !packet.is_keep_alive() {
        packet.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    } else if packet.version() == Version::HTTP_10 {
        packet.headers_mut().insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
}

fn response_payload_size(packet: &HttpResponsePacket) -> PayloadSize {
    if packet.is_chunked() {
        PayloadSize::Chunked
    } else {
        match packet.content_length() {
            Some(n) => PayloadSize::Length(n),
            None => PayloadSize::Empty,
        }
    }
}

fn concat_bytes(a: Bytes, b: Bytes) -> Bytes {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }
    let mut merged = BytesMut::with_capacity(a.len() + b.len());
    merged.extend_from_slice(&a);
    merged.extend_from_slice(&b);
    merged.freeze()
}

fn leftover(src: BytesMut) -> Option<Buffer> {
    if src.is_empty() {
        None
    } else {
        Some(Buffer::from(src))
    }
}

fn invoke_with_leftover(src: BytesMut) -> NextAction {
    NextAction::Invoke { remainder: leftover(src) }
}

fn stop_with_leftover(src: BytesMut) -> NextAction {
    NextAction::Stop { remainder: leftover(src) }
}
