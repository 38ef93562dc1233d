//! The topmost filter: request dispatch.
//!
//! Aggregates the request payload, acknowledges `Expect: 100-continue`
//! before pulling the first body byte, resolves the handler through the
//! registry, and streams the response back down the chain. Protocol
//! agnostic: the messages it sees are the same whether the codec below
//! speaks HTTP/1.x or AJP.

use crate::attributes::{default_attribute_builder, Attribute};
use crate::filter::{ChainMessage, Filter, FilterChainContext, NextAction, PipelineError};
use crate::protocol::{HttpContent, HttpRequestPacket, HttpResponsePacket, Message};
use crate::server::handler::{HandlerRegistry, Request, Response};
use crate::server::HttpHandler;
use crate::transport::CloseReason;
use async_trait::async_trait;
use bytes::BytesMut;
use http::header::{DATE, SERVER};
use http::{HeaderValue, Method, StatusCode, Version};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, trace, warn};

pub struct HttpServerFilter {
    registry: Arc<HandlerRegistry>,
    active: Attribute<ActiveRequest>,
}

struct ActiveRequest {
    packet: HttpRequestPacket,
    handler: Arc<dyn HttpHandler>,
    body: BytesMut,
}

impl HttpServerFilter {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry, active: default_attribute_builder().attribute("http-server-filter.active-request") }
    }
}

#[async_trait]
impl Filter for HttpServerFilter {
    fn name(&self) -> &'static str {
        "http-server"
    }

    async fn handle_read(&self, ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        match ctx.take_message() {
            Some(ChainMessage::Request(Message::Header(packet))) => self.on_request_head(ctx, packet).await,
            Some(ChainMessage::Request(Message::Content(content))) => self.on_request_content(ctx, content).await,
            Some(_) => {
                warn!("unexpected message at the top of the chain");
                Ok(NextAction::stop())
            }
            None => Ok(NextAction::invoke()),
        }
    }
}

impl HttpServerFilter {
    async fn on_request_head(
        &self,
        ctx: &mut FilterChainContext<'_>,
        packet: HttpRequestPacket,
    ) -> Result<NextAction, PipelineError> {
        let expects_payload = !packet.payload_size().is_empty();

        let Some(handler) = self.registry.resolve(packet.uri().path()) else {
            debug!(uri = %packet.uri(), "no handler registered");
            // committing now arms the codec's residual-payload skip, so any
            // body already on its way never reaches this filter
            let response = Response::with_status(StatusCode::NOT_FOUND);
            self.commit_response(ctx, &packet, response);
            return Ok(NextAction::stop());
        };

        // acknowledge before the first body byte is pulled
        if packet.is_expect_continue() && expects_payload {
            trace!("acknowledging expect-continue");
            ctx.write(ChainMessage::Response(Message::Header(HttpResponsePacket::acknowledgment())));
        }

        if expects_payload {
            self.active.set(ctx.attributes(), ActiveRequest { packet, handler, body: BytesMut::new() });
        } else {
            self.dispatch(ctx, packet, handler, BytesMut::new(), Default::default()).await;
        }
        Ok(NextAction::stop())
    }

    async fn on_request_content(
        &self,
        ctx: &mut FilterChainContext<'_>,
        content: HttpContent,
    ) -> Result<NextAction, PipelineError> {
        let Some(mut active) = self.active.take(ctx.attributes()) else {
            // payload of an already-answered message
            trace!("dropping stray request content");
            return Ok(NextAction::stop());
        };

        active.body.extend_from_slice(content.data());

        if content.is_last() {
            let trailers = content.trailers().clone();
            self.dispatch(ctx, active.packet, active.handler, active.body, trailers).await;
        } else {
            self.active.set(ctx.attributes(), active);
        }
        Ok(NextAction::stop())
    }

    async fn dispatch(
        &self,
        ctx: &mut FilterChainContext<'_>,
        packet: HttpRequestPacket,
        handler: Arc<dyn HttpHandler>,
        body: BytesMut,
        trailers: http::HeaderMap,
    ) {
        let keep_alive = packet.processing().keep_alive;
        let version = packet.version();
        let is_head = packet.method() == Method::HEAD;

        let request = Request::new(packet, body.freeze(), trailers);
        let served = handler.service(request).await;

        let response = match served {
            Ok(response) => response,
            Err(e) => {
                error!(cause = %e, "handler failed");
                Response::with_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        self.write_response(ctx, response, version, is_head, keep_alive);
    }

    fn commit_response(&self, ctx: &mut FilterChainContext<'_>, packet: &HttpRequestPacket, response: Response) {
        let keep_alive = packet.processing().keep_alive;
        let version = packet.version();
        let is_head = packet.method() == Method::HEAD;
        self.write_response(ctx, response, version, is_head, keep_alive);
    }

    fn write_response(
        &self,
        ctx: &mut FilterChainContext<'_>,
        response: Response,
        version: Version,
        is_head: bool,
        keep_alive: bool,
    ) {
        let (status, headers, body) = response.into_parts();

        let mut packet = HttpResponsePacket::new(status, version);
        *packet.headers_mut() = headers;
        packet.set_keep_alive(keep_alive);
        packet.set_suppress_body(is_head);

        if !packet.headers().contains_key(DATE) {
            let date = httpdate::fmt_http_date(SystemTime::now());
            if let Ok(value) = HeaderValue::from_str(&date) {
                packet.headers_mut().insert(DATE, value);
            }
        }
        if !packet.headers().contains_key(SERVER) {
            if let Ok(value) = HeaderValue::from_str(&ctx.config().server_name) {
                packet.headers_mut().insert(SERVER, value);
            }
        }

        if !packet.status_forbids_body() {
            packet.set_content_length(Some(body.len() as u64));
        }

        ctx.write(ChainMessage::Response(Message::Header(packet)));
        ctx.write(ChainMessage::Response(Message::Content(HttpContent::last(body))));

        if !keep_alive {
            ctx.connection().request_close(CloseReason::Locally);
        }
    }
}
