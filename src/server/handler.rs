//! The application-facing handler seam.
//!
//! An [`HttpHandler`] services one request and returns a [`Response`]; the
//! [`HandlerRegistry`] maps `(context path, url pattern)` pairs to handlers
//! with longest-match resolution, ties at equal length going to the earliest
//! registration.

use crate::protocol::HttpRequestPacket;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

pub type HandlerError = Box<dyn Error + Send + Sync>;

/// A fully-received request as seen by application handlers.
pub struct Request {
    packet: HttpRequestPacket,
    body: Bytes,
    trailers: HeaderMap,
}

impl Request {
    pub(crate) fn new(packet: HttpRequestPacket, body: Bytes, trailers: HeaderMap) -> Self {
        Self { packet, body, trailers }
    }

    pub fn method(&self) -> &Method {
        self.packet.method()
    }

    pub fn uri(&self) -> &Uri {
        self.packet.uri()
    }

    pub fn version(&self) -> Version {
        self.packet.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.packet.headers()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// The underlying packet, including forwarded connection metadata.
    pub fn packet(&self) -> &HttpRequestPacket {
        &self.packet
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// A response under construction by a handler.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl Response {
    pub fn new() -> Self {
        Self::with_status(StatusCode::OK)
    }

    pub fn with_status(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: BytesMut::new() }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(http::header::CONTENT_TYPE, value);
        }
    }

    /// Appends bytes to the response body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        self.body.extend_from_slice(data.as_ref());
    }

    /// Replaces the response body.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body.clear();
        self.body.extend_from_slice(&body.into());
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body.freeze())
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn service(&self, request: Request) -> Result<Response, HandlerError>;
}

pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HttpHandler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, HandlerError>> + Send,
{
    async fn service(&self, request: Request) -> Result<Response, HandlerError> {
        (self.f)(request).await
    }
}

pub fn make_handler<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, HandlerError>> + Send,
{
    HandlerFn { f }
}

/// How a registration matches request paths inside its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPattern {
    Exact(String),
    /// `/images/*`: matches everything under the prefix
    Prefix(String),
    /// `*.jsp`: matches by extension
    Suffix(String),
    /// `/`: matches anything left over
    Default,
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "/" || pattern.is_empty() {
            UrlPattern::Default
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            UrlPattern::Prefix(format!("{prefix}/"))
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            UrlPattern::Suffix(format!(".{suffix}"))
        } else {
            UrlPattern::Exact(pattern.to_owned())
        }
    }

    /// Matched length inside the context, or `None` on mismatch.
    fn match_len(&self, relative: &str) -> Option<usize> {
        match self {
            UrlPattern::Exact(exact) => (relative == exact).then_some(exact.len()),
            UrlPattern::Prefix(prefix) => {
                (relative.starts_with(prefix.as_str()) || relative == &prefix[..prefix.len() - 1])
                    .then_some(prefix.len())
            }
            UrlPattern::Suffix(suffix) => relative.ends_with(suffix.as_str()).then_some(suffix.len()),
            UrlPattern::Default => Some(1),
        }
    }
}

struct Registration {
    context_path: String,
    pattern: UrlPattern,
    handler: Arc<dyn HttpHandler>,
}

/// Maps `(context path, url pattern)` to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a handler under `context_path` for `pattern` (see
    /// [`UrlPattern::parse`]).
    pub fn add(&mut self, context_path: &str, pattern: &str, handler: impl HttpHandler + 'static) {
        self.add_shared(context_path, pattern, Arc::new(handler));
    }

    pub fn add_shared(&mut self, context_path: &str, pattern: &str, handler: Arc<dyn HttpHandler>) {
        let context_path = context_path.trim_end_matches('/').to_owned();
        self.registrations.push(Registration { context_path, pattern: UrlPattern::parse(pattern), handler });
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Longest-match resolution; ties at equal match length go to the
    /// earliest registration.
    pub fn resolve(&self, path: &str) -> Option<Arc<dyn HttpHandler>> {
        let mut best: Option<(usize, &Registration)> = None;
        for registration in &self.registrations {
            let Some(relative) = relative_path(path, &registration.context_path) else {
                continue;
            };
            let Some(matched) = registration.pattern.match_len(relative) else {
                continue;
            };
            let score = registration.context_path.len() + matched;
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, registration));
            }
        }
        best.map(|(_, registration)| registration.handler.clone())
    }
}

fn relative_path<'a>(path: &'a str, context: &str) -> Option<&'a str> {
    if context.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(context)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
