//! Parsed request metadata.
//!
//! An [`HttpRequestPacket`] carries everything a request head says about the
//! message: method, target, version, headers, body framing and the
//! connection-forwarded metadata an AJP front end supplies. The packet is
//! created by a codec filter on the read path, mutated only there, and then
//! handed to the layers above.

use crate::protocol::PayloadSize;
use http::header::{CONNECTION, EXPECT};
use http::{HeaderMap, Method, Uri, Version};

/// Parsed request head plus processing state.
#[derive(Debug, Default)]
pub struct HttpRequestPacket {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    content_length: Option<u64>,
    chunked: bool,
    expect_continue: bool,
    secure: bool,
    remote_addr: Option<String>,
    remote_host: Option<String>,
    server_name: Option<String>,
    server_port: Option<u16>,
    request_attributes: Vec<(String, String)>,
    processing: ProcessingState,
}

impl HttpRequestPacket {
    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap) -> Self {
        Self { method, uri, version, headers, ..Default::default() }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn set_content_length(&mut self, length: Option<u64>) {
        self.content_length = length;
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn set_chunked(&mut self, chunked: bool) {
        self.chunked = chunked;
    }

    pub fn is_expect_continue(&self) -> bool {
        self.expect_continue
    }

    pub fn set_expect_continue(&mut self, expect: bool) {
        self.expect_continue = expect;
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn set_remote_addr(&mut self, addr: Option<String>) {
        self.remote_addr = addr;
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    pub fn set_remote_host(&mut self, host: Option<String>) {
        self.remote_host = host;
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn set_server_name(&mut self, name: Option<String>) {
        self.server_name = name;
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server_port
    }

    pub fn set_server_port(&mut self, port: Option<u16>) {
        self.server_port = port;
    }

    /// Front-end supplied request attributes, in arrival order.
    pub fn request_attributes(&self) -> &[(String, String)] {
        &self.request_attributes
    }

    pub fn add_request_attribute(&mut self, name: String, value: String) {
        self.request_attributes.push((name, value));
    }

    pub fn processing(&self) -> &ProcessingState {
        &self.processing
    }

    pub fn processing_mut(&mut self) -> &mut ProcessingState {
        &mut self.processing
    }

    /// Body framing declared by the head.
    pub fn payload_size(&self) -> PayloadSize {
        if self.chunked {
            PayloadSize::Chunked
        } else {
            match self.content_length {
                Some(0) | None => PayloadSize::Empty,
                Some(n) => PayloadSize::Length(n),
            }
        }
    }

    /// Whether the method defines request payload semantics.
    ///
    /// GET, HEAD, DELETE, OPTIONS, TRACE and CONNECT leave the payload
    /// undefined; a body on them is only honored when the codec is
    /// configured to allow it.
    pub fn method_defines_payload(&self) -> bool {
        !matches!(
            self.method,
            Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::TRACE | Method::CONNECT
        )
    }

    /// Evaluates `Expect: 100-continue` from the headers.
    pub fn examine_expect(&mut self) {
        if let Some(value) = self.headers.get(EXPECT) {
            let slice = value.as_bytes();
            self.expect_continue = slice.len() >= 4 && slice[0..4].eq_ignore_ascii_case(b"100-");
        }
    }

    /// Evaluates the keep-alive decision from version and `Connection`.
    pub fn examine_connection(&mut self) {
        let tokens = self
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();

        let keep_alive = match self.version {
            Version::HTTP_11 => !tokens.iter().any(|t| t == "close"),
            Version::HTTP_10 => tokens.iter().any(|t| t == "keep-alive"),
            _ => false,
        };
        self.processing.keep_alive = keep_alive;
    }
}

/// Mutable per-message processing state shared along the pipeline.
#[derive(Debug, Default)]
pub struct ProcessingState {
    /// An unrecoverable error was seen while handling the message
    pub error: bool,
    /// The connection may serve another request after this message
    pub keep_alive: bool,
    /// The response for this message has been committed
    pub response_committed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn packet(version: Version) -> HttpRequestPacket {
        HttpRequestPacket::new(Method::GET, Uri::from_static("/"), version, HeaderMap::new())
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let mut p11 = packet(Version::HTTP_11);
        p11.examine_connection();
        assert!(p11.processing().keep_alive);

        let mut p10 = packet(Version::HTTP_10);
        p10.examine_connection();
        assert!(!p10.processing().keep_alive);
    }

    #[test]
    fn connection_header_overrides_default() {
        let mut p11 = packet(Version::HTTP_11);
        p11.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        p11.examine_connection();
        assert!(!p11.processing().keep_alive);

        let mut p10 = packet(Version::HTTP_10);
        p10.headers_mut().insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        p10.examine_connection();
        assert!(p10.processing().keep_alive);
    }

    #[test]
    fn expect_continue_is_case_insensitive_prefix() {
        let mut p = packet(Version::HTTP_11);
        p.headers_mut().insert(EXPECT, HeaderValue::from_static("100-Continue"));
        p.examine_expect();
        assert!(p.is_expect_continue());
    }

    #[test]
    fn payload_size_prefers_chunked() {
        let mut p = packet(Version::HTTP_11);
        p.set_content_length(Some(42));
        assert_eq!(p.payload_size(), PayloadSize::Length(42));

        p.set_chunked(true);
        assert_eq!(p.payload_size(), PayloadSize::Chunked);
    }
}
