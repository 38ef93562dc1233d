//! Server assembly.
//!
//! [`HttpServer`] wires a listen transport to the standard filter chain:
//! codec filter(s) for the chosen wire protocol below, the dispatching
//! [`HttpServerFilter`] on top.

mod handler;
mod server_filter;

pub use handler::{make_handler, HandlerError, HandlerFn, HandlerRegistry, HttpHandler, Request, Response, UrlPattern};
pub use server_filter::HttpServerFilter;

use crate::codec::ajp::{AjpHandlerFilter, AjpMessageFilter};
use crate::codec::encoding::EncodingRegistry;
use crate::codec::HttpCodecFilter;
use crate::config::ServerConfig;
use crate::filter::FilterChain;
use crate::transport::{TcpTransport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::ToSocketAddrs;

/// The wire protocol spoken below the server filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProtocol {
    Http,
    Ajp,
}

pub struct HttpServerBuilder {
    config: ServerConfig,
    protocol: ServerProtocol,
    registry: HandlerRegistry,
    encodings: EncodingRegistry,
}

impl HttpServerBuilder {
    fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            protocol: ServerProtocol::Http,
            registry: HandlerRegistry::new(),
            encodings: EncodingRegistry::new(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn protocol(mut self, protocol: ServerProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Registers a handler under `(context_path, pattern)`.
    pub fn handler(mut self, context_path: &str, pattern: &str, handler: impl HttpHandler + 'static) -> Self {
        self.registry.add(context_path, pattern, handler);
        self
    }

    /// Registers a content encoding with the codec.
    pub fn content_encoding(mut self, encoding: impl crate::codec::encoding::ContentEncoding + 'static) -> Self {
        self.encodings.register(encoding);
        self
    }

    pub fn build(self) -> HttpServer {
        let server_filter = HttpServerFilter::new(Arc::new(self.registry));
        let chain = match self.protocol {
            ServerProtocol::Http => FilterChain::builder()
                .add(HttpCodecFilter::new(self.encodings))
                .add(server_filter)
                .build(),
            ServerProtocol::Ajp => FilterChain::builder()
                .add(AjpMessageFilter::new())
                .add(AjpHandlerFilter::new())
                .add(server_filter)
                .build(),
        };
        HttpServer { transport: TcpTransport::new(self.config, chain) }
    }
}

pub struct HttpServer {
    transport: TcpTransport,
}

impl HttpServer {
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    pub async fn bind(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr, TransportError> {
        self.transport.bind(addr).await
    }

    pub fn start(&self) -> Result<(), TransportError> {
        self.transport.start()
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.transport.shutdown(grace).await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &TcpTransport {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeHolder;
    use crate::codec::encoding::{ContentEncoding, GzipContentEncoding};
    use crate::filter::FilterChain;
    use crate::memory::Buffer;
    use crate::transport::write_queue::WriteQueueHandle;
    use crate::transport::{Connection, ConnectionState};
    use bytes::{Bytes, BytesMut};
    use tokio::io::AsyncReadExt;

    fn echo_chain(encodings: EncodingRegistry) -> FilterChain {
        let mut registry = HandlerRegistry::new();
        registry.add("", "/", {
            make_handler(|request: Request| async move {
                let mut response = Response::new();
                if request.body().is_empty() {
                    response.write("hi");
                } else {
                    let body = request.into_body();
                    response.write(&body);
                }
                Ok(response)
            })
        });
        registry.add("", "/gzip-out", {
            make_handler(|_request: Request| async move {
                let mut response = Response::new();
                response.headers_mut().insert(http::header::CONTENT_ENCODING, "gzip".parse().unwrap());
                response.write("compress me, please, compress me well");
                Ok(response)
            })
        });

        FilterChain::builder()
            .add(HttpCodecFilter::new(encodings))
            .add(HttpServerFilter::new(Arc::new(registry)))
            .build()
    }

    fn connection(config: ServerConfig) -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (handle, _task) = WriteQueueHandle::spawn(client, 32, Duration::from_secs(1));
        let addr = "127.0.0.1:0".parse().unwrap();
        (Connection::new(1, addr, addr, handle, Arc::new(config)), server)
    }

    async fn drain_output(conn: &Connection, server: &mut tokio::io::DuplexStream) -> Vec<u8> {
        conn.flush_writes().await.unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        while let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(20), server.read(&mut chunk)).await {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    #[tokio::test]
    async fn http_10_get_is_answered_and_closed() {
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(ServerConfig::default());

        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n"))).await.unwrap();

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"), "got: {out}");
        assert!(out.contains("content-length: 2\r\n"));
        assert!(out.ends_with("hi"));
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(ServerConfig::default());

        let wire = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(wire))).await.unwrap();

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        let responses: Vec<_> = out.matches("HTTP/1.1 200 OK").collect();
        assert_eq!(responses.len(), 2, "got: {out}");
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn gzip_request_body_reaches_handler_decoded() {
        let mut encodings = EncodingRegistry::new();
        encodings.register(GzipContentEncoding::new(6));
        let chain = echo_chain(encodings);
        let (mut conn, mut server) = connection(ServerConfig::default());

        // gzip "hello" with a standalone transformer
        let scratch_encoding = GzipContentEncoding::new(6);
        let mut scratch = AttributeHolder::new();
        let mut compressed = Vec::new();
        if let Some(bytes) = scratch_encoding.encode(&mut scratch, Bytes::from_static(b"hello")).unwrap() {
            compressed.extend_from_slice(&bytes);
        }
        if let Some(bytes) = scratch_encoding.finish(&mut scratch).unwrap() {
            compressed.extend_from_slice(&bytes);
        }

        let mut wire = format!(
            "POST /p HTTP/1.1\r\nHost: x\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        wire.extend_from_slice(&compressed);

        chain.fire_read(&mut conn, Buffer::from(Bytes::from(wire))).await.unwrap();

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.contains("content-length: 5\r\n"), "got: {out}");
        assert!(out.ends_with("hello"));
    }

    #[tokio::test]
    async fn expect_continue_is_acknowledged_before_the_body() {
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(ServerConfig::default());

        let head = b"POST /p HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n";
        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(head))).await.unwrap();

        let interim = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"ping"))).await.unwrap();
        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("ping"));
    }

    #[tokio::test]
    async fn head_response_has_headers_but_no_body() {
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(ServerConfig::default());

        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n"))).await.unwrap();

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.contains("content-length: 2\r\n"), "got: {out}");
        assert!(out.ends_with("\r\n\r\n"), "no body bytes expected: {out:?}");
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn chunked_request_with_trailers_is_aggregated() {
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(ServerConfig::default());

        let wire = b"POST /c HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\nX-Check: ok\r\n\r\n";
        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(wire))).await.unwrap();

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.ends_with("abcdef"), "got: {out}");
    }

    #[tokio::test]
    async fn unknown_path_gets_404_and_connection_survives() {
        let mut registry = HandlerRegistry::new();
        registry.add("", "/only-this", make_handler(|_req| async { Ok(Response::new()) }));
        let chain = FilterChain::builder()
            .add(HttpCodecFilter::default())
            .add(HttpServerFilter::new(Arc::new(registry)))
            .build();
        let (mut conn, mut server) = connection(ServerConfig::default());

        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n"))).await.unwrap();

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn malformed_request_gets_an_error_response_and_the_pass_fails() {
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(ServerConfig::default());

        let result = chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"GET / HTTP/9.9\r\n\r\n"))).await;
        assert!(result.is_err());

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.starts_with("HTTP/1.1 505 "), "got: {out}");
    }

    #[tokio::test]
    async fn oversized_request_line_gets_413() {
        let config = ServerConfig::builder().max_request_line_size(32).build();
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(config);

        let wire = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(64));
        let result = chain.fire_read(&mut conn, Buffer::from(Bytes::from(wire.into_bytes()))).await;
        assert!(result.is_err());

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.starts_with("HTTP/1.1 413 "), "got: {out}");
    }

    #[tokio::test]
    async fn gzip_response_is_chunked_and_decodable() {
        let mut encodings = EncodingRegistry::new();
        encodings.register(GzipContentEncoding::new(6));
        let chain = echo_chain(encodings);
        let (mut conn, mut server) = connection(ServerConfig::default());

        chain
            .fire_read(&mut conn, Buffer::from(Bytes::from_static(b"GET /gzip-out HTTP/1.1\r\nHost: x\r\n\r\n")))
            .await
            .unwrap();

        let out = drain_output(&conn, &mut server).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("transfer-encoding: chunked\r\n"), "got: {text}");
        assert!(text.contains("content-encoding: gzip\r\n"));

        // strip the head, de-chunk, then gunzip
        let head_end = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let mut chunked = BytesMut::from(&out[head_end..]);
        let mut dechunked = Vec::new();
        let mut decoder = crate::codec::body::PayloadDecoder::chunked();
        use tokio_util::codec::Decoder;
        loop {
            match decoder.decode(&mut chunked).unwrap() {
                Some(content) => {
                    dechunked.extend_from_slice(content.data());
                    if content.is_last() {
                        break;
                    }
                }
                None => panic!("incomplete chunked body"),
            }
        }

        let scratch_encoding = GzipContentEncoding::new(6);
        let mut scratch = AttributeHolder::new();
        let result = scratch_encoding.decode(&mut scratch, Bytes::from(dechunked)).unwrap();
        scratch_encoding.decode_complete(&mut scratch).unwrap();
        assert_eq!(result.content.as_deref(), Some(&b"compress me, please, compress me well"[..]));
    }

    #[tokio::test]
    async fn keep_alive_request_budget_closes_the_connection() {
        let config = ServerConfig::builder().max_keep_alive_requests(Some(1)).build();
        let chain = echo_chain(EncodingRegistry::new());
        let (mut conn, mut server) = connection(config);

        chain.fire_read(&mut conn, Buffer::from(Bytes::from_static(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"))).await.unwrap();

        let out = String::from_utf8(drain_output(&conn, &mut server).await).unwrap();
        assert!(out.contains("connection: close\r\n"), "got: {out}");
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn server_over_tcp_answers_requests() {
        let server = HttpServer::builder()
            .handler("", "/", make_handler(|_req| async {
                let mut response = Response::new();
                response.set_content_type("text/plain");
                response.write("over tcp");
                Ok(response)
            }))
            .build();

        let addr = server.bind("127.0.0.1:0").await.unwrap();
        server.start().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.ends_with("over tcp"));

        server.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn draining_transport_refuses_new_connections() {
        let server = HttpServer::builder()
            .handler("", "/", make_handler(|_req| async { Ok(Response::new()) }))
            .build();
        let addr = server.bind("127.0.0.1:0").await.unwrap();
        server.start().unwrap();

        server.shutdown(Duration::from_millis(100)).await;

        // the listener is gone: either refused or immediately closed
        match tokio::net::TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(mut stream) => {
                let mut buf = [0u8; 1];
                let n = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
                assert!(matches!(n, Ok(Ok(0)) | Ok(Err(_))), "connection should be dead");
            }
        }
    }
}
