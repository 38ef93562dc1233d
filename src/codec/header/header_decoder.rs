use std::mem::MaybeUninit;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Method, Uri, Version};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;

use crate::config::ServerConfig;
use crate::protocol::{HttpRequestPacket, ParseError, PayloadSize};

pub(crate) const MAX_HEADER_NUM: usize = 64;
pub(crate) const DEFAULT_MAX_REQUEST_LINE_SIZE: usize = 8 * 1024;
pub(crate) const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Streaming decoder for the request head.
///
/// Accepts `\r\n` and bare `\n` line terminators (`\r` alone never
/// terminates a line), folds obs-fold continuation lines into the previous
/// value with a single space, and enforces the configured request-line and
/// header-block byte limits. Limit overruns are fatal to the connection.
pub struct HeaderDecoder {
    max_request_line_size: usize,
    max_header_size: usize,
    allow_payload_for_undefined_methods: bool,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self {
            max_request_line_size: DEFAULT_MAX_REQUEST_LINE_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            allow_payload_for_undefined_methods: false,
        }
    }
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_config(config: &ServerConfig) -> Self {
        Self {
            max_request_line_size: config.max_request_line_size,
            max_header_size: config.max_request_header_size,
            allow_payload_for_undefined_methods: config.allow_payload_for_undefined_methods,
        }
    }
}

impl Decoder for HeaderDecoder {
    type Item = (HttpRequestPacket, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let head_len = match find_head_end(src) {
            Some(len) => len,
            None => {
                // partial head: fail fast once a limit cannot be met anymore
                if !src.contains(&b'\n') {
                    ensure!(
                        src.len() <= self.max_request_line_size,
                        ParseError::limit_exceeded("request line", src.len(), self.max_request_line_size)
                    );
                }
                ensure!(
                    src.len() <= self.max_header_size,
                    ParseError::limit_exceeded("request header", src.len(), self.max_header_size)
                );
                return Ok(None);
            }
        };

        trace!(head_size = head_len, "located end of request head");
        ensure!(
            head_len <= self.max_header_size,
            ParseError::limit_exceeded("request header", head_len, self.max_header_size)
        );

        let line_len = request_line_len(&src[..head_len]);
        ensure!(
            line_len <= self.max_request_line_size,
            ParseError::limit_exceeded("request line", line_len, self.max_request_line_size)
        );

        // obs-fold continuations are rare; unfold into a scratch copy only
        // when one is present, otherwise parse the wire bytes in place
        let unfolded: Option<Bytes> =
            contains_obs_fold(&src[..head_len]).then(|| Bytes::from(unfold(&src[..head_len])));
        let parse_src: &[u8] = match &unfolded {
            Some(bytes) => bytes,
            None => &src[..head_len],
        };

        let mut req = httparse::Request::new(&mut []);
        let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] =
            unsafe { MaybeUninit::uninit().assume_init() };

        let parsed = req.parse_with_uninit_headers(parse_src, &mut headers).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            httparse::Error::Version => ParseError::InvalidVersion(None),
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let body_offset = match parsed {
            Status::Complete(offset) => offset,
            // the head terminator was located above, so httparse must agree
            Status::Partial => return Err(ParseError::invalid_header("inconsistent request head")),
        };

        let mut header_index: [HeaderIndex; MAX_HEADER_NUM] = EMPTY_HEADER_INDEX_ARRAY;
        HeaderIndex::record(parse_src, req.headers, &mut header_index);

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };

        let method: Method = req.method.ok_or(ParseError::InvalidMethod)?.parse().map_err(|_| ParseError::InvalidMethod)?;
        let uri: Uri = req.path.ok_or(ParseError::InvalidUri)?.parse().map_err(|_| ParseError::InvalidUri)?;
        let header_count = req.headers.len();

        debug_assert_eq!(body_offset, parse_src.len(), "head terminator and parser disagree");

        let header_bytes: Bytes = match unfolded {
            Some(bytes) => {
                src.advance(head_len);
                bytes
            }
            None => src.split_to(head_len).freeze(),
        };

        let mut packet = HttpRequestPacket::new(method, uri, version, Default::default());
        packet.headers_mut().reserve(header_count);
        for index in &header_index[..header_count] {
            // safe to unwrap: httparse has checked the header name is valid ASCII
            let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1]).unwrap();
            let value = HeaderValue::from_maybe_shared(header_bytes.slice(index.value.0..index.value.1))
                .map_err(|_| ParseError::invalid_header("invalid header value"))?;
            packet.headers_mut().append(name, value);
        }

        packet.examine_expect();
        packet.examine_connection();

        let payload_size = self.examine_payload(&mut packet)?;

        Ok(Some((packet, payload_size)))
    }
}

impl HeaderDecoder {
    /// Resolves the body framing from the parsed head.
    ///
    /// `Transfer-Encoding: chunked` takes precedence over `Content-Length`.
    fn examine_payload(&self, packet: &mut HttpRequestPacket) -> Result<PayloadSize, ParseError> {
        let chunked = is_chunked(packet.headers().get(TRANSFER_ENCODING));

        let content_length = match packet.headers().get(CONTENT_LENGTH) {
            None => None,
            Some(value) => {
                let values: Vec<_> = packet.headers().get_all(CONTENT_LENGTH).iter().collect();
                ensure!(
                    values.windows(2).all(|w| w[0] == w[1]),
                    ParseError::invalid_content_length("conflicting content-length values")
                );

                let text = value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
                let length = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::invalid_content_length(format!("value {text} is not u64")))?;
                Some(length)
            }
        };

        let declares_payload = chunked || content_length.is_some_and(|n| n > 0);
        if declares_payload && !packet.method_defines_payload() && !self.allow_payload_for_undefined_methods {
            return Err(ParseError::invalid_body(format!("payload is not allowed for {} requests", packet.method())));
        }

        packet.set_chunked(chunked);
        packet.set_content_length(if chunked { None } else { content_length });
        Ok(packet.payload_size())
    }
}

/// Index of the end of the request head (past the blank line), if complete.
///
/// A head ends at an empty line; both `\r\n` and bare `\n` terminate lines.
fn find_head_end(src: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < src.len() {
        if src[i] == b'\n' {
            match src.get(i + 1) {
                Some(b'\n') => return Some(i + 2),
                Some(b'\r') if src.get(i + 2) == Some(&b'\n') => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Length of the request line, excluding its terminator.
fn request_line_len(head: &[u8]) -> usize {
    match head.iter().position(|&b| b == b'\n') {
        Some(nl) if nl > 0 && head[nl - 1] == b'\r' => nl - 1,
        Some(nl) => nl,
        None => head.len(),
    }
}

fn contains_obs_fold(head: &[u8]) -> bool {
    head.windows(2).any(|w| w[0] == b'\n' && (w[1] == b' ' || w[1] == b'\t'))
}

/// Rewrites obs-fold sequences (`CRLF` or `LF` followed by whitespace) into a
/// single space so the head parses as plain header lines.
fn unfold(head: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len());
    let mut i = 0;
    while i < head.len() {
        let fold_len = fold_len_at(&head[i..]);
        if fold_len > 0 {
            out.push(b' ');
            i += fold_len;
        } else {
            out.push(head[i]);
            i += 1;
        }
    }
    out
}

fn fold_len_at(bytes: &[u8]) -> usize {
    let mut i = 0;
    if bytes.get(i) == Some(&b'\r') {
        i += 1;
    }
    if bytes.get(i) != Some(&b'\n') {
        return 0;
    }
    i += 1;
    let lws = bytes[i..].iter().take_while(|&&b| b == b' ' || b == b'\t').count();
    if lws == 0 {
        return 0;
    }
    i + lws
}

#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

const EMPTY_HEADER_INDEX_ARRAY: [HeaderIndex; MAX_HEADER_NUM] = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            let name_end = name_start + header.name.len();
            indices.name = (name_start, name_end);
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            let value_end = value_start + header.value.len();
            indices.value = (value_start, value_end);
        }
    }
}

fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    header_value
        .and_then(|value| value.to_str().ok())
        .and_then(|encodings| encodings.rsplit(',').next())
        .map(|last_encoding| last_encoding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};

        let mut buf = BytesMut::from(str);
        let (packet, payload_size) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();

        assert_eq!(payload_size, PayloadSize::Empty);
        assert_eq!(packet.method(), &Method::GET);
        assert_eq!(packet.version(), Version::HTTP_11);
        assert_eq!(packet.uri().path(), "/index.html");
        assert_eq!(packet.headers().len(), 3);
        assert_eq!(packet.headers().get(http::header::HOST), Some(&HeaderValue::from_static("127.0.0.1:8080")));
        assert_eq!(packet.headers().get(http::header::ACCEPT), Some(&HeaderValue::from_static("*/*")));
        assert!(packet.processing().keep_alive);
        assert!(buf.is_empty());
    }

    #[test]
    fn leftover_bytes_stay_in_buffer() {
        let str = indoc! {r##"
        POST /submit HTTP/1.1
        Host: x
        Content-Length: 3

        abc"##};

        let mut buf = BytesMut::from(str);
        let (packet, payload_size) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();

        assert_eq!(payload_size, PayloadSize::Length(3));
        assert_eq!(packet.content_length(), Some(3));
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn crlf_terminators() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\n\r\nrest"[..]);
        let (packet, _) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.uri().path(), "/");
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn partial_head_returns_none() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\n"[..]);
        assert!(HeaderDecoder::new().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 25);
    }

    #[test]
    fn obs_fold_is_unfolded_with_one_space() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Long: first\r\n   second\r\nHost: x\r\n\r\n"[..]);
        let (packet, _) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.headers().get("x-long"), Some(&HeaderValue::from_static("first second")));
        assert_eq!(packet.headers().get(http::header::HOST), Some(&HeaderValue::from_static("x")));
    }

    #[test]
    fn request_line_limit_boundary() {
        let fits = |path_len: usize| {
            let raw = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "p".repeat(path_len));
            let mut decoder = HeaderDecoder {
                max_request_line_size: 64,
                max_header_size: 8 * 1024,
                allow_payload_for_undefined_methods: false,
            };
            let mut buf = BytesMut::from(raw.as_bytes());
            decoder.decode(&mut buf)
        };

        // line length = 5 + path_len + 9 = 64 → accepted
        assert!(fits(50).unwrap().is_some());
        // one byte past the limit → rejected
        let err = fits(51).unwrap_err();
        assert!(matches!(err, ParseError::LimitExceeded { what: "request line", .. }));
    }

    #[test]
    fn oversized_partial_header_is_rejected_early() {
        let mut decoder =
            HeaderDecoder { max_request_line_size: 8 * 1024, max_header_size: 64, allow_payload_for_undefined_methods: false };
        let mut buf = BytesMut::from(format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n", "x".repeat(100)).as_bytes());
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::LimitExceeded { what: "request header", .. }));
    }

    #[test]
    fn chunked_takes_precedence_over_content_length() {
        let str = indoc! {r##"
        POST /p HTTP/1.1
        Host: x
        Content-Length: 10
        Transfer-Encoding: chunked

        "##};

        let mut buf = BytesMut::from(str);
        let (packet, payload_size) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Chunked);
        assert!(packet.is_chunked());
        assert_eq!(packet.content_length(), None);
    }

    #[test]
    fn payload_on_undefined_method_is_rejected_by_default() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let err = HeaderDecoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::InvalidBody { .. }));

        let mut decoder = HeaderDecoder { allow_payload_for_undefined_methods: true, ..Default::default() };
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let (_, payload_size) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Length(5));
    }

    #[test]
    fn bad_content_length_is_rejected() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: -5\r\n\r\n"[..]);
        let err = HeaderDecoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::InvalidContentLength { .. }));

        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 99999999999999999999\r\n\r\n"[..]);
        let err = HeaderDecoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::InvalidContentLength { .. }));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.2\r\nHost: x\r\n\r\n"[..]);
        let err = HeaderDecoder::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.response_status(), http::StatusCode::HTTP_VERSION_NOT_SUPPORTED);
    }

    #[test]
    fn expect_continue_flag_is_set() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: x
        Expect: 100-continue
        Content-Length: 4

        "##};

        let mut buf = BytesMut::from(str);
        let (packet, _) = HeaderDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert!(packet.is_expect_continue());
    }
}
