//! Error types for the protocol pipeline.
//!
//! [`HttpError`] is the top-level error at the codec boundary, wrapping the
//! parse, send and content-encoding error families. Parse failures are fatal
//! to the connection they occur on, never to the transport; where possible a
//! minimal error response is emitted before the connection closes.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// The top-level error type for protocol operations.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Errors that occur while parsing inbound messages
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    /// Errors that occur while serializing outbound messages
    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    /// Errors raised by a content-encoding transformer
    #[error("encoding error: {source}")]
    EncodingError {
        #[from]
        source: EncodingError,
    },
}

/// Errors that occur while parsing inbound messages.
#[derive(Error, Debug)]
pub enum ParseError {
    /// A size limit was exceeded (request line, header block, packet size)
    #[error("{what} too large, current: {current_size} exceed the limit {max_size}")]
    LimitExceeded { what: &'static str, current_size: usize, max_size: usize },

    /// Number of headers exceeds the maximum allowed
    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    /// Invalid header format or content
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// Unsupported protocol version
    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    /// Malformed message framing (chunk sizes, packet marks, TLVs)
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    /// Invalid message body
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// I/O error during parsing
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn limit_exceeded(what: &'static str, current_size: usize, max_size: usize) -> Self {
        Self::LimitExceeded { what, current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_frame<S: ToString>(str: S) -> Self {
        Self::InvalidFrame { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status of the minimal error response emitted before close.
    pub fn response_status(&self) -> StatusCode {
        match self {
            Self::LimitExceeded { .. } | Self::TooManyHeaders { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Errors that occur while serializing and sending outbound messages.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// The encoder received messages out of order
    #[error("unexpected message: {reason}")]
    UnexpectedMessage { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn unexpected_message<S: ToString>(str: S) -> Self {
        Self::UnexpectedMessage { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Errors raised by content-encoding transformers.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("malformed {encoding} stream: {reason}")]
    Malformed { encoding: &'static str, reason: String },

    #[error("{encoding} checksum mismatch, expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { encoding: &'static str, expected: u32, computed: u32 },

    #[error("{encoding} stream truncated")]
    Truncated { encoding: &'static str },

    #[error("compression failure: {reason}")]
    Compression { reason: String },
}

impl EncodingError {
    pub fn malformed<S: ToString>(encoding: &'static str, reason: S) -> Self {
        Self::Malformed { encoding, reason: reason.to_string() }
    }

    pub fn compression<S: ToString>(reason: S) -> Self {
        Self::Compression { reason: reason.to_string() }
    }
}
