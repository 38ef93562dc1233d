use bytes::Bytes;
use http::HeaderMap;

/// A protocol message flowing through a codec: either the parsed header of a
/// request/response, or a piece of its payload.
///
/// The generic parameter `T` is the header type (request or response
/// packet).
pub enum Message<T> {
    /// The parsed header of a message
    Header(T),
    /// A piece of the message payload
    Content(HttpContent),
}

impl<T> Message<T> {
    #[inline]
    pub fn is_header(&self) -> bool {
        matches!(self, Message::Header(_))
    }

    #[inline]
    pub fn is_content(&self) -> bool {
        matches!(self, Message::Content(_))
    }

    /// Converts the message into its content part, if any.
    pub fn into_content(self) -> Option<HttpContent> {
        match self {
            Message::Header(_) => None,
            Message::Content(content) => Some(content),
        }
    }
}

impl<T> From<HttpContent> for Message<T> {
    fn from(content: HttpContent) -> Self {
        Message::Content(content)
    }
}

/// One streamed piece of a message body.
///
/// Every message carries exactly one terminal piece (`is_last == true`); for
/// chunked transfer the trailer fields ride on that terminal piece.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpContent {
    data: Bytes,
    is_last: bool,
    trailers: HeaderMap,
}

impl HttpContent {
    /// A non-terminal data piece.
    pub fn chunk(data: Bytes) -> Self {
        Self { data, is_last: false, trailers: HeaderMap::new() }
    }

    /// A terminal piece carrying the final bytes of the body.
    pub fn last(data: Bytes) -> Self {
        Self { data, is_last: true, trailers: HeaderMap::new() }
    }

    /// An empty terminal piece.
    pub fn eof() -> Self {
        Self::last(Bytes::new())
    }

    /// A terminal piece with trailer fields attached.
    pub fn last_with_trailers(data: Bytes, trailers: HeaderMap) -> Self {
        Self { data, is_last: true, trailers }
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    #[inline]
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Replaces the payload bytes, keeping the terminal flag and trailers.
    pub fn with_data(self, data: Bytes) -> Self {
        Self { data, ..self }
    }
}

/// How the payload of a message is framed on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with known length in bytes
    Length(u64),
    /// Payload using chunked transfer encoding
    Chunked,
    /// No payload
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}
