//! Content-encoding transformers.
//!
//! A [`ContentEncoding`] is a pair of streaming transformers applied to
//! message payloads, selected per message by the `Content-Encoding` header:
//! decoders run right-to-left over the listed encodings on the read path,
//! encoders mirror that on the write path. Transformer state is
//! per-connection and lives in the connection's attribute holder.

mod gzip;

pub use gzip::GzipContentEncoding;

use crate::attributes::AttributeHolder;
use crate::protocol::EncodingError;
use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::HeaderMap;
use std::sync::Arc;

/// Outcome of one decode step.
pub struct ParsingResult {
    /// Decoded payload produced by this step, if any
    pub content: Option<Bytes>,
    /// Input bytes past the end of the encoded stream, surfaced so the
    /// layers above can resume with them
    pub remainder: Option<Bytes>,
}

impl ParsingResult {
    pub fn new(content: Option<Bytes>, remainder: Option<Bytes>) -> Self {
        Self { content, remainder }
    }

    pub fn empty() -> Self {
        Self { content: None, remainder: None }
    }
}

/// A named, aliasable payload transformer.
pub trait ContentEncoding: Send + Sync {
    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str];

    /// Whether this transformer matches an encoding token.
    fn matches(&self, token: &str) -> bool {
        token.eq_ignore_ascii_case(self.name()) || self.aliases().iter().any(|a| token.eq_ignore_ascii_case(a))
    }

    /// Whether the inbound message should be decoded by this transformer.
    fn want_decode(&self, headers: &HeaderMap) -> bool {
        lists_encoding(headers, self)
    }

    /// Whether the outbound message should be encoded by this transformer.
    fn want_encode(&self, headers: &HeaderMap) -> bool {
        lists_encoding(headers, self)
    }

    /// Feeds encoded input; returns decoded output and any bytes past the
    /// end of the encoded stream.
    fn decode(&self, attributes: &mut AttributeHolder, input: Bytes) -> Result<ParsingResult, EncodingError>;

    /// Called at the end of the inbound payload; verifies the stream was
    /// complete and resets the per-connection state.
    fn decode_complete(&self, attributes: &mut AttributeHolder) -> Result<(), EncodingError>;

    /// Feeds plain input; returns encoded output once the transformer emits
    /// any.
    fn encode(&self, attributes: &mut AttributeHolder, input: Bytes) -> Result<Option<Bytes>, EncodingError>;

    /// Flushes the transformer at the end of the outbound payload and
    /// resets the per-connection state.
    fn finish(&self, attributes: &mut AttributeHolder) -> Result<Option<Bytes>, EncodingError>;
}

fn lists_encoding(headers: &HeaderMap, encoding: &(impl ContentEncoding + ?Sized)) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| encoding.matches(token.trim()))
}

/// Maps encoding names (and aliases) to transformers, in registration
/// order.
#[derive(Clone, Default)]
pub struct EncodingRegistry {
    encodings: Vec<Arc<dyn ContentEncoding>>,
}

impl EncodingRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, encoding: impl ContentEncoding + 'static) {
        self.encodings.push(Arc::new(encoding));
    }

    pub fn register_shared(&mut self, encoding: Arc<dyn ContentEncoding>) {
        self.encodings.push(encoding);
    }

    /// Resolves a token against names and aliases.
    pub fn lookup(&self, token: &str) -> Option<Arc<dyn ContentEncoding>> {
        self.encodings.iter().find(|e| e.matches(token)).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ContentEncoding>> {
        self.encodings.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_names_and_aliases() {
        let mut registry = EncodingRegistry::new();
        registry.register(GzipContentEncoding::new(6));

        assert!(registry.lookup("gzip").is_some());
        assert!(registry.lookup("GZIP").is_some());
        assert!(registry.lookup("deflate").is_some());
        assert!(registry.lookup("br").is_none());
    }

    #[test]
    fn want_decode_consults_content_encoding_header() {
        let encoding = GzipContentEncoding::new(6);

        let mut headers = HeaderMap::new();
        assert!(!encoding.want_decode(&headers));

        headers.insert(CONTENT_ENCODING, "gzip".parse().unwrap());
        assert!(encoding.want_decode(&headers));

        headers.insert(CONTENT_ENCODING, "identity, gzip".parse().unwrap());
        assert!(encoding.want_decode(&headers));
    }
}
