//! Serialized response metadata.

use http::{HeaderMap, StatusCode, Version};

/// Response head handed to the serializer.
///
/// `acknowledgment` marks an interim `100 Continue`; it is emitted as a bare
/// status line and does not commit the real response. `suppress_body` keeps
/// the declared framing headers but emits no payload bytes (HEAD, 1xx, 204,
/// 304).
#[derive(Debug)]
pub struct HttpResponsePacket {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    headers: HeaderMap,
    content_length: Option<u64>,
    chunked: bool,
    suppress_body: bool,
    acknowledgment: bool,
    keep_alive: bool,
}

impl Default for HttpResponsePacket {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content_length: None,
            chunked: false,
            suppress_body: false,
            acknowledgment: false,
            keep_alive: true,
        }
    }
}

impl HttpResponsePacket {
    pub fn new(status: StatusCode, version: Version) -> Self {
        Self { status, version, ..Default::default() }
    }

    /// An interim `100 Continue` acknowledgment.
    pub fn acknowledgment() -> Self {
        Self { status: StatusCode::CONTINUE, acknowledgment: true, ..Default::default() }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The reason phrase: an explicit override, or the fixed table entry for
    /// the status code.
    pub fn reason(&self) -> &str {
        self.reason.as_deref().or_else(|| self.status.canonical_reason()).unwrap_or("Unknown")
    }

    pub fn set_reason(&mut self, reason: Option<String>) {
        self.reason = reason;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
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

    pub fn is_suppress_body(&self) -> bool {
        self.suppress_body
    }

    pub fn set_suppress_body(&mut self, suppress: bool) {
        self.suppress_body = suppress;
    }

    pub fn is_acknowledgment(&self) -> bool {
        self.acknowledgment
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Whether the status code forbids a payload on the wire.
    pub fn status_forbids_body(&self) -> bool {
        self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_falls_back_to_fixed_table() {
        let mut packet = HttpResponsePacket::new(StatusCode::NOT_FOUND, Version::HTTP_11);
        assert_eq!(packet.reason(), "Not Found");

        packet.set_reason(Some("Gone Fishing".to_owned()));
        assert_eq!(packet.reason(), "Gone Fishing");
    }

    #[test]
    fn body_forbidden_statuses() {
        for status in [StatusCode::CONTINUE, StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED] {
            assert!(HttpResponsePacket::new(status, Version::HTTP_11).status_forbids_body());
        }
        assert!(!HttpResponsePacket::new(StatusCode::OK, Version::HTTP_11).status_forbids_body());
    }
}
