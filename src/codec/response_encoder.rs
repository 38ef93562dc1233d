use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{HttpResponsePacket, Message, PayloadSize, SendError};
use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::error;

pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None }
    }
}

impl Encoder<Message<(HttpResponsePacket, PayloadSize)>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(HttpResponsePacket, PayloadSize)>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((packet, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(SendError::unexpected_message("previous response payload is not finished"));
                }

                // interim acknowledgments never commit a payload encoder
                if packet.is_acknowledgment() {
                    return self.header_encoder.encode((packet, PayloadSize::Empty), dst);
                }

                let payload_encoder = if packet.is_suppress_body() || packet.status_forbids_body() {
                    PayloadEncoder::empty()
                } else {
                    PayloadEncoder::from(payload_size)
                };
                self.payload_encoder = Some(payload_encoder);
                self.header_encoder.encode((packet, payload_size), dst)
            }

            Message::Content(content) => {
                let payload_encoder = if let Some(encoder) = &mut self.payload_encoder {
                    encoder
                } else {
                    error!("expect response header but receive payload item");
                    return Err(SendError::unexpected_message("payload item before response head"));
                };

                let result = payload_encoder.encode(content, dst);

                if payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }

                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HttpContent;
    use bytes::Bytes;
    use http::{StatusCode, Version};

    #[test]
    fn fixed_length_response() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        let packet = HttpResponsePacket::new(StatusCode::OK, Version::HTTP_11);
        encoder.encode(Message::Header((packet, PayloadSize::Length(2))), &mut dst).unwrap();
        encoder.encode(Message::Content(HttpContent::last(Bytes::from_static(b"hi"))), &mut dst).unwrap();

        let out = String::from_utf8(dst.to_vec()).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("content-length: 2\r\n"));
        assert!(out.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn head_response_suppresses_body_but_keeps_length() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        let mut packet = HttpResponsePacket::new(StatusCode::OK, Version::HTTP_11);
        packet.set_suppress_body(true);
        encoder.encode(Message::Header((packet, PayloadSize::Length(42))), &mut dst).unwrap();
        encoder.encode(Message::Content(HttpContent::last(Bytes::from_static(b"should not appear"))), &mut dst).unwrap();

        let out = String::from_utf8(dst.to_vec()).unwrap();
        assert!(out.contains("content-length: 42\r\n"));
        assert!(out.ends_with("\r\n\r\n"), "no body bytes expected: {out:?}");

        // the encoder is reusable for the next response
        let packet = HttpResponsePacket::new(StatusCode::OK, Version::HTTP_11);
        encoder.encode(Message::Header((packet, PayloadSize::Empty)), &mut dst).unwrap();
    }

    #[test]
    fn acknowledgment_does_not_commit_payload_state() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(Message::Header((HttpResponsePacket::acknowledgment(), PayloadSize::Empty)), &mut dst).unwrap();
        assert_eq!(&dst[..], b"HTTP/1.1 100 Continue\r\n\r\n");

        dst.clear();
        let packet = HttpResponsePacket::new(StatusCode::OK, Version::HTTP_11);
        encoder.encode(Message::Header((packet, PayloadSize::Length(0))), &mut dst).unwrap();
    }

    #[test]
    fn content_before_header_is_rejected() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        let result = encoder.encode(Message::Content(HttpContent::eof()), &mut dst);
        assert!(result.is_err());
    }
}
