use crate::protocol::{HttpResponsePacket, PayloadSize, SendError};

use bytes::{BufMut, BytesMut};

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, DATE, TRANSFER_ENCODING};
use http::{HeaderName, Version};
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::Encoder;
use tracing::error;

const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Framing headers emitted first, in this order, when present.
const ORDERED_HEADERS: [HeaderName; 4] = [DATE, CONTENT_LENGTH, TRANSFER_ENCODING, CONTENT_TYPE];

pub struct HeaderEncoder;

impl Encoder<(HttpResponsePacket, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (HttpResponsePacket, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut packet, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        match packet.version() {
            Version::HTTP_11 => dst.put_slice(b"HTTP/1.1 "),
            Version::HTTP_10 => dst.put_slice(b"HTTP/1.0 "),
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        }
        dst.put_slice(packet.status().as_str().as_bytes());
        dst.put_slice(b" ");
        dst.put_slice(packet.reason().as_bytes());
        dst.put_slice(b"\r\n");

        // interim acknowledgments are a bare status line
        if packet.is_acknowledgment() {
            dst.put_slice(b"\r\n");
            return Ok(());
        }

        if !packet.status_forbids_body() {
            match payload_size {
                PayloadSize::Length(n) => match packet.headers_mut().get_mut(CONTENT_LENGTH) {
                    Some(value) => *value = n.into(),
                    None => {
                        packet.headers_mut().insert(CONTENT_LENGTH, n.into());
                    }
                },
                PayloadSize::Chunked => match packet.headers_mut().get_mut(TRANSFER_ENCODING) {
                    Some(value) => *value = "chunked".parse().unwrap(),
                    None => {
                        packet.headers_mut().insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
                    }
                },
                PayloadSize::Empty => match packet.headers_mut().get_mut(CONTENT_LENGTH) {
                    Some(value) => *value = 0.into(),
                    None => {
                        packet.headers_mut().insert(CONTENT_LENGTH, 0.into());
                    }
                },
            }
        }

        for name in &ORDERED_HEADERS {
            for value in packet.headers().get_all(name) {
                dst.put_slice(name.as_ref());
                dst.put_slice(b": ");
                dst.put_slice(value.as_ref());
                dst.put_slice(b"\r\n");
            }
        }

        for (name, value) in packet.headers().iter() {
            if ORDERED_HEADERS.contains(name) {
                continue;
            }
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
