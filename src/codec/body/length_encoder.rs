use crate::protocol::{HttpContent, SendError};
use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    received_eof: bool,
    length: u64,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { received_eof: false, length }
    }

    pub fn is_finish(&self) -> bool {
        self.length == 0 && self.received_eof
    }
}

impl Encoder<HttpContent> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: HttpContent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.length == 0 && !item.data().is_empty() {
            warn!("content exceeds the declared length, dropping the excess");
            if item.is_last() {
                self.received_eof = true;
            }
            return Ok(());
        }

        if !item.data().is_empty() {
            let allowed = self.length.min(item.data().len() as u64) as usize;
            if (allowed as u64) < item.data().len() as u64 {
                warn!("content exceeds the declared length, truncating");
            }
            dst.extend_from_slice(&item.data()[..allowed]);
            self.length -= allowed as u64;
        }

        if item.is_last() {
            self.received_eof = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn writes_exactly_declared_length() {
        let mut encoder = LengthEncoder::new(5);
        let mut dst = BytesMut::new();

        encoder.encode(HttpContent::chunk(Bytes::from_static(b"he")), &mut dst).unwrap();
        assert!(!encoder.is_finish());

        encoder.encode(HttpContent::last(Bytes::from_static(b"llo")), &mut dst).unwrap();
        assert!(encoder.is_finish());
        assert_eq!(&dst[..], b"hello");
    }

    #[test]
    fn excess_bytes_are_dropped() {
        let mut encoder = LengthEncoder::new(3);
        let mut dst = BytesMut::new();

        encoder.encode(HttpContent::last(Bytes::from_static(b"abcdef")), &mut dst).unwrap();
        assert!(encoder.is_finish());
        assert_eq!(&dst[..], b"abc");
    }
}
